use crate::prelude::*;

use crate::datalog_writer::DatalogWriter;
use crate::device::{DeviceInfo, DeviceLayout, ModelEntry};
use crate::error::{DecodeError, ProbeError, TransportError};
use crate::modbus::frame::MAX_READ_REGISTERS;
use crate::modbus::RegisterTransport;
use crate::sunspec::decoder::{decode, DecodedReading};
use crate::sunspec::flags::FlagLookup;
use crate::sunspec::schema::ModelSchema;

use {
    std::collections::HashMap,
    std::sync::{Arc, Mutex, PoisonError},
    std::time::Duration,
    tokio::time::Instant,
};

/// "SunS" at the base address.
pub const SUNSPEC_MARKER: u32 = 0x5375_6E53;
pub const END_MODEL_ID: u16 = 0xFFFF;
pub const COMMON_MODEL_ID: u16 = 1;

#[derive(Clone, Debug)]
pub struct ReaderSettings {
    pub base_address: u16,
    pub max_models: u16,
    /// Quiet time between consecutive block reads on one device.
    pub read_delay: Duration,
    /// Models read at most once per interval rather than every cycle.
    pub model_intervals: HashMap<u16, Duration>,
}

impl ReaderSettings {
    pub fn from_config(config: &ConfigWrapper, class: DeviceClass) -> Self {
        let modbus = config.modbus();
        let devices = config.devices();
        Self {
            base_address: modbus.base_address(),
            max_models: modbus.max_models(),
            read_delay: match class {
                DeviceClass::Inverter => devices.inverter_read_delay(),
                DeviceClass::Meter => Duration::ZERO,
            },
            model_intervals: devices.model_intervals(),
        }
    }
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            base_address: 40000,
            max_models: 32,
            read_delay: Duration::ZERO,
            model_intervals: HashMap::new(),
        }
    }
}

/// Result of reading every model in a device's layout once.
#[derive(Clone, Debug, Default)]
pub struct ModelRead {
    pub readings: Vec<DecodedReading>,
    /// Models whose header or length no longer matched the layout.
    pub mismatched: Vec<u16>,
}

impl ModelRead {
    pub fn needs_reprobe(&self) -> bool {
        !self.mismatched.is_empty()
    }
}

/// Discovers a device's model map and reads its model blocks.
pub struct ModelReader {
    transport: Arc<dyn RegisterTransport>,
    schema: Arc<ModelSchema>,
    flags: Arc<FlagLookup>,
    settings: ReaderSettings,
    datalog: Option<DatalogWriter>,
    last_read: Mutex<HashMap<(DeviceId, u16), Instant>>,
}

impl ModelReader {
    pub fn new(
        transport: Arc<dyn RegisterTransport>,
        schema: Arc<ModelSchema>,
        flags: Arc<FlagLookup>,
        settings: ReaderSettings,
    ) -> Self {
        Self {
            transport,
            schema,
            flags,
            settings,
            datalog: None,
            last_read: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_datalog(mut self, datalog: Option<DatalogWriter>) -> Self {
        self.datalog = datalog;
        self
    }

    pub fn settings(&self) -> &ReaderSettings {
        &self.settings
    }

    /// Walk the SunSpec header chain and build the device's model map.
    pub async fn probe(&self, device: &DeviceId) -> Result<DeviceLayout, ProbeError> {
        let base = self.settings.base_address;

        let (hi, lo) = header(&self.transport.read(device, base, 2).await?)?;
        let found = ((hi as u32) << 16) | lo as u32;
        if found != SUNSPEC_MARKER {
            return Err(ProbeError::NotSunSpec {
                address: base,
                found,
            });
        }

        let common_address = next_address(base, 0)?;
        let (id, common_len) = header(&self.transport.read(device, common_address, 2).await?)?;
        if id != COMMON_MODEL_ID {
            return Err(ProbeError::NoCommonModel {
                address: common_address,
                found: id,
            });
        }

        let body = self
            .read_span(device, next_address(common_address, 0)?, common_len)
            .await?;
        let common = decode(&self.schema, &self.flags, COMMON_MODEL_ID, &body)?;
        let info = DeviceInfo {
            manufacturer: common.text("manufacturer").unwrap_or_default().to_string(),
            model: common.text("model").unwrap_or_default().to_string(),
            version: common.text("version").unwrap_or_default().to_string(),
            serial_number: common.text("serial_number").unwrap_or_default().to_string(),
        };

        let mut models = vec![ModelEntry {
            id: COMMON_MODEL_ID,
            address: common_address,
            length: common_len,
        }];

        let mut address = next_address(common_address, common_len)?;
        for _ in 0..self.settings.max_models {
            let (id, length) = header(&self.transport.read(device, address, 2).await?)?;
            if id == END_MODEL_ID || length == 0 {
                break;
            }
            if !self.schema.contains(id) {
                debug!(
                    "{}: model {} at {} has no layout, it will not be read",
                    device, id, address
                );
            }
            models.push(ModelEntry { id, address, length });
            address = next_address(address, length)?;
        }

        info!(
            "{}: {} {} (serial {}, firmware {}), models {:?}",
            device,
            info.manufacturer,
            info.model,
            info.serial_number,
            info.version,
            models.iter().map(|m| m.id).collect::<Vec<_>>()
        );

        Ok(DeviceLayout {
            info,
            models,
            discovered_at: Some(chrono::Utc::now()),
        })
    }

    /// Read every decodable model in `layout`, in ascending address order.
    ///
    /// A transport failure fails the whole read. A block whose header no
    /// longer matches the layout is dropped and reported in `mismatched`.
    pub async fn read(
        &self,
        device: &DeviceId,
        layout: &DeviceLayout,
    ) -> Result<ModelRead, TransportError> {
        let mut result = ModelRead::default();
        let mut first = true;

        for entry in layout.in_address_order() {
            if entry.id == COMMON_MODEL_ID || !self.schema.contains(entry.id) {
                continue;
            }
            if !self.due(device, entry.id) {
                trace!("{}: model {} not due yet", device, entry.id);
                continue;
            }

            if !first && !self.settings.read_delay.is_zero() {
                tokio::time::sleep(self.settings.read_delay).await;
            }
            first = false;

            let words = self.read_span(device, entry.address, entry.block_len()).await?;
            if let Some(datalog) = &self.datalog {
                if let Err(e) = datalog.write_block(device, entry.id, entry.address, &words) {
                    warn!("datalog write failed: {}", e);
                }
            }

            match self.decode_block(&entry, &words) {
                Ok(reading) => {
                    self.mark_read(device, entry.id);
                    result.readings.push(reading);
                }
                Err(e) => {
                    warn!("{}: {}", device, e);
                    result.mismatched.push(entry.id);
                }
            }
        }

        Ok(result)
    }

    fn decode_block(
        &self,
        entry: &ModelEntry,
        words: &[u16],
    ) -> Result<DecodedReading, DecodeError> {
        let (id, length) = (words[0], words[1]);
        if id != entry.id || length != entry.length {
            return Err(DecodeError::Structural {
                model_id: entry.id,
                expected: format!("header {}/{}", entry.id, entry.length),
                actual: length as usize,
            });
        }
        decode(&self.schema, &self.flags, entry.id, &words[2..])
    }

    /// Read `count` words starting at `address`, split into protocol-sized requests.
    async fn read_span(
        &self,
        device: &DeviceId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut words = Vec::with_capacity(count as usize);
        let mut offset = 0u16;
        while offset < count {
            let chunk = (count - offset).min(MAX_READ_REGISTERS);
            let start = address.checked_add(offset).ok_or_else(|| TransportError::Transient {
                attempts: 0,
                reason: format!("address {} + {} overflows", address, offset),
            })?;
            let part = self.transport.read(device, start, chunk).await?;
            if part.len() != chunk as usize {
                return Err(TransportError::Transient {
                    attempts: 1,
                    reason: format!(
                        "asked for {} registers at {}, got {}",
                        chunk,
                        start,
                        part.len()
                    ),
                });
            }
            words.extend(part);
            offset += chunk;
        }
        Ok(words)
    }

    fn due(&self, device: &DeviceId, model_id: u16) -> bool {
        let Some(interval) = self.settings.model_intervals.get(&model_id) else {
            return true;
        };
        let last_read = self.last_read.lock().unwrap_or_else(PoisonError::into_inner);
        match last_read.get(&(device.clone(), model_id)) {
            Some(at) => at.elapsed() >= *interval,
            None => true,
        }
    }

    fn mark_read(&self, device: &DeviceId, model_id: u16) {
        if self.settings.model_intervals.contains_key(&model_id) {
            self.last_read
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((device.clone(), model_id), Instant::now());
        }
    }
}

fn header(words: &[u16]) -> Result<(u16, u16), TransportError> {
    match words {
        [a, b] => Ok((*a, *b)),
        _ => Err(TransportError::Transient {
            attempts: 1,
            reason: format!("expected 2 header registers, got {}", words.len()),
        }),
    }
}

/// Address of the next model header after a model at `address` with body `length`.
fn next_address(address: u16, length: u16) -> Result<u16, ProbeError> {
    address
        .checked_add(2)
        .and_then(|a| a.checked_add(length))
        .ok_or(ProbeError::AddressOverflow(address))
}
