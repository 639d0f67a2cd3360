#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sunspec_bridge::device_cache::{DeviceCache, SqliteStore};
use sunspec_bridge::error::{LinkError, TransportError};
use sunspec_bridge::modbus::{Connector, ModbusLink, RegisterTransport, Sleeper};
use sunspec_bridge::prelude::*;
use sunspec_bridge::scheduler::{ScheduleSettings, Scheduler};
use sunspec_bridge::sink::SinkBinding;
use sunspec_bridge::stats::{PollStats, SharedStats};
use sunspec_bridge::sunspec::{FlagLookup, ModelReader, ModelSchema, ReaderSettings};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;

impl Factory {
    pub fn gateway() -> Gateway {
        Gateway::new("192.168.1.20", 502)
    }

    pub fn inverter(unit_id: u8) -> DeviceId {
        DeviceId::new(Self::gateway(), unit_id, DeviceClass::Inverter)
    }

    pub fn meter(unit_id: u8) -> DeviceId {
        DeviceId::new(Self::gateway(), unit_id, DeviceClass::Meter)
    }

    pub fn schema() -> Arc<ModelSchema> {
        Arc::new(ModelSchema::builtin().unwrap())
    }

    pub fn flags() -> Arc<FlagLookup> {
        Arc::new(FlagLookup::from_file("config/event_flags.yaml").unwrap())
    }
}

// register map builders {{{
pub fn encode_string(s: &str, words: usize) -> Vec<u16> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(words * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn encode_u32(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

pub fn encode_sf(sf: i16) -> u16 {
    sf as u16
}

/// Body of an inverter model (101/102/103) with every field not
/// implemented unless set.
#[derive(Clone, Debug)]
pub struct InverterBody {
    words: Vec<u16>,
}

impl Default for InverterBody {
    fn default() -> Self {
        let mut words = vec![0xFFFF; 50];
        // scale factors
        for offset in [4, 11, 13, 15, 17, 19, 21, 24, 26, 28, 30, 35] {
            words[offset] = 0x8000;
        }
        // int16 fields
        for offset in [12, 16, 18, 20, 29, 31, 32, 33, 34] {
            words[offset] = 0x8000;
        }
        Self { words }
    }
}

impl InverterBody {
    pub fn ac_power(mut self, raw: i16, sf: i16) -> Self {
        self.words[12] = raw as u16;
        self.words[13] = encode_sf(sf);
        self
    }

    pub fn energy(mut self, wh: u32) -> Self {
        let [hi, lo] = encode_u32(wh);
        self.words[22] = hi;
        self.words[23] = lo;
        self.words[24] = 0;
        self
    }

    pub fn ac_voltage_an(mut self, raw: u16, sf: i16) -> Self {
        self.words[8] = raw;
        self.words[11] = encode_sf(sf);
        self
    }

    pub fn operating_state(mut self, code: u16) -> Self {
        self.words[36] = code;
        self
    }

    pub fn events(mut self, bits: u32) -> Self {
        let [hi, lo] = encode_u32(bits);
        self.words[38] = hi;
        self.words[39] = lo;
        self
    }

    pub fn words(self) -> Vec<u16> {
        self.words
    }
}

/// Lays out a SunSpec register map: marker, common model, then models
/// back to back, then the end marker.
pub struct SunSpecMapBuilder {
    next: u16,
    words: BTreeMap<u16, u16>,
    models: Vec<(u16, u16)>,
}

impl SunSpecMapBuilder {
    pub fn new(base: u16) -> Self {
        let mut words = BTreeMap::new();
        words.insert(base, 0x5375);
        words.insert(base + 1, 0x6E53);
        Self {
            next: base + 2,
            words,
            models: Vec::new(),
        }
    }

    pub fn common(self, manufacturer: &str, model: &str, version: &str, serial: &str) -> Self {
        let mut body = Vec::with_capacity(66);
        body.extend(encode_string(manufacturer, 16));
        body.extend(encode_string(model, 16));
        body.extend(encode_string("", 8));
        body.extend(encode_string(version, 8));
        body.extend(encode_string(serial, 16));
        body.push(1);
        body.push(0xFFFF);
        self.model(1, body)
    }

    pub fn model(mut self, id: u16, body: Vec<u16>) -> Self {
        let address = self.next;
        self.models.push((id, address));
        self.words.insert(address, id);
        self.words.insert(address + 1, body.len() as u16);
        for (i, word) in body.iter().enumerate() {
            self.words.insert(address + 2 + i as u16, *word);
        }
        self.next = address + 2 + body.len() as u16;
        self
    }

    /// Header address of each model, in layout order.
    pub fn addresses(&self) -> Vec<(u16, u16)> {
        self.models.clone()
    }

    pub fn build(mut self) -> BTreeMap<u16, u16> {
        self.words.insert(self.next, 0xFFFF);
        self.words.insert(self.next + 1, 0);
        self.words
    }
}

/// The standard test inverter: common model at 40002, model 103 at 40070.
pub fn inverter_map(body: InverterBody) -> BTreeMap<u16, u16> {
    SunSpecMapBuilder::new(40000)
        .common("Fronius", "Symo 8.2-3-M", "1.28.7-1", "34119102")
        .model(103, body.words())
        .build()
} // }}}

// fake register transport {{{
/// In-memory registers per (gateway, unit id) with scripted failures.
#[derive(Default)]
pub struct FakeRegisters {
    devices: Mutex<HashMap<(Gateway, u8), BTreeMap<u16, u16>>>,
    failures: Mutex<HashMap<(Gateway, u8), VecDeque<TransportError>>>,
    pub reads: AtomicU32,
}

impl FakeRegisters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, device: &DeviceId, map: BTreeMap<u16, u16>) {
        self.devices
            .lock()
            .unwrap()
            .insert((device.gateway.clone(), device.unit_id), map);
    }

    pub fn set(&self, device: &DeviceId, address: u16, words: &[u16]) {
        let mut devices = self.devices.lock().unwrap();
        let map = devices
            .entry((device.gateway.clone(), device.unit_id))
            .or_default();
        for (i, word) in words.iter().enumerate() {
            map.insert(address + i as u16, *word);
        }
    }

    /// The next reads of `device` fail with these errors, one per read.
    pub fn fail_next(&self, device: &DeviceId, errors: Vec<TransportError>) {
        self.failures
            .lock()
            .unwrap()
            .entry((device.gateway.clone(), device.unit_id))
            .or_default()
            .extend(errors);
    }

    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegisterTransport for FakeRegisters {
    async fn read(
        &self,
        device: &DeviceId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let key = (device.gateway.clone(), device.unit_id);

        if let Some(err) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let devices = self.devices.lock().unwrap();
        let map = devices.get(&key).ok_or_else(|| TransportError::Transient {
            attempts: 1,
            reason: "no such device".to_string(),
        })?;

        (address..address + count)
            .map(|a| {
                map.get(&a).copied().ok_or_else(|| TransportError::Transient {
                    attempts: 1,
                    reason: format!("illegal data address {}", a),
                })
            })
            .collect()
    }
} // }}}

// fake connector {{{
/// Connector whose links answer from a shared reply script.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub connects: Arc<AtomicU32>,
    pub refuse: Arc<Mutex<bool>>,
    pub replies: Arc<Mutex<VecDeque<Result<Vec<u16>, LinkError>>>>,
    pub requests: Arc<Mutex<Vec<(u8, u16, u16)>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }

    pub fn reply(&self, reply: Result<Vec<u16>, LinkError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

struct FakeLink {
    replies: Arc<Mutex<VecDeque<Result<Vec<u16>, LinkError>>>>,
    requests: Arc<Mutex<Vec<(u8, u16, u16)>>>,
}

#[async_trait]
impl ModbusLink for FakeLink {
    async fn read_holding(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, LinkError> {
        self.requests.lock().unwrap().push((unit_id, address, count));
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or(Err(LinkError::Timeout(timeout)))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        gateway: &Gateway,
        _timeout: Duration,
    ) -> Result<Box<dyn ModbusLink>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if *self.refuse.lock().unwrap() {
            return Err(LinkError::Connect {
                gateway: gateway.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            });
        }
        Ok(Box::new(FakeLink {
            replies: self.replies.clone(),
            requests: self.requests.clone(),
        }))
    }
}

/// Records requested delays without waiting.
#[derive(Default)]
pub struct InstantSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
} // }}}

// recording sink {{{
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub device: DeviceId,
    pub field: String,
    pub value: FieldValue,
    pub is_change: bool,
}

#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<Published>>,
    pub cycles: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }

    pub fn value(&self, field: &str) -> Option<FieldValue> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.field == field)
            .map(|p| p.value.clone())
    }
}

#[async_trait]
impl PublishSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(
        &self,
        device: &DeviceId,
        field: &str,
        value: &FieldValue,
        _timestamp: DateTime<Utc>,
        is_change: bool,
    ) -> Result<()> {
        self.published.lock().unwrap().push(Published {
            device: device.clone(),
            field: field.to_string(),
            value: value.clone(),
            is_change,
        });
        Ok(())
    }

    async fn end_cycle(&self, _device: &DeviceId, _timestamp: DateTime<Utc>) -> Result<()> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
} // }}}

/// Everything a scheduler test needs, on an in-memory cache.
pub struct Harness {
    pub registers: Arc<FakeRegisters>,
    pub cache: Arc<DeviceCache>,
    pub sink: Arc<RecordingSink>,
    pub stats: SharedStats,
    pub scheduler: Scheduler,
}

impl Harness {
    pub async fn new(devices: Vec<DeviceId>, mode: PublishMode) -> Self {
        let store = SqliteStore::in_memory().await.unwrap();
        let cache = Arc::new(DeviceCache::load(Arc::new(store), 0.0).await.unwrap());
        Self::with_cache(devices, mode, cache, FakeRegisters::new(), 3)
    }

    pub fn with_cache(
        devices: Vec<DeviceId>,
        mode: PublishMode,
        cache: Arc<DeviceCache>,
        registers: Arc<FakeRegisters>,
        backoff_cycles: u32,
    ) -> Self {
        let sink = RecordingSink::new();
        let stats = PollStats::shared();
        let class = devices.first().map(|d| d.class).unwrap_or(DeviceClass::Inverter);

        let reader = ModelReader::new(
            registers.clone(),
            Factory::schema(),
            Factory::flags(),
            ReaderSettings::default(),
        );
        let scheduler = Scheduler::new(
            class,
            devices,
            Arc::new(reader),
            cache.clone(),
            vec![SinkBinding::new(sink.clone(), mode)],
            ScheduleSettings {
                poll_interval: Duration::from_secs(5),
                device_delay: Duration::ZERO,
                unhealthy_backoff_cycles: backoff_cycles,
            },
            stats.clone(),
        );

        Self {
            registers,
            cache,
            sink,
            stats,
            scheduler,
        }
    }
}
