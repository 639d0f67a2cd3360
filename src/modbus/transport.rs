use crate::prelude::*;

use crate::error::{FailureKind, LinkError, TransportError};
use crate::modbus::frame::{exception_name, MbapCodec, ReadRequest, Response};
use crate::modbus::retry::{RetryMachine, RetryPolicy, RetryState, Sleeper};
use crate::stats::SharedStats;

use {
    async_trait::async_trait,
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::collections::HashMap,
    std::sync::{Arc, Mutex, PoisonError},
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
    tokio_util::codec::{Decoder, Encoder},
};

const TCP_KEEPALIVE_SECS: u64 = 60;

/// Consecutive exhausted retry cycles of connect/protocol errors before a
/// device is reported as fatally failing.
pub const ESCALATE_AFTER_CYCLES: u32 = 2;

/// One request/response exchange on an open gateway connection.
#[async_trait]
pub trait ModbusLink: Send {
    async fn read_holding(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, LinkError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        gateway: &Gateway,
        timeout: Duration,
    ) -> Result<Box<dyn ModbusLink>, LinkError>;
}

/// Register reads with retry, timeout and connection pooling applied.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    async fn read(
        &self,
        device: &DeviceId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Drop every pooled connection, waiting for in-flight exchanges first.
    async fn close(&self) {}
}

// TcpConnector {{{
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        gateway: &Gateway,
        timeout: Duration,
    ) -> Result<Box<dyn ModbusLink>, LinkError> {
        let address = gateway.to_string();
        debug!("connecting to {}", address);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(LinkError::Connect { gateway: address, source }),
            Err(_) => {
                return Err(LinkError::Connect {
                    gateway: address,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("Failed to set TCP keepalive on {}: {}", address, e);
        }
        let stream = TcpStream::from_std(std_stream)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }

        info!("connected to {}", address);
        Ok(Box::new(TcpLink::new(stream)))
    }
} // }}}

// TcpLink {{{
pub struct TcpLink {
    stream: TcpStream,
    codec: MbapCodec,
    buf: BytesMut,
    next_transaction: u16,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            codec: MbapCodec::new(),
            buf: BytesMut::with_capacity(512),
            next_transaction: 0,
        }
    }

    async fn exchange(
        &mut self,
        request: &[u8],
        transaction: u16,
        unit_id: u8,
    ) -> Result<Vec<u16>, LinkError> {
        self.stream.write_all(request).await?;

        loop {
            while let Some(response) = self.codec.decode(&mut self.buf)? {
                if response.transaction() != transaction {
                    debug!(
                        "discarding reply to transaction {} while waiting for {}",
                        response.transaction(),
                        transaction
                    );
                    continue;
                }
                if response.unit_id() != unit_id {
                    return Err(LinkError::Protocol(format!(
                        "asked unit {}, reply came from unit {}",
                        unit_id,
                        response.unit_id()
                    )));
                }
                return match response {
                    Response::Registers { words, .. } => Ok(words),
                    Response::Exception { code, .. } => {
                        debug!("unit {} replied with exception {}", unit_id, exception_name(code));
                        Err(LinkError::Exception(code))
                    }
                };
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "gateway closed the connection",
                )));
            }
        }
    }
}

#[async_trait]
impl ModbusLink for TcpLink {
    async fn read_holding(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, LinkError> {
        self.next_transaction = self.next_transaction.wrapping_add(1);
        let transaction = self.next_transaction;

        let mut request = BytesMut::new();
        self.codec.encode(
            ReadRequest {
                transaction,
                unit_id,
                address,
                count,
            },
            &mut request,
        )?;

        match tokio::time::timeout(timeout, self.exchange(&request, transaction, unit_id)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(timeout)),
        }
    }
} // }}}

#[derive(Clone, Copy, Debug)]
pub struct TransportSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub reconnect_on_unit_change: bool,
}

impl TransportSettings {
    pub fn from_config(config: &ConfigWrapper) -> Self {
        let modbus = config.modbus();
        Self {
            timeout: modbus.timeout(),
            retry: RetryPolicy::new(modbus.retry_attempts(), modbus.retry_delay()),
            reconnect_on_unit_change: modbus.reconnect_on_unit_change(),
        }
    }
}

struct GatewaySlot {
    gateway: Gateway,
    link: Option<Box<dyn ModbusLink>>,
    last_unit: Option<u8>,
}

/// Pool of one lazily opened connection per gateway.
///
/// Exchanges on one gateway are serialized by its slot lock; different
/// gateways proceed independently.
pub struct Transport {
    connector: Arc<dyn Connector>,
    sleeper: Arc<dyn Sleeper>,
    settings: TransportSettings,
    stats: SharedStats,
    gateways: Mutex<HashMap<Gateway, Arc<tokio::sync::Mutex<GatewaySlot>>>>,
    // consecutive escalating retry cycles per device
    streaks: Mutex<HashMap<DeviceId, u32>>,
}

impl Transport {
    pub fn new(
        connector: Arc<dyn Connector>,
        sleeper: Arc<dyn Sleeper>,
        settings: TransportSettings,
        stats: SharedStats,
    ) -> Self {
        Self {
            connector,
            sleeper,
            settings,
            stats,
            gateways: Mutex::new(HashMap::new()),
            streaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    fn slot(&self, gateway: &Gateway) -> Arc<tokio::sync::Mutex<GatewaySlot>> {
        let mut gateways = self.gateways.lock().unwrap_or_else(PoisonError::into_inner);
        gateways
            .entry(gateway.clone())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(GatewaySlot {
                    gateway: gateway.clone(),
                    link: None,
                    last_unit: None,
                }))
            })
            .clone()
    }

    async fn attempt(
        &self,
        device: &DeviceId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, LinkError> {
        let slot = self.slot(&device.gateway);
        let mut slot = slot.lock().await;

        if self.settings.reconnect_on_unit_change
            && slot.link.is_some()
            && slot.last_unit.is_some_and(|unit| unit != device.unit_id)
        {
            debug!("{}: unit id changed, reopening connection", device);
            slot.link = None;
        }

        let mut link = match slot.link.take() {
            Some(link) => link,
            None => {
                let link = self.connector.connect(&device.gateway, self.settings.timeout).await?;
                if let Ok(mut stats) = self.stats.lock() {
                    stats.connects += 1;
                }
                link
            }
        };
        slot.last_unit = Some(device.unit_id);

        let result = match link
            .read_holding(device.unit_id, address, count, self.settings.timeout)
            .await
        {
            Ok(words) if words.len() != count as usize => Err(LinkError::Protocol(format!(
                "asked for {} registers, got {}",
                count,
                words.len()
            ))),
            other => other,
        };

        match &result {
            Err(err) if err.poisons_connection() => {
                debug!("{}: dropping connection after {}", slot.gateway, err);
            }
            _ => slot.link = Some(link),
        }

        result
    }

    async fn disconnect(&self, gateway: &Gateway) {
        let slot = self.slot(gateway);
        slot.lock().await.link = None;
    }

    fn reset_streak(&self, device: &DeviceId) {
        self.streaks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);
    }

    /// Classify an exhausted retry cycle, escalating repeated
    /// connect/protocol failures to Fatal.
    fn exhausted(
        &self,
        device: &DeviceId,
        attempts: u32,
        reason: String,
        escalating: bool,
    ) -> TransportError {
        let mut streaks = self.streaks.lock().unwrap_or_else(PoisonError::into_inner);

        if !escalating {
            streaks.remove(device);
            return TransportError::Transient { attempts, reason };
        }

        let streak = streaks.entry(device.clone()).or_insert(0);
        *streak += 1;
        if *streak >= ESCALATE_AFTER_CYCLES {
            TransportError::Fatal {
                reason: format!("{} ({} consecutive retry cycles)", reason, streak),
            }
        } else {
            TransportError::Transient { attempts, reason }
        }
    }
}

#[async_trait]
impl RegisterTransport for Transport {
    async fn read(
        &self,
        device: &DeviceId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let policy = self.settings.retry;
        let mut machine = RetryMachine::new(policy);
        let mut state = machine.start();
        let mut last_error: Option<LinkError> = None;
        let mut escalating = true;

        loop {
            match state {
                RetryState::Attempting { attempt } => {
                    match self.attempt(device, address, count).await {
                        Ok(words) => {
                            machine.record_success();
                            self.reset_streak(device);
                            if let Ok(mut stats) = self.stats.lock() {
                                stats.blocks_read += 1;
                            }
                            return Ok(words);
                        }
                        Err(err) => {
                            debug!(
                                "{}: read {}+{} attempt {}/{} failed: {}",
                                device, address, count, attempt, policy.attempts, err
                            );
                            escalating &= err.kind() == FailureKind::Escalating;
                            last_error = Some(err);
                            state = machine.record_failure();
                        }
                    }
                }
                RetryState::Retrying { .. } => {
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.retried_attempts += 1;
                    }
                    self.sleeper.sleep(policy.delay).await;
                    state = machine.next_attempt();
                }
                RetryState::Exhausted { attempts } => {
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.block_read_failures += 1;
                    }
                    self.disconnect(&device.gateway).await;
                    let reason = last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no attempt made".to_string());
                    return Err(self.exhausted(device, attempts, reason, escalating));
                }
                RetryState::Idle | RetryState::Succeeded { .. } => {
                    return Err(TransportError::Transient {
                        attempts: 0,
                        reason: format!("retry machine stopped in {:?}", state),
                    });
                }
            }
        }
    }

    async fn close(&self) {
        let slots: Vec<_> = self
            .gateways
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for slot in slots {
            let mut slot = slot.lock().await;
            if slot.link.take().is_some() {
                info!("closed connection to {}", slot.gateway);
            }
        }
    }
}
