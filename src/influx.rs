use crate::prelude::*;
use crate::stats::SharedStats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rinfluxdb::line_protocol::{r#async::Client, LineBuilder};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

static MEASUREMENT_PREFIX: &str = "sunspec";

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum ChannelData {
    Flush,
    Shutdown,
}

/// One line-protocol point: all numeric fields of one device from one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingPoint {
    pub device: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

impl PendingPoint {
    pub fn measurement(&self) -> String {
        format!("{}_{}", MEASUREMENT_PREFIX, self.device.class)
    }
}

// Batcher {{{
/// Coalesces field updates into per-device points and rate-limits them.
///
/// Points are released at most once per `write_interval` per device into a
/// bounded queue; when the queue is full the oldest point is dropped.
#[derive(Debug)]
pub struct Batcher {
    write_interval: Duration,
    max_pending: usize,
    open: HashMap<DeviceId, PendingPoint>,
    queue: VecDeque<PendingPoint>,
    last_release: HashMap<DeviceId, DateTime<Utc>>,
    dropped: u64,
}

impl Batcher {
    pub fn new(write_interval: Duration, max_pending: usize) -> Self {
        Self {
            write_interval,
            max_pending: max_pending.max(1),
            open: HashMap::new(),
            queue: VecDeque::new(),
            last_release: HashMap::new(),
            dropped: 0,
        }
    }

    /// Merge one field into the device's open point; the newest value wins.
    pub fn record(&mut self, device: &DeviceId, field: &str, value: f64, timestamp: DateTime<Utc>) {
        let point = self.open.entry(device.clone()).or_insert_with(|| PendingPoint {
            device: device.clone(),
            timestamp,
            fields: BTreeMap::new(),
        });
        point.timestamp = timestamp;
        point.fields.insert(field.to_string(), value);
    }

    fn due(&self, device: &DeviceId, now: DateTime<Utc>) -> bool {
        match self.last_release.get(device) {
            None => true,
            // a clock stepped backwards counts as due
            Some(last) => (now - *last)
                .to_std()
                .map(|elapsed| elapsed >= self.write_interval)
                .unwrap_or(true),
        }
    }

    /// Queue the device's open point if its interval has passed.
    pub fn release(&mut self, device: &DeviceId, now: DateTime<Utc>) -> bool {
        if !self.open.contains_key(device) || !self.due(device, now) {
            return false;
        }
        match self.open.remove(device) {
            Some(point) => {
                self.last_release.insert(device.clone(), now);
                self.enqueue(point);
                true
            }
            None => false,
        }
    }

    /// Queue every open point whose interval has passed.
    pub fn release_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut devices: Vec<DeviceId> = self.open.keys().cloned().collect();
        devices.sort();
        devices
            .into_iter()
            .filter(|device| self.release(device, now))
            .count()
    }

    /// Queue every open point regardless of interval; used at shutdown.
    pub fn release_all(&mut self, now: DateTime<Utc>) {
        let mut points: Vec<PendingPoint> = self.open.drain().map(|(_, p)| p).collect();
        points.sort_by(|a, b| a.device.cmp(&b.device));
        for point in points {
            self.last_release.insert(point.device.clone(), now);
            self.enqueue(point);
        }
    }

    fn enqueue(&mut self, point: PendingPoint) {
        self.queue.push_back(point);
        self.trim();
    }

    fn trim(&mut self) {
        while self.queue.len() > self.max_pending {
            self.queue.pop_front();
            self.dropped += 1;
        }
    }

    pub fn take_queued(&mut self) -> Vec<PendingPoint> {
        self.queue.drain(..).collect()
    }

    /// Put back points whose write failed, ahead of anything newer.
    pub fn requeue(&mut self, points: Vec<PendingPoint>) {
        for point in points.into_iter().rev() {
            self.queue.push_front(point);
        }
        self.trim();
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn open_points(&self) -> usize {
        self.open.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
} // }}}

/// Writes a batch of points to the database.
#[async_trait]
pub trait LineWriter: Send + Sync {
    async fn write(&self, points: &[PendingPoint]) -> Result<()>;
}

pub struct RinfluxWriter {
    client: Client,
    database: String,
}

impl RinfluxWriter {
    pub fn new(config: &config::Influx) -> Result<Self> {
        let url = reqwest::Url::parse(config.url())?;
        let credentials = match (config.username(), config.password()) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        };

        Ok(Self {
            client: Client::new(url, credentials)?,
            database: config.database().to_string(),
        })
    }
}

#[async_trait]
impl LineWriter for RinfluxWriter {
    async fn write(&self, points: &[PendingPoint]) -> Result<()> {
        let lines: Vec<_> = points
            .iter()
            .map(|point| {
                let measurement = point.measurement();
                let mut line = LineBuilder::new(measurement.as_str())
                    .insert_tag("unit_id", point.device.unit_id.to_string().as_str())
                    .insert_tag("gateway", point.device.gateway.to_string().as_str())
                    .set_timestamp(point.timestamp);
                for (name, value) in &point.fields {
                    line = line.insert_field(name.as_str(), *value);
                }
                line.build()
            })
            .collect();

        trace!("Sending to InfluxDB: {:?}", lines);
        self.client.send(&self.database, &lines).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Influx {
    config: ConfigWrapper,
    channels: Channels,
    batcher: Arc<Mutex<Batcher>>,
    shared_stats: SharedStats,
}

impl Influx {
    pub fn new(config: ConfigWrapper, channels: Channels, shared_stats: SharedStats) -> Self {
        let influx = config.influx();
        let batcher = Batcher::new(influx.write_interval(), influx.max_pending());

        Self {
            config,
            channels,
            batcher: Arc::new(Mutex::new(batcher)),
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        if !self.config.influx().enabled() {
            info!("influx disabled, skipping");
            return Ok(());
        }

        info!("initializing influx at {}", self.config.influx().url());
        let writer = RinfluxWriter::new(&self.config.influx())?;
        self.sender(&writer).await
    }

    pub fn stop(&self) {
        let _ = self.channels.to_influx.send(ChannelData::Shutdown);
    }

    fn batcher(&self) -> std::sync::MutexGuard<'_, Batcher> {
        self.batcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn sender(&self, writer: &dyn LineWriter) -> Result<()> {
        let mut receiver = self.channels.to_influx.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("InfluxDB sender started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.flush(writer, Utc::now()).await;
                }
                msg = receiver.recv() => match msg {
                    Ok(ChannelData::Flush) => {
                        let _ = self.flush(writer, Utc::now()).await;
                    }
                    Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => {
                        info!("InfluxDB sender received shutdown signal");
                        self.batcher().release_all(Utc::now());
                        let _ = self.flush(writer, Utc::now()).await;
                        break;
                    }
                    Err(RecvError::Lagged(_)) => {}
                }
            }
        }

        let queued = self.batcher().queued();
        if queued > 0 {
            warn!("InfluxDB sender exiting with {} unsent points", queued);
        }
        info!("InfluxDB sender loop exiting");
        Ok(())
    }

    /// Write everything that is due. Failed points go back to the queue.
    pub async fn flush(&self, writer: &dyn LineWriter, now: DateTime<Utc>) -> Result<usize> {
        let points = {
            let mut batcher = self.batcher();
            batcher.release_due(now);
            batcher.take_queued()
        };
        if points.is_empty() {
            return Ok(0);
        }

        match writer.write(&points).await {
            Ok(()) => {
                debug!("Sent {} points to InfluxDB", points.len());
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.influx_writes += 1;
                }
                Ok(points.len())
            }
            Err(err) => {
                error!("InfluxDB push of {} points failed: {:?}", points.len(), err);
                let dropped = {
                    let mut batcher = self.batcher();
                    batcher.requeue(points);
                    batcher.dropped()
                };
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.influx_errors += 1;
                    stats.influx_dropped = dropped;
                }
                Err(err)
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.batcher().queued()
    }
}

#[async_trait]
impl PublishSink for Influx {
    fn name(&self) -> &str {
        "influx"
    }

    async fn publish(
        &self,
        device: &DeviceId,
        field: &str,
        value: &FieldValue,
        timestamp: DateTime<Utc>,
        _is_change: bool,
    ) -> Result<()> {
        let numeric = match value {
            FieldValue::Number { value, .. } => *value,
            FieldValue::Flags { raw, .. } => *raw as f64,
            FieldValue::Text { .. } | FieldValue::Absent => return Ok(()),
        };
        self.batcher().record(device, field, numeric, timestamp);
        Ok(())
    }

    async fn end_cycle(&self, device: &DeviceId, timestamp: DateTime<Utc>) -> Result<()> {
        self.batcher().release(device, timestamp);
        Ok(())
    }
}
