use crate::prelude::*;

use crate::device::{DeviceInfo, DeviceLayout};
use crate::device_cache::DeviceCache;
use crate::error::ProbeError;
use crate::sink::SinkBinding;
use crate::stats::SharedStats;
use crate::sunspec::{DecodedReading, ModelReader};

use {
    chrono::{DateTime, Utc},
    std::collections::{BTreeMap, HashMap},
    std::sync::{Arc, Mutex, PoisonError},
    std::time::Duration,
    tokio::sync::broadcast::error::TryRecvError,
    tokio::time::MissedTickBehavior,
};

/// Everything read from one device in one cycle, stamped with one instant.
#[derive(Clone, Debug)]
pub struct DeviceReading {
    pub device: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub info: DeviceInfo,
    pub readings: Vec<DecodedReading>,
}

impl DeviceReading {
    /// All model fields flattened into one map, plus the identity strings
    /// from the common model.
    pub fn fields(&self) -> BTreeMap<String, FieldValue> {
        let mut fields = BTreeMap::new();

        let identity = [
            ("manufacturer", &self.info.manufacturer),
            ("model", &self.info.model),
            ("version", &self.info.version),
            ("serial_number", &self.info.serial_number),
        ];
        for (name, value) in identity {
            if !value.is_empty() {
                fields.insert(name.to_string(), FieldValue::text(value.as_str()));
            }
        }

        for reading in &self.readings {
            for (name, value) in &reading.fields {
                fields.insert(name.clone(), value.clone());
            }
        }
        fields
    }

    pub fn model_ids(&self) -> Vec<u16> {
        self.readings.iter().map(|r| r.model_id).collect()
    }
}

/// Outcome of one device poll.
#[derive(Clone, Debug)]
pub enum PollResult {
    Success(DeviceReading),
    /// Skipped this cycle, retried next cycle.
    TransientFailure(String),
    /// Device is marked unhealthy and polled less often.
    FatalFailure(String),
}

impl PollResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PollResult::Success(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Cycles left to skip before the next attempt.
    Unhealthy { skip: u32 },
}

#[derive(Clone, Debug)]
pub struct ScheduleSettings {
    pub poll_interval: Duration,
    /// Pause between consecutive devices of one cycle.
    pub device_delay: Duration,
    /// Cycles skipped between attempts on an unhealthy device.
    pub unhealthy_backoff_cycles: u32,
}

impl ScheduleSettings {
    pub fn from_config(config: &ConfigWrapper, class: DeviceClass) -> Self {
        let devices = config.devices();
        Self {
            poll_interval: config.poll_interval(class),
            device_delay: match class {
                DeviceClass::Inverter => devices.inverter_poll_delay(),
                DeviceClass::Meter => Duration::ZERO,
            },
            unhealthy_backoff_cycles: devices.unhealthy_backoff_cycles(),
        }
    }
}

/// Periodic poll loop for every configured device of one class.
pub struct Scheduler {
    class: DeviceClass,
    devices: Vec<DeviceId>,
    reader: Arc<ModelReader>,
    cache: Arc<DeviceCache>,
    sinks: Vec<SinkBinding>,
    settings: ScheduleSettings,
    shared_stats: SharedStats,
    health: Mutex<HashMap<DeviceId, Health>>,
}

impl Scheduler {
    pub fn new(
        class: DeviceClass,
        devices: Vec<DeviceId>,
        reader: Arc<ModelReader>,
        cache: Arc<DeviceCache>,
        sinks: Vec<SinkBinding>,
        settings: ScheduleSettings,
        shared_stats: SharedStats,
    ) -> Self {
        Self {
            class,
            devices,
            reader,
            cache,
            sinks,
            settings,
            shared_stats,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn health(&self, device: &DeviceId) -> Health {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .copied()
            .unwrap_or(Health::Healthy)
    }

    fn set_health(&self, device: &DeviceId, health: Health) {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.clone(), health);
    }

    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if self.devices.is_empty() {
            info!("no {}s configured, {} poller not started", self.class, self.class);
            return Ok(());
        }

        info!(
            "{} poller started: {} devices every {:?}",
            self.class,
            self.devices.len(),
            self.settings.poll_interval
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }

            if !self.run_cycle(&mut shutdown).await {
                break;
            }
        }

        info!("{} poller exiting", self.class);
        Ok(())
    }

    /// Poll every device once. Returns false if shutdown was requested;
    /// the device in flight is always finished first.
    pub async fn run_cycle(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 && !self.settings.device_delay.is_zero() {
                tokio::select! {
                    _ = shutdown.recv() => return false,
                    _ = tokio::time::sleep(self.settings.device_delay) => {}
                }
            }
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                return false;
            }

            self.poll_once(device).await;
        }
        true
    }

    /// One scheduled visit to a device: honours unhealthy backoff, polls,
    /// publishes and updates health. Returns None if the device was skipped.
    pub async fn poll_once(&self, device: &DeviceId) -> Option<PollResult> {
        if let Health::Unhealthy { skip } = self.health(device) {
            if skip > 0 {
                self.set_health(device, Health::Unhealthy { skip: skip - 1 });
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.polls_skipped_unhealthy += 1;
                }
                trace!("{}: unhealthy, {} cycles until next attempt", device, skip);
                return None;
            }
        }

        let result = self.poll_device(device).await;

        match &result {
            PollResult::Success(reading) => {
                self.publish(reading).await;
                if self.health(device) != Health::Healthy {
                    info!("{}: recovered, polling normally again", device);
                }
                self.set_health(device, Health::Healthy);
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.polls_succeeded += 1;
                }
            }
            PollResult::TransientFailure(reason) => {
                warn!("{}: poll failed, skipping this cycle: {}", device, reason);
                if let Health::Unhealthy { .. } = self.health(device) {
                    self.backoff(device);
                }
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.polls_transient += 1;
                    stats.last_failures.insert(device.key(), reason.clone());
                }
            }
            PollResult::FatalFailure(reason) => {
                if self.health(device) == Health::Healthy {
                    error!(
                        "{}: marked unhealthy, retrying every {} cycles: {}",
                        device,
                        self.settings.unhealthy_backoff_cycles + 1,
                        reason
                    );
                } else {
                    debug!("{}: still unhealthy: {}", device, reason);
                }
                self.backoff(device);
                // recovery has to start from a fresh probe
                self.cache.mark_reprobe(device).await;
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.polls_fatal += 1;
                    stats.last_failures.insert(device.key(), reason.clone());
                }
            }
        }

        Some(result)
    }

    fn backoff(&self, device: &DeviceId) {
        self.set_health(
            device,
            Health::Unhealthy {
                skip: self.settings.unhealthy_backoff_cycles,
            },
        );
    }

    /// Read a device, probing first if its layout is unknown or stale.
    pub async fn poll_device(&self, device: &DeviceId) -> PollResult {
        let snapshot = self.cache.get(device).await;

        let layout = match snapshot.usable_layout() {
            Some(layout) => layout.clone(),
            None => match self.probe(device).await {
                Ok(layout) => layout,
                Err(result) => return result,
            },
        };

        match self.reader.read(device, &layout).await {
            Ok(read) => {
                if read.needs_reprobe() {
                    warn!(
                        "{}: models {:?} no longer match, re-probing next cycle",
                        device, read.mismatched
                    );
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.structural_mismatches += read.mismatched.len() as u64;
                    }
                    self.cache.mark_reprobe(device).await;
                }

                PollResult::Success(DeviceReading {
                    device: device.clone(),
                    timestamp: Utc::now(),
                    info: layout.info,
                    readings: read.readings,
                })
            }
            Err(err) if err.is_fatal() => PollResult::FatalFailure(err.to_string()),
            Err(err) => PollResult::TransientFailure(err.to_string()),
        }
    }

    async fn probe(&self, device: &DeviceId) -> Result<DeviceLayout, PollResult> {
        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.probes += 1;
        }

        let layout = self.reader.probe(device).await.map_err(|err| match err {
            ProbeError::Transport(e) if !e.is_fatal() => {
                PollResult::TransientFailure(e.to_string())
            }
            ProbeError::Decode(e) => PollResult::TransientFailure(format!("probe: {}", e)),
            e => PollResult::FatalFailure(format!("probe: {}", e)),
        })?;

        if let Err(err) = self.cache.store_layout(device, layout.clone()).await {
            error!("{}: failed to persist layout: {:?}", device, err);
            if let Ok(mut stats) = self.shared_stats.lock() {
                stats.cache_errors += 1;
            }
        }
        Ok(layout)
    }

    /// Diff a reading against the cache, hand it to every sink according
    /// to its publish mode, then commit. Returns the number of sink calls.
    pub async fn publish(&self, reading: &DeviceReading) -> usize {
        let device = &reading.device;
        let fields = reading.fields();
        let changed = self.cache.diff(device, &fields).await;
        let mut published = 0;
        let mut errors = 0;

        for (name, value) in &fields {
            let is_change = changed.contains(name);
            for binding in &self.sinks {
                if !binding.wants(value, is_change) {
                    continue;
                }
                match binding
                    .sink
                    .publish(device, name, value, reading.timestamp, is_change)
                    .await
                {
                    Ok(()) => published += 1,
                    Err(err) => {
                        errors += 1;
                        warn!(
                            "{}: {} sink rejected {}: {}",
                            device,
                            binding.sink.name(),
                            name,
                            err
                        );
                    }
                }
            }
        }

        for binding in &self.sinks {
            if let Err(err) = binding.sink.end_cycle(device, reading.timestamp).await {
                errors += 1;
                warn!("{}: {} sink failed to finish cycle: {}", device, binding.sink.name(), err);
            }
        }

        let cache_failed = match self.cache.commit(device, &fields, reading.timestamp).await {
            Ok(_) => false,
            Err(err) => {
                error!("{}: failed to persist published values: {:?}", device, err);
                true
            }
        };

        debug!(
            "{}: models {:?}, {} fields, {} changed, {} sink calls",
            device,
            reading.model_ids(),
            fields.len(),
            changed.len(),
            published
        );

        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.fields_published += published as u64;
            stats.fields_unchanged += (fields.len() - changed.len()) as u64;
            stats.sink_errors += errors;
            if cache_failed {
                stats.cache_errors += 1;
            }
        }

        published
    }
}
