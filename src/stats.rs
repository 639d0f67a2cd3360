use crate::prelude::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type SharedStats = Arc<Mutex<PollStats>>;

#[derive(Debug, Default, Clone)]
pub struct PollStats {
    // Transport
    pub blocks_read: u64,
    pub block_read_failures: u64,
    pub retried_attempts: u64,
    pub connects: u64,
    // Poll outcomes
    pub polls_succeeded: u64,
    pub polls_transient: u64,
    pub polls_fatal: u64,
    pub polls_skipped_unhealthy: u64,
    pub probes: u64,
    pub structural_mismatches: u64,
    // Publishing
    pub fields_published: u64,
    pub fields_unchanged: u64,
    pub sink_errors: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
    pub influx_writes: u64,
    pub influx_errors: u64,
    pub influx_dropped: u64,
    pub cache_errors: u64,
    // Last failure reason per device
    pub last_failures: HashMap<String, String>,
}

impl PollStats {
    pub fn shared() -> SharedStats {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn print_summary(&self) {
        info!("Poll Statistics:");
        info!("  Transport:");
        info!("    Blocks read: {}", self.blocks_read);
        info!("    Block read failures: {}", self.block_read_failures);
        info!("    Retried attempts: {}", self.retried_attempts);
        info!("    Connects: {}", self.connects);
        info!("  Polls:");
        info!("    Succeeded: {}", self.polls_succeeded);
        info!("    Transient failures: {}", self.polls_transient);
        info!("    Fatal failures: {}", self.polls_fatal);
        info!("    Skipped while unhealthy: {}", self.polls_skipped_unhealthy);
        info!("    Probes: {}", self.probes);
        info!("    Structural mismatches: {}", self.structural_mismatches);
        info!("  Publishing:");
        info!("    Fields published: {}", self.fields_published);
        info!("    Fields unchanged: {}", self.fields_unchanged);
        info!("    Sink errors: {}", self.sink_errors);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
        info!("  InfluxDB:");
        info!("    Writes: {}", self.influx_writes);
        info!("    Errors: {}", self.influx_errors);
        info!("    Dropped points: {}", self.influx_dropped);
        info!("  Device cache errors: {}", self.cache_errors);
        if !self.last_failures.is_empty() {
            info!("  Last failure by device:");
            let mut devices: Vec<_> = self.last_failures.iter().collect();
            devices.sort();
            for (device, reason) in devices {
                info!("    {}: {}", device, reason);
            }
        }
    }
}
