use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSecondsWithFrac, OneOrMany};
use serde_yaml;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    pub modbus: Modbus,
    #[serde(default)]
    pub devices: Devices,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub influx: Influx,
}

// General {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct General {
    #[serde(default = "Config::default_loglevel")]
    pub log_level: String,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(default)]
    pub publish_mode: PublishMode,

    #[serde(default = "Config::default_cache_file")]
    pub cache_file: String,

    /// Model layouts; the built-in schema is used when unset.
    pub schema_file: Option<String>,
    pub flags_file: Option<String>,

    /// Optional path to append every raw register block as JSON lines
    pub datalog_file: Option<String>,

    #[serde(default = "Config::default_pid_file")]
    pub pid_file: String,

    #[serde(default)]
    pub float_tolerance: f64,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: Config::default_loglevel(),
            poll_interval: Config::default_poll_interval(),
            publish_mode: PublishMode::default(),
            cache_file: Config::default_cache_file(),
            schema_file: None,
            flags_file: None,
            datalog_file: None,
            pid_file: Config::default_pid_file(),
            float_tolerance: 0.0,
        }
    }
}

impl General {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn publish_mode(&self) -> PublishMode {
        self.publish_mode
    }

    pub fn cache_file(&self) -> &str {
        &self.cache_file
    }

    pub fn schema_file(&self) -> Option<&str> {
        self.schema_file.as_deref()
    }

    pub fn flags_file(&self) -> Option<&str> {
        self.flags_file.as_deref()
    }

    pub fn datalog_file(&self) -> Option<&str> {
        self.datalog_file.as_deref()
    }

    pub fn pid_file(&self) -> &str {
        &self.pid_file
    }

    pub fn float_tolerance(&self) -> f64 {
        self.float_tolerance
    }
} // }}}

// Modbus {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Modbus {
    pub host: String,
    #[serde(default = "Config::default_modbus_port")]
    pub port: u16,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_modbus_timeout")]
    pub timeout: Duration,

    #[serde(default = "Config::default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_retry_delay")]
    pub retry_delay: Duration,

    #[serde(default = "Config::default_base_address")]
    pub base_address: u16,

    #[serde(default = "Config::default_max_models")]
    pub max_models: u16,

    #[serde(default)]
    pub reconnect_on_unit_change: bool,
}

impl Modbus {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.host.as_str(), self.port)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn base_address(&self) -> u16 {
        self.base_address
    }

    pub fn max_models(&self) -> u16 {
        self.max_models
    }

    pub fn reconnect_on_unit_change(&self) -> bool {
        self.reconnect_on_unit_change
    }
} // }}}

// Devices {{{
/// A device is either a bare unit id on the default gateway, or a table
/// naming its own gateway.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeviceEntry {
    Unit(u8),
    Table {
        unit_id: u8,
        host: Option<String>,
        port: Option<u16>,
    },
}

impl DeviceEntry {
    pub fn unit_id(&self) -> u8 {
        match self {
            Self::Unit(unit_id) => *unit_id,
            Self::Table { unit_id, .. } => *unit_id,
        }
    }

    pub fn gateway(&self, default: &Gateway) -> Gateway {
        match self {
            Self::Unit(_) => default.clone(),
            Self::Table { host, port, .. } => Gateway::new(
                host.clone().unwrap_or_else(|| default.host.clone()),
                port.unwrap_or(default.port),
            ),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Devices {
    #[serde_as(as = "OneOrMany<_>")]
    #[serde(default = "Config::default_inverters")]
    pub inverters: Vec<DeviceEntry>,

    #[serde_as(as = "OneOrMany<_>")]
    #[serde(default = "Config::default_meters")]
    pub meters: Vec<DeviceEntry>,

    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default = "Config::default_meter_poll_interval")]
    pub meter_poll_interval: Option<Duration>,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_inverter_poll_delay")]
    pub inverter_poll_delay: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "Config::default_inverter_read_delay")]
    pub inverter_read_delay_ms: Duration,

    #[serde(default = "Config::default_unhealthy_backoff_cycles")]
    pub unhealthy_backoff_cycles: u32,

    /// model id -> seconds between reads
    #[serde(default = "Config::default_model_intervals")]
    pub model_intervals: HashMap<u16, u64>,
}

impl Default for Devices {
    fn default() -> Self {
        Self {
            inverters: Config::default_inverters(),
            meters: Config::default_meters(),
            meter_poll_interval: Config::default_meter_poll_interval(),
            inverter_poll_delay: Config::default_inverter_poll_delay(),
            inverter_read_delay_ms: Config::default_inverter_read_delay(),
            unhealthy_backoff_cycles: Config::default_unhealthy_backoff_cycles(),
            model_intervals: Config::default_model_intervals(),
        }
    }
}

impl Devices {
    pub fn entries(&self, class: DeviceClass) -> &[DeviceEntry] {
        match class {
            DeviceClass::Inverter => &self.inverters,
            DeviceClass::Meter => &self.meters,
        }
    }

    pub fn meter_poll_interval(&self) -> Option<Duration> {
        self.meter_poll_interval
    }

    pub fn inverter_poll_delay(&self) -> Duration {
        self.inverter_poll_delay
    }

    pub fn inverter_read_delay(&self) -> Duration {
        self.inverter_read_delay_ms
    }

    pub fn unhealthy_backoff_cycles(&self) -> u32 {
        self.unhealthy_backoff_cycles
    }

    pub fn model_intervals(&self) -> HashMap<u16, Duration> {
        self.model_intervals
            .iter()
            .map(|(id, secs)| (*id, Duration::from_secs(*secs)))
            .collect()
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    #[serde(default = "Config::default_enabled")]
    pub retain: bool,

    #[serde(default)]
    pub qos: u8,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            enabled: Config::default_enabled(),
            host: Config::default_mqtt_host(),
            port: Config::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Config::default_mqtt_namespace(),
            retain: true,
            qos: 0,
        }
    }
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn qos(&self) -> u8 {
        self.qos
    }
} // }}}

// Influx {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Influx {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_influx_database")]
    pub database: String,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_write_interval")]
    pub write_interval: Duration,

    #[serde(default = "Config::default_max_pending")]
    pub max_pending: usize,

    /// Falls back to general.publish_mode when unset.
    pub publish_mode: Option<PublishMode>,
}

impl Default for Influx {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            username: None,
            password: None,
            database: Config::default_influx_database(),
            write_interval: Config::default_write_interval(),
            max_pending: Config::default_max_pending(),
            publish_mode: None,
        }
    }
}

impl Influx {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn write_interval(&self) -> Duration {
        self.write_interval
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn publish_mode(&self) -> Option<PublishMode> {
        self.publish_mode
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn general(&self) -> General {
        self.lock().general.clone()
    }

    pub fn modbus(&self) -> Modbus {
        self.lock().modbus.clone()
    }

    pub fn devices(&self) -> Devices {
        self.lock().devices.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn influx(&self) -> Influx {
        self.lock().influx.clone()
    }

    pub fn log_summary(&self) {
        self.lock().log_summary();
    }

    pub fn loglevel(&self) -> String {
        self.lock().general.log_level.clone()
    }

    pub fn poll_interval(&self, class: DeviceClass) -> Duration {
        let config = self.lock();
        match class {
            DeviceClass::Inverter => config.general.poll_interval,
            DeviceClass::Meter => config
                .devices
                .meter_poll_interval
                .unwrap_or(config.general.poll_interval),
        }
    }

    pub fn influx_publish_mode(&self) -> PublishMode {
        let config = self.lock();
        config
            .influx
            .publish_mode
            .unwrap_or(config.general.publish_mode)
    }

    /// Configured devices of one class, in configuration order.
    pub fn device_ids(&self, class: DeviceClass) -> Vec<DeviceId> {
        let config = self.lock();
        let default = config.modbus.gateway();
        config
            .devices
            .entries(class)
            .iter()
            .map(|entry| DeviceId::new(entry.gateway(&default), entry.unit_id(), class))
            .collect()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Called once logging is up, since the log level comes from the file.
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Log Level: {}", self.general.log_level);
        info!("  Poll Interval: {:?}", self.general.poll_interval);
        info!("  Publish Mode: {}", self.general.publish_mode);
        info!("  Cache File: {}", self.general.cache_file);
        info!(
            "  Schema File: {}",
            self.general.schema_file.as_deref().unwrap_or("(built-in)")
        );
        if let Some(file) = &self.general.datalog_file {
            info!("  Datalog File: {}", file);
        }

        info!("  Modbus: {}:{}", self.modbus.host, self.modbus.port);
        info!("    Timeout: {:?}", self.modbus.timeout);
        info!(
            "    Retries: {} x {:?}",
            self.modbus.retry_attempts, self.modbus.retry_delay
        );
        info!("    Base Address: {}", self.modbus.base_address);
        if self.modbus.reconnect_on_unit_change {
            info!("    Reconnect On Unit Change: enabled");
        }

        let default = self.modbus.gateway();
        for class in [DeviceClass::Inverter, DeviceClass::Meter] {
            let entries = self.devices.entries(class);
            info!("  {}s: {} configured", class, entries.len());
            for entry in entries {
                info!("    Unit {} on {}", entry.unit_id(), entry.gateway(&default));
            }
        }
        if let Some(interval) = self.devices.meter_poll_interval {
            info!("  Meter Poll Interval: {:?}", interval);
        }
        info!("  Inverter Poll Delay: {:?}", self.devices.inverter_poll_delay);
        info!("  Inverter Read Delay: {:?}", self.devices.inverter_read_delay_ms);

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
        }

        info!("  InfluxDB: {}", if self.influx.enabled { "enabled" } else { "disabled" });
        if self.influx.enabled {
            info!("    URL: {}", self.influx.url);
            info!("    Database: {}", self.influx.database);
            info!("    Write Interval: {:?}", self.influx.write_interval);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.modbus.host.is_empty() {
            bail!("modbus.host is required");
        }
        if self.modbus.port == 0 {
            bail!("modbus.port must be between 1 and 65535");
        }
        if self.modbus.timeout.is_zero() {
            bail!("modbus.timeout must be greater than 0");
        }
        if self.modbus.retry_attempts == 0 {
            bail!("modbus.retry_attempts must be at least 1");
        }
        if self.general.poll_interval.is_zero() {
            bail!("general.poll_interval must be greater than 0");
        }
        if self.devices.meter_poll_interval.is_some_and(|i| i.is_zero()) {
            bail!("devices.meter_poll_interval must be greater than 0");
        }
        if self.general.float_tolerance < 0.0 {
            bail!("general.float_tolerance cannot be negative");
        }

        for class in [DeviceClass::Inverter, DeviceClass::Meter] {
            let mut seen = Vec::new();
            for entry in self.devices.entries(class) {
                let unit_id = entry.unit_id();
                if unit_id == 0 || unit_id > 247 {
                    bail!("{} unit id {} must be between 1 and 247", class, unit_id);
                }
                let key = (entry.gateway(&self.modbus.gateway()), unit_id);
                if seen.contains(&key) {
                    bail!("{} unit id {} configured twice on {}", class, unit_id, key.0);
                }
                seen.push(key);
            }
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                return Err(file_error!("MQTT host cannot be empty"));
            }
            if self.mqtt.qos > 2 {
                bail!("mqtt.qos must be 0, 1 or 2");
            }
        }

        if self.influx.enabled {
            if let Err(e) = url::Url::parse(&self.influx.url) {
                return Err(file_error!("Invalid InfluxDB URL: {}", e));
            }
            if self.influx.database.is_empty() {
                return Err(file_error!("InfluxDB database name cannot be empty"));
            }
            if self.influx.max_pending == 0 {
                bail!("influx.max_pending must be at least 1");
            }
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn default_cache_file() -> String {
        "sunspec_cache.db".to_string()
    }

    fn default_pid_file() -> String {
        "sunspec-bridge.pid".to_string()
    }

    fn default_modbus_port() -> u16 {
        502
    }

    fn default_modbus_timeout() -> Duration {
        Duration::from_secs(3)
    }

    fn default_retry_attempts() -> u32 {
        2
    }

    fn default_retry_delay() -> Duration {
        Duration::from_millis(100)
    }

    fn default_base_address() -> u16 {
        40000
    }

    fn default_max_models() -> u16 {
        32
    }

    fn default_inverters() -> Vec<DeviceEntry> {
        vec![DeviceEntry::Unit(1)]
    }

    fn default_meters() -> Vec<DeviceEntry> {
        vec![DeviceEntry::Unit(240)]
    }

    fn default_meter_poll_interval() -> Option<Duration> {
        Some(Duration::from_secs(2))
    }

    fn default_inverter_poll_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_inverter_read_delay() -> Duration {
        Duration::from_millis(200)
    }

    fn default_unhealthy_backoff_cycles() -> u32 {
        10
    }

    fn default_model_intervals() -> HashMap<u16, u64> {
        HashMap::from([(123, 60)])
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "sunspec".to_string()
    }

    fn default_influx_database() -> String {
        "sunspec".to_string()
    }

    fn default_write_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_pending() -> usize {
        1000
    }

    fn default_enabled() -> bool {
        true
    }
}
