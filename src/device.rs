use crate::prelude::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Inverter,
    Meter,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Inverter => "inverter",
            DeviceClass::Meter => "meter",
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inverter" => Ok(DeviceClass::Inverter),
            "meter" => Ok(DeviceClass::Meter),
            _ => bail!("unknown device class {}", s),
        }
    }
}

/// A Modbus/TCP gateway; every unit id behind it shares one socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
}

impl Gateway {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub gateway: Gateway,
    pub unit_id: u8,
    pub class: DeviceClass,
}

impl DeviceId {
    pub fn new(gateway: Gateway, unit_id: u8, class: DeviceClass) -> Self {
        Self {
            gateway,
            unit_id,
            class,
        }
    }

    /// Stable key used by the persistent cache.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.class, self.gateway, self.unit_id)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}@{}", self.class, self.unit_id, self.gateway)
    }
}

/// One model header found while probing: model id, header address, data length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: u16,
    pub address: u16,
    pub length: u16,
}

impl ModelEntry {
    /// Words to read for header plus body.
    pub fn block_len(&self) -> u16 {
        self.length + 2
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub serial_number: String,
}

/// What the probe learned about a device. Persisted as JSON in the cache;
/// unknown keys from newer versions are ignored on load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLayout {
    #[serde(default)]
    pub info: DeviceInfo,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub discovered_at: Option<DateTime<Utc>>,
}

impl DeviceLayout {
    pub fn model(&self, id: u16) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn model_ids(&self) -> Vec<u16> {
        self.models.iter().map(|m| m.id).collect()
    }

    /// Models sorted by register address.
    pub fn in_address_order(&self) -> Vec<ModelEntry> {
        let mut models = self.models.clone();
        models.sort_by_key(|m| m.address);
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_is_stable() {
        let device = DeviceId::new(Gateway::new("10.0.0.5", 502), 3, DeviceClass::Meter);
        assert_eq!(device.key(), "meter/10.0.0.5:502/3");
        assert_eq!(device.to_string(), "meter 3@10.0.0.5:502");
    }

    #[test]
    fn layout_ignores_unknown_keys() {
        let json = r#"{"info":{"manufacturer":"Fronius","future":1},"models":[{"id":1,"address":40002,"length":66}],"extra":true}"#;
        let layout: DeviceLayout = serde_json::from_str(json).unwrap();
        assert_eq!(layout.info.manufacturer, "Fronius");
        assert_eq!(layout.model(1).map(|m| m.block_len()), Some(68));
    }
}
