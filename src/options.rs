use clap::{Parser, ValueEnum};

use crate::device::DeviceClass;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeviceFilter {
    All,
    Inverter,
    Meter,
}

impl DeviceFilter {
    pub fn classes(&self) -> Vec<DeviceClass> {
        match self {
            DeviceFilter::All => vec![DeviceClass::Inverter, DeviceClass::Meter],
            DeviceFilter::Inverter => vec![DeviceClass::Inverter],
            DeviceFilter::Meter => vec![DeviceClass::Meter],
        }
    }
}

/// SunSpec Bridge - polls SunSpec inverters and meters over Modbus/TCP
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Which device classes to poll
    #[clap(short = 'd', long = "device", value_enum, default_value = "all")]
    pub device: DeviceFilter,

    /// Start even if the PID file says another instance is running
    #[clap(short = 'f', long = "force")]
    pub force: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
