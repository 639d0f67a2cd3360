pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::str::FromStr;
pub use tokio::sync::broadcast;

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::device::{DeviceClass, DeviceId, Gateway};
pub use crate::sink::{PublishMode, PublishSink};
pub use crate::sunspec::FieldValue;
pub use crate::{file_error, file_error_with_source};
