use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_mqtt: broadcast::Sender<crate::mqtt::ChannelData>,
    pub to_influx: broadcast::Sender<crate::influx::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_mqtt: Self::channel(),
            to_influx: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
