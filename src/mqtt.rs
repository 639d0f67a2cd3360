use crate::prelude::*;
use crate::stats::SharedStats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    /// `<class>/<host>_<port>/<unit_id>/<field>`; the namespace is added by the sender.
    pub fn for_field(
        device: &DeviceId,
        field: &str,
        value: &FieldValue,
        retain: bool,
    ) -> Result<Message> {
        Ok(Message {
            topic: format!(
                "{}/{}/{}/{}",
                device.class,
                Self::gateway_level(&device.gateway),
                device.unit_id,
                field
            ),
            retain,
            payload: Self::payload(value)?,
        })
    }

    // one topic level; MQTT separators and wildcards are not allowed in it
    fn gateway_level(gateway: &Gateway) -> String {
        format!("{}_{}", gateway.host, gateway.port)
            .chars()
            .map(|c| if matches!(c, '/' | '+' | '#') { '_' } else { c })
            .collect()
    }

    /// An absent value becomes an empty payload, which clears a retained topic.
    pub fn payload(value: &FieldValue) -> Result<String> {
        Ok(match value {
            FieldValue::Number { value, .. } => format_number(*value),
            FieldValue::Flags { raw, active } => {
                serde_json::to_string(&serde_json::json!({ "raw": raw, "active": active }))?
            }
            FieldValue::Text { value } => value.clone(),
            FieldValue::Absent => String::new(),
        })
    }
}

/// At most three decimals, no trailing zeros.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    shared_stats: SharedStats,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, shared_stats: SharedStats) -> Self {
        Self {
            config,
            channels,
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("sunspec-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.receiver(client.clone(), eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    // drives the connection; announces "online" on every (re)connect
    async fn receiver(&self, client: AsyncClient, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.to_mqtt.subscribe();
        let mut stopping: Option<tokio::time::Instant> = None;

        loop {
            if stopping.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                break;
            }

            tokio::select! {
                msg = shutdown.recv(), if stopping.is_none() => {
                    if matches!(msg, Ok(ChannelData::Shutdown) | Err(RecvError::Closed)) {
                        // keep polling briefly so the offline message and disconnect go out
                        stopping = Some(tokio::time::Instant::now() + Duration::from_secs(2));
                    }
                }
                event = tokio::time::timeout(Duration::from_secs(1), eventloop.poll()) => match event {
                    Ok(Ok(Event::Incoming(Incoming::ConnAck(_)))) => {
                        info!("mqtt connected");
                        let online =
                            client.try_publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online");
                        if let Err(e) = online {
                            warn!("failed to queue online message: {}", e);
                        }
                    }
                    Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
                    Ok(Err(e)) => {
                        if stopping.is_some() {
                            break;
                        }
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    _ => {} // keepalives etc
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    async fn sender(&self, client: AsyncClient) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();
        let namespace = self.config.mqtt().namespace().to_string();
        let qos = self.qos();

        loop {
            match receiver.recv().await {
                Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client
                        .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
                Ok(ChannelData::Message(message)) => {
                    let topic = format!("{}/{}", namespace, message.topic);
                    debug!("publishing: {} = {}", topic, message.payload);
                    let mut retry_count = 0;
                    loop {
                        match client
                            .publish(&topic, qos, message.retain, message.payload.clone())
                            .await
                        {
                            Ok(_) => {
                                if let Ok(mut stats) = self.shared_stats.lock() {
                                    stats.mqtt_messages_sent += 1;
                                }
                                break;
                            }
                            Err(err) => {
                                retry_count += 1;
                                if let Ok(mut stats) = self.shared_stats.lock() {
                                    stats.mqtt_errors += 1;
                                }
                                if retry_count >= 3 {
                                    error!(
                                        "MQTT publish of {} failed after 3 attempts: {:?}",
                                        topic, err
                                    );
                                    break;
                                }
                                error!(
                                    "MQTT publish failed: {:?} - retrying in 1s (attempt {}/3)",
                                    err, retry_count
                                );
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("MQTT sender fell behind, {} messages dropped", n);
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.mqtt_errors += n;
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    fn qos(&self) -> QoS {
        match self.config.mqtt().qos() {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}

/// Hands field values to the MQTT sender over its channel.
#[derive(Clone)]
pub struct MqttSink {
    to_mqtt: Sender,
    retain: bool,
}

impl MqttSink {
    pub fn new(channels: &Channels, retain: bool) -> Self {
        Self {
            to_mqtt: channels.to_mqtt.clone(),
            retain,
        }
    }
}

#[async_trait]
impl PublishSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn publish(
        &self,
        device: &DeviceId,
        field: &str,
        value: &FieldValue,
        _timestamp: DateTime<Utc>,
        _is_change: bool,
    ) -> Result<()> {
        let message = Message::for_field(device, field, value, self.retain)?;
        if self.to_mqtt.send(ChannelData::Message(message)).is_err() {
            bail!("send(to_mqtt) failed - channel closed?");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::new(Gateway::new("192.168.1.20", 502), 1, DeviceClass::Inverter)
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(150.0), "150");
        assert_eq!(format_number(23.01), "23.01");
        assert_eq!(format_number(0.12345), "0.123");
        assert_eq!(format_number(-0.0001), "0");
        assert_eq!(format_number(-12.5), "-12.5");
    }

    #[test]
    fn field_messages() {
        let value = FieldValue::Number {
            value: 150.0,
            unit: Some("W".into()),
            scaled: true,
        };
        let message = Message::for_field(&device(), "ac_power", &value, true).unwrap();
        assert_eq!(message.topic, "inverter/192.168.1.20_502/1/ac_power");
        assert_eq!(message.payload, "150");
        assert!(message.retain);

        let flags = FieldValue::Flags {
            raw: 129,
            active: vec!["Ground fault".into(), "Over temperature".into()],
        };
        let payload = Message::payload(&flags).unwrap();
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["raw"], 129);
        assert_eq!(json["active"][1], "Over temperature");

        assert_eq!(Message::payload(&FieldValue::text("Fronius")).unwrap(), "Fronius");
        assert_eq!(Message::payload(&FieldValue::Absent).unwrap(), "");
    }

    #[test]
    fn same_unit_on_different_gateways_gets_its_own_topic() {
        let value = FieldValue::text("x");
        let a = DeviceId::new(Gateway::new("10.0.0.5", 502), 1, DeviceClass::Inverter);
        let b = DeviceId::new(Gateway::new("10.0.0.6", 502), 1, DeviceClass::Inverter);
        let c = DeviceId::new(Gateway::new("10.0.0.5", 1502), 1, DeviceClass::Inverter);

        let ta = Message::for_field(&a, "ac_power", &value, true).unwrap().topic;
        let tb = Message::for_field(&b, "ac_power", &value, true).unwrap().topic;
        let tc = Message::for_field(&c, "ac_power", &value, true).unwrap().topic;
        assert_eq!(ta, "inverter/10.0.0.5_502/1/ac_power");
        assert_ne!(ta, tb);
        assert_ne!(ta, tc);

        let odd = DeviceId::new(Gateway::new("gw/#1", 502), 3, DeviceClass::Meter);
        let topic = Message::for_field(&odd, "ac_power", &value, true).unwrap().topic;
        assert_eq!(topic, "meter/gw__1_502/3/ac_power");
    }

    #[tokio::test]
    async fn sink_sends_on_channel() {
        let channels = Channels::new();
        let mut rx = channels.to_mqtt.subscribe();
        let sink = MqttSink::new(&channels, false);

        sink.publish(&device(), "events", &FieldValue::Absent, Utc::now(), true)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ChannelData::Message(m) => {
                assert_eq!(m.topic, "inverter/192.168.1.20_502/1/events");
                assert!(!m.retain);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
