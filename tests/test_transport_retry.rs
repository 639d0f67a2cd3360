mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;
use sunspec_bridge::error::{LinkError, TransportError};
use sunspec_bridge::modbus::{RegisterTransport, RetryPolicy, Transport, TransportSettings};
use sunspec_bridge::prelude::*;
use sunspec_bridge::stats::{PollStats, SharedStats};

struct Rig {
    connector: FakeConnector,
    sleeper: Arc<InstantSleeper>,
    stats: SharedStats,
    transport: Transport,
}

fn rig(attempts: u32, reconnect_on_unit_change: bool) -> Rig {
    common_setup();

    let connector = FakeConnector::new();
    let sleeper = Arc::new(InstantSleeper::default());
    let stats = PollStats::shared();
    let transport = Transport::new(
        Arc::new(connector.clone()),
        sleeper.clone(),
        TransportSettings {
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(attempts, Duration::from_millis(100)),
            reconnect_on_unit_change,
        },
        stats.clone(),
    );

    Rig {
        connector,
        sleeper,
        stats,
        transport,
    }
}

#[tokio::test]
async fn gives_up_after_exactly_the_configured_attempts() {
    let rig = rig(3, false);
    let device = Factory::inverter(1);

    let err = rig.transport.read(&device, 40000, 2).await.unwrap_err();

    assert_eq!(
        err,
        TransportError::Transient {
            attempts: 3,
            reason: "no reply within 1s".to_string(),
        }
    );
    assert_eq!(rig.connector.request_count(), 3);
    assert_eq!(
        *rig.sleeper.sleeps.lock().unwrap(),
        vec![Duration::from_millis(100); 2]
    );

    let stats = rig.stats.lock().unwrap();
    assert_eq!(stats.block_read_failures, 1);
    assert_eq!(stats.retried_attempts, 2);
}

#[tokio::test]
async fn succeeds_on_a_later_attempt() {
    let rig = rig(3, false);
    let device = Factory::inverter(1);
    rig.connector.reply(Err(LinkError::Timeout(Duration::from_secs(1))));
    rig.connector.reply(Ok(vec![0x5375, 0x6E53]));

    let words = rig.transport.read(&device, 40000, 2).await.unwrap();

    assert_eq!(words, vec![0x5375, 0x6E53]);
    assert_eq!(rig.connector.request_count(), 2);
    // the timed out socket was replaced
    assert_eq!(rig.connector.connect_count(), 2);
}

#[tokio::test]
async fn refused_connects_escalate_after_two_cycles() {
    let rig = rig(3, false);
    let device = Factory::inverter(1);
    rig.connector.refuse(true);

    let first = rig.transport.read(&device, 40000, 2).await.unwrap_err();
    assert!(!first.is_fatal());

    let second = rig.transport.read(&device, 40000, 2).await.unwrap_err();
    assert!(second.is_fatal());
    assert_eq!(rig.connector.connect_count(), 6);

    // a success clears the streak
    rig.connector.refuse(false);
    rig.connector.reply(Ok(vec![1, 66]));
    rig.transport.read(&device, 40002, 2).await.unwrap();

    rig.connector.refuse(true);
    let after_recovery = rig.transport.read(&device, 40000, 2).await.unwrap_err();
    assert!(!after_recovery.is_fatal());
}

#[tokio::test]
async fn escalation_is_tracked_per_device() {
    let rig = rig(2, false);
    let first = Factory::inverter(1);
    let second = Factory::inverter(2);
    rig.connector.refuse(true);

    assert!(!rig.transport.read(&first, 40000, 2).await.unwrap_err().is_fatal());
    assert!(!rig.transport.read(&second, 40000, 2).await.unwrap_err().is_fatal());
    assert!(rig.transport.read(&first, 40000, 2).await.unwrap_err().is_fatal());
}

#[tokio::test]
async fn timeouts_never_escalate() {
    let rig = rig(2, false);
    let device = Factory::inverter(1);

    for _ in 0..4 {
        let err = rig.transport.read(&device, 40000, 2).await.unwrap_err();
        assert!(!err.is_fatal());
    }
}

#[tokio::test]
async fn exception_keeps_the_connection() {
    let rig = rig(2, false);
    let device = Factory::inverter(1);
    rig.connector.reply(Err(LinkError::Exception(0x02)));
    rig.connector.reply(Ok(vec![103, 50]));

    rig.transport.read(&device, 40070, 2).await.unwrap();
    assert_eq!(rig.connector.connect_count(), 1);
}

#[tokio::test]
async fn short_reply_is_a_failed_attempt() {
    let rig = rig(2, false);
    let device = Factory::inverter(1);
    rig.connector.reply(Ok(vec![103]));
    rig.connector.reply(Ok(vec![103, 50]));

    assert_eq!(rig.transport.read(&device, 40070, 2).await.unwrap(), vec![103, 50]);
    assert_eq!(rig.connector.request_count(), 2);
}

#[tokio::test]
async fn units_on_one_gateway_share_a_connection() {
    let rig = rig(1, false);
    rig.connector.reply(Ok(vec![1, 2]));
    rig.connector.reply(Ok(vec![3, 4]));

    rig.transport.read(&Factory::inverter(1), 40000, 2).await.unwrap();
    rig.transport.read(&Factory::meter(240), 40000, 2).await.unwrap();

    assert_eq!(rig.connector.connect_count(), 1);
    let requests = rig.connector.requests.lock().unwrap().clone();
    assert_eq!(requests, vec![(1, 40000, 2), (240, 40000, 2)]);
}

#[tokio::test]
async fn separate_gateways_get_separate_connections() {
    let rig = rig(1, false);
    rig.connector.reply(Ok(vec![1, 2]));
    rig.connector.reply(Ok(vec![3, 4]));

    let other = DeviceId::new(Gateway::new("192.168.1.21", 502), 1, DeviceClass::Inverter);
    rig.transport.read(&Factory::inverter(1), 40000, 2).await.unwrap();
    rig.transport.read(&other, 40000, 2).await.unwrap();

    assert_eq!(rig.connector.connect_count(), 2);
}

#[tokio::test]
async fn unit_change_reconnects_when_configured() {
    let rig = rig(1, true);
    for _ in 0..3 {
        rig.connector.reply(Ok(vec![0, 0]));
    }

    rig.transport.read(&Factory::inverter(1), 40000, 2).await.unwrap();
    rig.transport.read(&Factory::inverter(1), 40002, 2).await.unwrap();
    rig.transport.read(&Factory::inverter(2), 40000, 2).await.unwrap();

    assert_eq!(rig.connector.connect_count(), 2);
}

#[tokio::test]
async fn close_drops_pooled_connections() {
    let rig = rig(1, false);
    rig.connector.reply(Ok(vec![0, 0]));
    rig.connector.reply(Ok(vec![0, 0]));

    rig.transport.read(&Factory::inverter(1), 40000, 2).await.unwrap();
    rig.transport.close().await;
    rig.transport.read(&Factory::inverter(1), 40000, 2).await.unwrap();

    assert_eq!(rig.connector.connect_count(), 2);
}
