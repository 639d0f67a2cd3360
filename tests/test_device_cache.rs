mod common;
use common::*;

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use sunspec_bridge::device::{DeviceInfo, DeviceLayout, ModelEntry};
use sunspec_bridge::device_cache::{DeviceCache, SqliteStore};
use sunspec_bridge::prelude::*;

fn number(value: f64) -> FieldValue {
    FieldValue::Number {
        value,
        unit: Some("W".to_string()),
        scaled: true,
    }
}

fn fields(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn layout() -> DeviceLayout {
    DeviceLayout {
        info: DeviceInfo {
            manufacturer: "Fronius".to_string(),
            model: "Symo".to_string(),
            version: "1.0".to_string(),
            serial_number: "34119102".to_string(),
        },
        models: vec![
            ModelEntry {
                id: 1,
                address: 40002,
                length: 66,
            },
            ModelEntry {
                id: 103,
                address: 40070,
                length: 50,
            },
        ],
        discovered_at: Some(Utc::now()),
    }
}

async fn memory_cache() -> DeviceCache {
    let store = SqliteStore::in_memory().await.unwrap();
    DeviceCache::load(Arc::new(store), 0.0).await.unwrap()
}

#[tokio::test]
async fn unchanged_readings_have_an_empty_diff() {
    common_setup();
    let cache = memory_cache().await;
    let device = Factory::inverter(1);
    let reading = fields(&[("ac_power", number(150.0)), ("dc_power", number(160.0))]);

    assert_eq!(cache.diff(&device, &reading).await.len(), 2);
    assert_eq!(cache.commit(&device, &reading, Utc::now()).await.unwrap(), 2);

    assert!(cache.diff(&device, &reading).await.is_empty());
    assert_eq!(cache.commit(&device, &reading, Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn one_change_yields_exactly_that_field() {
    common_setup();
    let cache = memory_cache().await;
    let device = Factory::inverter(1);
    cache
        .commit(
            &device,
            &fields(&[("ac_power", number(150.0)), ("dc_power", number(160.0))]),
            Utc::now(),
        )
        .await
        .unwrap();

    let next = fields(&[("ac_power", number(152.0)), ("dc_power", number(160.0))]);
    let changed: Vec<_> = cache.diff(&device, &next).await.into_iter().collect();
    assert_eq!(changed, vec!["ac_power".to_string()]);

    cache.commit(&device, &next, Utc::now()).await.unwrap();
    let snapshot = cache.get(&device).await;
    assert_eq!(snapshot.fields["ac_power"].sequence, 2);
    assert_eq!(snapshot.fields["dc_power"].sequence, 1);
}

#[tokio::test]
async fn skipped_model_fields_are_not_changes() {
    common_setup();
    let cache = memory_cache().await;
    let device = Factory::inverter(1);
    cache
        .commit(
            &device,
            &fields(&[("ac_power", number(150.0)), ("wmax_lim_pct", number(100.0))]),
            Utc::now(),
        )
        .await
        .unwrap();

    // model 123 not read this cycle
    let partial = fields(&[("ac_power", number(150.0))]);
    assert!(cache.diff(&device, &partial).await.is_empty());
    cache.commit(&device, &partial, Utc::now()).await.unwrap();
    assert!(cache.get(&device).await.fields.contains_key("wmax_lim_pct"));
}

#[tokio::test]
async fn going_absent_is_a_change_once() {
    common_setup();
    let cache = memory_cache().await;
    let device = Factory::inverter(1);
    cache
        .commit(&device, &fields(&[("ac_power", number(150.0))]), Utc::now())
        .await
        .unwrap();

    let absent = fields(&[("ac_power", FieldValue::Absent)]);
    assert_eq!(cache.commit(&device, &absent, Utc::now()).await.unwrap(), 1);
    assert!(cache.diff(&device, &absent).await.is_empty());
}

#[tokio::test]
async fn devices_are_keyed_independently() {
    common_setup();
    let cache = memory_cache().await;
    let reading = fields(&[("ac_power", number(150.0))]);

    cache.commit(&Factory::inverter(1), &reading, Utc::now()).await.unwrap();
    assert_eq!(cache.diff(&Factory::inverter(2), &reading).await.len(), 1);
    assert_eq!(cache.diff(&Factory::meter(1), &reading).await.len(), 1);
}

#[tokio::test]
async fn state_survives_a_restart() {
    common_setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache").join("sunspec_cache.db");
    let path = path.to_str().unwrap();
    let device = Factory::inverter(1);
    let reading = fields(&[
        ("ac_power", number(150.0)),
        ("serial_number", FieldValue::text("34119102")),
        (
            "events",
            FieldValue::Flags {
                raw: 1,
                active: vec!["Ground fault".to_string()],
            },
        ),
    ]);

    {
        let store = SqliteStore::open(path).await.unwrap();
        let cache = DeviceCache::load(Arc::new(store.clone()), 0.0).await.unwrap();
        cache.store_layout(&device, layout()).await.unwrap();
        cache.commit(&device, &reading, Utc::now()).await.unwrap();
        store.close().await;
    }

    let store = SqliteStore::open(path).await.unwrap();
    let cache = DeviceCache::load(Arc::new(store), 0.0).await.unwrap();
    assert_eq!(cache.device_count(), 1);

    let snapshot = cache.get(&device).await;
    assert_eq!(snapshot.usable_layout().unwrap().model_ids(), vec![1, 103]);
    assert_eq!(snapshot.layout.unwrap().info.serial_number, "34119102");
    assert!(cache.diff(&device, &reading).await.is_empty());
}

#[tokio::test]
async fn reprobe_flag_hides_layout_until_replaced() {
    common_setup();
    let cache = memory_cache().await;
    let device = Factory::inverter(1);
    cache.store_layout(&device, layout()).await.unwrap();

    cache.mark_reprobe(&device).await;
    let snapshot = cache.get(&device).await;
    assert!(snapshot.reprobe);
    assert!(snapshot.usable_layout().is_none());
    assert!(snapshot.layout.is_some());

    cache.store_layout(&device, layout()).await.unwrap();
    assert!(cache.get(&device).await.usable_layout().is_some());
}

#[tokio::test]
async fn evict_forgets_the_device_on_disk_too() {
    common_setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sunspec_cache.db");
    let path = path.to_str().unwrap();
    let evicted = Factory::inverter(1);
    let kept = Factory::meter(240);
    let reading = fields(&[("ac_power", number(150.0))]);

    {
        let store = SqliteStore::open(path).await.unwrap();
        let cache = DeviceCache::load(Arc::new(store.clone()), 0.0).await.unwrap();
        for device in [&evicted, &kept] {
            cache.store_layout(device, layout()).await.unwrap();
            cache.commit(device, &reading, Utc::now()).await.unwrap();
        }
        cache.evict(&evicted).await.unwrap();
        assert_eq!(cache.get(&evicted).await, Default::default());
        store.close().await;
    }

    let store = SqliteStore::open(path).await.unwrap();
    let cache = DeviceCache::load(Arc::new(store), 0.0).await.unwrap();
    assert_eq!(cache.device_count(), 1);
    assert!(cache.diff(&kept, &reading).await.is_empty());
    assert_eq!(cache.diff(&evicted, &reading).await.len(), 1);
}

#[tokio::test]
async fn unreadable_rows_are_skipped() {
    common_setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sunspec_cache.db");
    let path = path.to_str().unwrap();
    let device = Factory::inverter(1);

    let store = SqliteStore::open(path).await.unwrap();
    let cache = DeviceCache::load(Arc::new(store.clone()), 0.0).await.unwrap();
    cache
        .commit(&device, &fields(&[("ac_power", number(150.0))]), Utc::now())
        .await
        .unwrap();
    store.close().await;

    // rows a newer version might write
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", path)).await.unwrap();
    sqlx::query(
        "INSERT INTO field_values (device_key, field, value, updated_at, sequence) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(device.key())
    .bind("grid_state")
    .bind(r#"{"kind":"histogram","buckets":[1,2]}"#)
    .bind(Utc::now().timestamp_millis())
    .bind(1i64)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO devices (device_key, layout, updated_at) VALUES (?, ?, ?)")
        .bind("inverter/10.0.0.9:502/4")
        .bind("not json")
        .bind(0i64)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let store = SqliteStore::open(path).await.unwrap();
    let cache = DeviceCache::load(Arc::new(store), 0.0).await.unwrap();
    let snapshot = cache.get(&device).await;
    assert!(snapshot.fields.contains_key("ac_power"));
    assert!(!snapshot.fields.contains_key("grid_state"));
    assert_eq!(cache.device_count(), 2);
}
