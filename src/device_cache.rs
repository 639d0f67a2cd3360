use crate::prelude::*;

use crate::device::DeviceLayout;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    std::collections::{BTreeMap, BTreeSet, HashMap},
    std::path::Path,
    std::sync::{Arc, Mutex, PoisonError},
};

/// Last published state of one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: FieldValue,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceSnapshot {
    pub layout: Option<DeviceLayout>,
    pub fields: BTreeMap<String, CacheEntry>,
    /// Set when a read no longer matched the layout; cleared by a new layout.
    pub reprobe: bool,
}

impl DeviceSnapshot {
    /// The layout, unless a re-probe is pending.
    pub fn usable_layout(&self) -> Option<&DeviceLayout> {
        if self.reprobe {
            None
        } else {
            self.layout.as_ref()
        }
    }
}

/// Pending write for one field; `None` deletes it.
pub type FieldUpdate = (String, Option<CacheEntry>);

/// Durable backing for the device cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, DeviceSnapshot>>;
    async fn save_layout(&self, device_key: &str, layout: &DeviceLayout) -> Result<()>;
    async fn save_fields(&self, device_key: &str, updates: &[FieldUpdate]) -> Result<()>;
    async fn evict(&self, device_key: &str) -> Result<()>;
}

// SqliteStore {{{
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &str) -> Result<Self> {
        info!("Opening device cache at {}", path);
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        // one connection: an in-memory database is per connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| file_error_with_source!(e, "cannot open device cache"))?;

        sqlx::migrate!("db/migrations/sqlite")
            .run(&pool)
            .await
            .map_err(|e| file_error_with_source!(e, "cannot migrate device cache"))?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn load(&self) -> Result<HashMap<String, DeviceSnapshot>> {
        let mut devices: HashMap<String, DeviceSnapshot> = HashMap::new();

        let layouts: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT device_key, layout FROM devices")
                .fetch_all(&self.pool)
                .await?;
        for (key, layout) in layouts {
            let snapshot = devices.entry(key.clone()).or_default();
            if let Some(layout) = layout {
                match serde_json::from_str::<DeviceLayout>(&layout) {
                    Ok(layout) => snapshot.layout = Some(layout),
                    Err(e) => warn!("{}: ignoring unreadable cached layout: {}", key, e),
                }
            }
        }

        let rows: Vec<(String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT device_key, field, value, updated_at, sequence FROM field_values",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut skipped = 0;
        for (key, field, value, updated_at, sequence) in rows {
            let value = match serde_json::from_str::<FieldValue>(&value) {
                Ok(value) => value,
                Err(e) => {
                    debug!("{}: skipping cached {}: {}", key, field, e);
                    skipped += 1;
                    continue;
                }
            };
            let Some(timestamp) = DateTime::from_timestamp_millis(updated_at) else {
                skipped += 1;
                continue;
            };
            devices.entry(key).or_default().fields.insert(
                field,
                CacheEntry {
                    value,
                    timestamp,
                    sequence: sequence.max(0) as u64,
                },
            );
        }
        if skipped > 0 {
            warn!("device cache: ignored {} unreadable field values", skipped);
        }

        Ok(devices)
    }

    async fn save_layout(&self, device_key: &str, layout: &DeviceLayout) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_key, layout, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(device_key) DO UPDATE SET layout = excluded.layout, updated_at = excluded.updated_at",
        )
        .bind(device_key)
        .bind(serde_json::to_string(layout)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_fields(&self, device_key: &str, updates: &[FieldUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (field, entry) in updates {
            match entry {
                Some(entry) => {
                    sqlx::query(
                        "INSERT INTO field_values (device_key, field, value, updated_at, sequence) VALUES (?, ?, ?, ?, ?) \
                         ON CONFLICT(device_key, field) DO UPDATE SET value = excluded.value, \
                         updated_at = excluded.updated_at, sequence = excluded.sequence",
                    )
                    .bind(device_key)
                    .bind(field)
                    .bind(serde_json::to_string(&entry.value)?)
                    .bind(entry.timestamp.timestamp_millis())
                    .bind(entry.sequence as i64)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM field_values WHERE device_key = ? AND field = ?")
                        .bind(device_key)
                        .bind(field)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn evict(&self, device_key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM field_values WHERE device_key = ?")
            .bind(device_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM devices WHERE device_key = ?")
            .bind(device_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
} // }}}

/// Whether `current` should be reported as a change against `previous`.
pub fn values_differ(previous: &FieldValue, current: &FieldValue, tolerance: f64) -> bool {
    match (previous, current) {
        (FieldValue::Number { value: a, .. }, FieldValue::Number { value: b, .. }) => {
            if tolerance > 0.0 {
                (a - b).abs() > tolerance
            } else {
                a != b
            }
        }
        (FieldValue::Flags { raw: a, .. }, FieldValue::Flags { raw: b, .. }) => a != b,
        (a, b) => a != b,
    }
}

/// Fields of `current` that differ from the last published state.
///
/// Fields missing from `current` (a model skipped this cycle) are not
/// changes. A field going absent is a change only if it was present before.
pub fn changed_fields(
    previous: &BTreeMap<String, CacheEntry>,
    current: &BTreeMap<String, FieldValue>,
    tolerance: f64,
) -> BTreeSet<String> {
    current
        .iter()
        .filter(|(field, value)| match previous.get(*field) {
            None => !value.is_absent(),
            Some(entry) => values_differ(&entry.value, value, tolerance),
        })
        .map(|(field, _)| field.clone())
        .collect()
}

/// Last published values and layouts per device, loaded before the first
/// poll and persisted after every commit.
///
/// Each device has its own lock; devices never contend with each other.
pub struct DeviceCache {
    store: Arc<dyn CacheStore>,
    tolerance: f64,
    devices: Mutex<HashMap<String, Arc<tokio::sync::Mutex<DeviceSnapshot>>>>,
}

impl DeviceCache {
    pub async fn load(store: Arc<dyn CacheStore>, tolerance: f64) -> Result<Self> {
        let loaded = store.load().await?;
        info!("device cache: loaded {} devices", loaded.len());

        let devices = loaded
            .into_iter()
            .map(|(key, snapshot)| (key, Arc::new(tokio::sync::Mutex::new(snapshot))))
            .collect();

        Ok(Self {
            store,
            tolerance,
            devices: Mutex::new(devices),
        })
    }

    fn entry(&self, device: &DeviceId) -> Arc<tokio::sync::Mutex<DeviceSnapshot>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device.key())
            .or_default()
            .clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn get(&self, device: &DeviceId) -> DeviceSnapshot {
        self.entry(device).lock().await.clone()
    }

    pub async fn diff(
        &self,
        device: &DeviceId,
        fields: &BTreeMap<String, FieldValue>,
    ) -> BTreeSet<String> {
        let entry = self.entry(device);
        let snapshot = entry.lock().await;
        changed_fields(&snapshot.fields, fields, self.tolerance)
    }

    /// Record `fields` as published, bumping sequence counters of changed
    /// fields. Returns how many fields changed.
    ///
    /// Memory is updated even if persisting fails, so a broken disk does not
    /// turn into a republish storm.
    pub async fn commit(
        &self,
        device: &DeviceId,
        fields: &BTreeMap<String, FieldValue>,
        timestamp: DateTime<Utc>,
    ) -> Result<usize> {
        let entry = self.entry(device);
        let mut snapshot = entry.lock().await;

        let changed = changed_fields(&snapshot.fields, fields, self.tolerance);
        let mut updates: Vec<FieldUpdate> = Vec::with_capacity(changed.len());

        for field in &changed {
            let Some(value) = fields.get(field) else {
                continue;
            };
            if value.is_absent() {
                snapshot.fields.remove(field);
                updates.push((field.clone(), None));
            } else {
                let sequence = snapshot.fields.get(field).map(|e| e.sequence).unwrap_or(0) + 1;
                let cached = CacheEntry {
                    value: value.clone(),
                    timestamp,
                    sequence,
                };
                snapshot.fields.insert(field.clone(), cached.clone());
                updates.push((field.clone(), Some(cached)));
            }
        }

        self.store.save_fields(&device.key(), &updates).await?;
        Ok(changed.len())
    }

    /// Store a freshly probed layout and clear any pending re-probe.
    pub async fn store_layout(&self, device: &DeviceId, layout: DeviceLayout) -> Result<()> {
        let entry = self.entry(device);
        let mut snapshot = entry.lock().await;
        snapshot.reprobe = false;
        snapshot.layout = Some(layout.clone());
        self.store.save_layout(&device.key(), &layout).await
    }

    pub async fn mark_reprobe(&self, device: &DeviceId) {
        let entry = self.entry(device);
        let mut snapshot = entry.lock().await;
        if !snapshot.reprobe {
            debug!("{}: marked for re-probe", device);
        }
        snapshot.reprobe = true;
    }

    /// Forget everything about a device, in memory and on disk.
    pub async fn evict(&self, device: &DeviceId) -> Result<()> {
        let entry = self.entry(device);
        let _guard = entry.lock().await;
        self.store.evict(&device.key()).await?;
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device.key());
        info!("{}: evicted from device cache", device);
        Ok(())
    }
}
