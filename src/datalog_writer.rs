use crate::prelude::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Appends every raw register block read to a JSON-lines file.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    blocks_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str) -> Result<Self> {
        info!("Opening datalog file at {}", path);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open datalog file {}: {}", path, e);
                return Err(e.into());
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on datalog file {}: {}", path, e);
                return Err(e.into());
            }
        }

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            blocks_written: Arc::new(Mutex::new(0)),
        })
    }

    pub fn write_block(
        &self,
        device: &DeviceId,
        model_id: u16,
        address: u16,
        words: &[u16],
    ) -> Result<()> {
        let raw_data: Vec<String> = words.iter().map(|w| format!("0x{:04X}", w)).collect();

        let line = serde_json::json!({
            "utc_timestamp": chrono::Utc::now().timestamp(),
            "gateway": device.gateway.to_string(),
            "unit_id": device.unit_id,
            "class": device.class,
            "model_id": model_id,
            "address": address,
            "raw_data": raw_data,
        });
        let json_string = serde_json::to_string(&line)?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("Failed to lock datalog file"))?;
        if let Err(e) = writeln!(file, "{}", json_string).and_then(|_| file.flush()) {
            error!("Failed to write to datalog file {}: {}", self.path, e);
            return Err(e.into());
        }

        let mut blocks_written = self
            .blocks_written
            .lock()
            .map_err(|_| anyhow!("Failed to lock datalog counter"))?;
        *blocks_written += 1;
        trace!("{} blocks stored in datalog file", *blocks_written);

        Ok(())
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.lock().map(|n| *n).unwrap_or(0)
    }
}
