use crate::prelude::*;

use std::path::{Path, PathBuf};

/// Holds the PID file for as long as this process runs; removes it on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    /// Claim the PID file. Fails if it names a live process, unless `force`.
    pub fn acquire(path: &str, force: bool) -> Result<Self> {
        let path = PathBuf::from(path);

        if let Some(pid) = Self::read_pid(&path) {
            if pid != std::process::id() && Self::is_running(pid) {
                if !force {
                    bail!(
                        "another instance is already running (pid {} in {}); use --force to override",
                        pid,
                        path.display()
                    );
                }
                warn!("ignoring running instance {} because of --force", pid);
            } else {
                info!("removing stale pid file {}", path.display());
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| file_error!("error creating {}: {}", parent.display(), err))?;
        }
        std::fs::write(&path, std::process::id().to_string())
            .map_err(|err| file_error!("error writing {}: {}", path.display(), err))?;

        Ok(Self { path })
    }

    fn read_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        Path::new(&format!("/proc/{}", pid)).exists()
    }

    // without procfs we cannot tell, so treat the file as live
    #[cfg(not(target_os = "linux"))]
    fn is_running(_pid: u32) -> bool {
        true
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if Self::read_pid(&self.path) == Some(std::process::id()) {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!("failed to remove {}: {}", self.path.display(), err);
            }
        }
    }
}
