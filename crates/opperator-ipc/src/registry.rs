//! Daemon registry persistence: a user-scoped JSON file of `Daemon` rows.
//! `local` is always present implicitly and assumed healthy. Writes are
//! whole-file and serialized through a process-wide mutex since auto-disable
//! can race a user-initiated toggle.

use opperator_core::{Daemon, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct DaemonRegistry {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl DaemonRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn load(&self) -> Result<Vec<Daemon>> {
        load_registry(&self.path)
    }

    /// Flip `enabled` for `name` and rewrite the file whole, under the
    /// process-wide mutex.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut daemons = load_registry(&self.path)?;
        let mut found = false;
        for d in daemons.iter_mut() {
            if d.name == name {
                d.enabled = enabled;
                found = true;
            }
        }
        if !found {
            return Err(Error::internal(format!("unknown daemon: {name}")));
        }
        save_registry(&self.path, &daemons)
    }
}

fn load_registry(path: &Path) -> Result<Vec<Daemon>> {
    let mut daemons: Vec<Daemon> = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)?
    } else {
        Vec::new()
    };
    if !daemons.iter().any(|d| d.name == "local") {
        daemons.insert(
            0,
            Daemon {
                name: "local".to_string(),
                address: "unix:///tmp/opperator-local.sock".to_string(),
                auth_token: None,
                enabled: true,
            },
        );
    }
    Ok(daemons)
}

fn save_registry(path: &Path, daemons: &[Daemon]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(daemons)?;
    std::fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_is_always_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemons.json");
        let registry = DaemonRegistry::new(&path);
        let daemons = registry.load().unwrap();
        assert!(daemons.iter().any(|d| d.name == "local" && d.enabled));
    }
}
