//! Configuration file watcher for hot reload.
//!
//! Backend membership and the geo section are applied from a reloaded
//! file; other sections need a restart. An invalid file is logged and ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::RampartConfig;
use crate::load_balancer::BackendManager;
use crate::security::Admission;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<RampartConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver of validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<RampartConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reload(&path, &tx);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Load `path` and hand the result to the applier. Returns whether it was delivered.
fn reload(path: &Path, tx: &mpsc::UnboundedSender<RampartConfig>) -> bool {
    match load_config(path) {
        Ok(config) => {
            if tx.send(config).is_err() {
                tracing::warn!(path = ?path, "Config reload dropped, nothing is applying updates");
                return false;
            }
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to reload config, keeping current settings");
            false
        }
    }
}

/// Apply reloaded configurations until the channel closes.
pub async fn apply_reloads(
    manager: Arc<BackendManager>,
    admission: Arc<Admission>,
    mut updates: mpsc::UnboundedReceiver<RampartConfig>,
) {
    while let Some(config) = updates.recv().await {
        if !manager.replace_backends(&config.backends) {
            tracing::debug!("Config reloaded, backends unchanged");
        }
        if let Err(e) = admission.reload_geo(&config.geo) {
            tracing::error!(error = %e, "Rejected reloaded geo table, keeping current one");
        }
    }
}
