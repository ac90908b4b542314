use crate::config::GatewayConfig;
use crate::directory::{RouteDirectory, RouteTable, StaticRouteSource};
use crate::error::{GatewayError, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Reloads the route and service table when the config file changes
///
/// Only `routes` and `services` are picked up; every other section needs a
/// restart.
pub struct RouteReloader {
    config_path: PathBuf,
    source: Arc<StaticRouteSource>,
    directory: Arc<RouteDirectory>,
    debounce: Duration,
}

impl RouteReloader {
    pub fn new(
        config_path: impl AsRef<Path>,
        source: Arc<StaticRouteSource>,
        directory: Arc<RouteDirectory>,
        debounce_ms: u64,
    ) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            source,
            directory,
            debounce: Duration::from_millis(debounce_ms),
        }
    }

    /// Load, validate and apply the file; the old table stays on failure
    pub async fn reload(&self) -> Result<()> {
        let config = GatewayConfig::from_file(&self.config_path)?;
        config.validate()?;

        self.source
            .replace(RouteTable::new(config.routes, config.services))
            .await;
        self.directory.invalidate();

        Ok(())
    }

    /// Start watching the config file in the background
    pub fn start(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                    ) {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Internal(format!("Failed to watch config file: {}", e)))?;

        info!(
            path = %self.config_path.display(),
            debounce_ms = self.debounce.as_millis() as u64,
            "Route hot reload watcher started"
        );

        tokio::spawn(async move {
            // Moved in so the watcher lives as long as the task
            let _watcher = watcher;

            while let Some(event) = rx.recv().await {
                debug!(kind = ?event.kind, "Config file change detected");

                // Let a burst of writes settle, then reload once
                tokio::time::sleep(self.debounce).await;
                while rx.try_recv().is_ok() {}

                match self.reload().await {
                    Ok(()) => info!(path = %self.config_path.display(), "Routes reloaded"),
                    Err(e) => error!(error = %e, "Rejected config reload, keeping previous routes"),
                }
            }
        });

        Ok(())
    }
}
