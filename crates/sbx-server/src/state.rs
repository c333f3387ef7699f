//! Shared state behind both front-door surfaces.

use std::sync::Arc;
use std::time::Duration;

use sbx_core::{CommandService, FileService, SessionRegistry, SnapshotService};
use sbx_launcher::Launcher;
use sbx_workspaces::WorkspaceStore;

use crate::config::ServerConfig;

/// One registry, one set of services; both protocol adapters clone this.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub exec: CommandService,
    pub files: FileService,
    pub snapshots: SnapshotService,
}

impl AppState {
    pub fn new(config: &ServerConfig, store: Arc<WorkspaceStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new(store, config.registry_config()));
        let launcher = Launcher::new(config.capture_cap_bytes, Duration::from_millis(500));
        Self {
            exec: CommandService::new(registry.clone(), launcher, config.default_limits()),
            files: FileService::new(registry.clone(), config.read_cap_bytes),
            snapshots: SnapshotService::new(registry.clone()),
            registry,
        }
    }
}
