//! The session registry: single source of truth for live sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use sbx_workspaces::WorkspaceStore;

use crate::session::{generate_session_id, validate_env_names, Session};
use crate::{Error, Result};

/// Policy knobs for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an idle session lives before the sweeper reclaims it.
    pub idle_ttl: Duration,
    /// How long destroy waits for in-flight commands before killing them.
    pub destroy_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(1800),
            destroy_grace: Duration::from_secs(30),
        }
    }
}

/// Thread-safe directory of sessions. Lock order is always registry map
/// first, then the session's own locks; the map lock is never held across
/// disk I/O or a subprocess wait.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store: Arc<WorkspaceStore>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<WorkspaceStore>, config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    /// Allocate an id, materialize a workspace, and insert the session.
    pub async fn create(&self, initial_env: HashMap<String, String>) -> Result<Arc<Session>> {
        validate_env_names(initial_env.keys())?;

        let id = loop {
            let candidate = generate_session_id();
            if !self.sessions.read().await.contains_key(&candidate) {
                break candidate;
            }
        };

        let root = self.store.materialize(&id).await.map_err(Error::from)?;
        let root = root
            .canonicalize()
            .map_err(|e| Error::internal(format!("canonicalize workspace root: {}", e)))?;

        let session = Arc::new(Session::new(
            id.clone(),
            root,
            initial_env,
            self.config.idle_ttl,
        ));
        self.sessions.write().await.insert(id.clone(), session.clone());

        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// Look up a session that still accepts work.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::session_not_found(id))?;
        session.ensure_active().await?;
        Ok(session)
    }

    /// Destroy a session: reject new work, drain in-flight commands for the
    /// configured grace, kill stragglers, reclaim the workspace. Idempotent;
    /// a concurrent or repeated destroy converges on the same end state.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let Some(session) = self.sessions.read().await.get(id).cloned() else {
            return Ok(());
        };

        if !session.begin_destroy().await {
            return Ok(());
        }

        if !session.wait_for_drain(self.config.destroy_grace).await {
            warn!(session_id = %id, "destroy grace expired, killing in-flight commands");
            session.kill_active_groups().await;
            session.wait_for_drain(Duration::from_secs(1)).await;
        }

        // Exclusive gate: no file or snapshot operation may overlap the
        // on-disk teardown.
        let _gate = session.gate().write().await;
        self.store.destroy(id).await.map_err(Error::from)?;
        session.mark_destroyed().await;
        self.sessions.write().await.remove(id);

        info!(session_id = %id, "session destroyed");
        Ok(())
    }

    /// Evict idle sessions. Returns how many were destroyed.
    pub async fn sweep(&self) -> usize {
        let sessions: Vec<(String, Arc<Session>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        let mut evicted = 0;
        for (id, session) in sessions {
            if session.idle_expired().await {
                info!(session_id = %id, "evicting idle session");
                if let Err(e) = self.destroy(&id).await {
                    warn!(session_id = %id, "idle eviction failed: {}", e);
                } else {
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Number of sessions currently tracked.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Destroy every session (graceful server shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.destroy(&id).await {
                warn!(session_id = %id, "shutdown teardown failed: {}", e);
            }
        }
    }
}

/// Spawn the periodic idle sweeper.
pub fn spawn_sweeper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let evicted = registry.sweep().await;
            if evicted > 0 {
                info!(evicted, "idle sweep complete");
            }
        }
    })
}
