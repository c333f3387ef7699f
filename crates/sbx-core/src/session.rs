//! Per-session mutable state and its locking.
//!
//! One mutex guards the session's cwd, env, lifecycle, and in-flight command
//! accounting; it is only ever held for in-memory work. The separate
//! workspace gate (a reader/writer lock) quiesces the workspace: commands
//! and file operations hold it shared, mutating snapshot operations hold it
//! exclusively, and destroy takes it exclusively before reclaiming disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use crate::{paths, Error, Result};

/// Fallback PATH for sessions whose creator supplied none; without it no
/// relative executable would ever resolve.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Active,
    Destroying,
    Destroyed,
}

struct SessionState {
    cwd: PathBuf,
    env: HashMap<String, String>,
    lifecycle: Lifecycle,
    active_commands: u32,
    active_groups: HashSet<i32>,
    last_used_at: Instant,
}

/// A live sandbox session: workspace root, mutable shell-like state, and the
/// synchronization needed to keep concurrent operations coherent.
pub struct Session {
    id: String,
    workspace_root: PathBuf,
    created_at: DateTime<Utc>,
    idle_ttl: Duration,
    state: Mutex<SessionState>,
    drained: Notify,
    workspace_gate: RwLock<()>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        workspace_root: PathBuf,
        mut env: HashMap<String, String>,
        idle_ttl: Duration,
    ) -> Self {
        env.entry("PATH".to_string()).or_insert_with(|| DEFAULT_PATH.to_string());
        Self {
            created_at: Utc::now(),
            idle_ttl,
            state: Mutex::new(SessionState {
                cwd: workspace_root.clone(),
                env,
                lifecycle: Lifecycle::Active,
                active_commands: 0,
                active_groups: HashSet::new(),
                last_used_at: Instant::now(),
            }),
            drained: Notify::new(),
            workspace_gate: RwLock::new(()),
            id,
            workspace_root,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The workspace quiescing gate (see module docs).
    pub fn gate(&self) -> &RwLock<()> {
        &self.workspace_gate
    }

    /// Fail unless the session still accepts work.
    pub async fn ensure_active(&self) -> Result<()> {
        match self.state.lock().await.lifecycle {
            Lifecycle::Active => Ok(()),
            Lifecycle::Destroying => Err(Error::session_destroying(&self.id)),
            Lifecycle::Destroyed => Err(Error::session_not_found(&self.id)),
        }
    }

    /// Refresh the idle clock.
    pub async fn touch(&self) {
        self.state.lock().await.last_used_at = Instant::now();
    }

    /// Capture the current cwd and env for a read-only consumer.
    pub async fn shell_state(&self) -> (PathBuf, HashMap<String, String>) {
        let state = self.state.lock().await;
        (state.cwd.clone(), state.env.clone())
    }

    /// Merge new environment variables into the session.
    pub async fn set_env(&self, vars: HashMap<String, String>) -> Result<()> {
        validate_env_names(vars.keys())?;
        let mut state = self.state.lock().await;
        ensure_active_locked(&state, &self.id)?;
        state.env.extend(vars);
        state.last_used_at = Instant::now();
        Ok(())
    }

    /// Change the session working directory. The target must exist inside
    /// the workspace root.
    pub async fn set_cwd(&self, raw: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        ensure_active_locked(&state, &self.id)?;
        let resolved = paths::resolve_cwd(&self.workspace_root, &state.cwd, raw)?;
        if !resolved.is_dir() {
            return Err(Error::invalid_argument(format!(
                "not a directory: {}",
                raw
            )));
        }
        state.cwd = resolved;
        state.last_used_at = Instant::now();
        Ok(())
    }

    /// Capture effective cwd/env for one invocation and count it in-flight.
    ///
    /// Per-call overrides win over session state; the override cwd is
    /// validated against the workspace root before anything is committed.
    /// Every successful call must be paired with [`Session::finish_command`].
    pub(crate) async fn begin_command(
        &self,
        env_override: &HashMap<String, String>,
        cwd_override: Option<&str>,
    ) -> Result<(PathBuf, HashMap<String, String>)> {
        validate_env_names(env_override.keys())?;
        let mut state = self.state.lock().await;
        ensure_active_locked(&state, &self.id)?;

        let cwd = match cwd_override {
            Some(raw) => paths::resolve_cwd(&self.workspace_root, &state.cwd, raw)?,
            None => state.cwd.clone(),
        };
        let mut env = state.env.clone();
        env.extend(env_override.iter().map(|(k, v)| (k.clone(), v.clone())));

        state.active_commands += 1;
        Ok((cwd, env))
    }

    /// Track a spawned command's process group for forced teardown.
    pub(crate) async fn register_group(&self, pgid: i32) {
        self.state.lock().await.active_groups.insert(pgid);
    }

    /// Account for a finished (or never-spawned) command.
    pub(crate) async fn finish_command(&self, pgid: Option<i32>) {
        let mut state = self.state.lock().await;
        state.active_commands = state.active_commands.saturating_sub(1);
        if let Some(pgid) = pgid {
            state.active_groups.remove(&pgid);
        }
        state.last_used_at = Instant::now();
        if state.active_commands == 0 {
            self.drained.notify_one();
        }
    }

    /// Move to `Destroying`, rejecting all new work. Returns false when the
    /// session is already destroyed (nothing left to do).
    pub(crate) async fn begin_destroy(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.lifecycle {
            Lifecycle::Destroyed => false,
            _ => {
                state.lifecycle = Lifecycle::Destroying;
                true
            }
        }
    }

    /// Wait up to `grace` for in-flight commands to drain.
    pub(crate) async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.state.lock().await.active_commands == 0 {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
    }

    /// SIGKILL every process group still running under this session.
    pub(crate) async fn kill_active_groups(&self) {
        let groups: Vec<i32> = self.state.lock().await.active_groups.iter().copied().collect();
        for pgid in groups {
            debug!(session_id = %self.id, pgid, "killing straggler process group");
            sbx_launcher::kill_process_group(pgid);
        }
    }

    pub(crate) async fn mark_destroyed(&self) {
        self.state.lock().await.lifecycle = Lifecycle::Destroyed;
    }

    /// Idle sessions with nothing in flight are eviction candidates.
    pub(crate) async fn idle_expired(&self) -> bool {
        let state = self.state.lock().await;
        state.lifecycle == Lifecycle::Active
            && state.active_commands == 0
            && state.last_used_at.elapsed() >= self.idle_ttl
    }

    /// Number of commands currently in flight.
    pub async fn active_commands(&self) -> u32 {
        self.state.lock().await.active_commands
    }
}

fn ensure_active_locked(state: &SessionState, id: &str) -> Result<()> {
    match state.lifecycle {
        Lifecycle::Active => Ok(()),
        Lifecycle::Destroying => Err(Error::session_destroying(id)),
        Lifecycle::Destroyed => Err(Error::session_not_found(id)),
    }
}

/// Environment variable names follow the shell grammar
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn validate_env_names<'a, I>(names: I) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    for name in names {
        if !is_valid_env_name(name) {
            return Err(Error::invalid_argument(format!(
                "invalid environment variable name: {:?}",
                name
            )));
        }
    }
    Ok(())
}

/// Generate a fresh session id: 128 bits from the OS RNG, URL-safe base64.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
