//! Command service: request → session context → launcher → outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use sbx_launcher::{CommandOutcome, CommandSpec, Launcher, Limits};

use crate::registry::SessionRegistry;
use crate::{Error, Result};

/// Per-call knobs; anything unset falls back to the server defaults or the
/// session's own state.
#[derive(Debug, Clone, Default)]
pub struct CommandOverrides {
    pub time_ms: Option<u64>,
    pub mem_kb: Option<u64>,
    pub fsize_kb: Option<u64>,
    pub nofile: Option<u64>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

/// Stateless adapter that turns a run request into a launcher invocation.
#[derive(Clone)]
pub struct CommandService {
    registry: Arc<SessionRegistry>,
    launcher: Launcher,
    default_limits: Limits,
}

impl CommandService {
    pub fn new(registry: Arc<SessionRegistry>, launcher: Launcher, default_limits: Limits) -> Self {
        Self {
            registry,
            launcher,
            default_limits,
        }
    }

    /// Run one command inside a session and wait for its outcome. A
    /// wall-clock kill still resolves to `Ok` with the signal recorded.
    pub async fn run(
        &self,
        session_id: &str,
        argv: Vec<String>,
        overrides: CommandOverrides,
    ) -> Result<CommandOutcome> {
        if argv.is_empty() {
            return Err(Error::invalid_argument("command must have at least one element"));
        }
        let limits = self.effective_limits(&overrides)?;

        let session = self.registry.get(session_id).await?;

        // Shared gate: mutating snapshot operations wait for us, and we wait
        // for them, so no command ever observes a half-restored workspace.
        let gate = session.gate().read().await;
        let (cwd, env) = session
            .begin_command(&overrides.env, overrides.cwd.as_deref())
            .await?;

        let spec = CommandSpec {
            argv,
            cwd,
            env,
            limits,
        };
        debug!(session_id, argv = ?spec.argv, "running command");

        let running = match self.launcher.launch(spec) {
            Ok(running) => running,
            Err(e) => {
                session.finish_command(None).await;
                return Err(e.into());
            }
        };

        let pgid = running.pgid();
        session.register_group(pgid).await;
        let outcome = running.wait().await;
        drop(gate);
        session.finish_command(Some(pgid)).await;

        outcome.map_err(Into::into)
    }

    fn effective_limits(&self, overrides: &CommandOverrides) -> Result<Limits> {
        let limits = Limits {
            wall_ms: overrides.time_ms.unwrap_or(self.default_limits.wall_ms),
            mem_kb: overrides.mem_kb.unwrap_or(self.default_limits.mem_kb),
            fsize_kb: overrides.fsize_kb.unwrap_or(self.default_limits.fsize_kb),
            nofile: overrides.nofile.unwrap_or(self.default_limits.nofile),
        };
        for (name, value) in [
            ("time_ms", limits.wall_ms),
            ("mem_kb", limits.mem_kb),
            ("fsize_kb", limits.fsize_kb),
            ("nofile", limits.nofile),
        ] {
            if value == 0 {
                return Err(Error::invalid_argument(format!("{} must be positive", name)));
            }
        }
        Ok(limits)
    }
}
