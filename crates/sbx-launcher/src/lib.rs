//! Resource-limited subprocess execution for sandbox sessions.
//!
//! The launcher turns a prepared command spec into a single supervised child
//! process: rlimits are applied between fork and exec, stdout/stderr are
//! captured into bounded buffers, and a wall-clock timer escalates from
//! SIGTERM to SIGKILL. A wall-clock kill is not an error; it yields a
//! well-formed outcome with the terminating signal recorded.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::resource::Resource;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod error;

pub use error::Error;

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Default per-stream capture cap (16 MiB).
pub const DEFAULT_CAPTURE_CAP: usize = 16 * 1024 * 1024;

/// Hard resource limits applied to a single command.
///
/// All values must be positive; zero limits are rejected upstream before a
/// spec reaches the launcher. `wall_ms` is wall-clock time enforced by the
/// launcher's own timer, not an rlimit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Wall-clock budget in milliseconds.
    pub wall_ms: u64,
    /// Address-space cap in KiB (RLIMIT_AS).
    pub mem_kb: u64,
    /// Per-file write cap in KiB (RLIMIT_FSIZE).
    pub fsize_kb: u64,
    /// Open file descriptor cap (RLIMIT_NOFILE).
    pub nofile: u64,
}

/// A fully resolved command ready to execute.
///
/// `argv[0]` is the executable, resolved against `PATH` from `env` (the
/// child's environment, never the server's). The launcher does not interpret
/// the command; shell semantics are the caller's business.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub limits: Limits,
}

/// Outcome of a finished command.
///
/// When the child was terminated by a signal (including the launcher's own
/// wall-clock kill), `signal` is the signal number and `exit_code` is the
/// negated signal number, so `exit_code == 0` always implies a clean exit.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub signal: i32,
    pub duration_ms: u64,
}

/// Spawns commands with limits applied and supervises them to completion.
#[derive(Debug, Clone)]
pub struct Launcher {
    capture_cap: usize,
    term_grace: Duration,
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_CAP, Duration::from_millis(500))
    }
}

impl Launcher {
    /// Create a launcher with a per-stream capture cap and a SIGTERM grace
    /// period. The grace is clamped to the 100ms..=1s window.
    pub fn new(capture_cap: usize, term_grace: Duration) -> Self {
        let term_grace = term_grace
            .clamp(Duration::from_millis(100), Duration::from_secs(1));
        Self {
            capture_cap,
            term_grace,
        }
    }

    /// Spawn the command. Limits other than `wall_ms` are installed in the
    /// child between fork and exec; the returned handle drives the rest.
    pub fn launch(&self, spec: CommandSpec) -> Result<RunningCommand> {
        if spec.argv.is_empty() {
            return Err(Error::spawn("empty argv"));
        }

        let mut cmd = Command::new(&spec.argv[0]);
        cmd.args(&spec.argv[1..])
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let limits = spec.limits;
        // SAFETY: runs between fork and exec; only async-signal-safe calls
        // (setsid, setrlimit) are made.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                set_rlimit(Resource::RLIMIT_AS, limits.mem_kb.saturating_mul(1024))?;
                set_rlimit(Resource::RLIMIT_FSIZE, limits.fsize_kb.saturating_mul(1024))?;
                set_rlimit(Resource::RLIMIT_NOFILE, limits.nofile)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| Error::spawn(format!("{}: {}", spec.argv[0], e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::internal("spawned child has no pid"))? as i32;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("child stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("child stderr pipe missing"))?;

        debug!(pid, argv = ?spec.argv, "spawned command");

        Ok(RunningCommand {
            child,
            pgid: pid,
            started: Instant::now(),
            wall: Duration::from_millis(limits.wall_ms),
            term_grace: self.term_grace,
            stdout: Capture::spawn(stdout, self.capture_cap),
            stderr: Capture::spawn(stderr, self.capture_cap),
            capture_cap: self.capture_cap,
        })
    }
}

/// A spawned command being supervised.
///
/// The child runs in its own process group (`pgid` equals the child pid), so
/// killing the group takes down anything the command forked.
pub struct RunningCommand {
    child: Child,
    pgid: i32,
    started: Instant,
    wall: Duration,
    term_grace: Duration,
    stdout: Capture,
    stderr: Capture,
    capture_cap: usize,
}

impl RunningCommand {
    /// Process-group id, usable with [`kill_process_group`] for forced
    /// teardown from outside the supervision loop.
    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Wait for the child to exit or the wall clock to expire, then collect
    /// the captured streams. Returns only after the child is reaped; the
    /// pipe drain is bounded so an orphan holding a pipe open cannot stall
    /// the caller.
    pub async fn wait(mut self) -> Result<CommandOutcome> {
        let status = match tokio::time::timeout(self.wall, self.child.wait()).await {
            Ok(status) => status.map_err(|e| Error::internal(format!("wait failed: {}", e)))?,
            Err(_) => self.kill_with_grace().await?,
        };

        let duration_ms = self.started.elapsed().as_millis() as u64;
        // Pipes normally hit EOF the moment the child exits. If the command
        // left an orphan holding the write end, bound the drain rather than
        // hang the caller; whatever was captured so far is the output.
        let stdout = self.stdout.finish(self.term_grace, self.capture_cap).await;
        let stderr = self.stderr.finish(self.term_grace, self.capture_cap).await;

        let signal = status.signal().unwrap_or(0);
        let exit_code = status.code().unwrap_or(-signal);

        debug!(
            pgid = self.pgid,
            exit_code, signal, duration_ms, "command finished"
        );

        Ok(CommandOutcome {
            stdout,
            stderr,
            exit_code,
            signal,
            duration_ms,
        })
    }

    /// SIGTERM the group, wait out the grace period, SIGKILL stragglers.
    async fn kill_with_grace(&mut self) -> Result<std::process::ExitStatus> {
        debug!(pgid = self.pgid, "wall clock expired, terminating");
        signal_group(self.pgid, Signal::SIGTERM);

        match tokio::time::timeout(self.term_grace, self.child.wait()).await {
            Ok(status) => status.map_err(|e| Error::internal(format!("wait failed: {}", e))),
            Err(_) => {
                warn!(pgid = self.pgid, "child ignored SIGTERM, killing group");
                signal_group(self.pgid, Signal::SIGKILL);
                self.child
                    .wait()
                    .await
                    .map_err(|e| Error::internal(format!("wait failed: {}", e)))
            }
        }
    }
}

/// Send SIGKILL to a command's process group. Used by session teardown when
/// the destroy grace period runs out; errors (already-dead group) are ignored.
pub fn kill_process_group(pgid: i32) {
    signal_group(pgid, Signal::SIGKILL);
}

fn signal_group(pgid: i32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
        debug!(pgid, %signal, "killpg: {}", e);
    }
}

/// Install one rlimit with cur == max.
fn set_rlimit(resource: Resource, value: u64) -> std::io::Result<()> {
    nix::sys::resource::setrlimit(resource, value, value).map_err(std::io::Error::from)
}

/// One captured stream: a drain task appending into a shared bounded buffer.
///
/// The task keeps consuming past the cap so a chatty child never blocks on a
/// full pipe buffer; the shared buffer lets the supervisor collect partial
/// output even when it has to give up on EOF.
struct Capture {
    buf: Arc<Mutex<(Vec<u8>, bool)>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(mut reader: R, cap: usize) -> Self
    where
        R: AsyncReadExt + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new((Vec::new(), false)));
        let shared = buf.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut guard =
                            shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        let (data, truncated) = &mut *guard;
                        if data.len() < cap {
                            let take = n.min(cap - data.len());
                            data.extend_from_slice(&chunk[..take]);
                            if take < n {
                                *truncated = true;
                            }
                        } else {
                            *truncated = true;
                        }
                    }
                    Err(e) => {
                        debug!("stream capture ended early: {}", e);
                        break;
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Wait up to `grace` for EOF, then take whatever was captured.
    async fn finish(mut self, grace: Duration, cap: usize) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            debug!("stream still open after child exit, abandoning drain");
            self.task.abort();
        }
        let (bytes, truncated) = std::mem::take(
            &mut *self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if truncated {
            text.push_str(&format!("\n[truncated: output exceeded {} bytes]\n", cap));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn spec(script: &str, wall_ms: u64) -> CommandSpec {
        CommandSpec {
            argv: sh(script),
            cwd: std::env::temp_dir(),
            env: HashMap::from([(
                "PATH".to_string(),
                "/usr/bin:/bin".to_string(),
            )]),
            limits: Limits {
                wall_ms,
                mem_kb: 2 * 1024 * 1024,
                fsize_kb: 1024 * 1024,
                nofile: 256,
            },
        }
    }

    #[tokio::test]
    async fn echo_captures_stdout() {
        let outcome = Launcher::default()
            .launch(spec("echo hi", 5_000))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hi\n");
        assert_eq!(outcome.stderr, "");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.signal, 0);
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let outcome = Launcher::default()
            .launch(spec("echo oops >&2; exit 3", 5_000))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "");
        assert_eq!(outcome.stderr, "oops\n");
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.signal, 0);
    }

    #[tokio::test]
    async fn parent_environment_is_not_leaked() {
        std::env::set_var("SBX_LAUNCHER_LEAK_PROBE", "leaked");
        let outcome = Launcher::default()
            .launch(spec("echo \"probe=$SBX_LAUNCHER_LEAK_PROBE\"", 5_000))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "probe=\n");
    }

    #[tokio::test]
    async fn cwd_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("pwd", 5_000);
        s.cwd = dir.path().canonicalize().unwrap();
        let outcome = Launcher::default().launch(s).unwrap().wait().await.unwrap();
        assert_eq!(outcome.stdout.trim(), s_path(&dir));
    }

    fn s_path(dir: &tempfile::TempDir) -> String {
        dir.path().canonicalize().unwrap().to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn wall_clock_expiry_kills_and_reports_signal() {
        let started = Instant::now();
        let outcome = Launcher::default()
            .launch(spec("sleep 10", 200))
            .unwrap()
            .wait()
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(outcome.signal != 0 || outcome.exit_code != 0);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1_500));
        // clean exit always means no signal
        if outcome.exit_code == 0 {
            assert_eq!(outcome.signal, 0);
        }
    }

    #[tokio::test]
    async fn output_is_truncated_with_marker() {
        let launcher = Launcher::new(64, Duration::from_millis(500));
        let outcome = launcher
            .launch(spec("yes x | head -c 4096", 5_000))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(outcome.stdout.contains("[truncated: output exceeded 64 bytes]"));
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_failed() {
        let mut s = spec("irrelevant", 5_000);
        s.argv = vec!["/nonexistent/definitely-not-a-binary".to_string()];
        match Launcher::default().launch(s) {
            Err(Error::Spawn { .. }) => {}
            other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let mut s = spec("irrelevant", 5_000);
        s.argv.clear();
        assert!(matches!(
            Launcher::default().launch(s),
            Err(Error::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn fsize_limit_fails_large_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec(
            "dd if=/dev/zero of=big.bin bs=1024 count=64 2>/dev/null; echo rc=$?",
            5_000,
        );
        s.cwd = dir.path().to_path_buf();
        s.limits.fsize_kb = 8;
        let outcome = Launcher::default().launch(s).unwrap().wait().await.unwrap();
        // dd either reports failure or the shell dies on SIGXFSZ
        assert!(!outcome.stdout.contains("rc=0") || outcome.signal != 0);
    }
}
