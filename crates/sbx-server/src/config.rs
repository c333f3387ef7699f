//! Server configuration: flags with environment fallbacks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use sbx_core::RegistryConfig;
use sbx_launcher::Limits;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-tenant code-execution sandbox server", long_about = None)]
pub struct ServerConfig {
    /// HTTP listen address (session lifecycle, snapshots, exports)
    #[arg(long, env = "SBX_HTTP_ADDR", default_value = "0.0.0.0:3000")]
    pub http_addr: SocketAddr,

    /// RPC listen address (command and file hot path)
    #[arg(long, env = "SBX_RPC_ADDR", default_value = "0.0.0.0:50051")]
    pub rpc_addr: SocketAddr,

    /// Data root holding workspaces, snapshots, and exports
    #[arg(long, env = "SBX_DATA_ROOT", default_value = "./data")]
    pub data_root: PathBuf,

    /// Workspace backing root (default: <data-root>/workspaces)
    #[arg(long, env = "SBX_WORKSPACES_ROOT")]
    pub workspaces_root: Option<PathBuf>,

    /// Snapshots root (default: <data-root>/snapshots)
    #[arg(long, env = "SBX_SNAPSHOTS_ROOT")]
    pub snapshots_root: Option<PathBuf>,

    /// Exports root (default: <data-root>/exports)
    #[arg(long, env = "SBX_EXPORTS_ROOT")]
    pub exports_root: Option<PathBuf>,

    /// Seconds an idle session lives before eviction
    #[arg(long, env = "SBX_IDLE_TTL_SECS", default_value_t = 1800)]
    pub idle_ttl_secs: u64,

    /// Seconds destroy waits for in-flight commands before killing them
    #[arg(long, env = "SBX_DESTROY_GRACE_SECS", default_value_t = 30)]
    pub destroy_grace_secs: u64,

    /// Seconds between idle-eviction sweeps
    #[arg(long, env = "SBX_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Per-stream output capture cap in bytes
    #[arg(long, env = "SBX_CAPTURE_CAP_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub capture_cap_bytes: usize,

    /// File read cap in bytes
    #[arg(long, env = "SBX_READ_CAP_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub read_cap_bytes: u64,

    /// Default wall-clock budget per command, milliseconds
    #[arg(long, env = "SBX_DEFAULT_TIME_MS", default_value_t = 300_000)]
    pub default_time_ms: u64,

    /// Default address-space cap per command, KiB
    #[arg(long, env = "SBX_DEFAULT_MEM_KB", default_value_t = 2_097_152)]
    pub default_mem_kb: u64,

    /// Default per-file write cap per command, KiB
    #[arg(long, env = "SBX_DEFAULT_FSIZE_KB", default_value_t = 1_048_576)]
    pub default_fsize_kb: u64,

    /// Default open-file cap per command
    #[arg(long, env = "SBX_DEFAULT_NOFILE", default_value_t = 256)]
    pub default_nofile: u64,
}

impl ServerConfig {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("--idle-ttl-secs", self.idle_ttl_secs),
            ("--destroy-grace-secs", self.destroy_grace_secs),
            ("--sweep-interval-secs", self.sweep_interval_secs),
            ("--default-time-ms", self.default_time_ms),
            ("--default-mem-kb", self.default_mem_kb),
            ("--default-fsize-kb", self.default_fsize_kb),
            ("--default-nofile", self.default_nofile),
        ] {
            if value == 0 {
                return Err(format!("{} must be positive", name));
            }
        }
        if self.capture_cap_bytes == 0 {
            return Err("--capture-cap-bytes must be positive".to_string());
        }
        if self.read_cap_bytes == 0 {
            return Err("--read-cap-bytes must be positive".to_string());
        }
        Ok(())
    }

    /// On-disk layout, with per-root overrides applied over the data root.
    pub fn store_layout(&self) -> sbx_workspaces::StoreLayout {
        let mut layout = sbx_workspaces::StoreLayout::under(&self.data_root);
        if let Some(root) = &self.workspaces_root {
            layout.workspaces = root.clone();
        }
        if let Some(root) = &self.snapshots_root {
            layout.snapshots = root.clone();
        }
        if let Some(root) = &self.exports_root {
            layout.exports = root.clone();
        }
        layout
    }

    pub fn default_limits(&self) -> Limits {
        Limits {
            wall_ms: self.default_time_ms,
            mem_kb: self.default_mem_kb,
            fsize_kb: self.default_fsize_kb,
            nofile: self.default_nofile,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            idle_ttl: Duration::from_secs(self.idle_ttl_secs),
            destroy_grace: Duration::from_secs(self.destroy_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ServerConfig::parse_from(["sbx-server"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.default_limits().wall_ms, 300_000);
        assert_eq!(config.default_limits().nofile, 256);
    }

    #[test]
    fn per_root_overrides_beat_the_data_root() {
        let config = ServerConfig::parse_from([
            "sbx-server",
            "--data-root",
            "/var/lib/sbx",
            "--snapshots-root",
            "/mnt/btrfs/snapshots",
        ]);
        let layout = config.store_layout();
        assert_eq!(layout.workspaces, PathBuf::from("/var/lib/sbx/workspaces"));
        assert_eq!(layout.snapshots, PathBuf::from("/mnt/btrfs/snapshots"));
        assert_eq!(layout.exports, PathBuf::from("/var/lib/sbx/exports"));
    }

    #[test]
    fn zero_knobs_are_rejected() {
        let config = ServerConfig::parse_from(["sbx-server", "--idle-ttl-secs", "0"]);
        assert!(config.validate().is_err());

        let config = ServerConfig::parse_from(["sbx-server", "--default-mem-kb", "0"]);
        assert!(config.validate().is_err());
    }
}
