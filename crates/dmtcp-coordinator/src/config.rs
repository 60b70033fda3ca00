//! Command-line and environment configuration.
//!
//! User-specified runtime arguments take priority over environment
//! variables; clap's `env` attribute gives exactly that ordering.

use std::path::PathBuf;

use clap::Parser;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 7779;

/// Default stale timeout: exit after eight hours with no clients.
pub const DEFAULT_STALE_TIMEOUT_SECS: i64 = 8 * 60 * 60;

/// Coordinator configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "dmtcp_coordinator")]
#[command(version)]
#[command(about = "Coordinates checkpoints between multiple processes.")]
pub struct CoordFlags {
    /// Port to listen on. 0 binds an ephemeral port.
    #[arg(short = 'p', long = "coord-port", alias = "port", env = "DMTCP_COORD_PORT")]
    pub port: Option<u16>,

    /// Port to listen on (positional form, takes priority).
    #[arg(value_name = "PORT")]
    pub port_arg: Option<u16>,

    /// File to write the bound listener port number.
    ///
    /// Useful with `--coord-port 0`, which assigns a random port.
    #[arg(long = "port-file")]
    pub port_file: Option<PathBuf>,

    /// File to write host, port, interval, and peer-count info.
    #[arg(long = "status-file")]
    pub status_file: Option<PathBuf>,

    /// Directory to store the restart script.
    #[arg(long = "ckptdir", short = 'c', env = "DMTCP_CHECKPOINT_DIR", default_value = "./")]
    pub ckpt_dir: PathBuf,

    /// Directory for temporary files.
    #[arg(long = "tmpdir", short = 't', env = "DMTCP_TMPDIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Write key-value store data to a JSON file on checkpoint and quit.
    #[arg(long = "write-kv-data", env = "DMTCP_COORD_WRITE_KV_DATA")]
    pub write_kv_data: bool,

    /// Exit automatically when the last client disconnects.
    #[arg(long = "exit-on-last")]
    pub exit_on_last: bool,

    /// Kill peer processes of the computation after each checkpoint.
    #[arg(long = "kill-after-ckpt")]
    pub kill_after_ckpt: bool,

    /// Exit after this many seconds even if jobs are active.
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Exit after this many seconds with no active job. -1 disables.
    #[arg(
        long = "stale-timeout",
        value_name = "SECONDS",
        default_value_t = DEFAULT_STALE_TIMEOUT_SECS,
        allow_negative_numbers = true
    )]
    pub stale_timeout: i64,

    /// Detach from the parent process and run in the background.
    #[arg(long = "daemon")]
    pub daemon: bool,

    /// Dump coordinator logs to the given file.
    #[arg(long = "coord-logfile", env = "DMTCP_COORD_LOG_FILENAME")]
    pub log_file: Option<PathBuf>,

    /// Seconds between automatic checkpoints. 0 disables.
    #[arg(short = 'i', long = "interval", env = "DMTCP_CHECKPOINT_INTERVAL", default_value_t = 0)]
    pub interval: u32,

    /// Skip the startup message and note-level logs; twice skips warnings.
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl CoordFlags {
    /// The port to bind: positional argument wins over `--coord-port`,
    /// which wins over the environment and the default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port_arg.or(self.port).unwrap_or(DEFAULT_PORT)
    }

    /// Scratch directory: `--tmpdir`, then `TMPDIR`, then `/tmp`.
    #[must_use]
    pub fn effective_tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(|| {
            std::env::var_os("TMPDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let flags = CoordFlags::parse_from(["dmtcp_coordinator"]);
        assert_eq!(flags.effective_port(), DEFAULT_PORT);
        assert_eq!(flags.interval, 0);
        assert_eq!(flags.stale_timeout, DEFAULT_STALE_TIMEOUT_SECS);
        assert!(!flags.exit_on_last);
        assert!(!flags.daemon);
    }

    #[test]
    fn positional_port_wins() {
        let flags = CoordFlags::parse_from(["dmtcp_coordinator", "-p", "1234", "5678"]);
        assert_eq!(flags.effective_port(), 5678);
    }

    #[test]
    fn short_flags() {
        let flags = CoordFlags::parse_from(["dmtcp_coordinator", "-p0", "-i60", "-qq"]);
        assert_eq!(flags.effective_port(), 0);
        assert_eq!(flags.interval, 60);
        assert_eq!(flags.quiet, 2);
    }

    #[test]
    fn stale_timeout_disable() {
        let flags =
            CoordFlags::parse_from(["dmtcp_coordinator", "--stale-timeout", "-1"]);
        assert_eq!(flags.stale_timeout, -1);
    }
}
