//! Optional status file.
//!
//! The first line records the startup time and is never rewritten.
//! Everything after it is replaced on each update: the file is
//! truncated back to the recorded first-line offset and the current
//! snapshot appended. Exit paths append a termination line instead.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;

/// Handle to the status file, remembering the first-line offset.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
    first_line_offset: u64,
}

/// The snapshot written below the first line.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Coordinator hostname.
    pub host: String,
    /// Coordinator IPv4 address, printable.
    pub ip: String,
    /// Listener port.
    pub port: u16,
    /// Current checkpoint interval (0 = disabled).
    pub interval: u32,
    /// `--exit-on-last` flag.
    pub exit_on_last: bool,
    /// `--kill-after-ckpt` flag.
    pub kill_after_ckpt: bool,
    /// Computation id, printable.
    pub computation_id: String,
    /// Checkpoint directory.
    pub ckpt_dir: String,
    /// Connected worker count.
    pub num_peers: u32,
    /// Whether the computation is unanimously running.
    pub running: bool,
}

impl StatusFile {
    /// Create the file, write the startup line, and remember its length.
    pub fn create(path: &Path) -> io::Result<Self> {
        let first_line = format!(
            "Coordinator started: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        fs::write(path, &first_line)?;
        Ok(Self {
            path: path.to_owned(),
            first_line_offset: first_line.len() as u64,
        })
    }

    /// Replace everything after the first line with the snapshot.
    pub fn update(&self, snapshot: &StatusSnapshot) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.first_line_offset)?;

        let mut out = OpenOptions::new().append(true).open(&self.path)?;
        write!(
            out,
            "Host: {} ({})\n\
             Port: {}\n\
             Checkpoint Interval: {}\n\
             Exit on last client: {}\n\
             Kill after checkpoint: {}\n\
             Computation Id: {}\n\
             Checkpoint Dir: {}\n\
             NUM_PEERS={}\n\
             RUNNING={}\n",
            snapshot.host,
            snapshot.ip,
            snapshot.port,
            if snapshot.interval == 0 {
                "disabled".to_owned()
            } else {
                snapshot.interval.to_string()
            },
            snapshot.exit_on_last as u8,
            snapshot.kill_after_ckpt as u8,
            snapshot.computation_id,
            snapshot.ckpt_dir,
            snapshot.num_peers,
            if snapshot.running { "yes" } else { "no" },
        )
    }

    /// Append a termination line; used from exit and signal paths.
    pub fn append_termination(&self, reason: &str) {
        if let Ok(mut out) = OpenOptions::new().append(true).open(&self.path) {
            let _ = writeln!(
                out,
                "Coordinator exited: {} ({reason})",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(num_peers: u32) -> StatusSnapshot {
        StatusSnapshot {
            host: "coord.example".into(),
            ip: "10.0.0.7".into(),
            port: 7779,
            interval: 0,
            exit_on_last: false,
            kill_after_ckpt: true,
            computation_id: "ab-40000-10".into(),
            ckpt_dir: "/ckpts".into(),
            num_peers,
            running: num_peers > 0,
        }
    }

    #[test]
    fn first_line_survives_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let status = StatusFile::create(&path).unwrap();

        status.update(&snapshot(1)).unwrap();
        status.update(&snapshot(3)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("Coordinator started: "));
        assert!(contents.contains("NUM_PEERS=3"));
        assert!(!contents.contains("NUM_PEERS=1"));
        assert!(contents.contains("RUNNING=yes"));
        assert!(contents.contains("Kill after checkpoint: 1"));
    }

    #[test]
    fn termination_line_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let status = StatusFile::create(&path).unwrap();
        status.update(&snapshot(0)).unwrap();
        status.append_termination("signal 15");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.trim_end().ends_with("(signal 15)"));
    }
}
