//! Restart-script emission.
//!
//! After every completed checkpoint the coordinator writes a POSIX
//! shell script that reconstitutes the computation: it knows the
//! coordinator host and port, the per-host checkpoint image lists, and
//! the ssh/rsh fan-out commands for remote hosts. A stable symlink
//! always points at the most recent script.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use dmtcp_proto::UniquePid;
use tracing::debug;

/// Basename of the emitted script and its stable symlink.
pub const SCRIPT_BASENAME: &str = "dmtcp_restart_script";

/// Per-host checkpoint filename lists, keyed by hostname.
pub type HostFilenames = BTreeMap<String, Vec<String>>;

/// Everything the script embeds.
pub struct RestartScriptInfo<'a> {
    /// Directory the script is written into.
    pub ckpt_dir: &'a Path,
    /// Whether per-process unique filenames are preserved on restart.
    pub unique_filenames: bool,
    /// Wall-clock seconds when the checkpoint started.
    pub ckpt_timestamp: i64,
    /// Current checkpoint interval in seconds.
    pub interval: u32,
    /// Coordinator hostname.
    pub coord_host: &'a str,
    /// Coordinator port.
    pub coord_port: u16,
    /// Computation group identity.
    pub comp_id: UniquePid,
    /// Images restarted locally or over the default remote shell.
    pub restart_filenames: &'a HostFilenames,
    /// Images restarted through `rsh`.
    pub rsh_filenames: &'a HostFilenames,
    /// Images restarted through `ssh`.
    pub ssh_filenames: &'a HostFilenames,
}

/// Write the restart script and refresh the `dmtcp_restart_script.sh`
/// symlink. Returns the path of the written script.
pub fn write_script(info: &RestartScriptInfo<'_>) -> io::Result<PathBuf> {
    let filename = format!(
        "{}_{}_{}.sh",
        SCRIPT_BASENAME, info.comp_id, info.ckpt_timestamp
    );
    let path = info.ckpt_dir.join(&filename);

    let contents = render(info);

    // Write-then-rename; the symlink must never point at a torn script.
    let tmp = path.with_extension("sh.tmp");
    fs::write(&tmp, contents)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755))?;
    fs::rename(&tmp, &path)?;

    let link = info.ckpt_dir.join(format!("{SCRIPT_BASENAME}.sh"));
    let _ = fs::remove_file(&link);
    symlink(&filename, &link)?;

    debug!(path = %path.display(), "wrote restart script");
    Ok(path)
}

fn render(info: &RestartScriptInfo<'_>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "#!/bin/sh");
    let _ = writeln!(out);
    let _ = writeln!(out, "# Generated by the checkpoint coordinator.");
    let _ = writeln!(out, "# Restarts the computation {} from its", info.comp_id);
    let _ = writeln!(out, "# checkpoint images. A coordinator must be reachable at the");
    let _ = writeln!(out, "# host/port below, or supplied via --coord-host/--coord-port.");
    let _ = writeln!(out);
    let _ = writeln!(out, "coord_host=${{DMTCP_COORD_HOST:-{}}}", info.coord_host);
    let _ = writeln!(out, "coord_port=${{DMTCP_COORD_PORT:-{}}}", info.coord_port);
    let _ = writeln!(out, "checkpoint_interval=${{DMTCP_CHECKPOINT_INTERVAL:-{}}}", info.interval);
    let _ = writeln!(out);
    if info.unique_filenames {
        let _ = writeln!(out, "# Unique-filename mode: images keep their per-process");
        let _ = writeln!(out, "# names across restarts.");
        let _ = writeln!(out);
    }

    let restart_flags =
        "--coord-host \"$coord_host\" --coord-port \"$coord_port\" --interval \"$checkpoint_interval\"";

    // Local (or unqualified) images first, then the remote-shell fan-out.
    for (host, files) in info.restart_filenames {
        let _ = writeln!(out, "# Images for host {host}");
        let _ = writeln!(
            out,
            "dmtcp_restart {restart_flags} \\\n  {}",
            shell_join(files)
        );
        let _ = writeln!(out);
    }
    for (shell, by_host) in [("rsh", info.rsh_filenames), ("ssh", info.ssh_filenames)] {
        for (host, files) in by_host {
            let _ = writeln!(out, "# Remote images for host {host} via {shell}");
            let _ = writeln!(
                out,
                "{shell} {host} dmtcp_restart {restart_flags} \\\n  {} &",
                shell_join(files)
            );
            let _ = writeln!(out);
        }
    }

    let _ = writeln!(out, "wait");
    out
}

fn shell_join(files: &[String]) -> String {
    files
        .iter()
        .map(|f| format!("'{}'", f.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" \\\n  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info<'a>(
        dir: &'a Path,
        local: &'a HostFilenames,
        ssh: &'a HostFilenames,
        empty: &'a HostFilenames,
    ) -> RestartScriptInfo<'a> {
        RestartScriptInfo {
            ckpt_dir: dir,
            unique_filenames: false,
            ckpt_timestamp: 1_700_000_000,
            interval: 60,
            coord_host: "coord.example",
            coord_port: 7779,
            comp_id: UniquePid::new(0xab, 40_000, 0x10),
            restart_filenames: local,
            rsh_filenames: empty,
            ssh_filenames: ssh,
        }
    }

    #[test]
    fn script_names_embed_compid_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = HostFilenames::new();
        local.insert("hostA".into(), vec!["/tmp/ckpt_a.dmtcp".into()]);
        let empty = HostFilenames::new();

        let path = write_script(&info(dir.path(), &local, &empty, &empty)).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "dmtcp_restart_script_ab-40000-10_1700000000.sh"
        );

        let link = dir.path().join("dmtcp_restart_script.sh");
        let target = fs::read_link(&link).unwrap();
        assert_eq!(target, path.file_name().unwrap());
    }

    #[test]
    fn script_contains_coordinator_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = HostFilenames::new();
        local.insert(
            "hostA".into(),
            vec!["/tmp/ckpt_a.dmtcp".into(), "/tmp/ckpt_b.dmtcp".into()],
        );
        let mut ssh = HostFilenames::new();
        ssh.insert("hostB".into(), vec!["/data/ckpt_c.dmtcp".into()]);
        let empty = HostFilenames::new();

        let path = write_script(&info(dir.path(), &local, &ssh, &empty)).unwrap();
        let contents = fs::read_to_string(&path).unwrap();

        assert!(contents.starts_with("#!/bin/sh"));
        assert!(contents.contains("coord_host=${DMTCP_COORD_HOST:-coord.example}"));
        assert!(contents.contains("coord_port=${DMTCP_COORD_PORT:-7779}"));
        assert!(contents.contains("'/tmp/ckpt_a.dmtcp'"));
        assert!(contents.contains("'/tmp/ckpt_b.dmtcp'"));
        assert!(contents.contains("ssh hostB dmtcp_restart"));
        assert!(contents.contains("'/data/ckpt_c.dmtcp'"));
        assert!(contents.trim_end().ends_with("wait"));
    }

    #[test]
    fn symlink_is_replaced_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = HostFilenames::new();
        local.insert("hostA".into(), vec!["/tmp/ckpt_a.dmtcp".into()]);
        let empty = HostFilenames::new();

        let mut first = info(dir.path(), &local, &empty, &empty);
        write_script(&first).unwrap();
        first.ckpt_timestamp += 60;
        let second = write_script(&first).unwrap();

        let link = dir.path().join("dmtcp_restart_script.sh");
        assert_eq!(fs::read_link(&link).unwrap(), second.file_name().unwrap());
    }

    #[test]
    fn script_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = HostFilenames::new();
        local.insert("hostA".into(), vec!["/tmp/ckpt_a.dmtcp".into()]);
        let empty = HostFilenames::new();

        let path = write_script(&info(dir.path(), &local, &empty, &empty)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
