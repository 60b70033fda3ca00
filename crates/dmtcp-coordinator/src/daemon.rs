//! Background-process detachment.
//!
//! Must run before the async runtime starts: forking a process with a
//! live tokio runtime is undefined territory. The parent exits 0 once
//! the child is detached, which is the success signal for launchers
//! that wait for the coordinator to background itself.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Detach from the parent: redirect stdio, fork, and let the parent
/// exit. Returns only in the child.
///
/// With `log_file` set, stdout/stderr append to it; otherwise all three
/// standard streams point at `/dev/null`.
pub fn daemonize(log_file: Option<&Path>) -> io::Result<()> {
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;

    let out_fd = match log_file {
        Some(path) => {
            let log = OpenOptions::new().create(true).append(true).open(path)?;
            let fd = log.as_raw_fd();
            std::mem::forget(log);
            fd
        }
        None => devnull.as_raw_fd(),
    };

    // stdin always detaches from the terminal.
    redirect(devnull.as_raw_fd(), libc::STDIN_FILENO)?;
    redirect(out_fd, libc::STDOUT_FILENO)?;
    redirect(out_fd, libc::STDERR_FILENO)?;

    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => {
            // Child: leave the parent's session so terminal signals
            // cannot reach the coordinator.
            unsafe {
                libc::setsid();
            }
            Ok(())
        }
        _ => {
            // Parent exits immediately; the computation belongs to the
            // detached child now.
            std::process::exit(0);
        }
    }
}

/// Point stdout/stderr at a log file without detaching; used for
/// `--coord-logfile` in foreground mode.
pub fn redirect_output(log_file: &Path) -> io::Result<()> {
    let log = OpenOptions::new().create(true).append(true).open(log_file)?;
    let fd = log.as_raw_fd();
    std::mem::forget(log);
    redirect(fd, libc::STDOUT_FILENO)?;
    redirect(fd, libc::STDERR_FILENO)
}

fn redirect(from: libc::c_int, to: libc::c_int) -> io::Result<()> {
    if unsafe { libc::dup2(from, to) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
