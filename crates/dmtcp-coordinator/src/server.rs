//! The event loop.
//!
//! Single-threaded: one task owns the [`Coordinator`] and multiplexes
//! the listener, the reader-task event channel, stdin, signals, and a
//! one-second tick. Timer policies observe the computation on every
//! wake, and a queued periodic checkpoint is drained after the I/O of
//! each wake, never in the middle of it.

use std::io::Write as _;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoordFlags;
use crate::coordinator::{Coordinator, Event, LoopAction};
use crate::error::CoordError;
use crate::status_file::StatusFile;

/// A bound, not-yet-serving coordinator.
pub struct Server {
    flags: CoordFlags,
    listener: TcpListener,
    bound_port: u16,
}

/// Bind, serve, and return the process exit code.
pub async fn run(flags: CoordFlags) -> Result<i32, CoordError> {
    Server::bind(flags).await?.serve().await
}

impl Server {
    /// Bind the listener and write the port file.
    pub async fn bind(flags: CoordFlags) -> Result<Self, CoordError> {
        let port = flags.effective_port();
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| CoordError::Bind { port, source })?;
        let bound_port = listener.local_addr()?.port();

        if let Some(port_file) = &flags.port_file {
            std::fs::write(port_file, format!("{bound_port}\n"))?;
        }

        Ok(Self {
            flags,
            listener,
            bound_port,
        })
    }

    /// The port actually bound; differs from the request for `--coord-port 0`.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.bound_port
    }

    /// Run the event loop to completion.
    pub async fn serve(self) -> Result<i32, CoordError> {
        let Self {
            flags,
            listener,
            bound_port,
        } = self;

        let hostname = detect_hostname();
        let local_ip = detect_local_ip(&hostname).await;
        info!(port = bound_port, %hostname, ip = %local_ip, "listening");

        if flags.quiet == 0 && !flags.daemon {
            eprintln!("dmtcp_coordinator starting...");
            eprintln!("    Host: {hostname} ({local_ip})");
            eprintln!("    Port: {bound_port}");
            match flags.interval {
                0 => eprintln!("    Checkpoint Interval: disabled (checkpoint manually instead)"),
                secs => eprintln!("    Checkpoint Interval: {secs}"),
            }
            eprintln!("    Exit on last client: {}", u8::from(flags.exit_on_last));
            eprintln!("Type '?' for help.\n");
        }

        let status_file = match &flags.status_file {
            Some(path) => Some(StatusFile::create(path)?),
            None => None,
        };

        let (events_tx, mut events_rx) = mpsc::channel::<Event>(1024);
        let cancel = CancellationToken::new();
        let mut coordinator = Coordinator::new(
            flags.clone(),
            bound_port,
            hostname,
            local_ip,
            status_file.clone(),
            events_tx,
            cancel.clone(),
        );
        coordinator.update_status_file();

        // Stdin is a command source unless the coordinator is detached.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(16);
        let mut stdin_open = !flags.daemon;
        if stdin_open {
            spawn_stdin_reader(stdin_tx);
        }

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        // A coordinator launched transparently alongside the computation
        // must not die from terminal signals aimed at the foreground job.
        let signals_blocked = flags.exit_on_last && flags.daemon;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if coordinator.interactive() && stdin_open {
                print!("dmtcp> ");
                let _ = std::io::stdout().flush();
            }

            let action = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => coordinator.on_connect(stream, peer).await,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        LoopAction::Continue
                    }
                },
                Some(event) = events_rx.recv() => coordinator.on_event(event).await,
                line = stdin_rx.recv(), if stdin_open => match line {
                    Some(line) => coordinator.on_stdin_line(&line).await,
                    None => {
                        eprintln!("\n  Closing stdin...");
                        stdin_open = false;
                        LoopAction::Continue
                    }
                },
                _ = tick.tick() => LoopAction::Continue,
                _ = sigint.recv() => {
                    if signals_blocked {
                        LoopAction::Continue
                    } else {
                        info!("caught SIGINT; quitting");
                        coordinator.quit().await
                    }
                }
                _ = sigterm.recv() => {
                    if signals_blocked {
                        LoopAction::Continue
                    } else {
                        terminate_by_signal(status_file.as_ref(), libc::SIGTERM)
                    }
                }
                _ = sigquit.recv() => {
                    if signals_blocked {
                        LoopAction::Continue
                    } else {
                        terminate_by_signal(status_file.as_ref(), libc::SIGQUIT)
                    }
                }
            };

            if let LoopAction::Exit(code) = action {
                return Ok(code);
            }
            // Timer policies see every wake, including the plain tick.
            if let LoopAction::Exit(code) = coordinator.tick().await {
                return Ok(code);
            }
        }
    }
}

fn spawn_stdin_reader(tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
        // Sender drops here; the loop sees EOF as a closed channel.
    });
}

/// Record the termination and re-raise the signal with its default
/// disposition. Does not return.
fn terminate_by_signal(status_file: Option<&StatusFile>, signum: i32) -> LoopAction {
    if let Some(status_file) = status_file {
        status_file.append_termination(&format!("signal {signum}"));
    }
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
    // The raised signal terminates the process; this is unreachable in
    // practice but keeps the select arm well typed.
    LoopAction::Exit(128 + signum)
}

fn detect_hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_owned();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}

/// The IPv4 address advertised to loopback peers. Resolution failure
/// falls back to loopback, as on an offline host.
async fn detect_local_ip(hostname: &str) -> Ipv4Addr {
    match tokio::net::lookup_host((hostname, 0u16)).await {
        Ok(addrs) => addrs
            .filter_map(|addr| match addr.ip() {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .next()
            .unwrap_or(Ipv4Addr::LOCALHOST),
        Err(_) => Ipv4Addr::LOCALHOST,
    }
}
