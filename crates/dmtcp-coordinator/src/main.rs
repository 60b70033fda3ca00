//! `dmtcp_coordinator` entry point.

use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dmtcp_coordinator::{daemon, server, CoordFlags};

fn main() -> ExitCode {
    let flags = match CoordFlags::try_parse() {
        Ok(flags) => flags,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    // Forking with a live runtime is not an option; detach first.
    if flags.daemon {
        if let Err(err) = daemon::daemonize(flags.log_file.as_deref()) {
            eprintln!("dmtcp_coordinator: failed to daemonize: {err}");
            return ExitCode::FAILURE;
        }
    } else if let Some(log_file) = &flags.log_file {
        if let Err(err) = daemon::redirect_output(log_file) {
            eprintln!("dmtcp_coordinator: failed to open log file: {err}");
            return ExitCode::FAILURE;
        }
    }

    init_tracing(&flags);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("dmtcp_coordinator: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(server::run(flags)) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("dmtcp_coordinator: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(flags: &CoordFlags) {
    let default = match flags.quiet {
        0 => "info",
        1 => "warn",
        _ => "error",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
