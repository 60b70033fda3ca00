//! Checkpoint coordinator for distributed computations.
//!
//! One coordinator serves one computation: every instrumented worker
//! keeps a TCP connection to it for the lifetime of the run. The
//! coordinator drives synchronized checkpoints and restarts through a
//! generation-numbered state machine and a sequence of named barriers,
//! relays one-letter user commands, hosts a key-value rendezvous store
//! for plugins, and emits a restart script after every checkpoint.
//!
//! The coordinator never touches image data and runs single-threaded:
//! all state is owned by the event loop in [`server`], per-connection
//! reader tasks only decode frames and forward them over a channel.

pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod intervals;
pub mod kvdb;
pub mod registry;
pub mod script;
pub mod server;
pub mod status_file;

pub use config::CoordFlags;
pub use coordinator::Coordinator;
pub use error::CoordError;
