//! Wire protocol for the DMTCP checkpoint coordinator.
//!
//! Every coordinator<->worker datagram is a fixed-size [`Message`] header
//! followed by `extra_bytes` of payload. The header layout is fixed and
//! little-endian so that independently built workers and coordinators
//! interoperate; see [`message`] for the byte-level table.
//!
//! This crate holds only value types and the codec. Connection handling,
//! barrier bookkeeping, and all coordinator policy live in
//! `dmtcp-coordinator`.

pub mod message;
pub mod types;
pub mod unique_pid;

pub use message::{Message, ProtocolError, HEADER_SIZE, MAGIC, MAX_EXTRA_BYTES};
pub use types::{
    CoordCmdStatus, KvdbOp, KvdbStatus, MessageKind, WorkerState, SAME_CKPT_INTERVAL,
};
pub use unique_pid::UniquePid;
