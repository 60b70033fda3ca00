//! Error types for the coordinator.

use std::io;

use dmtcp_proto::ProtocolError;

/// Errors from coordinator operations.
///
/// The variants map to how the coordinator reacts: protocol and I/O
/// errors drop the offending client, `NotReady` is reported back to the
/// command issuer, and `Bind`/`Fatal` abort startup with a non-zero
/// exit. A single misbehaving peer never takes the coordinator down.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// Malformed frame from a peer; the peer is dropped.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket or filesystem I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Kv snapshot serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checkpoint refused: the computation is not unanimously running,
    /// or a checkpoint is already in flight.
    #[error("computation not ready for checkpoint")]
    NotReady,

    /// Listener could not be bound.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying bind failure.
        source: io::Error,
    },

    /// Unrecoverable failure of the coordinator's own state or files.
    #[error("{0}")]
    Fatal(String),
}
