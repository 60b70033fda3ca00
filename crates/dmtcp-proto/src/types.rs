//! Enumerations carried in the control-message header.
//!
//! Discriminant values are part of the wire format and must not be
//! reordered. Conversions from raw integers are fallible; an unknown
//! discriminant is a protocol error, never a panic.

use std::fmt;

/// Sentinel for "leave the checkpoint interval unchanged" in a
/// `UserCmd` message (`i` command without a new value).
pub const SAME_CKPT_INTERVAL: i32 = !0u32 as i32;

/// The lifecycle state a worker reports in every message.
///
/// The declaration order defines the ordering used by the state
/// aggregator: `Unknown < Running < PreSuspend < Suspended <
/// Checkpointing < Checkpointed < Restarting`. A worker's state is
/// monotone within a checkpoint phase and returns to [`Running`]
/// when the resume barriers release.
///
/// [`Running`]: WorkerState::Running
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum WorkerState {
    /// No state reported yet (or no workers connected).
    Unknown = 0,
    /// Executing user code.
    Running = 1,
    /// Pre-suspend plugin callbacks are running.
    PreSuspend = 2,
    /// All user threads quiesced.
    Suspended = 3,
    /// Writing the checkpoint image.
    Checkpointing = 4,
    /// Image written, waiting for resume barriers.
    Checkpointed = 5,
    /// Restored from an image, waiting for restart barriers.
    Restarting = 6,
}

impl WorkerState {
    /// Decode a wire discriminant.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::Running),
            2 => Some(Self::PreSuspend),
            3 => Some(Self::Suspended),
            4 => Some(Self::Checkpointing),
            5 => Some(Self::Checkpointed),
            6 => Some(Self::Restarting),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Running => "RUNNING",
            Self::PreSuspend => "PRESUSPEND",
            Self::Suspended => "SUSPENDED",
            Self::Checkpointing => "CHECKPOINTING",
            Self::Checkpointed => "CHECKPOINTED",
            Self::Restarting => "RESTARTING",
        };
        f.write_str(name)
    }
}

/// The kind tag of a control message.
///
/// Worker->coordinator kinds and coordinator->worker kinds share one
/// numbering space; the direction is implied by the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Default-constructed; never valid on the wire.
    Null = 0,
    /// Hello from a freshly launched worker.
    NewWorker = 1,
    /// Hello from an auxiliary name-service client.
    NameServiceWorker = 2,
    /// Hello from a worker restored from a checkpoint image.
    RestartWorker = 3,
    /// Coordinator accepts a hello.
    Accept = 4,
    /// Restart hello refused: computation is not restarting.
    RejectNotRestarting = 5,
    /// Hello refused: wrong computation group.
    RejectWrongComp = 6,
    /// New-worker hello refused: computation not unanimously running.
    RejectNotRunning = 7,
    /// Worker re-announces identity after `fork()`.
    UpdateProcessInfoAfterFork = 8,
    /// Worker re-announces identity after `exec()` or late init.
    UpdateProcessInfoAfterInitOrExec = 9,
    /// Worker asks for the checkpoint directory.
    GetCkptDir = 10,
    /// Reply to [`GetCkptDir`](Self::GetCkptDir); payload is the path.
    GetCkptDirResult = 11,
    /// Worker pushes a new checkpoint directory.
    UpdateCkptDir = 12,
    /// Worker reports its written checkpoint image filename.
    CkptFilename = 13,
    /// Same as [`CkptFilename`](Self::CkptFilename) with per-process
    /// unique naming preserved across restarts.
    UniqueCkptFilename = 14,
    /// One-shot command from a command client.
    UserCmd = 15,
    /// Reply to [`UserCmd`](Self::UserCmd).
    UserCmdResult = 16,
    /// Coordinator orders all workers to begin a checkpoint.
    DoCheckpoint = 17,
    /// Worker arrives at a named global barrier.
    Barrier = 18,
    /// Coordinator releases the named barrier; payload is the name.
    BarrierReleased = 19,
    /// Worker is back to running user code.
    WorkerResuming = 20,
    /// Coordinator orders the peer to exit.
    KillPeer = 21,
    /// Key-value store request.
    KvdbRequest = 22,
    /// Key-value store response.
    KvdbResponse = 23,
}

impl MessageKind {
    /// Decode a wire discriminant.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Null),
            1 => Some(Self::NewWorker),
            2 => Some(Self::NameServiceWorker),
            3 => Some(Self::RestartWorker),
            4 => Some(Self::Accept),
            5 => Some(Self::RejectNotRestarting),
            6 => Some(Self::RejectWrongComp),
            7 => Some(Self::RejectNotRunning),
            8 => Some(Self::UpdateProcessInfoAfterFork),
            9 => Some(Self::UpdateProcessInfoAfterInitOrExec),
            10 => Some(Self::GetCkptDir),
            11 => Some(Self::GetCkptDirResult),
            12 => Some(Self::UpdateCkptDir),
            13 => Some(Self::CkptFilename),
            14 => Some(Self::UniqueCkptFilename),
            15 => Some(Self::UserCmd),
            16 => Some(Self::UserCmdResult),
            17 => Some(Self::DoCheckpoint),
            18 => Some(Self::Barrier),
            19 => Some(Self::BarrierReleased),
            20 => Some(Self::WorkerResuming),
            21 => Some(Self::KillPeer),
            22 => Some(Self::KvdbRequest),
            23 => Some(Self::KvdbResponse),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Status codes returned to command clients in `coord_cmd_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CoordCmdStatus {
    /// Command executed.
    NoError = 0,
    /// Unrecognized command byte.
    ErrorInvalidCommand = -1,
    /// Checkpoint refused: computation not unanimously running, or a
    /// checkpoint is already in flight.
    ErrorNotRunningState = -2,
    /// Reserved for clients that fail to reach a coordinator.
    ErrorCoordinatorNotFound = -3,
}

impl CoordCmdStatus {
    /// Decode a wire value.
    #[must_use]
    pub const fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoError),
            -1 => Some(Self::ErrorInvalidCommand),
            -2 => Some(Self::ErrorNotRunningState),
            -3 => Some(Self::ErrorCoordinatorNotFound),
            _ => None,
        }
    }
}

/// Operation selector for [`KvdbRequest`](MessageKind::KvdbRequest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KvdbOp {
    /// Fetch the value for a key.
    Get = 0,
    /// Fetch a 64-bit integer value.
    Get64 = 1,
    /// Store a byte-string value.
    Set = 2,
    /// Store a 64-bit integer value.
    Set64 = 3,
    /// Add a signed delta to a 64-bit value, creating it at zero.
    Incr64 = 4,
    /// Remove a key.
    Del = 5,
    /// Enumerate all entries in a namespace.
    List = 6,
}

impl KvdbOp {
    /// Decode a wire discriminant.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Get),
            1 => Some(Self::Get64),
            2 => Some(Self::Set),
            3 => Some(Self::Set64),
            4 => Some(Self::Incr64),
            5 => Some(Self::Del),
            6 => Some(Self::List),
            _ => None,
        }
    }
}

/// Outcome of a kvdb operation, carried in `kvdb_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KvdbStatus {
    /// Operation applied.
    Ok = 0,
    /// Key (or namespace) does not exist.
    NotFound = 1,
    /// Malformed request (bad lengths, non-integer value for a 64-bit
    /// operation).
    InvalidRequest = 2,
}

impl KvdbStatus {
    /// Decode a wire value.
    #[must_use]
    pub const fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::NotFound),
            2 => Some(Self::InvalidRequest),
            _ => None,
        }
    }
}
