//! Process and computation-group identity.

use std::fmt;

use bytes::{Buf, BufMut};

/// Identity of a worker process or of a whole computation group.
///
/// The triple `(hostid, pid, time)` uniquely names a process for the
/// lifetime of a computation; `generation` advances once per started
/// checkpoint when the pid identifies a computation group.
///
/// ## Wire layout (24 bytes, little-endian)
///
/// | Field      | Offset | Size |
/// |------------|--------|------|
/// | hostid     | 0      | 8    |
/// | pid        | 8      | 4    |
/// | time       | 12     | 8    |
/// | generation | 20     | 4    |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UniquePid {
    /// Stable identifier of the originating host.
    pub hostid: u64,
    /// Process id (virtual pid for computation groups).
    pub pid: i32,
    /// Wall-clock seconds at process birth.
    pub time: u64,
    /// Checkpoint generation counter.
    pub generation: u32,
}

/// Encoded size of a [`UniquePid`].
pub const UNIQUE_PID_SIZE: usize = 24;

impl UniquePid {
    /// Build an identity from its parts with generation zero.
    #[must_use]
    pub const fn new(hostid: u64, pid: i32, time: u64) -> Self {
        Self {
            hostid,
            pid,
            time,
            generation: 0,
        }
    }

    /// The zero identity, used for "no computation group yet".
    #[must_use]
    pub const fn null() -> Self {
        Self::new(0, 0, 0)
    }

    /// Whether this is the zero identity.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.hostid == 0 && self.pid == 0 && self.time == 0
    }

    /// Advance the checkpoint generation.
    pub fn increment_generation(&mut self) {
        self.generation += 1;
    }

    /// Append the 24-byte wire form.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.hostid);
        buf.put_i32_le(self.pid);
        buf.put_u64_le(self.time);
        buf.put_u32_le(self.generation);
    }

    /// Read the 24-byte wire form. The caller guarantees the buffer
    /// holds at least [`UNIQUE_PID_SIZE`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let hostid = buf.get_u64_le();
        let pid = buf.get_i32_le();
        let time = buf.get_u64_le();
        let generation = buf.get_u32_le();
        Self {
            hostid,
            pid,
            time,
            generation,
        }
    }
}

impl fmt::Display for UniquePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{}-{:x}",
            self.hostid, self.pid, self.time
        )
    }
}
