//! Per-named-barrier arrival counting and release.
//!
//! Workers step through checkpoint and restart by announcing named
//! barriers. The coordinator does not interpret the names beyond
//! equality: the first arrival adopts the name, every later arrival
//! must match it, and the barrier releases once every live worker has
//! arrived. During a restart the release is additionally held back
//! until the expected peer count has connected.

use crate::registry::ComputationStatus;

/// A worker announced a barrier different from the one in progress.
///
/// This is a protocol violation by the worker. The offending client is
/// dropped; the coordinator never aborts on peer misbehavior.
#[derive(Debug, thiserror::Error)]
#[error("barrier mismatch: got {got:?}, expected {expected:?}")]
pub struct BarrierMismatch {
    /// The name the worker announced.
    pub got: String,
    /// The barrier currently in progress.
    pub expected: String,
}

/// Arrival counter for the single barrier in progress.
#[derive(Debug, Default)]
pub struct BarrierEngine {
    current: Option<String>,
    prev: Option<String>,
    workers_at_barrier: u32,
}

impl BarrierEngine {
    /// An engine with no barrier in progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The barrier currently in progress.
    #[must_use]
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// The most recently released barrier.
    #[must_use]
    pub fn prev(&self) -> Option<&str> {
        self.prev.as_deref()
    }

    /// Arrivals registered at the current barrier.
    #[must_use]
    pub fn arrivals(&self) -> u32 {
        self.workers_at_barrier
    }

    /// Register one arrival. The first arrival adopts `name`; later
    /// arrivals must announce the same name.
    pub fn arrive(&mut self, name: &str) -> Result<(), BarrierMismatch> {
        match &self.current {
            None => self.current = Some(name.to_owned()),
            Some(current) if current == name => {}
            Some(current) => {
                return Err(BarrierMismatch {
                    got: name.to_owned(),
                    expected: current.clone(),
                });
            }
        }
        self.workers_at_barrier += 1;
        Ok(())
    }

    /// Un-register one arrival after a registered worker disconnected.
    pub fn depart(&mut self) {
        self.workers_at_barrier = self.workers_at_barrier.saturating_sub(1);
    }

    /// Release the current barrier if every live worker has arrived.
    ///
    /// Returns the released name, or `None` if the barrier holds. The
    /// release is deferred while a restart is still filling up
    /// (`num_restart_peers > 0` and fewer peers connected).
    pub fn try_release(
        &mut self,
        status: &ComputationStatus,
        num_restart_peers: i32,
    ) -> Option<String> {
        self.current.as_ref()?;
        if self.workers_at_barrier != status.num_peers {
            return None;
        }
        if num_restart_peers > 0 && status.num_peers as i32 != num_restart_peers {
            return None;
        }

        let released = self.current.take()?;
        self.prev = Some(released.clone());
        self.workers_at_barrier = 0;
        Some(released)
    }

    /// Zero the arrival counter. Broadcasting any message resets the
    /// counter: the next barrier starts counting from scratch.
    pub fn reset_arrivals(&mut self) {
        self.workers_at_barrier = 0;
    }

    /// Forget all barrier state (computation reset).
    pub fn clear(&mut self) {
        self.current = None;
        self.prev = None;
        self.workers_at_barrier = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmtcp_proto::WorkerState;
    use std::time::Instant;

    fn status(num_peers: u32) -> ComputationStatus {
        ComputationStatus {
            num_peers,
            minimum_state: WorkerState::Suspended,
            maximum_state: WorkerState::Suspended,
            minimum_state_unanimous: true,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn first_arrival_adopts_name() {
        let mut engine = BarrierEngine::new();
        engine.arrive("DMT:SUSPEND").unwrap();
        assert_eq!(engine.current(), Some("DMT:SUSPEND"));
        assert_eq!(engine.arrivals(), 1);
    }

    #[test]
    fn mismatched_name_is_an_error() {
        let mut engine = BarrierEngine::new();
        engine.arrive("DMT:SUSPEND").unwrap();
        let err = engine.arrive("DMT:CHECKPOINT").unwrap_err();
        assert_eq!(err.expected, "DMT:SUSPEND");
        // The mismatched arrival did not count.
        assert_eq!(engine.arrivals(), 1);
    }

    #[test]
    fn releases_when_all_arrive() {
        let mut engine = BarrierEngine::new();
        engine.arrive("DMT:SUSPEND").unwrap();
        assert!(engine.try_release(&status(2), -1).is_none());

        engine.arrive("DMT:SUSPEND").unwrap();
        let released = engine.try_release(&status(2), -1).unwrap();
        assert_eq!(released, "DMT:SUSPEND");
        assert_eq!(engine.prev(), Some("DMT:SUSPEND"));
        assert!(engine.current().is_none());
        assert_eq!(engine.arrivals(), 0);
    }

    #[test]
    fn restart_defers_release_until_all_peers_connect() {
        let mut engine = BarrierEngine::new();
        engine.arrive("DMT:RESTART").unwrap();
        engine.arrive("DMT:RESTART").unwrap();

        // Two workers connected and arrived, but three peers expected.
        assert!(engine.try_release(&status(2), 3).is_none());

        // Third peer connects and arrives.
        engine.arrive("DMT:RESTART").unwrap();
        assert_eq!(engine.try_release(&status(3), 3).unwrap(), "DMT:RESTART");
    }

    #[test]
    fn disconnect_of_straggler_releases_the_rest() {
        let mut engine = BarrierEngine::new();
        engine.arrive("DMT:SUSPEND").unwrap();
        engine.arrive("DMT:SUSPEND").unwrap();
        assert!(engine.try_release(&status(3), -1).is_none());

        // The third worker never arrived and disconnects; its departure
        // is not counted against the barrier, only the peer count drops.
        assert_eq!(engine.try_release(&status(2), -1).unwrap(), "DMT:SUSPEND");
    }

    #[test]
    fn disconnect_of_arrived_worker_decrements_first() {
        let mut engine = BarrierEngine::new();
        engine.arrive("DMT:SUSPEND").unwrap();
        engine.arrive("DMT:SUSPEND").unwrap();

        // One of the two arrived workers disconnects: the counter drops
        // with the peer count, so the barrier still holds for the
        // remaining straggler.
        engine.depart();
        assert!(engine.try_release(&status(2), -1).is_none());
    }

    #[test]
    fn last_to_leave_releases() {
        let mut engine = BarrierEngine::new();
        engine.arrive("Write-Ckpt").unwrap();
        engine.arrive("Write-Ckpt").unwrap();
        // One of the two arrived workers disconnects.
        engine.depart();
        assert_eq!(engine.try_release(&status(1), -1).unwrap(), "Write-Ckpt");
    }

    #[test]
    fn no_barrier_means_no_release() {
        let mut engine = BarrierEngine::new();
        assert!(engine.try_release(&status(0), -1).is_none());
    }
}
