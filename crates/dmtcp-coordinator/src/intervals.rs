//! Periodic-checkpoint and timeout policies.
//!
//! All three managers are observed on every event-loop wake, including
//! the one-second tick, with the current aggregate status. They take
//! the clock as a parameter so tests can drive them deterministically.

use std::time::{Duration, Instant};

use dmtcp_proto::WorkerState;

use crate::registry::ComputationStatus;

/// Queues a checkpoint whenever the computation has been unanimously
/// running for a full interval without one.
#[derive(Debug)]
pub struct CkptIntervalManager {
    interval: Option<Duration>,
    deadline: Option<Instant>,
}

impl CkptIntervalManager {
    /// `secs == 0` disables periodic checkpoints.
    #[must_use]
    pub fn new(secs: u32) -> Self {
        Self {
            interval: (secs > 0).then(|| Duration::from_secs(u64::from(secs))),
            deadline: None,
        }
    }

    /// Current interval in seconds (0 = disabled).
    #[must_use]
    pub fn interval_secs(&self) -> u32 {
        self.interval.map_or(0, |d| d.as_secs() as u32)
    }

    /// Replace the interval and restart the countdown.
    pub fn set_interval(&mut self, secs: u32, now: Instant) {
        self.interval = (secs > 0).then(|| Duration::from_secs(u64::from(secs)));
        self.deadline = self.interval.map(|d| now + d);
    }

    /// Restart the countdown (called when a checkpoint starts).
    pub fn rearm(&mut self, now: Instant) {
        self.deadline = self.interval.map(|d| now + d);
    }

    /// Observe the current status; returns `true` when a checkpoint
    /// should be queued.
    pub fn observe(&mut self, status: &ComputationStatus, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };

        if status.num_peers == 0
            || status.minimum_state != WorkerState::Running
            || !status.minimum_state_unanimous
        {
            // Not checkpointable; the countdown restarts once it is.
            self.deadline = None;
            return false;
        }

        match self.deadline {
            None => {
                self.deadline = Some(now + interval);
                false
            }
            Some(deadline) if now >= deadline => {
                self.deadline = Some(now + interval);
                true
            }
            Some(_) => false,
        }
    }
}

/// Exits the coordinator after a period with no connected clients.
#[derive(Debug)]
pub struct StaleTimeoutManager {
    limit: Option<Duration>,
    idle_since: Option<Instant>,
}

impl StaleTimeoutManager {
    /// Negative `secs` disables the timeout.
    #[must_use]
    pub fn new(secs: i64, now: Instant) -> Self {
        Self {
            limit: u64::try_from(secs).ok().map(Duration::from_secs),
            idle_since: Some(now),
        }
    }

    /// Observe the peer count; returns `true` when the coordinator has
    /// been empty past the limit and should exit.
    pub fn observe(&mut self, num_peers: u32, now: Instant) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        if num_peers > 0 {
            self.idle_since = None;
            return false;
        }
        let since = *self.idle_since.get_or_insert(now);
        now.duration_since(since) >= limit
    }
}

/// Unconditional exit deadline (`--timeout`).
#[derive(Debug)]
pub struct HardTimeout {
    deadline: Option<Instant>,
}

impl HardTimeout {
    /// `None` disables the timeout.
    #[must_use]
    pub fn new(secs: Option<u64>, now: Instant) -> Self {
        Self {
            deadline: secs.map(|s| now + Duration::from_secs(s)),
        }
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(num_peers: u32) -> ComputationStatus {
        ComputationStatus {
            num_peers,
            minimum_state: WorkerState::Running,
            maximum_state: WorkerState::Running,
            minimum_state_unanimous: true,
            timestamp: Instant::now(),
        }
    }

    fn suspended(num_peers: u32) -> ComputationStatus {
        ComputationStatus {
            minimum_state: WorkerState::Suspended,
            maximum_state: WorkerState::Suspended,
            ..running(num_peers)
        }
    }

    #[test]
    fn disabled_interval_never_queues() {
        let mut mgr = CkptIntervalManager::new(0);
        let now = Instant::now();
        assert!(!mgr.observe(&running(1), now + Duration::from_secs(3600)));
    }

    #[test]
    fn queues_after_idle_interval() {
        let mut mgr = CkptIntervalManager::new(10);
        let t0 = Instant::now();

        // First observation arms the countdown.
        assert!(!mgr.observe(&running(1), t0));
        assert!(!mgr.observe(&running(1), t0 + Duration::from_secs(9)));
        assert!(mgr.observe(&running(1), t0 + Duration::from_secs(10)));
        // Re-armed after firing.
        assert!(!mgr.observe(&running(1), t0 + Duration::from_secs(11)));
        assert!(mgr.observe(&running(1), t0 + Duration::from_secs(20)));
    }

    #[test]
    fn countdown_resets_while_not_running() {
        let mut mgr = CkptIntervalManager::new(10);
        let t0 = Instant::now();
        assert!(!mgr.observe(&running(1), t0));

        // A checkpoint is in flight at the would-be deadline.
        assert!(!mgr.observe(&suspended(1), t0 + Duration::from_secs(10)));

        // Back to running: the countdown starts over.
        assert!(!mgr.observe(&running(1), t0 + Duration::from_secs(11)));
        assert!(!mgr.observe(&running(1), t0 + Duration::from_secs(20)));
        assert!(mgr.observe(&running(1), t0 + Duration::from_secs(21)));
    }

    #[test]
    fn set_interval_rearms() {
        let mut mgr = CkptIntervalManager::new(10);
        let t0 = Instant::now();
        assert!(!mgr.observe(&running(1), t0));

        mgr.set_interval(2, t0 + Duration::from_secs(5));
        assert_eq!(mgr.interval_secs(), 2);
        assert!(mgr.observe(&running(1), t0 + Duration::from_secs(7)));
    }

    #[test]
    fn stale_timeout_fires_only_when_empty() {
        let t0 = Instant::now();
        let mut mgr = StaleTimeoutManager::new(60, t0);

        assert!(!mgr.observe(0, t0 + Duration::from_secs(59)));
        assert!(mgr.observe(0, t0 + Duration::from_secs(60)));

        // A client connects: the idle clock resets.
        let mut mgr = StaleTimeoutManager::new(60, t0);
        assert!(!mgr.observe(1, t0 + Duration::from_secs(120)));
        assert!(!mgr.observe(0, t0 + Duration::from_secs(130)));
        assert!(mgr.observe(0, t0 + Duration::from_secs(190)));
    }

    #[test]
    fn stale_timeout_disabled_with_negative() {
        let t0 = Instant::now();
        let mut mgr = StaleTimeoutManager::new(-1, t0);
        assert!(!mgr.observe(0, t0 + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn hard_timeout() {
        let t0 = Instant::now();
        let timeout = HardTimeout::new(Some(5), t0);
        assert!(!timeout.expired(t0 + Duration::from_secs(4)));
        assert!(timeout.expired(t0 + Duration::from_secs(5)));
        assert!(!HardTimeout::new(None, t0).expired(t0 + Duration::from_secs(5)));
    }
}
