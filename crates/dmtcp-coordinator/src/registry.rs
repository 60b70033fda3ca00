//! Connected-client registry and virtual-pid allocation.
//!
//! The registry owns every accepted worker exclusively: the socket write
//! half lives inside the [`CoordClient`], and removing a client from the
//! registry is the only way it is ever closed. Auxiliary name-service
//! sockets are tracked separately and never enter the computation
//! bookkeeping.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Instant;

use dmtcp_proto::{UniquePid, WorkerState};
use rustc_hash::FxHashMap;
use tokio::io::AsyncWrite;

/// First virtual pid handed out.
pub const INITIAL_VIRTUAL_PID: i32 = 40_000;

/// Distance between consecutively assigned virtual pids; each worker
/// owns the range for the pids of its forked children.
pub const VIRTUAL_PID_STEP: i32 = 1_000;

/// Virtual pids wrap around below this bound.
pub const MAX_VIRTUAL_PID: i32 = 1_000_000;

/// Registry-assigned handle for a connection, never reused.
pub type ClientId = u64;

/// Boxed socket write half. Erased so unit tests can register clients
/// backed by `tokio::io::sink()`.
pub type ClientWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// One connected worker (or auxiliary name-service socket).
pub struct CoordClient {
    /// Registry handle.
    pub id: ClientId,
    /// Small ordinal shown in the client table.
    pub client_number: u32,
    /// Socket write half; reads happen in the per-connection reader task.
    pub writer: ClientWriter,
    /// Worker identity from the hello (updated after fork/exec).
    pub identity: UniquePid,
    /// Kernel pid on the worker host.
    pub real_pid: i32,
    /// Coordinator-assigned pid.
    pub virtual_pid: i32,
    /// Worker hostname from the hello payload.
    pub hostname: String,
    /// Program name from the hello payload.
    pub progname: String,
    /// Peer address.
    pub ip: IpAddr,
    /// Last reported state.
    pub state: WorkerState,
    /// Barrier the worker is currently registered at, if any.
    pub current_barrier: Option<String>,
    /// Auxiliary name-service socket, excluded from the computation.
    pub is_name_service: bool,
}

/// Aggregate view of all worker states.
///
/// `minimum_state`/`maximum_state` use the [`WorkerState`] ordering.
/// During a restart with peers still connecting, unanimity is forced
/// false so nothing releases early.
#[derive(Debug, Clone, Copy)]
pub struct ComputationStatus {
    /// Number of connected workers.
    pub num_peers: u32,
    /// Minimum worker state ([`WorkerState::Unknown`] when empty).
    pub minimum_state: WorkerState,
    /// Maximum worker state ([`WorkerState::Unknown`] when empty).
    pub maximum_state: WorkerState,
    /// Whether every worker reports `minimum_state`.
    pub minimum_state_unanimous: bool,
    /// Monotonic stamp taken when the snapshot was computed.
    pub timestamp: Instant,
}

impl ComputationStatus {
    /// Whether the computation is unanimously running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.minimum_state_unanimous && self.minimum_state == WorkerState::Running
    }
}

/// The set of connected workers plus its secondary indexes.
pub struct ClientRegistry {
    /// Workers in connection order.
    clients: Vec<CoordClient>,
    /// Auxiliary name-service sockets.
    aux: FxHashMap<ClientId, CoordClient>,
    /// Secondary index: virtual pid to registry handle.
    by_virtual_pid: FxHashMap<i32, ClientId>,
    /// Rolling allocation cursor.
    next_virtual_pid: i32,
    next_client_number: u32,
    next_client_id: ClientId,
}

impl ClientRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            aux: FxHashMap::default(),
            by_virtual_pid: FxHashMap::default(),
            next_virtual_pid: INITIAL_VIRTUAL_PID,
            next_client_number: 1,
            next_client_id: 1,
        }
    }

    /// Mint a fresh registry handle.
    pub fn next_id(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    /// Mint the small ordinal shown in the client table.
    pub fn next_client_number(&mut self) -> u32 {
        let n = self.next_client_number;
        self.next_client_number += 1;
        n
    }

    /// Allocate an unused virtual pid.
    ///
    /// Deterministic: the smallest unused pid at or after the rolling
    /// cursor, stepping by [`VIRTUAL_PID_STEP`] and wrapping at
    /// [`MAX_VIRTUAL_PID`]. The map is always strictly smaller than the
    /// pid space, so the loop terminates.
    pub fn allocate_virtual_pid(&mut self) -> i32 {
        assert!(
            self.by_virtual_pid.len() < (MAX_VIRTUAL_PID / VIRTUAL_PID_STEP) as usize,
            "virtual pid space exhausted"
        );
        loop {
            let pid = self.next_virtual_pid;
            self.next_virtual_pid += VIRTUAL_PID_STEP;
            if self.next_virtual_pid >= MAX_VIRTUAL_PID {
                self.next_virtual_pid = INITIAL_VIRTUAL_PID;
            }
            if !self.by_virtual_pid.contains_key(&pid) {
                return pid;
            }
        }
    }

    /// Insert a worker, indexing its virtual pid.
    pub fn insert(&mut self, client: CoordClient) {
        debug_assert!(!client.is_name_service);
        self.by_virtual_pid.insert(client.virtual_pid, client.id);
        self.clients.push(client);
    }

    /// Insert an auxiliary name-service socket.
    pub fn insert_aux(&mut self, client: CoordClient) {
        debug_assert!(client.is_name_service);
        self.aux.insert(client.id, client);
    }

    /// Remove a connection by handle, worker or auxiliary.
    ///
    /// Returns the removed client so the caller can finish barrier
    /// bookkeeping before the socket drops.
    pub fn remove(&mut self, id: ClientId) -> Option<CoordClient> {
        if let Some(aux) = self.aux.remove(&id) {
            return Some(aux);
        }
        let pos = self.clients.iter().position(|c| c.id == id)?;
        let client = self.clients.remove(pos);
        self.by_virtual_pid.remove(&client.virtual_pid);
        Some(client)
    }

    /// Look up a worker by registry handle.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&CoordClient> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Mutable lookup by registry handle, workers and auxiliaries.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut CoordClient> {
        if let Some(aux) = self.aux.get_mut(&id) {
            return Some(aux);
        }
        self.clients.iter_mut().find(|c| c.id == id)
    }

    /// Look up a worker by virtual pid.
    #[must_use]
    pub fn find_by_virtual_pid(&self, virtual_pid: i32) -> Option<&CoordClient> {
        let id = *self.by_virtual_pid.get(&virtual_pid)?;
        self.get(id)
    }

    /// Number of connected workers (auxiliaries excluded).
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.clients.len()
    }

    /// Iterate workers in connection order.
    pub fn iter(&self) -> impl Iterator<Item = &CoordClient> {
        self.clients.iter()
    }

    /// Iterate workers mutably; used by broadcast.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CoordClient> {
        self.clients.iter_mut()
    }

    /// Group worker counts by hostname, deterministically ordered.
    #[must_use]
    pub fn hosts_summary(&self) -> BTreeMap<String, usize> {
        let mut hosts = BTreeMap::new();
        for client in &self.clients {
            *hosts.entry(client.hostname.clone()).or_insert(0) += 1;
        }
        hosts
    }

    /// Compute the aggregate status.
    ///
    /// `num_restart_peers` is positive only while a restart is filling
    /// up; in that window a `Restarting` minimum with fewer connected
    /// peers than expected reports non-unanimous so barriers hold.
    #[must_use]
    pub fn status(&self, num_restart_peers: i32) -> ComputationStatus {
        let mut min: Option<WorkerState> = None;
        let mut max: Option<WorkerState> = None;
        let mut unanimous = true;

        for client in &self.clients {
            unanimous = unanimous && min.map_or(true, |m| m == client.state);
            min = Some(min.map_or(client.state, |m| m.min(client.state)));
            max = Some(max.map_or(client.state, |m| m.max(client.state)));
        }

        let minimum_state = min.unwrap_or(WorkerState::Unknown);
        let mut minimum_state_unanimous = unanimous;
        if minimum_state == WorkerState::Restarting
            && (self.clients.len() as i32) < num_restart_peers
        {
            minimum_state_unanimous = false;
        }

        ComputationStatus {
            num_peers: self.clients.len() as u32,
            minimum_state,
            maximum_state: max.unwrap_or(WorkerState::Unknown),
            minimum_state_unanimous,
            timestamp: Instant::now(),
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_client(id: ClientId, virtual_pid: i32, state: WorkerState) -> CoordClient {
        CoordClient {
            id,
            client_number: id as u32,
            writer: Box::new(tokio::io::sink()),
            identity: UniquePid::new(1, virtual_pid, 100),
            real_pid: 1000 + virtual_pid,
            virtual_pid,
            hostname: format!("host{}", id % 2),
            progname: "a.out".to_owned(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            state,
            current_barrier: None,
            is_name_service: false,
        }
    }

    #[test]
    fn virtual_pids_are_unique_and_in_range() {
        let mut registry = ClientRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let pid = registry.allocate_virtual_pid();
            assert!(pid >= INITIAL_VIRTUAL_PID && pid < MAX_VIRTUAL_PID);
            assert!(seen.insert(pid), "duplicate virtual pid {pid}");
            registry.insert(test_client(i, pid, WorkerState::Running));
        }
    }

    #[test]
    fn allocator_wraps_and_skips_live_pids() {
        let mut registry = ClientRegistry::new();
        let first = registry.allocate_virtual_pid();
        registry.insert(test_client(1, first, WorkerState::Running));

        // Push the cursor to the last slot before the wrap point.
        registry.next_virtual_pid = MAX_VIRTUAL_PID - VIRTUAL_PID_STEP;
        let at_end = registry.allocate_virtual_pid();
        assert_eq!(at_end, MAX_VIRTUAL_PID - VIRTUAL_PID_STEP);

        // Cursor has wrapped to the initial pid, which is taken; the
        // allocator must skip it.
        let wrapped = registry.allocate_virtual_pid();
        assert_ne!(wrapped, first);
        assert_eq!(wrapped, INITIAL_VIRTUAL_PID + VIRTUAL_PID_STEP);
    }

    #[test]
    fn remove_unindexes_virtual_pid() {
        let mut registry = ClientRegistry::new();
        let pid = registry.allocate_virtual_pid();
        registry.insert(test_client(1, pid, WorkerState::Running));
        assert!(registry.find_by_virtual_pid(pid).is_some());

        registry.remove(1).unwrap();
        assert!(registry.find_by_virtual_pid(pid).is_none());
        assert_eq!(registry.num_workers(), 0);
    }

    #[test]
    fn status_empty_registry() {
        let registry = ClientRegistry::new();
        let status = registry.status(-1);
        assert_eq!(status.num_peers, 0);
        assert_eq!(status.minimum_state, WorkerState::Unknown);
        assert_eq!(status.maximum_state, WorkerState::Unknown);
        assert!(status.minimum_state_unanimous);
    }

    #[test]
    fn status_min_max_unanimity() {
        let mut registry = ClientRegistry::new();
        registry.insert(test_client(1, 40_000, WorkerState::Running));
        registry.insert(test_client(2, 41_000, WorkerState::Suspended));

        let status = registry.status(-1);
        assert_eq!(status.minimum_state, WorkerState::Running);
        assert_eq!(status.maximum_state, WorkerState::Suspended);
        assert!(!status.minimum_state_unanimous);

        registry.get_mut(1).unwrap().state = WorkerState::Suspended;
        let status = registry.status(-1);
        assert_eq!(status.minimum_state, WorkerState::Suspended);
        assert!(status.minimum_state_unanimous);
    }

    #[test]
    fn restart_forces_non_unanimous_until_full() {
        let mut registry = ClientRegistry::new();
        registry.insert(test_client(1, 40_000, WorkerState::Restarting));
        registry.insert(test_client(2, 41_000, WorkerState::Restarting));

        let status = registry.status(3);
        assert_eq!(status.minimum_state, WorkerState::Restarting);
        assert!(!status.minimum_state_unanimous);

        registry.insert(test_client(3, 42_000, WorkerState::Restarting));
        let status = registry.status(3);
        assert!(status.minimum_state_unanimous);
    }

    #[test]
    fn hosts_summary_groups_by_hostname() {
        let mut registry = ClientRegistry::new();
        for i in 1..=4 {
            let pid = registry.allocate_virtual_pid();
            registry.insert(test_client(i, pid, WorkerState::Running));
        }
        let hosts = registry.hosts_summary();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["host0"] + hosts["host1"], 4);
    }
}
