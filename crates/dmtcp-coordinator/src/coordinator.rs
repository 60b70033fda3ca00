//! The coordinator state machine.
//!
//! All computation state lives here and is mutated only from the event
//! loop task. The flow mirrors the protocol: `on_connect` handshakes
//! new sockets, `on_worker_message` advances the barrier/checkpoint
//! machinery as replies come back, `on_disconnect` unwinds membership,
//! and `handle_user_command` mutates state on behalf of the operator.
//! Messages broadcast from here take effect only when the workers reply,
//! so every command just changes state and returns to the event loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use dmtcp_proto::message::read_message;
use dmtcp_proto::{
    CoordCmdStatus, Message, MessageKind, ProtocolError, UniquePid, WorkerState,
    SAME_CKPT_INTERVAL,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::barrier::BarrierEngine;
use crate::config::CoordFlags;
use crate::intervals::{CkptIntervalManager, HardTimeout, StaleTimeoutManager};
use crate::kvdb::LookupService;
use crate::registry::{ClientId, ClientRegistry, ClientWriter, ComputationStatus, CoordClient};
use crate::script::{self, HostFilenames, RestartScriptInfo};
use crate::status_file::{StatusFile, StatusSnapshot};

/// Help text printed for `h` / `?`.
const HELP_MESSAGE: &str = "\
COMMANDS:
  l: List connected nodes
  s: Print status message
  c: Checkpoint all nodes
  ck: kc:
     Checkpoint and then kill all nodes
  i: Print current checkpoint interval
  k: Kill all nodes
  q: Kill all nodes and quit
  ?: Show this message
";

/// Events forwarded to the event loop by per-connection reader tasks.
#[derive(Debug)]
pub enum Event {
    /// A decoded frame from a registered connection.
    Worker {
        /// Registry handle of the sender.
        id: ClientId,
        /// Decoded header.
        msg: Message,
        /// Trailing payload bytes.
        payload: Bytes,
    },
    /// The connection sent a malformed frame.
    ProtocolError {
        /// Registry handle of the sender.
        id: ClientId,
        /// Decode failure.
        error: ProtocolError,
    },
    /// The connection closed or failed.
    Disconnected {
        /// Registry handle of the peer.
        id: ClientId,
    },
}

/// What the event loop should do after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Keep serving.
    Continue,
    /// Shut down with this exit code.
    Exit(i32),
}

/// The coordinator: one computation's worth of state.
pub struct Coordinator {
    flags: CoordFlags,
    /// Checkpoint directory; workers may update it at runtime.
    ckpt_dir: PathBuf,
    port: u16,
    hostname: String,
    local_ip: Ipv4Addr,

    registry: ClientRegistry,
    barriers: BarrierEngine,
    lookup: LookupService,

    comp_id: UniquePid,
    cur_timestamp: u64,
    ckpt_timestamp: i64,
    num_restart_peers: i32,

    /// A `DoCheckpoint` broadcast is outstanding; no new checkpoint may
    /// start until the workers report their images.
    suspend_msg_sent: bool,
    kill_in_progress: bool,
    kill_after_ckpt_once: bool,
    unique_ckpt_filenames: bool,
    checkpoint_queued: bool,

    /// Command socket awaiting the blocking-checkpoint reply.
    block_until_done: Option<ClientWriter>,

    restart_filenames: HostFilenames,
    rsh_filenames: HostFilenames,
    ssh_filenames: HostFilenames,
    num_restart_filenames: u32,
    num_ckpt_workers: u32,

    interval_mgr: CkptIntervalManager,
    stale_mgr: StaleTimeoutManager,
    hard_timeout: HardTimeout,

    restart_started_at: Option<Instant>,
    checkpoint_started_at: Option<Instant>,

    status_file: Option<StatusFile>,
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Build a coordinator around its bound listener facts.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: CoordFlags,
        port: u16,
        hostname: String,
        local_ip: Ipv4Addr,
        status_file: Option<StatusFile>,
        events_tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        let interval_mgr = CkptIntervalManager::new(flags.interval);
        let stale_mgr = StaleTimeoutManager::new(flags.stale_timeout, now);
        let hard_timeout = HardTimeout::new(flags.timeout, now);
        let ckpt_dir = flags.ckpt_dir.clone();

        Self {
            flags,
            ckpt_dir,
            port,
            hostname,
            local_ip,
            registry: ClientRegistry::new(),
            barriers: BarrierEngine::new(),
            lookup: LookupService::new(),
            comp_id: UniquePid::null(),
            cur_timestamp: 0,
            ckpt_timestamp: 0,
            num_restart_peers: -1,
            suspend_msg_sent: false,
            kill_in_progress: false,
            kill_after_ckpt_once: false,
            unique_ckpt_filenames: false,
            checkpoint_queued: false,
            block_until_done: None,
            restart_filenames: HostFilenames::new(),
            rsh_filenames: HostFilenames::new(),
            ssh_filenames: HostFilenames::new(),
            num_restart_filenames: 0,
            num_ckpt_workers: 0,
            interval_mgr,
            stale_mgr,
            hard_timeout,
            restart_started_at: None,
            checkpoint_started_at: None,
            status_file,
            events_tx,
            cancel,
        }
    }

    /// Aggregate status of the computation.
    #[must_use]
    pub fn status(&self) -> ComputationStatus {
        self.registry.status(self.num_restart_peers)
    }

    /// Append an event to the coordinator's event log.
    fn record_event(&mut self, event: &str) {
        self.lookup.record_event(event);
    }

    // ------------------------------------------------------------------
    // Connection acceptance
    // ------------------------------------------------------------------

    /// Handshake a freshly accepted socket.
    pub async fn on_connect(&mut self, mut stream: TcpStream, peer: SocketAddr) -> LoopAction {
        trace!(%peer, "accepting new connection");

        let (hello, payload) = match read_message(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return LoopAction::Continue,
            Err(err) => {
                warn!(%peer, error = %err, "bad hello; closing connection");
                return LoopAction::Continue;
            }
        };

        if hello.kind == MessageKind::NameServiceWorker {
            self.register_name_service(stream, peer, &hello);
            return LoopAction::Continue;
        }

        if hello.kind == MessageKind::UserCmd {
            return self.process_user_cmd(stream, &hello).await;
        }

        if self.kill_in_progress {
            info!(%peer, "connection request while killing computation; sending kill message");
            let _ = Message::new(MessageKind::KillPeer)
                .write_to(&mut stream, &[])
                .await;
            return LoopAction::Continue;
        }

        // First client into an empty coordinator resets the computation.
        if self.registry.num_workers() == 0 {
            self.initialize_computation();
        }

        let (hostname, progname) = parse_process_info(&payload);

        match hello.kind {
            MessageKind::RestartWorker => {
                self.accept_restarting_worker(stream, peer, &hello, hostname, progname)
                    .await;
            }
            MessageKind::NewWorker => {
                self.accept_new_worker(stream, peer, &hello, hostname, progname)
                    .await;
            }
            other => {
                warn!(%peer, kind = %other, "rejecting connect request from unknown remote process type");
            }
        }

        self.update_status_file();
        LoopAction::Continue
    }

    fn register_name_service(&mut self, stream: TcpStream, peer: SocketAddr, hello: &Message) {
        let (read_half, write_half) = stream.into_split();
        let id = self.registry.next_id();
        let client_number = self.registry.next_client_number();
        self.registry.insert_aux(CoordClient {
            id,
            client_number,
            writer: Box::new(write_half),
            identity: hello.from,
            real_pid: hello.real_pid,
            virtual_pid: hello.virtual_pid,
            hostname: String::new(),
            progname: String::new(),
            ip: peer.ip(),
            state: hello.state,
            current_barrier: None,
            is_name_service: true,
        });
        self.spawn_reader(id, read_half);
        debug!(identity = %hello.from, "registered name-service worker");
    }

    async fn accept_restarting_worker(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        hello: &Message,
        hostname: String,
        progname: String,
    ) {
        if hello.state != WorkerState::Restarting {
            warn!(state = %hello.state, "rejecting restarting worker process with non-RESTARTING state");
            return;
        }

        if self.comp_id.is_null() {
            // Coordinator is idle: the first restarting process fixes the
            // computation group and the expected peer count.
            self.lookup.reset();
            self.record_event("Restarting-Computation");
            self.comp_id = hello.comp_group;
            self.num_restart_peers = hello.num_peers as i32;
            self.cur_timestamp = monotonic_ns();
            self.restart_started_at = Some(Instant::now());
            info!(
                num_restart_peers = self.num_restart_peers,
                comp_id = %self.comp_id,
                "first restart connection; set peer count and timestamp"
            );
            self.record_event("Restart-Start");
        } else if self.status().minimum_state != WorkerState::Restarting {
            info!(
                comp_id = %self.comp_id,
                remote = %hello.comp_group,
                "computation not restarting; rejecting incoming restart process"
            );
            let reply = Message::new(MessageKind::RejectNotRestarting);
            let _ = reply.write_to(&mut stream, &[]).await;
            return;
        } else if hello.comp_group != self.comp_id {
            info!(
                comp_id = %self.comp_id,
                remote = %hello.comp_group,
                "restart process is not from the current computation; rejecting"
            );
            let reply = Message::new(MessageKind::RejectWrongComp);
            let _ = reply.write_to(&mut stream, &[]).await;
            return;
        }

        let mut reply = Message::new(MessageKind::Accept);
        reply.coord_timestamp = self.cur_timestamp;
        reply.comp_group = self.comp_id;
        reply.ip_addr = self.advertised_ip(peer);
        if reply.write_to(&mut stream, &[]).await.is_err() {
            return;
        }

        let virtual_pid = hello.from.pid;
        self.register_worker(stream, peer, hello, hostname, progname, virtual_pid);
    }

    async fn accept_new_worker(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        hello: &Message,
        hostname: String,
        progname: String,
    ) {
        if hello.state != WorkerState::Running && hello.state != WorkerState::Unknown {
            warn!(state = %hello.state, "state is not RUNNING or UNKNOWN; rejecting new connection");
            return;
        }
        if hello.virtual_pid != -1 {
            warn!(virtual_pid = hello.virtual_pid, "virtualPid is not -1; rejecting new connection");
            return;
        }

        let virtual_pid = self.registry.allocate_virtual_pid();
        let mut reply = Message::new(MessageKind::Accept);
        reply.virtual_pid = virtual_pid;

        if self.suspend_msg_sent {
            // Born of fork/exec during a checkpoint: accept it, then
            // order it to join the checkpoint in flight.
            reply.comp_group = self.comp_id;
            if reply.write_to(&mut stream, &[]).await.is_err() {
                return;
            }
            self.register_worker(stream, peer, hello, hostname, progname, virtual_pid);
            if let Some(id) = self.registry.find_by_virtual_pid(virtual_pid).map(|c| c.id) {
                self.resend_do_checkpoint(id).await;
            }
            return;
        }

        let status = self.status();
        if status.num_peers > 0
            && status.minimum_state != WorkerState::Running
            && status.minimum_state != WorkerState::Unknown
        {
            info!(
                comp_id = %self.comp_id,
                remote = %hello.from,
                min_state = %status.minimum_state,
                "computation not in RUNNING state; refusing new connection"
            );
            let mut reject = Message::new(MessageKind::RejectNotRunning);
            reject.virtual_pid = virtual_pid;
            let _ = reject.write_to(&mut stream, &[]).await;
            return;
        }

        if !hello.comp_group.is_null() {
            info!(
                remote_group = %hello.comp_group,
                "new process already carries a computation group; rejecting"
            );
            let _ = Message::new(MessageKind::RejectWrongComp)
                .write_to(&mut stream, &[])
                .await;
            return;
        }

        if self.comp_id.is_null() {
            // First process: mint the computation group from its identity.
            self.comp_id = UniquePid {
                hostid: hello.from.hostid,
                pid: virtual_pid,
                time: hello.from.time,
                generation: hello.from.generation,
            };
            self.cur_timestamp = monotonic_ns();
            self.num_restart_peers = -1;
            debug!(comp_id = %self.comp_id, "first process connected; creating new computation group");
            self.record_event("Initializing-Computation");
            if hello.checkpoint_interval >= 0 && hello.checkpoint_interval != SAME_CKPT_INTERVAL {
                self.interval_mgr
                    .set_interval(hello.checkpoint_interval as u32, Instant::now());
            }
        } else {
            debug!(remote = %hello.from, virtual_pid, "new process connected");
        }

        reply.comp_group = self.comp_id;
        reply.coord_timestamp = self.cur_timestamp;
        reply.ip_addr = self.advertised_ip(peer);
        if reply.write_to(&mut stream, &[]).await.is_err() {
            return;
        }
        self.register_worker(stream, peer, hello, hostname, progname, virtual_pid);
    }

    fn register_worker(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        hello: &Message,
        hostname: String,
        progname: String,
        virtual_pid: i32,
    ) {
        let (read_half, write_half) = stream.into_split();
        let id = self.registry.next_id();
        let client_number = self.registry.next_client_number();
        info!(identity = %hello.from, %progname, "worker connected");
        self.registry.insert(CoordClient {
            id,
            client_number,
            writer: Box::new(write_half),
            identity: hello.from,
            real_pid: hello.real_pid,
            virtual_pid,
            hostname,
            progname,
            ip: peer.ip(),
            state: hello.state,
            current_barrier: None,
            is_name_service: false,
        });
        self.spawn_reader(id, read_half);
    }

    /// Advertise the coordinator's own IPv4 to loopback peers so a
    /// restarted worker on another host can still find it.
    fn advertised_ip(&self, peer: SocketAddr) -> Ipv4Addr {
        match peer.ip() {
            IpAddr::V4(v4) if v4.is_loopback() => self.local_ip,
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => self.local_ip,
        }
    }

    fn spawn_reader(&self, id: ClientId, mut read_half: OwnedReadHalf) {
        let tx = self.events_tx.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = read_message(&mut read_half) => match result {
                        Ok(Some((msg, payload))) => {
                            if tx.send(Event::Worker { id, msg, payload }).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(ProtocolError::Io(_)) => {
                            let _ = tx.send(Event::Disconnected { id }).await;
                            break;
                        }
                        Err(error) => {
                            let _ = tx.send(Event::ProtocolError { id, error }).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Worker messages
    // ------------------------------------------------------------------

    /// Dispatch one event from a reader task.
    pub async fn on_event(&mut self, event: Event) -> LoopAction {
        match event {
            Event::Worker { id, msg, payload } => self.on_worker_message(id, msg, payload).await,
            Event::ProtocolError { id, error } => {
                warn!(client = id, %error, "protocol error from peer; dropping client");
                self.on_disconnect(id).await
            }
            Event::Disconnected { id } => self.on_disconnect(id).await,
        }
    }

    async fn on_worker_message(&mut self, id: ClientId, msg: Message, payload: Bytes) -> LoopAction {
        let (prev_state, identity) = {
            let Some(client) = self.registry.get_mut(id) else {
                // Already disconnected; late frames are harmless.
                return LoopAction::Continue;
            };
            let prev = client.state;
            client.state = msg.state;
            (prev, client.identity)
        };

        match msg.kind {
            MessageKind::WorkerResuming => {
                trace!(from = %msg.from, %prev_state, state = %msg.state, "worker resuming execution");
                if let Some(client) = self.registry.get_mut(id) {
                    client.current_barrier = None;
                }

                let status = self.status();
                if status.is_running() && prev_state == WorkerState::Restarting {
                    if let Some(started) = self.restart_started_at.take() {
                        info!(elapsed = ?started.elapsed(), "restart complete");
                    }
                    self.record_event("Restart-Complete");
                    self.serialize_kvdb();
                }
            }

            MessageKind::Barrier => {
                let barrier = msg.text.clone();
                trace!(from = %msg.from, %prev_state, state = %msg.state, %barrier, "worker at barrier");

                if let Some(client) = self.registry.get_mut(id) {
                    if client.current_barrier.as_deref() == Some(barrier.as_str()) {
                        warn!(%barrier, "worker re-announced the barrier it is already at");
                    }
                    client.current_barrier = Some(barrier.clone());
                }

                if let Err(err) = self.barriers.arrive(&barrier) {
                    // Drop the deviating client, keep the computation.
                    warn!(%identity, %err, "dropping client with mismatched barrier");
                    return self.on_disconnect(id).await;
                }
                self.try_release_barrier().await;
            }

            MessageKind::UniqueCkptFilename | MessageKind::CkptFilename => {
                if msg.kind == MessageKind::UniqueCkptFilename {
                    self.unique_ckpt_filenames = true;
                }
                return self.record_ckpt_filename(id, &payload).await;
            }

            MessageKind::GetCkptDir => {
                let mut dir = self.ckpt_dir.to_string_lossy().into_owned().into_bytes();
                dir.push(0);
                let reply = Message::new(MessageKind::GetCkptDirResult);
                self.send_to_client(id, &reply, &dir).await;
            }

            MessageKind::UpdateCkptDir => {
                let (dir, _) = parse_cstr(&payload);
                if !dir.is_empty() && self.ckpt_dir != PathBuf::from(&dir) {
                    self.ckpt_dir = PathBuf::from(dir);
                    info!(ckpt_dir = %self.ckpt_dir.display(), "updated checkpoint directory");
                }
            }

            MessageKind::UpdateProcessInfoAfterFork => {
                info!(from = %msg.from, prev = %identity, "updating process information after fork()");
                if let Some(client) = self.registry.get_mut(id) {
                    client.identity = msg.from;
                    client.real_pid = msg.real_pid;
                }
            }

            MessageKind::UpdateProcessInfoAfterInitOrExec => {
                let (progname, _) = parse_cstr(&payload);
                info!(%progname, from = %msg.from, "updating process information after exec()");
                if let Some(client) = self.registry.get_mut(id) {
                    client.identity = msg.from;
                    client.progname = progname;
                    client.state = msg.state;
                }
                if self.suspend_msg_sent {
                    // The exec'd process may have missed the in-flight
                    // checkpoint order; resend it. Workers ignore the
                    // duplicate.
                    self.resend_do_checkpoint(id).await;
                }
            }

            MessageKind::KvdbRequest => {
                trace!(from = %identity, "kvdb request");
                let result = self.lookup.process_request(&msg, &payload);
                let mut reply = Message::new(MessageKind::KvdbResponse);
                reply.text = msg.text.clone();
                reply.kvdb_status = result.status as i32;
                reply.val_len = result.value.len() as u32;
                let value = result.value;
                self.send_to_client(id, &reply, &value).await;
            }

            other => {
                warn!(kind = %other, from = %identity, "unexpected message from worker; closing connection");
                return self.on_disconnect(id).await;
            }
        }

        LoopAction::Continue
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    async fn try_release_barrier(&mut self) {
        let status = self.status();
        let Some(released) = self.barriers.try_release(&status, self.num_restart_peers) else {
            if self.barriers.current().is_some()
                && self.num_restart_peers > 0
                && status.num_peers as i32 != self.num_restart_peers
                && self.barriers.arrivals() == status.num_peers
            {
                info!(
                    num_restart_peers = self.num_restart_peers,
                    num_peers = status.num_peers,
                    "waiting for all restarting processes to connect"
                );
            }
            return;
        };

        self.record_event(&format!("Barrier-{released}"));
        debug!(barrier = %released, "releasing barrier");

        self.num_ckpt_workers = status.num_peers;
        let mut payload = released.clone().into_bytes();
        payload.push(0);
        self.broadcast(MessageKind::BarrierReleased, &payload).await;

        if status.minimum_state == WorkerState::Checkpointed {
            info!("checkpoint complete; all workers running");
        }
    }

    // ------------------------------------------------------------------
    // Checkpoint orchestration
    // ------------------------------------------------------------------

    /// Begin a global checkpoint. Returns `false` (and changes nothing)
    /// unless the computation is unanimously running with no checkpoint
    /// already in flight.
    pub async fn start_checkpoint(&mut self) -> bool {
        let status = self.status();
        if status.minimum_state != WorkerState::Running
            || !status.minimum_state_unanimous
            || self.suspend_msg_sent
        {
            if status.num_peers > 0 {
                debug!(
                    min_state = %status.minimum_state,
                    num_peers = status.num_peers,
                    "delaying checkpoint; workers not ready"
                );
            }
            return false;
        }
        if status.num_peers == 0 {
            return false;
        }

        self.unique_ckpt_filenames = false;
        self.ckpt_timestamp = chrono::Utc::now().timestamp();
        self.checkpoint_started_at = Some(Instant::now());
        self.record_event("Ckpt-Start");
        self.num_restart_filenames = 0;
        self.num_ckpt_workers = status.num_peers;
        self.num_restart_peers = -1;
        self.restart_filenames.clear();
        self.rsh_filenames.clear();
        self.ssh_filenames.clear();
        self.comp_id.increment_generation();
        info!(
            num_peers = status.num_peers,
            generation = self.comp_id.generation,
            "starting checkpoint; incrementing generation; suspending all nodes"
        );

        self.broadcast(MessageKind::DoCheckpoint, &[]).await;

        // The order is out but the workers are still running; a second
        // checkpoint request must fail until they all report images.
        self.suspend_msg_sent = true;
        self.interval_mgr.rearm(Instant::now());
        true
    }

    async fn resend_do_checkpoint(&mut self, id: ClientId) {
        debug_assert!(self.suspend_msg_sent);
        let Some(identity) = self.registry.get(id).map(|c| c.identity) else {
            return;
        };
        info!(%identity, "sending checkpoint order to late-arriving worker");
        let mut msg = Message::new(MessageKind::DoCheckpoint);
        msg.comp_group = self.comp_id;
        self.send_to_client(id, &msg, &[]).await;
    }

    async fn record_ckpt_filename(&mut self, id: ClientId, payload: &Bytes) -> LoopAction {
        match self.registry.get_mut(id) {
            Some(client) => client.state = WorkerState::Checkpointed,
            None => return LoopAction::Continue,
        }

        let (ckpt_filename, rest) = parse_cstr(payload);
        let (shell_type, rest) = parse_cstr(rest);
        let (hostname, _) = parse_cstr(rest);
        if ckpt_filename.is_empty() || hostname.is_empty() {
            warn!("checkpoint-filename message without filename/hostname; dropping client");
            return self.on_disconnect(id).await;
        }

        trace!(%ckpt_filename, %hostname, %shell_type, "recording restart info");
        let bucket = match shell_type.as_str() {
            "" => &mut self.restart_filenames,
            "rsh" => &mut self.rsh_filenames,
            "ssh" => &mut self.ssh_filenames,
            other => {
                warn!(shell_type = other, "unsupported remote shell; dropping client");
                return self.on_disconnect(id).await;
            }
        };
        bucket.entry(hostname).or_default().push(ckpt_filename);
        self.num_restart_filenames += 1;

        if self.num_restart_filenames == self.num_ckpt_workers {
            self.finish_checkpoint().await;
        }
        LoopAction::Continue
    }

    async fn finish_checkpoint(&mut self) {
        let info = RestartScriptInfo {
            ckpt_dir: &self.ckpt_dir,
            unique_filenames: self.unique_ckpt_filenames,
            ckpt_timestamp: self.ckpt_timestamp,
            interval: self.interval_mgr.interval_secs(),
            coord_host: &self.hostname,
            coord_port: self.port,
            comp_id: self.comp_id,
            restart_filenames: &self.restart_filenames,
            rsh_filenames: &self.rsh_filenames,
            ssh_filenames: &self.ssh_filenames,
        };
        match script::write_script(&info) {
            Ok(path) => {
                if let Some(started) = self.checkpoint_started_at.take() {
                    info!(
                        elapsed = ?started.elapsed(),
                        script = %path.display(),
                        "checkpoint complete; wrote restart script"
                    );
                }
            }
            Err(err) => warn!(%err, "failed to write restart script"),
        }

        self.record_event("Ckpt-Complete");
        self.serialize_kvdb();

        if let Some(mut writer) = self.block_until_done.take() {
            info!("replying to blocking checkpoint command");
            let reply = Message::new(MessageKind::UserCmdResult);
            let _ = reply.write_to(&mut writer, &[]).await;
        }

        if self.flags.kill_after_ckpt || self.kill_after_ckpt_once {
            info!("checkpoint complete; killing all peers");
            self.broadcast(MessageKind::KillPeer, &[]).await;
        }

        self.kill_after_ckpt_once = false;
        self.num_restart_filenames = 0;
        self.num_ckpt_workers = 0;

        // Every worker has its image; a new checkpoint may start.
        self.suspend_msg_sent = false;
    }

    // ------------------------------------------------------------------
    // Disconnects and computation reset
    // ------------------------------------------------------------------

    async fn on_disconnect(&mut self, id: ClientId) -> LoopAction {
        let Some(client) = self.registry.remove(id) else {
            return LoopAction::Continue;
        };
        if client.is_name_service {
            return LoopAction::Continue;
        }
        info!(identity = %client.identity, progname = %client.progname, "client disconnected");

        let status = self.status();
        if status.num_peers == 0 {
            if self.flags.exit_on_last {
                info!("last client exited; shutting down");
                return self.quit().await;
            }
            self.remove_stale_shared_area_file();
            // A kill in progress blocks new connections; with everyone
            // gone the refusal must lift.
            self.kill_in_progress = false;
            self.comp_id = UniquePid::null();
            self.barriers.clear();
            self.num_restart_peers = -1;
        } else if self.barriers.current().is_some() {
            if client.current_barrier.as_deref() == self.barriers.current() {
                self.barriers.depart();
            }
            self.try_release_barrier().await;
        }

        self.update_status_file();
        LoopAction::Continue
    }

    fn initialize_computation(&mut self) {
        info!("resetting computation");
        self.suspend_msg_sent = false;
        self.kill_in_progress = false;
        self.kill_after_ckpt_once = false;
        self.checkpoint_queued = false;
        self.comp_id = UniquePid::null();
        self.cur_timestamp = 0;
        self.num_restart_peers = -1;
        self.block_until_done = None;
        self.barriers.clear();
    }

    fn remove_stale_shared_area_file(&self) {
        let path = self.flags.effective_tmp_dir().join(format!(
            "dmtcpSharedArea.{}.{:x}",
            self.comp_id, self.cur_timestamp
        ));
        trace!(path = %path.display(), "removing shared-area file");
        let _ = std::fs::remove_file(path);
    }

    // ------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------

    /// Handle a line typed on the coordinator's stdin.
    pub async fn on_stdin_line(&mut self, line: &str) -> LoopAction {
        let cmd = line.trim_start().to_lowercase();
        if cmd.is_empty() {
            return LoopAction::Continue;
        }
        self.handle_user_command(&cmd, None).await
    }

    /// Execute a one- or two-letter command; `reply` is filled for
    /// command-socket callers.
    async fn handle_user_command(
        &mut self,
        cmd: &str,
        mut reply: Option<&mut CommandReply>,
    ) -> LoopAction {
        if let Some(reply) = reply.as_mut() {
            reply.status = CoordCmdStatus::NoError;
        }

        match cmd {
            "bc" | "kc" | "ck" | "K" | "c" => {
                if cmd == "kc" || cmd == "ck" || cmd == "K" {
                    debug!("will kill peers after creating the checkpoint");
                    self.kill_after_ckpt_once = true;
                } else {
                    debug!("checkpointing...");
                }

                if self.start_checkpoint().await {
                    if let Some(reply) = reply.as_mut() {
                        reply.num_peers = self.status().num_peers;
                    }
                } else if let Some(reply) = reply.as_mut() {
                    reply.status = CoordCmdStatus::ErrorNotRunningState;
                }
            }
            "l" | "t" => {
                let table = self.client_table();
                match reply.as_mut() {
                    Some(reply) => reply.data = table.into_bytes(),
                    None => print!("{table}"),
                }
            }
            "u" => {
                println!("Host List:");
                println!("HOST => # connected clients");
                for (host, count) in self.registry.hosts_summary() {
                    println!("{host} => {count}");
                }
            }
            "q" => {
                info!("killing all connected peers and quitting...");
                return self.quit().await;
            }
            "k" => {
                info!("killing all connected peers...");
                self.broadcast(MessageKind::KillPeer, &[]).await;
            }
            "i" => {
                println!(
                    "Checkpoint Interval: {}",
                    match self.interval_mgr.interval_secs() {
                        0 => "disabled".to_owned(),
                        secs => secs.to_string(),
                    }
                );
                if let Some(reply) = reply.as_mut() {
                    reply.checkpoint_interval = self.interval_mgr.interval_secs() as i32;
                }
            }
            "h" | "?" => {
                print!("{HELP_MESSAGE}");
            }
            "s" => {
                let status = self.status();
                match reply.as_mut() {
                    Some(reply) => {
                        reply.num_peers = status.num_peers;
                        reply.is_running = status.is_running();
                        reply.checkpoint_interval = self.interval_mgr.interval_secs() as i32;
                    }
                    None => self.print_status(&status),
                }
            }
            other => {
                info!(cmd = other, "unhandled user command");
                if let Some(reply) = reply.as_mut() {
                    reply.status = CoordCmdStatus::ErrorInvalidCommand;
                }
            }
        }
        LoopAction::Continue
    }

    /// Handle a one-shot command socket.
    async fn process_user_cmd(&mut self, stream: TcpStream, hello: &Message) -> LoopAction {
        let cmd_byte = char::from_u32(hello.coord_cmd).unwrap_or('\0');
        trace!(cmd = %cmd_byte, "got user command from command client");

        let mut reply = CommandReply::default();

        // The blocking prefix: reply only once the checkpoint completes.
        if cmd_byte == 'b' {
            if self.start_checkpoint().await {
                let (_, write_half) = stream.into_split();
                self.block_until_done = Some(Box::new(write_half));
                return LoopAction::Continue;
            }
            reply.status = CoordCmdStatus::ErrorNotRunningState;
            let mut stream = stream;
            send_cmd_reply(&mut stream, &reply).await;
            return LoopAction::Continue;
        }

        if cmd_byte == 'i' && hello.checkpoint_interval != SAME_CKPT_INTERVAL {
            let secs = hello.checkpoint_interval.max(0) as u32;
            info!(interval = secs, "updating checkpoint interval");
            self.interval_mgr.set_interval(secs, Instant::now());
            self.update_status_file();
        }

        let cmd = if cmd_byte == 'K' {
            "K".to_owned()
        } else {
            cmd_byte.to_ascii_lowercase().to_string()
        };
        let action = self.handle_user_command(&cmd, Some(&mut reply)).await;

        let mut stream = stream;
        send_cmd_reply(&mut stream, &reply).await;
        action
    }

    fn client_table(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        out.push_str("Client List:\n");
        out.push_str("#, PROG[virtPID:realPID]@HOST, DMTCP-UNIQUEPID, STATE, BARRIER\n");
        for client in self.registry.iter() {
            let _ = writeln!(
                out,
                "{}, {}[{}:{}]@{}, {}, {}, {}",
                client.client_number,
                client.progname,
                client.virtual_pid,
                client.real_pid,
                client.hostname,
                client.identity,
                client.state,
                client.current_barrier.as_deref().unwrap_or(""),
            );
        }
        out.push('\n');
        out
    }

    fn print_status(&self, status: &ComputationStatus) {
        println!("Status...");
        println!("Host: {} ({})", self.hostname, self.local_ip);
        println!("Port: {}", self.port);
        println!(
            "Checkpoint Interval: {}",
            match self.interval_mgr.interval_secs() {
                0 => "disabled (checkpoint manually instead)".to_owned(),
                secs => secs.to_string(),
            }
        );
        println!("Exit on last client: {}", self.flags.exit_on_last as u8);
        println!("Kill after checkpoint: {}", self.flags.kill_after_ckpt as u8);
        println!("Computation Id: {}", self.comp_id);
        println!("Checkpoint Dir: {}", self.ckpt_dir.display());
        println!("NUM_PEERS={}", status.num_peers);
        println!("RUNNING={}", if status.is_running() { "yes" } else { "no" });
    }

    // ------------------------------------------------------------------
    // Timers, shutdown, bookkeeping
    // ------------------------------------------------------------------

    /// Observe the timers; called on every event-loop wake including the
    /// one-second tick. Drains a queued periodic checkpoint.
    pub async fn tick(&mut self) -> LoopAction {
        let now = Instant::now();
        let status = self.status();

        if self.hard_timeout.expired(now) {
            info!("timeout reached; exiting");
            return self.quit().await;
        }
        if self.stale_mgr.observe(status.num_peers, now) {
            info!("no active job past the stale timeout; exiting");
            return self.quit().await;
        }
        if self.interval_mgr.observe(&status, now) {
            self.checkpoint_queued = true;
        }

        if self.checkpoint_queued {
            self.checkpoint_queued = false;
            self.start_checkpoint().await;
        }
        LoopAction::Continue
    }

    /// The `q` command: kill peers, snapshot the kv store, clean up.
    pub async fn quit(&mut self) -> LoopAction {
        self.broadcast(MessageKind::KillPeer, &[]).await;
        self.record_event("Exiting");
        self.serialize_kvdb();
        self.remove_stale_shared_area_file();
        if let Some(port_file) = &self.flags.port_file {
            trace!(path = %port_file.display(), "removing port file");
            let _ = std::fs::remove_file(port_file);
        }
        if let Some(status_file) = &self.status_file {
            status_file.append_termination("per request");
        }
        self.cancel.cancel();
        LoopAction::Exit(0)
    }

    fn serialize_kvdb(&mut self) {
        if !self.flags.write_kv_data {
            return;
        }
        let path = PathBuf::from(format!(
            "dmtcp_coordinator_db-{}-{}.json",
            self.comp_id,
            chrono::Utc::now().timestamp_millis()
        ));
        match self.lookup.serialize(&path) {
            Ok(()) => info!(path = %path.display(), "wrote coordinator key-value db"),
            Err(err) => warn!(%err, "failed to write key-value db"),
        }
    }

    async fn broadcast(&mut self, kind: MessageKind, payload: &[u8]) {
        let mut msg = Message::new(kind);
        msg.comp_group = self.comp_id;
        msg.num_peers = self.registry.num_workers() as u32;
        // From the coordinator's viewpoint we kill peers after the ckpt;
        // from the peer's viewpoint it exits after the ckpt.
        msg.exit_after_ckpt = u32::from(self.flags.kill_after_ckpt || self.kill_after_ckpt_once);

        if kind == MessageKind::KillPeer && self.registry.num_workers() > 0 {
            self.kill_in_progress = true;
        }

        trace!(%kind, "broadcasting message");
        for client in self.registry.iter_mut() {
            // Write failures surface as disconnects through the client's
            // reader task; do not unwind membership mid-broadcast.
            let _ = msg.write_to(&mut client.writer, payload).await;
        }
        self.barriers.reset_arrivals();
    }

    async fn send_to_client(&mut self, id: ClientId, msg: &Message, payload: &[u8]) {
        if let Some(client) = self.registry.get_mut(id) {
            let _ = msg.write_to(&mut client.writer, payload).await;
        }
    }

    /// Rewrite the status file body, if one was requested.
    pub fn update_status_file(&self) {
        let Some(status_file) = &self.status_file else {
            return;
        };
        let status = self.status();
        let snapshot = StatusSnapshot {
            host: self.hostname.clone(),
            ip: self.local_ip.to_string(),
            port: self.port,
            interval: self.interval_mgr.interval_secs(),
            exit_on_last: self.flags.exit_on_last,
            kill_after_ckpt: self.flags.kill_after_ckpt,
            computation_id: self.comp_id.to_string(),
            ckpt_dir: self.ckpt_dir.display().to_string(),
            num_peers: status.num_peers,
            running: status.is_running(),
        };
        if let Err(err) = status_file.update(&snapshot) {
            warn!(%err, "failed to update status file");
        }
    }

    /// Whether stdin should show an interactive prompt.
    #[must_use]
    pub fn interactive(&self) -> bool {
        !self.flags.daemon && self.flags.quiet == 0
    }
}

/// Reply fields for a command socket.
#[derive(Debug)]
struct CommandReply {
    status: CoordCmdStatus,
    num_peers: u32,
    is_running: bool,
    checkpoint_interval: i32,
    data: Vec<u8>,
}

impl Default for CommandReply {
    fn default() -> Self {
        Self {
            status: CoordCmdStatus::NoError,
            num_peers: 0,
            is_running: false,
            checkpoint_interval: SAME_CKPT_INTERVAL,
            data: Vec::new(),
        }
    }
}

async fn send_cmd_reply(stream: &mut TcpStream, reply: &CommandReply) {
    let mut msg = Message::new(MessageKind::UserCmdResult);
    msg.coord_cmd_status = reply.status as i32;
    msg.num_peers = reply.num_peers;
    msg.is_running = u32::from(reply.is_running);
    msg.checkpoint_interval = reply.checkpoint_interval;
    let _ = msg.write_to(stream, &reply.data).await;
}

/// Split the leading NUL-terminated string off a payload.
fn parse_cstr(payload: &[u8]) -> (String, &[u8]) {
    match payload.iter().position(|&b| b == 0) {
        Some(end) => (
            String::from_utf8_lossy(&payload[..end]).into_owned(),
            &payload[end + 1..],
        ),
        None => (String::from_utf8_lossy(payload).into_owned(), &[]),
    }
}

/// Hostname and program name from a hello payload.
fn parse_process_info(payload: &[u8]) -> (String, String) {
    let (hostname, rest) = parse_cstr(payload);
    let (progname, _) = parse_cstr(rest);
    (hostname, progname)
}

/// Nanoseconds on the monotonic clock; shared with workers through the
/// accept reply so both sides name the same shared-area file.
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cstr_splits_at_nul() {
        let (first, rest) = parse_cstr(b"hello\0world\0");
        assert_eq!(first, "hello");
        let (second, rest) = parse_cstr(rest);
        assert_eq!(second, "world");
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_cstr_without_terminator() {
        let (s, rest) = parse_cstr(b"dangling");
        assert_eq!(s, "dangling");
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_process_info_extracts_both_fields() {
        let (hostname, progname) = parse_process_info(b"hostA\0a.out\0");
        assert_eq!(hostname, "hostA");
        assert_eq!(progname, "a.out");
    }

    #[test]
    fn monotonic_ns_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
