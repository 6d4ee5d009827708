// This file is part of qnet-arbiter.

//! Per-connection client session (component C5): the protocol state machine, receive/send
//! plumbing, dead-peer timer, and membership/quorum bookkeeping for one connected cluster
//! node. The plain/TLS transport split and the `event_set` computation are generalized from
//! `examples/cloudflare-cfnts/src/nts_ke/server/connection.rs`'s `Connection` into one
//! `Transport` enum with a single `Read`/`Write` surface, per this project's "polymorphic over
//! {plain, TLS} I/O" design note.

use crate::algorithm::{Algorithm, ClusterView, NodeListKind as AlgoNodeListKind, SessionContext, TieBreaker, Vote};
use crate::cluster::SessionId;
use crate::codec::{options, Message, MessageType, ReadOutcome, ReceiveAssembler};
use crate::error::ArbiterError;
use crate::metrics;
use crate::send_queue::SendQueue;
use crate::timer::{TimerHandle, TimerHeap, TimerOutcome};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use mio::tcp::TcpStream;
use rustls::Session;
use slog::{debug, warn, Logger};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Bound on how long a `WAIT_FOR_REPLY` vote may stay deferred before the owning algorithm is
/// asked again via `on_timer`, per the "defer until all members have announced their config
/// list, subject to a bounded timer" resolution for FFSPLIT's not-yet-fully-configured case.
const ALGORITHM_TIMER_MS: u32 = 10_000;

/// Unifies a plain socket and a TLS-wrapped one behind ordinary `Read`/`Write`, the way
/// `Connection::do_tls_read`/`try_plain_read`/`tls_write` stitch `rustls::ServerSession`
/// together with the raw socket in the teacher, but collapsed into trait impls instead of
/// bespoke methods so the rest of this module never has to match on transport kind.
pub enum Transport {
    Plain(TcpStream),
    Tls(TcpStream, Box<rustls::ServerSession>),
}

impl Transport {
    pub fn event_set(&self) -> mio::Ready {
        match self {
            Transport::Plain(_) => mio::Ready::readable(),
            Transport::Tls(_, session) => {
                let rd = session.wants_read();
                let wr = session.wants_write();
                match (rd, wr) {
                    (true, true) => mio::Ready::readable() | mio::Ready::writable(),
                    (false, true) => mio::Ready::writable(),
                    _ => mio::Ready::readable(),
                }
            }
        }
    }

    pub fn start_tls(&mut self, session: rustls::ServerSession) {
        let socket = match self {
            Transport::Plain(socket) => socket.try_clone().expect("tcp stream clone for starttls upgrade"),
            Transport::Tls(..) => return,
        };
        *self = Transport::Tls(socket, Box::new(session));
    }

    pub fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(socket) => socket,
            Transport::Tls(socket, _) => socket,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.read(buf),
            Transport::Tls(socket, session) => {
                match session.read_tls(socket) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }
                session
                    .process_new_packets()
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                session.read(buf)
            }
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.write(buf),
            Transport::Tls(socket, session) => {
                let written = session.write(buf)?;
                session.write_tls(socket)?;
                Ok(written)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(socket) => socket.flush(),
            Transport::Tls(socket, session) => {
                session.write_tls(socket)?;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Accepted,
    PreinitReplied,
    WaitStartTls,
    TlsHandshake,
    WaitInit,
    Initialised,
    Running,
}

#[derive(Debug, Clone)]
pub enum DisconnectReason {
    ProtocolViolation(String),
    IoError,
    DpdTimeout,
    AdmissionDenied,
    ServerShutdown,
    Explicit,
}

pub enum TlsRequirement {
    Off,
    On,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingVoteKind {
    NodeList,
    AskForVote,
}

/// Per-connection session record. Owned by the instance's client table, referenced
/// elsewhere (timer closures, the cluster registry) only by `SessionId`/`Weak` handle so
/// ownership stays a tree rather than a cycle.
pub struct Client {
    pub id: SessionId,
    transport: Transport,
    pub peer_addr: String,
    pub state: ClientState,
    tls_requirement: TlsRequirement,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    receive: ReceiveAssembler,
    send_queue: SendQueue,
    heartbeat_ms: u32,
    heartbeat_min_ms: u32,
    heartbeat_max_ms: u32,
    dpd_coefficient: f64,
    dpd_enabled: bool,
    pub algorithm_id: Option<u8>,
    pub cluster_name: Option<String>,
    pub node_id: Option<u32>,
    pub last_ring_id: Option<u64>,
    pub configured_nodes: Vec<u32>,
    pub last_membership_nodes: Vec<u32>,
    pub last_quorum_nodes: Vec<u32>,
    pub heuristics_failed: bool,
    pub tie_breaker: TieBreaker,
    dpd_timer: Option<TimerHandle>,
    algorithm_timer: Option<TimerHandle>,
    pub pending_timer_fired: bool,
    pending_vote: Option<(PendingVoteKind, u64)>,
    needs_algorithm_timer: bool,
    pub pending_disconnect: Option<DisconnectReason>,
    pending_cluster_join: bool,
    logger: Logger,
}

impl Client {
    pub fn new(
        id: SessionId,
        socket: TcpStream,
        peer_addr: String,
        tls_requirement: TlsRequirement,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        max_receive: usize,
        max_send_buffers: usize,
        max_send_bytes: usize,
        heartbeat_min_ms: u32,
        heartbeat_max_ms: u32,
        dpd_coefficient: f64,
        dpd_enabled: bool,
        logger: Logger,
    ) -> Client {
        Client {
            id,
            transport: Transport::Plain(socket),
            peer_addr,
            state: ClientState::Accepted,
            tls_requirement,
            tls_config,
            receive: ReceiveAssembler::new(max_receive),
            send_queue: SendQueue::new(max_send_buffers, max_send_bytes),
            heartbeat_ms: heartbeat_min_ms,
            heartbeat_min_ms,
            heartbeat_max_ms,
            dpd_coefficient,
            dpd_enabled,
            algorithm_id: None,
            cluster_name: None,
            node_id: None,
            last_ring_id: None,
            configured_nodes: Vec::new(),
            last_membership_nodes: Vec::new(),
            last_quorum_nodes: Vec::new(),
            heuristics_failed: false,
            tie_breaker: TieBreaker::Lowest,
            dpd_timer: None,
            algorithm_timer: None,
            pending_timer_fired: false,
            pending_vote: None,
            needs_algorithm_timer: false,
            pending_disconnect: None,
            pending_cluster_join: false,
            logger,
        }
    }

    /// Drains the one-shot flag set after a successful INIT, so the instance can register
    /// this session in the cluster registry (which `Client` has no handle to) exactly once.
    pub fn take_cluster_join(&mut self) -> Option<(String, u32)> {
        if self.pending_cluster_join {
            self.pending_cluster_join = false;
            self.cluster_name.clone().zip(self.node_id)
        } else {
            None
        }
    }

    pub fn event_set(&self) -> mio::Ready {
        let base = self.transport.event_set();
        if !self.send_queue.is_empty() {
            base | mio::Ready::writable()
        } else {
            base
        }
    }

    pub fn schedule_disconnect(&mut self, reason: DisconnectReason) {
        if self.pending_disconnect.is_none() {
            self.pending_disconnect = Some(reason);
        }
    }

    /// Installs the dead-peer-detection timer. Any later valid inbound frame calls
    /// `reset_dpd_timer` to push the deadline back out; firing here only ever marks the
    /// client for deferred teardown, never tears it down inline (see the pre-poll hook
    /// ordering rationale in `instance.rs`).
    pub fn install_dpd_timer(self_handle: &Rc<RefCell<Client>>, timers: &mut TimerHeap) {
        let mut client = self_handle.borrow_mut();
        if !client.dpd_enabled {
            return;
        }
        let interval = dpd_interval_ms(client.heartbeat_ms, client.dpd_coefficient);
        let weak: Weak<RefCell<Client>> = Rc::downgrade(self_handle);
        let handle = timers.add(
            interval,
            Box::new(move || {
                if let Some(client) = weak.upgrade() {
                    metrics::DPD_TIMEOUTS.inc();
                    let mut client = client.borrow_mut();
                    debug!(client.logger, "dead-peer-detection timeout"; "peer" => &client.peer_addr, "error" => %ArbiterError::DpdTimeout);
                    client.schedule_disconnect(DisconnectReason::DpdTimeout);
                }
                TimerOutcome::Cancel
            }),
        );
        client.dpd_timer = handle;
    }

    pub fn reset_dpd_timer(&mut self, timers: &mut TimerHeap) {
        if let Some(handle) = self.dpd_timer {
            timers.reschedule(handle);
        }
    }

    /// Drains the one-shot flag set when a deferred vote needs its bounded algorithm timer
    /// armed, so the instance (which alone holds the `Rc<RefCell<Client>>` a timer callback
    /// needs to weakly reference) can call `install_algorithm_timer` exactly once per defer.
    pub fn take_needs_algorithm_timer(&mut self) -> bool {
        std::mem::replace(&mut self.needs_algorithm_timer, false)
    }

    /// Arms the bounded timer backing a deferred `WAIT_FOR_REPLY` vote. Mirrors
    /// `install_dpd_timer`'s shape: a `Weak` back into the owning `Rc` so the timer can outlive
    /// neither the session nor hold it alive past its natural removal.
    pub fn install_algorithm_timer(self_handle: &Rc<RefCell<Client>>, timers: &mut TimerHeap) {
        let mut client = self_handle.borrow_mut();
        if client.algorithm_timer.is_some() {
            return;
        }
        let weak: Weak<RefCell<Client>> = Rc::downgrade(self_handle);
        let handle = timers.add(
            ALGORITHM_TIMER_MS,
            Box::new(move || {
                if let Some(client) = weak.upgrade() {
                    client.borrow_mut().pending_timer_fired = true;
                }
                TimerOutcome::Cancel
            }),
        );
        client.algorithm_timer = handle;
    }

    /// Called from the instance's pre-poll hook once `pending_timer_fired` is observed:
    /// resolves a deferred vote by asking the algorithm again and delivering whatever it now
    /// returns, the "loop-provided `send_vote`" the algorithm's `WAIT_FOR_REPLY` contract
    /// requires.
    pub fn resolve_pending_vote(&mut self, algorithm: Option<&mut dyn Algorithm>) {
        self.pending_timer_fired = false;
        self.algorithm_timer = None;
        let (kind, _ring_id) = match self.pending_vote.take() {
            Some(pending) => pending,
            None => return,
        };

        let vote = match algorithm {
            Some(algo) => algo.on_timer(&self.session_context()),
            None => Vote::Nack,
        };
        count_vote(vote);

        let reply = match kind {
            PendingVoteKind::NodeList => Message::new(MessageType::NodeListReply).with_option(options::VOTE, vec![vote_wire(vote)]),
            PendingVoteKind::AskForVote => Message::new(MessageType::AskForVoteReply).with_option(options::VOTE, vec![vote_wire(vote)]),
        };
        self.enqueue(&reply);
    }

    fn recompute_dpd_interval(&mut self, timers: &mut TimerHeap) {
        if let Some(handle) = self.dpd_timer {
            let interval = dpd_interval_ms(self.heartbeat_ms, self.dpd_coefficient);
            timers.set_interval(handle, interval);
        }
    }

    pub fn cancel_timers(&mut self, timers: &mut TimerHeap) {
        if let Some(handle) = self.dpd_timer.take() {
            timers.delete(handle);
        }
        if let Some(handle) = self.algorithm_timer.take() {
            timers.delete(handle);
        }
    }

    fn enqueue(&mut self, message: &Message) {
        if self.send_queue.push_message(message).is_err() {
            let error = ArbiterError::ResourceExhausted("send queue full".into());
            warn!(self.logger, "dropping client"; "peer" => &self.peer_addr, "error" => %error);
            self.schedule_disconnect(DisconnectReason::IoError);
        }
    }

    fn send_error(&mut self, reason: &str) {
        let msg = Message::new(MessageType::ServerError).with_option(options::REASON, reason.as_bytes().to_vec());
        self.enqueue(&msg);
    }

    /// Sent by the instance when cluster registration discovers another session already
    /// holds this node id in the same cluster; `Client` itself has no handle to the registry
    /// to detect this earlier.
    pub fn send_duplicate_node_id_error(&mut self) {
        self.send_error("DUPLICATE_NODE_ID");
        self.schedule_disconnect(DisconnectReason::ProtocolViolation("duplicate node id in cluster".into()));
    }

    /// Drains readable bytes into complete frames and dispatches each one. Returns once the
    /// socket would block or a fatal condition is hit; never blocks itself.
    pub fn on_readable(&mut self, algorithm: Option<&mut dyn Algorithm>, view: &dyn ClusterView, timers: &mut TimerHeap) {
        fn reborrow<'a>(
            algorithm: &'a mut Option<&mut dyn Algorithm>,
        ) -> Option<&'a mut dyn Algorithm> {
            match algorithm {
                Some(algorithm) => Some(&mut **algorithm),
                None => None,
            }
        }
        let mut algorithm = algorithm;
        loop {
            if self.state == ClientState::TlsHandshake {
                // Drive the handshake by touching the transport; a real frame can't start
                // until it completes.
                let mut scratch = [0u8; 0];
                let _ = self.transport.read(&mut scratch);
                if self.tls_handshake_complete() {
                    self.state = ClientState::WaitInit;
                } else {
                    return;
                }
            }
            let outcome = self.receive.read_from(&mut self.transport);
            match outcome {
                ReadOutcome::Partial => return,
                ReadOutcome::Eof => {
                    self.schedule_disconnect(DisconnectReason::IoError);
                    return;
                }
                ReadOutcome::Io(err) => {
                    debug!(self.logger, "read error"; "peer" => &self.peer_addr, "error" => %ArbiterError::from(err));
                    self.schedule_disconnect(DisconnectReason::IoError);
                    return;
                }
                ReadOutcome::BufAllocFail | ReadOutcome::BodyAllocFail => {
                    metrics::MESSAGES_SKIPPED.inc();
                    let error = ArbiterError::ResourceExhausted("receive buffer allocation failed".into());
                    debug!(self.logger, "dropping frame"; "peer" => &self.peer_addr, "error" => %error);
                    self.send_error("RESOURCE_EXHAUSTED");
                    self.receive.reset();
                }
                ReadOutcome::Oversize => {
                    metrics::MESSAGES_SKIPPED.inc();
                    let error = ArbiterError::OversizeMessage(self.receive.max_len());
                    debug!(self.logger, "dropping frame"; "peer" => &self.peer_addr, "error" => %error);
                    self.send_error("MESSAGE_TOO_LONG");
                    self.receive.reset();
                }
                ReadOutcome::UnsupportedType => {
                    metrics::MESSAGES_SKIPPED.inc();
                    let error = ArbiterError::ProtocolViolation("unsupported message type".into());
                    debug!(self.logger, "dropping frame"; "peer" => &self.peer_addr, "error" => %error);
                    self.send_error("UNSUPPORTED_MESSAGE_TYPE");
                    self.receive.reset();
                }
                ReadOutcome::Complete { message, skipped } => {
                    self.receive.reset();
                    if !skipped {
                        metrics::MESSAGES_RECEIVED.inc();
                        self.reset_dpd_timer(timers);
                        self.dispatch(message, reborrow(&mut algorithm), view, timers);
                    } else {
                        metrics::MESSAGES_SKIPPED.inc();
                    }
                }
            }
            if self.pending_disconnect.is_some() {
                return;
            }
        }
    }

    pub fn on_writable(&mut self) -> io::Result<()> {
        self.send_queue.flush(&mut self.transport)?;
        // For `Transport::Tls` this also pushes out any handshake flight rustls has queued
        // even when the application send queue is empty; for `Transport::Plain` it's a no-op
        // socket flush.
        self.transport.flush()
    }

    fn dispatch(
        &mut self,
        message: Message,
        algorithm: Option<&mut dyn Algorithm>,
        view: &dyn ClusterView,
        timers: &mut TimerHeap,
    ) {
        match (self.state, message.msg_type) {
            (ClientState::Accepted, MessageType::Preinit) => self.handle_preinit(),
            (ClientState::WaitStartTls, MessageType::StartTls) => self.handle_starttls(),
            (ClientState::WaitInit, MessageType::Init) => self.handle_init(&message),
            (ClientState::Running, MessageType::EchoRequest) => self.handle_echo(&message),
            (ClientState::Running, MessageType::NodeList) => self.handle_node_list(&message, algorithm, view),
            (ClientState::Running, MessageType::AskForVote) => self.handle_ask_for_vote(&message, algorithm, view),
            (ClientState::Running, MessageType::VoteInfoReply) => {
                if let Some(algo) = algorithm {
                    algo.on_vote_info_reply(&self.session_context());
                }
            }
            (ClientState::Running, MessageType::HeuristicsChange) => self.handle_heuristics_change(&message, algorithm),
            (ClientState::Running, MessageType::SetOption) => self.handle_set_option(&message, timers),
            (_, _) => {
                self.send_error("UNEXPECTED_MESSAGE");
                self.schedule_disconnect(DisconnectReason::ProtocolViolation("unexpected message for state".into()));
            }
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            session: self.id,
            cluster_name: self.cluster_name.as_deref().unwrap_or(""),
            node_id: self.node_id.unwrap_or(0),
            heuristics_failed: self.heuristics_failed,
            tie_breaker: self.tie_breaker,
        }
    }

    fn handle_preinit(&mut self) {
        let reply = Message::new(MessageType::PreinitReply)
            .with_option(options::SUPPORTED_ALGORITHMS, crate::algorithm::SUPPORTED_IDS.to_vec());
        self.enqueue(&reply);
        self.state = match self.tls_requirement {
            TlsRequirement::Off => ClientState::WaitInit,
            TlsRequirement::On | TlsRequirement::Required => ClientState::WaitStartTls,
        };
    }

    fn handle_starttls(&mut self) {
        match &self.tls_config {
            Some(config) => {
                let session = rustls::ServerSession::new(config);
                self.transport.start_tls(session);
                // The handshake itself is now driven by `Transport::Tls`'s `Read`/`Write`
                // impls on the next pass through `on_readable`'s loop; `tls_handshake_complete`
                // reports done once `rustls::ServerSession::is_handshaking()` flips.
                self.state = ClientState::TlsHandshake;
            }
            None => {
                self.send_error("TLS_NOT_CONFIGURED");
                self.schedule_disconnect(DisconnectReason::ProtocolViolation("STARTTLS requested with no TLS config loaded".into()));
            }
        }
    }

    fn tls_handshake_complete(&self) -> bool {
        match &self.transport {
            Transport::Plain(_) => true,
            Transport::Tls(_, session) => !session.is_handshaking(),
        }
    }

    fn handle_init(&mut self, message: &Message) {
        let algorithm_id = message.option(options::ALGORITHM).and_then(|b| b.first().copied());
        let cluster_name = message
            .option(options::CLUSTER_NAME)
            .map(|b| String::from_utf8_lossy(b).into_owned());
        let node_id = message.option(options::NODE_ID).map(|b| BigEndian::read_u32(b));
        let heartbeat = message.option(options::HEARTBEAT_INTERVAL_MS).map(|b| BigEndian::read_u32(b));

        match (algorithm_id, cluster_name, node_id) {
            (Some(algorithm_id), Some(cluster_name), Some(node_id)) => {
                self.algorithm_id = Some(algorithm_id);
                self.cluster_name = Some(cluster_name);
                self.node_id = Some(node_id);
                if let Some(hb) = heartbeat {
                    self.heartbeat_ms = hb.max(self.heartbeat_min_ms).min(self.heartbeat_max_ms);
                }
                self.state = ClientState::Initialised;
                self.pending_cluster_join = true;
                let reply = Message::new(MessageType::InitReply).with_option(options::VOTE, vec![vote_wire(Vote::Ack)]);
                self.enqueue(&reply);
                self.state = ClientState::Running;
            }
            _ => {
                self.send_error("MALFORMED_INIT");
                self.schedule_disconnect(DisconnectReason::ProtocolViolation("malformed INIT".into()));
            }
        }
    }

    fn handle_echo(&mut self, message: &Message) {
        let mut reply = Message::new(MessageType::EchoReply);
        if let Some(cookie) = message.option(options::COOKIE) {
            reply = reply.with_option(options::COOKIE, cookie.to_vec());
        }
        self.enqueue(&reply);
    }

    fn handle_node_list(&mut self, message: &Message, algorithm: Option<&mut dyn Algorithm>, view: &dyn ClusterView) {
        let kind = message.option(options::NODE_LIST_KIND).and_then(|b| b.first().copied()).map(decode_kind);
        let ring_id = message.option(options::RING_ID).map(|b| BigEndian::read_u64(b)).unwrap_or(0);
        let nodes = message
            .option(options::NODES)
            .map(|b| b.chunks(4).map(BigEndian::read_u32).collect::<Vec<u32>>())
            .unwrap_or_default();

        let kind = match kind {
            Some(kind) => kind,
            None => {
                self.send_error("MALFORMED_NODE_LIST");
                return;
            }
        };

        match kind {
            AlgoNodeListKind::Config => self.configured_nodes = nodes.clone(),
            AlgoNodeListKind::Membership => self.last_membership_nodes = nodes.clone(),
            AlgoNodeListKind::Quorum => self.last_quorum_nodes = nodes.clone(),
            AlgoNodeListKind::Initial => {}
        }
        self.last_ring_id = Some(ring_id);

        let vote = match algorithm {
            Some(algo) => algo.on_node_list(&self.session_context(), kind, ring_id, &nodes, view),
            None => Vote::Nack,
        };
        self.reply_or_defer(PendingVoteKind::NodeList, ring_id, vote, |vote| {
            Message::new(MessageType::NodeListReply).with_option(options::VOTE, vec![vote_wire(vote)])
        });
    }

    fn handle_ask_for_vote(&mut self, message: &Message, algorithm: Option<&mut dyn Algorithm>, view: &dyn ClusterView) {
        let ring_id = message.option(options::RING_ID).map(|b| BigEndian::read_u64(b)).unwrap_or(0);
        let vote = match algorithm {
            Some(algo) => algo.on_ask_for_vote(&self.session_context(), ring_id, view),
            None => Vote::Nack,
        };
        self.reply_or_defer(PendingVoteKind::AskForVote, ring_id, vote, |vote| {
            Message::new(MessageType::AskForVoteReply).with_option(options::VOTE, vec![vote_wire(vote)])
        });
    }

    /// Either enqueues the reply immediately (`Ack`/`Nack`) or, on `WaitForReply`, captures a
    /// pending-vote slot and asks the instance to arm the bounded algorithm timer that later
    /// resolves it — see `resolve_pending_vote`.
    fn reply_or_defer(&mut self, kind: PendingVoteKind, ring_id: u64, vote: Vote, build_reply: impl FnOnce(Vote) -> Message) {
        if vote == Vote::WaitForReply {
            self.pending_vote = Some((kind, ring_id));
            if self.algorithm_timer.is_none() {
                self.needs_algorithm_timer = true;
            }
            return;
        }
        count_vote(vote);
        self.enqueue(&build_reply(vote));
    }

    fn handle_heuristics_change(&mut self, message: &Message, algorithm: Option<&mut dyn Algorithm>) {
        let failed = message.option(options::HEURISTICS_RESULT).and_then(|b| b.first().copied()).map(|b| b != 0).unwrap_or(false);
        self.heuristics_failed = failed;
        let vote = match algorithm {
            Some(algo) => algo.on_heuristics_change(&self.session_context(), failed),
            None => Vote::Nack,
        };
        count_vote(vote);
        let reply = Message::new(MessageType::HeuristicsChangeReply).with_option(options::VOTE, vec![vote_wire(vote)]);
        self.enqueue(&reply);
    }

    fn handle_set_option(&mut self, message: &Message, timers: &mut TimerHeap) {
        if let Some(hb) = message.option(options::HEARTBEAT_INTERVAL_MS).map(|b| BigEndian::read_u32(b)) {
            self.heartbeat_ms = hb.max(self.heartbeat_min_ms).min(self.heartbeat_max_ms);
            self.recompute_dpd_interval(timers);
        }
        let mut reply = Message::new(MessageType::SetOptionReply);
        let mut hb_bytes = Vec::new();
        hb_bytes.write_u32::<BigEndian>(self.heartbeat_ms).unwrap();
        reply = reply.with_option(options::HEARTBEAT_INTERVAL_MS, hb_bytes);
        self.enqueue(&reply);
    }
}

fn count_vote(vote: Vote) {
    match vote {
        Vote::Ack => metrics::VOTES_ACK.inc(),
        Vote::Nack => metrics::VOTES_NACK.inc(),
        Vote::WaitForReply => {}
    }
}

fn vote_wire(vote: Vote) -> u8 {
    match vote {
        Vote::Ack => 0,
        Vote::Nack => 1,
        Vote::WaitForReply => 2,
    }
}

fn decode_kind(raw: u8) -> AlgoNodeListKind {
    match raw {
        0 => AlgoNodeListKind::Membership,
        1 => AlgoNodeListKind::Quorum,
        2 => AlgoNodeListKind::Config,
        _ => AlgoNodeListKind::Initial,
    }
}

/// `dpd_coefficient x heartbeat`, clamped into the timer heap's schedulable range.
fn dpd_interval_ms(heartbeat_ms: u32, dpd_coefficient: f64) -> u32 {
    let computed = (f64::from(heartbeat_ms) * dpd_coefficient) as u32;
    computed.max(1).min(crate::timer::MAX_INTERVAL_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpd_interval_scales_with_heartbeat() {
        assert_eq!(dpd_interval_ms(1000, 3.0), 3000);
    }

    #[test]
    fn dpd_interval_is_clamped_to_schedulable_range() {
        assert!(dpd_interval_ms(u32::max_value(), 10.0) <= crate::timer::MAX_INTERVAL_MS);
    }
}
