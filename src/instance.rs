// This file is part of qnet-arbiter.

//! Instance orchestrator (component C10): owns the readiness loop, listener, client table
//! and cluster registry; runs startup/shutdown ordering through the readiness loop's pre-poll
//! hook chain instead of an outer driver loop.
//!
//! Admission, deferred disconnects, deferred-vote resolution and signal handling are each
//! registered as a pre-poll hook (`Readiness::add_pre_poll_hook`) rather than driven as plain
//! methods between `exec()` calls: the hook receives `&mut Readiness` so it can register or
//! remove entries itself (admitting newly accepted clients, tearing down disconnected ones)
//! without `Instance::run` needing to know any of that happens. `client_fds` and
//! `next_session_id` are `Rc`-wrapped for the same reason the client table already was: a hook
//! closure only ever captures `Rc` clones, never `&mut Instance`. Every socket handed to the
//! loop for readiness notification is a `try_clone()` of the one the client or listener
//! actually reads and writes through: the two file descriptors refer to the same kernel socket
//! and see the same readiness state, so neither side needs a pointer back into the other's
//! owner.

use crate::algorithm::{self, Algorithm};
use crate::client::{Client, TlsRequirement};
use crate::cluster::{ClusterRegistry, SessionId};
use crate::config::{Settings, TlsMode};
use crate::control::{self, StatusSnapshot};
use crate::error::ArbiterError;
use crate::listener::{self, AcceptOutcome};
use crate::lockfile::LockFile;
use crate::metrics;
use crate::readiness::{CallbackResult, FdEntryBuilder, PrePollOutcome, RawFdSource, Readiness, SetEventsOutcome};
use crate::signal::SelfPipe;
use crate::timer::TimerHeap;
use crate::tls;
use slog::{info, o, warn, Logger};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

type ClientHandle = Rc<RefCell<Client>>;
type SharedClusters = Rc<RefCell<ClusterRegistry>>;
type SharedClients = Rc<RefCell<HashMap<SessionId, ClientHandle>>>;
type SharedClientFds = Rc<RefCell<HashMap<SessionId, crate::readiness::FdHandle>>>;

/// Holds every algorithm instance, keyed by its advertised id; `on_node_list`/`on_ask_for_vote`
/// calls are routed to whichever one a client selected in INIT.
pub struct Algorithms {
    by_id: HashMap<u8, Box<dyn Algorithm>>,
}

impl Algorithms {
    fn new() -> Algorithms {
        let mut by_id: HashMap<u8, Box<dyn Algorithm>> = HashMap::new();
        for algo in algorithm::supported() {
            by_id.insert(algo.id(), algo);
        }
        Algorithms { by_id }
    }

    fn get(&mut self, id: u8) -> Option<&mut dyn Algorithm> {
        match self.by_id.get_mut(&id) {
            Some(algo) => Some(algo.as_mut()),
            None => None,
        }
    }
}

type SharedAlgorithms = Rc<RefCell<Algorithms>>;

struct InstanceClusterView {
    clusters: SharedClusters,
    clients: SharedClients,
}

impl algorithm::ClusterView for InstanceClusterView {
    fn configured_nodes(&self, cluster_name: &str) -> Vec<u32> {
        let clusters = self.clusters.borrow();
        let clients = self.clients.borrow();
        clusters
            .iter(cluster_name)
            .filter_map(|(_, session)| clients.get(&session))
            .flat_map(|client| client.borrow().configured_nodes.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn siblings(&self, cluster_name: &str, exclude: SessionId) -> Vec<(SessionId, u32, Vec<u32>)> {
        let clusters = self.clusters.borrow();
        let clients = self.clients.borrow();
        clusters
            .iter(cluster_name)
            .filter(|(_, session)| *session != exclude)
            .filter_map(|(node_id, session)| {
                clients
                    .get(&session)
                    .map(|client| (session, node_id, client.borrow().last_membership_nodes.clone()))
            })
            .collect()
    }
}

pub struct Instance {
    settings: Settings,
    logger: Logger,
    loop_: Readiness,
    timers: Rc<RefCell<TimerHeap>>,
    next_session_id: Rc<Cell<SessionId>>,
    clients: SharedClients,
    client_fds: SharedClientFds,
    clusters: SharedClusters,
    algorithms: SharedAlgorithms,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    pending_accepts: Rc<RefCell<Vec<(mio::tcp::TcpStream, String)>>>,
    _lock_file: Option<LockFile>,
    self_pipe: Rc<SelfPipe>,
    shutdown_requested: Rc<RefCell<bool>>,
    start_time: Instant,
}

impl Instance {
    pub fn start(settings: Settings, logger: Logger) -> Result<Instance, ArbiterError> {
        let lock_file = match LockFile::acquire(&settings.advanced.lock_file) {
            Ok(lock) => Some(lock),
            Err(crate::lockfile::LockError::AlreadyRunning) => {
                return Err(ArbiterError::InternalInvariant("another instance is already running".into()));
            }
            Err(crate::lockfile::LockError::Io(err)) => return Err(err.into()),
        };

        if let Some(metrics_cfg) = &settings.metrics {
            metrics::spawn(&metrics_cfg.addr, metrics_cfg.port, logger.new(o!("component" => "metrics")))?;
        }

        let self_pipe = Rc::new(SelfPipe::install()?);

        let tls_config = if settings.tls_mode == TlsMode::Off {
            None
        } else {
            Some(tls::build_server_config(
                &settings.advanced.cert_store_path,
                &settings.advanced.cert_nickname,
                settings.tls_client_cert_required,
            )?)
        };

        let loop_ = Readiness::new(1024)?;
        let timers = loop_.timers();

        let tcp_listener = listener::bind(
            settings.listen_addr.as_deref(),
            settings.listen_port,
            settings.address_family,
            settings.advanced.listen_backlog,
        )?;
        info!(logger, "listening"; "addr" => format!("{:?}", tcp_listener.local_addr()));

        let control_listener = control::bind(&settings.advanced.control_socket_path, settings.advanced.control_socket_backlog)?;

        let mut instance = Instance {
            settings,
            logger: logger.clone(),
            loop_,
            timers,
            next_session_id: Rc::new(Cell::new(1)),
            clients: Rc::new(RefCell::new(HashMap::new())),
            client_fds: Rc::new(RefCell::new(HashMap::new())),
            clusters: Rc::new(RefCell::new(ClusterRegistry::new())),
            algorithms: Rc::new(RefCell::new(Algorithms::new())),
            tls_config,
            pending_accepts: Rc::new(RefCell::new(Vec::new())),
            _lock_file: lock_file,
            self_pipe,
            shutdown_requested: Rc::new(RefCell::new(false)),
            start_time: Instant::now(),
        };

        instance.register_listener(tcp_listener)?;
        instance.register_control_socket(control_listener)?;
        instance.register_admit_hook();
        instance.register_disconnect_hook();
        instance.register_vote_resolution_hook();
        instance.register_signal_hook();
        Ok(instance)
    }

    fn register_listener(&mut self, tcp_listener: mio::tcp::TcpListener) -> std::io::Result<()> {
        let registration_copy = tcp_listener.try_clone()?;
        let pending = self.pending_accepts.clone();
        let max_clients = self.settings.max_clients;
        let clients = self.clients.clone();
        let logger = self.logger.new(o!("component" => "listener"));

        self.loop_.register(
            Box::new(registration_copy),
            mio::Ready::readable(),
            FdEntryBuilder::new().on_read(move || {
                loop {
                    let active = clients.borrow().len();
                    match listener::accept(&tcp_listener, active, max_clients) {
                        AcceptOutcome::Accepted { stream, peer_addr } => {
                            metrics::CONNECTIONS_ACCEPTED.inc();
                            pending.borrow_mut().push((stream, peer_addr));
                        }
                        AcceptOutcome::AdmissionDenied(_stream) => {
                            metrics::CONNECTIONS_REJECTED.inc();
                            warn!(logger, "admission cap reached, closing connection"; "error" => %ArbiterError::AdmissionDenied);
                        }
                        AcceptOutcome::WouldBlock => break,
                        AcceptOutcome::Io(err) => {
                            warn!(logger, "accept error"; "error" => %err);
                            break;
                        }
                    }
                }
                CallbackResult::Ok
            }),
        )?;
        Ok(())
    }

    fn register_control_socket(&mut self, control_listener: std::os::unix::net::UnixListener) -> std::io::Result<()> {
        let fd = control_listener.as_raw_fd();
        let shutdown = self.shutdown_requested.clone();
        let clients = self.clients.clone();
        let clusters = self.clusters.clone();
        let start_time = self.start_time;
        let logger = self.logger.new(o!("component" => "control"));

        self.loop_.register(
            Box::new(RawFdSource(fd)),
            mio::Ready::readable(),
            FdEntryBuilder::new().on_read(move || match control_listener.accept() {
                Ok((stream, _addr)) => {
                    let shutdown = shutdown.clone();
                    let clients = clients.clone();
                    let clusters = clusters.clone();
                    let result = control::handle_connection(
                        stream,
                        move || {
                            *shutdown.borrow_mut() = true;
                        },
                        move || StatusSnapshot {
                            active_clients: clients.borrow().len(),
                            active_clusters: clusters.borrow().cluster_count(),
                            uptime_secs: start_time.elapsed().as_secs(),
                        },
                    );
                    if let Err(err) = result {
                        warn!(logger, "control connection error"; "error" => %err);
                    }
                    CallbackResult::Ok
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => CallbackResult::Ok,
                Err(err) => {
                    warn!(logger, "control accept error"; "error" => %err);
                    CallbackResult::Ok
                }
            }),
        )?;
        Ok(())
    }

    /// Registers the pre-poll hook that turns queued accepted sockets into registered client
    /// sessions. Runs once per loop iteration, before `exec` polls, the same point the admit
    /// path ran at when it was a plain method called between `exec()`s — just now expressed as
    /// a hook stored inside the loop itself instead of a step `run()` remembers to call.
    fn register_admit_hook(&mut self) {
        let pending = self.pending_accepts.clone();
        let next_session_id = self.next_session_id.clone();
        let clients = self.clients.clone();
        let client_fds = self.client_fds.clone();
        let clusters = self.clusters.clone();
        let algorithms = self.algorithms.clone();
        let timers = self.timers.clone();
        let tls_mode = self.settings.tls_mode;
        let tls_config = self.tls_config.clone();
        let advanced = self.settings.advanced.clone();
        let logger = self.logger.clone();

        self.loop_.add_pre_poll_hook(move |readiness| {
            let accepted: Vec<_> = pending.borrow_mut().drain(..).collect();
            for (stream, peer_addr) in accepted {
                let id = next_session_id.get();
                next_session_id.set(id + 1);

                let registration_copy = match stream.try_clone() {
                    Ok(copy) => copy,
                    Err(err) => {
                        warn!(logger, "could not clone accepted socket"; "error" => %ArbiterError::from(err));
                        continue;
                    }
                };

                let client_logger = logger.new(o!("component" => "client", "peer" => peer_addr.clone()));
                let client = Client::new(
                    id,
                    stream,
                    peer_addr,
                    tls_requirement_from_mode(tls_mode),
                    tls_config.clone(),
                    advanced.max_client_receive_size,
                    advanced.max_client_send_buffers,
                    advanced.max_client_send_size,
                    advanced.heartbeat_interval_min,
                    advanced.heartbeat_interval_max,
                    advanced.dpd_interval_coefficient,
                    advanced.dpd_enabled,
                    client_logger,
                );
                let handle: ClientHandle = Rc::new(RefCell::new(client));
                clients.borrow_mut().insert(id, handle.clone());
                Client::install_dpd_timer(&handle, &mut timers.borrow_mut());

                match register_client_socket(readiness, registration_copy, handle, &clusters, &algorithms, &clients, &timers) {
                    Ok(fd_handle) => {
                        client_fds.borrow_mut().insert(id, fd_handle);
                    }
                    Err(err) => {
                        warn!(logger, "could not register client socket"; "error" => %ArbiterError::from(err));
                        clients.borrow_mut().remove(&id);
                    }
                }
            }
            PrePollOutcome::Continue
        });
    }

    /// Registers the pre-poll hook that walks all clients and disconnects those marked, the
    /// ordering the hook chain exists to guarantee: tearing a client down inline from its own
    /// read/write callback could leave a sibling's freshly enqueued vote without its WRITE bit
    /// set until the next iteration.
    fn register_disconnect_hook(&mut self) {
        let clients = self.clients.clone();
        let client_fds = self.client_fds.clone();
        let clusters = self.clusters.clone();
        let algorithms = self.algorithms.clone();
        let timers = self.timers.clone();

        self.loop_.add_pre_poll_hook(move |readiness| {
            let to_remove: Vec<SessionId> = clients
                .borrow()
                .iter()
                .filter(|(_, client)| client.borrow().pending_disconnect.is_some())
                .map(|(id, _)| *id)
                .collect();

            for id in to_remove {
                let removed = clients.borrow_mut().remove(&id);
                if let Some(client) = removed {
                    let mut client = client.borrow_mut();
                    if let Some(cluster_name) = client.cluster_name.clone() {
                        clusters.borrow_mut().remove(&cluster_name, id);
                        if let (Some(algo_id), Some(node_id)) = (client.algorithm_id, client.node_id) {
                            let ctx = crate::algorithm::SessionContext {
                                session: id,
                                cluster_name: &cluster_name,
                                node_id,
                                heuristics_failed: client.heuristics_failed,
                                tie_breaker: client.tie_breaker,
                            };
                            if let Some(algo) = algorithms.borrow_mut().get(algo_id) {
                                algo.disconnect(&ctx, false);
                            }
                        }
                    }
                    client.cancel_timers(&mut timers.borrow_mut());
                }
                if let Some(fd_handle) = client_fds.borrow_mut().remove(&id) {
                    let _ = readiness.remove(fd_handle);
                }
            }
            PrePollOutcome::Continue
        });
    }

    /// Registers the pre-poll hook that resolves deferred `WAIT_FOR_REPLY` votes once their
    /// bounded algorithm timer has fired.
    fn register_vote_resolution_hook(&mut self) {
        let clients = self.clients.clone();
        let algorithms = self.algorithms.clone();
        let timers = self.timers.clone();

        self.loop_.add_pre_poll_hook(move |_readiness| {
            let due: Vec<ClientHandle> = clients
                .borrow()
                .values()
                .filter(|client| client.borrow().pending_timer_fired)
                .cloned()
                .collect();

            for handle in due {
                let mut client = handle.borrow_mut();
                let algo_id = client.algorithm_id;
                let mut algorithms = algorithms.borrow_mut();
                let algo = algo_id.and_then(|id| algorithms.get(id)).map(|b| b.as_mut());
                client.resolve_pending_vote(algo);
                if client.take_needs_algorithm_timer() {
                    drop(client);
                    Client::install_algorithm_timer(&handle, &mut timers.borrow_mut());
                }
            }
            PrePollOutcome::Continue
        });
    }

    /// Registers the pre-poll hook that drains the self-pipe signal handling installs, marking
    /// the control socket closed (same outcome as the `shutdown` control verb) on SIGINT or
    /// SIGTERM.
    fn register_signal_hook(&mut self) {
        let shutdown = self.shutdown_requested.clone();
        let self_pipe = self.self_pipe.clone();

        self.loop_.add_pre_poll_hook(move |_readiness| {
            if self_pipe.drain() {
                *shutdown.borrow_mut() = true;
            }
            PrePollOutcome::Continue
        });
    }

    /// Runs the loop until shutdown is requested (via the control socket or a caught signal) or
    /// a fatal `exec` return code is seen.
    pub fn run(&mut self) -> i32 {
        loop {
            let code = self.loop_.exec();
            if code != crate::readiness::EXEC_OK {
                return code;
            }

            if *self.shutdown_requested.borrow() {
                return 0;
            }
        }
    }
}

fn register_client_socket(
    readiness: &mut Readiness,
    registration_copy: mio::tcp::TcpStream,
    handle: ClientHandle,
    clusters: &SharedClusters,
    algorithms: &SharedAlgorithms,
    clients: &SharedClients,
    timers: &Rc<RefCell<TimerHeap>>,
) -> std::io::Result<crate::readiness::FdHandle> {
    let set_events_handle = handle.clone();
    let read_handle = handle.clone();
    let write_handle = handle;
    let clusters = clusters.clone();
    let algorithms = algorithms.clone();
    let clients = clients.clone();
    let timers = timers.clone();

    readiness.register(
        Box::new(registration_copy),
        mio::Ready::readable(),
        FdEntryBuilder::new()
            .set_events(move |declared| SetEventsOutcome::Accept(declared | set_events_handle.borrow().event_set()))
            .on_read(move || {
                let view = InstanceClusterView {
                    clusters: clusters.clone(),
                    clients: clients.clone(),
                };
                let mut client = read_handle.borrow_mut();
                let algo_id = client.algorithm_id;
                {
                    let mut algorithms = algorithms.borrow_mut();
                    let algo = algo_id.and_then(|id| algorithms.get(id)).map(|b| b.as_mut());
                    let mut timers = timers.borrow_mut();
                    client.on_readable(algo, &view, &mut timers);
                }
                if let Some((cluster_name, node_id)) = client.take_cluster_join() {
                    if clusters.borrow_mut().add(&cluster_name, node_id, client.id).is_err() {
                        client.send_duplicate_node_id_error();
                    }
                }
                let needs_timer = client.take_needs_algorithm_timer();
                drop(client);
                if needs_timer {
                    Client::install_algorithm_timer(&read_handle, &mut timers.borrow_mut());
                }
                CallbackResult::Ok
            })
            .on_write(move || match write_handle.borrow_mut().on_writable() {
                Ok(()) => CallbackResult::Ok,
                Err(_) => {
                    write_handle.borrow_mut().schedule_disconnect(crate::client::DisconnectReason::IoError);
                    CallbackResult::Ok
                }
            }),
    )
}

fn tls_requirement_from_mode(mode: TlsMode) -> TlsRequirement {
    match mode {
        TlsMode::Off => TlsRequirement::Off,
        TlsMode::On => TlsRequirement::On,
        TlsMode::Required => TlsRequirement::Required,
    }
}
