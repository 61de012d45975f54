use bytes::Bytes;

use futures::{
    future::{self, Either, Loop},
    prelude::*,
    sync::{mpsc, oneshot},
    Future,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio_executor;
use tokio_timer::{timeout, Delay, Interval, Timeout};

use auth::Authenticator;
use error::NatsError;
use net::{NatsClientTlsConfig, NatsConnection};
use pool::{ServerAddr, ServerPool};
use protocol::headers::HeaderMap;
use protocol::{check_subject, check_subscribe_subject, commands::*, Op};

use super::registry::{Dispatch, SubscriptionRegistry, SubscriptionStream};
use super::mux::{reply_to_result, RequestMultiplexer};
use super::sender::{Enqueue, NatsClientSender, OutboundQueue, WriterTask};
use super::status::{StatusBus, StatusEvent, StatusStream};
use super::NatsStream;

type BoxFuture<T> = Box<dyn Future<Item = T, Error = NatsError> + Send>;

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
    Draining,
    Closed,
}

/// Options that are to be given to the client for initialization
#[derive(Clone, Builder)]
#[builder(setter(into))]
pub struct NatsClientOptions {
    /// Seed servers, tried in order until one accepts the connection.
    #[builder(default = "vec![\"nats://127.0.0.1:4222\".to_string()]")]
    pub servers: Vec<String>,
    /// Client identification forwarded in `CONNECT`.
    #[builder(default)]
    pub name: Option<String>,
    /// Turns on +OK protocol acknowledgements.
    #[builder(default)]
    pub verbose: bool,
    /// Turns on additional strict format checking on the server side.
    #[builder(default)]
    pub pedantic: bool,
    /// Suppresses reflection of our own publishes back to us.
    #[builder(default)]
    pub no_echo: bool,
    /// Connection username; installs password authentication with `pass`.
    #[builder(default)]
    pub user: Option<String>,
    /// Connection password.
    #[builder(default)]
    pub pass: Option<String>,
    /// Authorization token; ignored when `user` or `authenticator` is set.
    #[builder(default)]
    pub token: Option<String>,
    /// Custom authenticator capability, wins over `user`/`token`.
    #[builder(default)]
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Requires server header support; connecting fails fast without it.
    #[builder(default)]
    pub headers: bool,
    /// Keeps the server pool in seed order instead of shuffling
    /// discovered entries in.
    #[builder(default)]
    pub no_randomize: bool,
    /// Automatic reconnection on connection loss.
    #[builder(default = "true")]
    pub reconnect: bool,
    /// Proactively move to another pool member when the server announces
    /// lame-duck mode, instead of waiting for the eviction.
    #[builder(default)]
    pub reconnect_on_lame_duck: bool,
    /// Total reconnect attempts before giving up; -1 for unlimited.
    #[builder(default = "10")]
    pub max_reconnect_attempts: i64,
    /// Reconnect attempts per pool entry; 0 for unlimited.
    #[builder(default = "0")]
    pub max_reconnects_per_server: u32,
    /// Base wait between reconnect attempts, jittered by ±50%.
    #[builder(default = "Duration::from_millis(2000)")]
    pub reconnect_time_wait: Duration,
    /// Heartbeat cadence.
    #[builder(default = "Duration::from_secs(120)")]
    pub ping_interval: Duration,
    /// Unanswered heartbeats tolerated before the connection is declared
    /// dead.
    #[builder(default = "2")]
    pub max_pings_out: u32,
    /// Deadline for establishing the transport and finishing the
    /// handshake.
    #[builder(default = "Duration::from_secs(5)")]
    pub timeout: Duration,
    /// Upgrades the transport to TLS after `INFO`.
    #[builder(default)]
    pub tls: bool,
    /// Identity and roots for the TLS upgrade.
    #[builder(default)]
    pub tls_config: NatsClientTlsConfig,
    /// Per-subscription delivery buffer, in messages.
    #[builder(default = "512")]
    pub subscription_capacity: usize,
    /// Outbound queue bound while connected, in bytes; beyond it
    /// publishers get `SlowConsumer`.
    #[builder(default = "8 * 1024 * 1024")]
    pub high_water: usize,
    /// Outbound queue bound while reconnecting, in bytes; frames beyond
    /// it are dropped and reported on the status bus.
    #[builder(default = "2 * 1024 * 1024")]
    pub replay_buffer: usize,
}

impl NatsClientOptions {
    pub fn builder() -> NatsClientOptionsBuilder {
        NatsClientOptionsBuilder::default()
    }
}

impl Default for NatsClientOptions {
    fn default() -> Self {
        // This unwrap is safe because every field carries a default
        NatsClientOptionsBuilder::default().build().unwrap()
    }
}

impl fmt::Debug for NatsClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NatsClientOptions")
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("headers", &self.headers)
            .field("reconnect", &self.reconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_time_wait", &self.reconnect_time_wait)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("timeout", &self.timeout)
            .field("tls", &self.tls)
            .field("has_authenticator", &self.authenticator.is_some())
            .finish()
    }
}

/// Per-subscription knobs beyond the wire command itself.
#[derive(Debug, Clone, Default, Builder)]
#[builder(setter(into), default)]
pub struct SubscribeOptions {
    /// Auto-unsubscribe after this many deliveries.
    pub max: Option<u64>,
    /// Inactivity deadline: fires a `Timeout` error into the stream if
    /// nothing arrives in time.
    pub timeout: Option<Duration>,
}

impl SubscribeOptions {
    pub fn builder() -> SubscribeOptionsBuilder {
        SubscribeOptionsBuilder::default()
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), default)]
pub struct RequestOptions {
    /// Deadline for the reply.
    #[builder(default = "Duration::from_millis(1000)")]
    pub timeout: Duration,
    /// Headers to attach to the request.
    pub headers: Option<HeaderMap>,
    /// Uses a disposable single-shot subscription instead of the muxed
    /// inbox, for responders that stream multiple replies.
    pub no_mux: bool,
}

impl RequestOptions {
    pub fn builder() -> RequestOptionsBuilder {
        RequestOptionsBuilder::default()
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            timeout: Duration::from_millis(1000),
            headers: None,
            no_mux: false,
        }
    }
}

/// The NATS client: a handle over one connection's protocol machinery.
/// Cloning is shallow; all clones share the connection.
#[derive(Debug, Clone)]
pub struct NatsClient {
    inner: Arc<NatsClientInner>,
}

pub(crate) struct NatsClientInner {
    opts: NatsClientOptions,
    state: RwLock<ConnectionState>,
    /// Bumped on every successful (re)connect; stamped on subscription
    /// records so stale references from older sockets are ignorable.
    generation: AtomicUsize,
    pool: Mutex<ServerPool>,
    sender: NatsClientSender,
    registry: SubscriptionRegistry,
    mux: RequestMultiplexer,
    mux_sid: Mutex<Option<u64>>,
    status: StatusBus,
    server_info: RwLock<Option<ServerInfo>>,
    current_server: RwLock<Option<ServerAddr>>,
    pings_out: AtomicUsize,
    /// Serializes wire-state changes (SUB/UNSUB/PING enqueueing) against
    /// reconnect replay, so a subscription is neither lost nor doubled
    /// across a generation change.
    wire_lock: Mutex<()>,
    fault_tx: mpsc::UnboundedSender<NatsError>,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<NatsError>>>,
    /// Dropping these retires the reader/writer/heartbeat tasks of the
    /// current generation.
    task_stops: Mutex<Vec<oneshot::Sender<()>>>,
    closed_tx: Mutex<Option<oneshot::Sender<Option<NatsError>>>>,
    closed_rx: future::Shared<oneshot::Receiver<Option<NatsError>>>,
}

impl fmt::Debug for NatsClientInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NatsClientInner")
            .field("opts", &self.opts)
            .field("state", &*self.state.read())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl NatsClient {
    /// Builds a client from options without touching the network.
    pub fn from_options(
        opts: NatsClientOptions,
    ) -> impl Future<Item = Self, Error = NatsError> + Send {
        future::result(NatsClient::try_new(opts))
    }

    fn try_new(opts: NatsClientOptions) -> Result<Self, NatsError> {
        let pool = ServerPool::new(
            &opts.servers,
            !opts.no_randomize,
            opts.max_reconnect_attempts,
            opts.max_reconnects_per_server,
            opts.reconnect_time_wait,
        )?;

        let queue = OutboundQueue::new(opts.high_water, opts.replay_buffer);
        let (fault_tx, fault_rx) = mpsc::unbounded();
        let (closed_tx, closed_rx) = oneshot::channel();

        let inner = Arc::new(NatsClientInner {
            sender: NatsClientSender::new(queue),
            registry: SubscriptionRegistry::new(opts.subscription_capacity),
            mux: RequestMultiplexer::new(),
            mux_sid: Mutex::new(None),
            status: StatusBus::new(),
            state: RwLock::new(ConnectionState::Connecting),
            generation: AtomicUsize::new(0),
            pool: Mutex::new(pool),
            server_info: RwLock::new(None),
            current_server: RwLock::new(None),
            pings_out: AtomicUsize::new(0),
            wire_lock: Mutex::new(()),
            fault_tx,
            fault_rx: Mutex::new(Some(fault_rx)),
            task_stops: Mutex::new(Vec::new()),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx: closed_rx.shared(),
            opts,
        });

        Ok(NatsClient { inner })
    }

    /// Establishes the first connection: server pool iteration, `INFO`
    /// validation, authentication, subscription replay machinery.
    pub fn connect(self) -> impl Future<Item = Self, Error = NatsError> + Send {
        let inner = Arc::clone(&self.inner);
        NatsClientInner::spawn_fault_supervisor(&inner);
        NatsClientInner::initial_connect(inner).map(move |_| self)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// The most recent `INFO` from the server.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.read().clone()
    }

    /// A fresh consumer of lifecycle events. Only events published after
    /// this call are seen; a slow consumer loses oldest events first.
    pub fn status(&self) -> StatusStream {
        self.inner.status.subscribe(64)
    }

    /// Send a PUB command to the server. Enqueues and returns; ordering
    /// across calls from one thread is preserved on the wire.
    pub fn publish(&self, cmd: PubCommand) -> impl Future<Item = (), Error = NatsError> + Send {
        future::result(self.inner.enqueue_publish(cmd))
    }

    /// Send a SUB command and register the subscription, returning the
    /// stream of its messages.
    pub fn subscribe(
        &self,
        cmd: SubCommand,
    ) -> impl Future<Item = SubscriptionStream, Error = NatsError> + Send {
        self.subscribe_with(cmd, SubscribeOptions::default())
    }

    /// `subscribe` with an auto-unsubscribe cap and/or inactivity
    /// deadline.
    pub fn subscribe_with(
        &self,
        cmd: SubCommand,
        opts: SubscribeOptions,
    ) -> impl Future<Item = SubscriptionStream, Error = NatsError> + Send {
        future::result(NatsClientInner::enqueue_subscribe(&self.inner, cmd, opts))
    }

    /// Send a UNSUB command; with `max_msgs` the subscription survives
    /// for that many more deliveries.
    pub fn unsubscribe(&self, cmd: UnsubCommand) -> impl Future<Item = (), Error = NatsError> + Send {
        future::result(self.inner.enqueue_unsubscribe(cmd))
    }

    /// Orderly per-subscription shutdown: tells the server to stop, then
    /// delivers whatever was already in flight before closing the stream.
    pub fn drain_subscription(&self, sid: u64) -> impl Future<Item = (), Error = NatsError> + Send {
        let inner = Arc::clone(&self.inner);
        let pre = inner.check_live().and_then(|_| {
            let _wire = inner.wire_lock.lock();
            inner.registry.mark_draining(sid);
            if *inner.state.read() == ConnectionState::Connected {
                inner
                    .sender
                    .send(Op::UNSUB(UnsubCommand { sid, max_msgs: None }))?;
            }
            Ok(())
        });

        future::result(pre).and_then(move |_| {
            let flush = inner.do_flush();
            flush.then(move |res| {
                inner.registry.remove(sid);
                future::result(res)
            })
        })
    }

    /// Resolves once every frame enqueued before this call has been
    /// handed to the transport and the server answered our PING.
    pub fn flush(&self) -> impl Future<Item = (), Error = NatsError> + Send {
        let pre: Result<(), NatsError> = match *self.inner.state.read() {
            ConnectionState::Closed => Err(NatsError::ConnectionClosed),
            _ => Ok(()),
        };

        let inner = Arc::clone(&self.inner);
        future::result(pre).and_then(move |_| inner.do_flush())
    }

    /// Request/reply over the shared mux inbox.
    pub fn request(
        &self,
        subject: String,
        payload: Bytes,
    ) -> impl Future<Item = Message, Error = NatsError> + Send {
        self.request_with(subject, payload, RequestOptions::default())
    }

    /// `request` with an explicit deadline, headers, or a disposable
    /// reply subscription.
    pub fn request_with(
        &self,
        subject: String,
        payload: Bytes,
        opts: RequestOptions,
    ) -> impl Future<Item = Message, Error = NatsError> + Send {
        if opts.no_mux {
            Either::A(self.request_no_mux(subject, payload, opts))
        } else {
            Either::B(self.request_muxed(subject, payload, opts))
        }
    }

    fn request_muxed(
        &self,
        subject: String,
        payload: Bytes,
        opts: RequestOptions,
    ) -> impl Future<Item = Message, Error = NatsError> + Send {
        let deadline = opts.timeout;
        let pre = NatsClientInner::begin_muxed_request(&self.inner, subject, payload, opts.headers);

        let inner = Arc::clone(&self.inner);
        future::result(pre).and_then(move |(token, rx)| {
            let reply = rx
                .map_err(|_| NatsError::ConnectionClosed)
                .and_then(future::result);

            Timeout::new(reply, deadline).map_err(move |e| {
                if e.is_elapsed() {
                    inner.mux.cancel(&token);
                    NatsError::Timeout
                } else {
                    flatten_timeout(e)
                }
            })
        })
    }

    fn request_no_mux(
        &self,
        subject: String,
        payload: Bytes,
        opts: RequestOptions,
    ) -> impl Future<Item = Message, Error = NatsError> + Send {
        let deadline = opts.timeout;
        let pre = NatsClientInner::begin_request_no_mux(&self.inner, subject, payload, opts.headers);

        let inner = Arc::clone(&self.inner);
        future::result(pre).and_then(move |(sid, stream)| {
            let reply = stream
                .into_future()
                .map_err(|(e, _)| e)
                .and_then(|(maybe_msg, _)| match maybe_msg {
                    Some(msg) => future::result(reply_to_result(msg)),
                    None => future::err(NatsError::ConnectionClosed),
                });

            Timeout::new(reply, deadline).map_err(move |e| {
                if e.is_elapsed() {
                    inner.registry.remove(sid);
                    NatsError::Timeout
                } else {
                    flatten_timeout(e)
                }
            })
        })
    }

    /// Orderly connection shutdown: refuse new work, unsubscribe
    /// everything, flush, deliver what is in flight, then close.
    pub fn drain(&self) -> impl Future<Item = (), Error = NatsError> + Send {
        let pre: Result<(), NatsError> = {
            let mut state = self.inner.state.write();
            match *state {
                ConnectionState::Closed => Err(NatsError::ConnectionClosed),
                ConnectionState::Draining => Err(NatsError::ConnectionDraining),
                _ => {
                    *state = ConnectionState::Draining;
                    Ok(())
                }
            }
        };

        let inner = Arc::clone(&self.inner);
        future::result(pre).and_then(move |_| {
            {
                let _wire = inner.wire_lock.lock();
                for sid in inner.registry.sids() {
                    inner.registry.mark_draining(sid);
                    let _ = inner
                        .sender
                        .send(Op::UNSUB(UnsubCommand { sid, max_msgs: None }));
                }
            }

            inner.do_flush().then(move |res| {
                NatsClientInner::shutdown(&inner, None);
                future::result(res)
            })
        })
    }

    /// Terminal, idempotent close. Every clone observes the same
    /// `closed()` resolution.
    pub fn close(&self) -> impl Future<Item = (), Error = NatsError> + Send {
        NatsClientInner::shutdown(&self.inner, None);
        self.closed().map(|_| ())
    }

    /// Resolves exactly once when the connection reaches `Closed`,
    /// carrying the fatal error if one caused it.
    pub fn closed(&self) -> impl Future<Item = Option<NatsError>, Error = NatsError> + Send {
        self.inner
            .closed_rx
            .clone()
            .map(|item| (*item).clone())
            .map_err(|_| NatsError::ConnectionClosed)
    }
}

impl NatsClientInner {
    fn check_live(&self) -> Result<(), NatsError> {
        match *self.state.read() {
            ConnectionState::Closed => Err(NatsError::ConnectionClosed),
            ConnectionState::Draining => Err(NatsError::ConnectionDraining),
            _ => Ok(()),
        }
    }

    fn enqueue_publish(&self, cmd: PubCommand) -> Result<(), NatsError> {
        self.check_live()?;
        check_subject(&cmd.subject)?;
        if let Some(ref reply_to) = cmd.reply_to {
            check_subject(reply_to)?;
        }

        if let Some(ref info) = *self.server_info.read() {
            if cmd.payload.len() > info.max_payload as usize {
                return Err(NatsError::MaxPayloadExceeded(info.max_payload));
            }
            if cmd.headers.is_some() && !info.headers {
                return Err(NatsError::ServerOptionNA("headers".into()));
            }
        }

        match self.sender.send(Op::PUB(cmd))? {
            Enqueue::Queued => Ok(()),
            Enqueue::Dropped => {
                self.status
                    .publish(StatusEvent::Error(NatsError::SlowConsumer));
                Ok(())
            }
        }
    }

    fn enqueue_subscribe(
        inner: &Arc<NatsClientInner>,
        cmd: SubCommand,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionStream, NatsError> {
        inner.check_live()?;
        check_subscribe_subject(&cmd.subject)?;

        let _wire = inner.wire_lock.lock();
        let generation = inner.generation.load(Ordering::SeqCst) as u64;
        let (sid, stream) = inner.registry.register(
            cmd.subject.clone(),
            cmd.queue_group.clone(),
            opts.max,
            generation,
        );

        // Off the wire for now, the reconnect replay will register it.
        if *inner.state.read() == ConnectionState::Connected {
            let sub = SubCommand {
                subject: cmd.subject,
                queue_group: cmd.queue_group,
                sid,
            };
            if let Err(e) = inner.sender.send(Op::SUB(sub)) {
                inner.registry.remove(sid);
                return Err(e);
            }
            if let Some(max) = opts.max {
                let _ = inner.sender.send(Op::UNSUB(UnsubCommand {
                    sid,
                    max_msgs: Some(max),
                }));
            }
        }

        if let Some(deadline) = opts.timeout {
            let timer_inner = Arc::clone(inner);
            tokio_executor::spawn(Delay::new(Instant::now() + deadline).then(move |_| {
                timer_inner.registry.fire_inactivity(sid);
                Ok(())
            }));
        }

        Ok(stream)
    }

    fn enqueue_unsubscribe(&self, cmd: UnsubCommand) -> Result<(), NatsError> {
        self.check_live()?;

        let _wire = self.wire_lock.lock();
        match cmd.max_msgs {
            Some(max) => {
                let _ = self.registry.set_max(cmd.sid, max);
            }
            None => {
                self.registry.remove(cmd.sid);
            }
        }

        if *self.state.read() == ConnectionState::Connected {
            self.sender.send(Op::UNSUB(cmd)).map(|_| ())
        } else {
            Ok(())
        }
    }

    fn do_flush(&self) -> impl Future<Item = (), Error = NatsError> + Send {
        let _wire = self.wire_lock.lock();
        self.sender.flush()
    }

    fn ensure_mux(inner: &Arc<NatsClientInner>) -> Result<(), NatsError> {
        let _wire = inner.wire_lock.lock();
        let mut mux_sid = inner.mux_sid.lock();
        if mux_sid.is_none() {
            let sid = inner.registry.allocate_sid();
            if *inner.state.read() == ConnectionState::Connected {
                inner.sender.send(Op::SUB(SubCommand {
                    subject: inner.mux.wildcard_subject(),
                    queue_group: None,
                    sid,
                }))?;
            }
            *mux_sid = Some(sid);
        }
        Ok(())
    }

    fn begin_muxed_request(
        inner: &Arc<NatsClientInner>,
        subject: String,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<
        (
            String,
            oneshot::Receiver<Result<Message, NatsError>>,
        ),
        NatsError,
    > {
        inner.check_live()?;
        NatsClientInner::ensure_mux(inner)?;

        let (token, reply_to, rx) = inner.mux.register();
        let cmd = PubCommand {
            subject,
            reply_to: Some(reply_to),
            headers,
            payload,
        };
        if let Err(e) = inner.enqueue_publish(cmd) {
            inner.mux.cancel(&token);
            return Err(e);
        }

        Ok((token, rx))
    }

    fn begin_request_no_mux(
        inner: &Arc<NatsClientInner>,
        subject: String,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<(u64, SubscriptionStream), NatsError> {
        inner.check_live()?;

        let inbox = PubCommand::generate_reply_to();
        let (sid, stream) = {
            let _wire = inner.wire_lock.lock();
            let generation = inner.generation.load(Ordering::SeqCst) as u64;
            let (sid, stream) =
                inner
                    .registry
                    .register(inbox.clone(), None, Some(1), generation);

            if *inner.state.read() == ConnectionState::Connected {
                inner.sender.send(Op::SUB(SubCommand {
                    subject: inbox.clone(),
                    queue_group: None,
                    sid,
                }))?;
                inner.sender.send(Op::UNSUB(UnsubCommand {
                    sid,
                    max_msgs: Some(1),
                }))?;
            }
            (sid, stream)
        };

        let cmd = PubCommand {
            subject,
            reply_to: Some(inbox),
            headers,
            payload,
        };
        if let Err(e) = inner.enqueue_publish(cmd) {
            inner.registry.remove(sid);
            return Err(e);
        }

        Ok((sid, stream))
    }

    fn spawn_fault_supervisor(inner: &Arc<NatsClientInner>) {
        let rx = inner.fault_rx.lock().take();
        if let Some(rx) = rx {
            let supervised = Arc::downgrade(inner);
            tokio_executor::spawn(
                rx.for_each(move |err| {
                    match supervised.upgrade() {
                        Some(inner) => {
                            NatsClientInner::handle_fault(&inner, err);
                            future::ok(())
                        }
                        // The connection is gone; stop supervising.
                        None => future::err(()),
                    }
                })
                .then(|_| Ok(())),
            );
        }
    }

    /// Initial connection: one pass over the pool, first server that
    /// completes the handshake wins. Failure closes the client with the
    /// last error so `closed()` observes the same outcome.
    fn initial_connect(
        inner: Arc<NatsClientInner>,
    ) -> impl Future<Item = (), Error = NatsError> + Send {
        let rounds = inner.pool.lock().len();
        let closer = Arc::clone(&inner);

        future::loop_fn(
            (inner, rounds, None::<NatsError>),
            |(inner, left, last)| {
                let exhausted = || {
                    last.clone().unwrap_or_else(|| {
                        NatsError::ConnectionRefused(
                            "no server in the pool accepted the connection".into(),
                        )
                    })
                };

                if left == 0 {
                    return Either::A(future::err(exhausted()));
                }

                let server = inner.pool.lock().next_server();
                match server {
                    None => Either::A(future::err(exhausted())),
                    Some(server) => {
                        let next = Arc::clone(&inner);
                        Either::B(NatsClientInner::attempt(inner, server).then(
                            move |res| match res {
                                Ok(()) => Ok(Loop::Break(())),
                                Err(e) => {
                                    debug!(target: "natrix", "Connect attempt failed: {}", e);
                                    Ok(Loop::Continue((next, left - 1, Some(e))))
                                }
                            },
                        ))
                    }
                }
            },
        )
        .map_err(move |e: NatsError| {
            NatsClientInner::shutdown(&closer, Some(e.clone()));
            e
        })
    }

    /// One connection attempt against one server: transport, handshake
    /// with deadline, task installation.
    fn attempt(inner: Arc<NatsClientInner>, server: ServerAddr) -> BoxFuture<()> {
        match *inner.state.read() {
            ConnectionState::Closed | ConnectionState::Draining => {
                return Box::new(future::err(NatsError::ConnectionClosed));
            }
            _ => {}
        }

        let addr = match server.socket_addr() {
            Ok(addr) => addr,
            Err(e) => return Box::new(future::err(e)),
        };

        let deadline = inner.opts.timeout;
        let handshake_inner = Arc::clone(&inner);
        let install_server = server.clone();

        let fut = NatsConnection::connect(addr, deadline)
            .and_then(move |conn| {
                *handshake_inner.state.write() = ConnectionState::Handshaking;
                let handshake =
                    NatsClientInner::handshake(Arc::clone(&handshake_inner), server, conn);
                Timeout::new(handshake, deadline).map_err(flatten_timeout)
            })
            .and_then(move |(conn, info)| {
                future::result(NatsClientInner::install(inner, install_server, conn, info))
            });

        Box::new(fut)
    }

    /// `INFO` validation, optional TLS upgrade, authentication, and the
    /// CONNECT/PING/PONG exchange.
    fn handshake(
        inner: Arc<NatsClientInner>,
        server: ServerAddr,
        conn: NatsConnection,
    ) -> BoxFuture<(NatsConnection, ServerInfo)> {
        let opts = inner.opts.clone();

        let fut = conn.into_future().map_err(|(e, _)| e).and_then(
            move |(maybe_op, conn)| -> BoxFuture<(NatsConnection, ServerInfo)> {
                let info = match maybe_op {
                    Some(Op::INFO(info)) => info,
                    Some(Op::ERR(e)) => return Box::new(future::err(e.into())),
                    Some(op) => {
                        return Box::new(future::err(NatsError::ProtocolError(format!(
                            "expected INFO, got {:?}",
                            op
                        ))))
                    }
                    None => {
                        return Box::new(future::err(NatsError::ConnectionRefused(
                            "the server closed the connection before INFO".into(),
                        )))
                    }
                };

                if opts.headers && !info.headers {
                    return Box::new(future::err(NatsError::ServerOptionNA("headers".into())));
                }

                let wants_tls = opts.tls || server.tls_required();
                if info.tls_required && !wants_tls {
                    return Box::new(future::err(NatsError::ConnectionRefused(
                        "the server requires TLS and the transport is plaintext".into(),
                    )));
                }

                let connect_cmd =
                    match NatsClientInner::connect_command(&opts, &server, &info) {
                        Ok(cmd) => cmd,
                        Err(e) => return Box::new(future::err(e)),
                    };

                let upgrade: BoxFuture<NatsConnection> = if wants_tls && !conn.is_tls() {
                    Box::new(conn.upgrade_to_tls(server.host().to_string(), &opts.tls_config))
                } else {
                    Box::new(future::ok(conn))
                };

                let info_out = info;
                Box::new(
                    upgrade
                        .and_then(move |conn| conn.send(Op::CONNECT(connect_cmd)))
                        .and_then(|conn| conn.send(Op::PING))
                        .and_then(|conn| NatsClientInner::await_pong(conn))
                        .map(move |conn| (conn, info_out)),
                )
            },
        );

        Box::new(fut)
    }

    /// Reads frames until the PONG that seals the handshake, answering
    /// server PINGs and skipping `+OK` chatter on the way.
    fn await_pong(conn: NatsConnection) -> impl Future<Item = NatsConnection, Error = NatsError> + Send {
        future::loop_fn(conn, |conn| {
            conn.into_future().map_err(|(e, _)| e).and_then(
                |(maybe_op, conn)| -> BoxFuture<Loop<NatsConnection, NatsConnection>> {
                    match maybe_op {
                        Some(Op::PONG) => Box::new(future::ok(Loop::Break(conn))),
                        Some(Op::OK) | Some(Op::INFO(_)) => {
                            Box::new(future::ok(Loop::Continue(conn)))
                        }
                        Some(Op::PING) => Box::new(conn.send(Op::PONG).map(Loop::Continue)),
                        Some(Op::ERR(e)) => Box::new(future::err(e.into())),
                        Some(op) => Box::new(future::err(NatsError::ProtocolError(format!(
                            "unexpected {:?} during the handshake",
                            op
                        )))),
                        None => Box::new(future::err(NatsError::ConnectionRefused(
                            "the server closed the connection during the handshake".into(),
                        ))),
                    }
                },
            )
        })
    }

    fn connect_command(
        opts: &NatsClientOptions,
        server: &ServerAddr,
        info: &ServerInfo,
    ) -> Result<ConnectCommand, NatsError> {
        let mut cmd = ConnectCommand::default();
        cmd.verbose = opts.verbose;
        cmd.pedantic = opts.pedantic;
        cmd.tls_required = opts.tls || server.tls_required();
        cmd.name = opts.name.clone();
        cmd.echo = Some(!opts.no_echo);
        cmd.protocol = Some(1);
        cmd.headers = Some(opts.headers);
        cmd.no_responders = Some(opts.headers);

        if let Some(ref authenticator) = opts.authenticator {
            authenticator.authenticate(&info.nonce)?.apply(&mut cmd);
        } else if let Some(ref user) = opts.user {
            cmd.user = Some(user.clone());
            cmd.pass = opts.pass.clone();
        } else if let Some(ref token) = opts.token {
            cmd.auth_token = Some(token.clone());
        } else if let Some(user) = server.username() {
            cmd.user = Some(user);
            cmd.pass = server.password();
        }

        Ok(cmd)
    }

    /// Wires a freshly handshaken connection in: generation bump,
    /// subscription replay ahead of buffered traffic, reader/writer/
    /// heartbeat tasks, writer resume.
    fn install(
        inner: Arc<NatsClientInner>,
        server: ServerAddr,
        conn: NatsConnection,
        info: ServerInfo,
    ) -> Result<(), NatsError> {
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        *inner.server_info.write() = Some(info);
        inner.pool.lock().mark_connected(&server);
        *inner.current_server.write() = Some(server);

        let (sink, stream) = conn.split();

        let (writer_stop_tx, writer_stop_rx) = oneshot::channel();
        let (reader_stop_tx, reader_stop_rx) = oneshot::channel();
        let (heartbeat_stop_tx, heartbeat_stop_rx) = oneshot::channel();

        {
            let _wire = inner.wire_lock.lock();

            let mut entries = inner.registry.replay_entries(generation);
            if let Some(mux_sid) = *inner.mux_sid.lock() {
                entries.push((
                    mux_sid,
                    vec![Op::SUB(SubCommand {
                        subject: inner.mux.wildcard_subject(),
                        queue_group: None,
                        sid: mux_sid,
                    })],
                ));
                entries.sort_by_key(|&(sid, _)| sid);
            }
            let ops: Vec<Op> = entries.into_iter().flat_map(|(_, ops)| ops).collect();
            inner.sender.queue().push_front_batch(ops);

            {
                let mut stops = inner.task_stops.lock();
                stops.clear();
                stops.push(writer_stop_tx);
                stops.push(reader_stop_tx);
                stops.push(heartbeat_stop_tx);
            }

            tokio_executor::spawn(WriterTask::new(
                inner.sender.queue().clone(),
                sink,
                inner.fault_tx.clone(),
                writer_stop_rx,
            ));
            NatsClientInner::spawn_reader(&inner, stream, reader_stop_rx);
            NatsClientInner::spawn_heartbeat(&inner, heartbeat_stop_rx);

            inner.pings_out.store(0, Ordering::SeqCst);
            inner.sender.queue().resume();
            *inner.state.write() = ConnectionState::Connected;
        }

        Ok(())
    }

    fn spawn_reader(
        inner: &Arc<NatsClientInner>,
        stream: NatsStream,
        stop: oneshot::Receiver<()>,
    ) {
        let process = Arc::clone(inner);
        let fault = inner.fault_tx.clone();

        let work = stream
            .for_each(move |op| {
                NatsClientInner::process_op(&process, op);
                future::ok(())
            })
            .select2(stop)
            .then(move |result| {
                let faulted = match result {
                    // The server closed the stream on us.
                    Ok(Either::A(((), _))) => Some(NatsError::ConnectionClosed),
                    Err(Either::A((e, _))) => Some(e),
                    // Retired by a generation change or shutdown.
                    Ok(Either::B(_)) | Err(Either::B(_)) => None,
                };
                if let Some(e) = faulted {
                    let _ = fault.unbounded_send(e);
                }
                Ok(())
            });

        tokio_executor::spawn(work);
    }

    fn spawn_heartbeat(inner: &Arc<NatsClientInner>, stop: oneshot::Receiver<()>) {
        let interval = inner.opts.ping_interval;
        let max_out = inner.opts.max_pings_out as usize;
        let beat = Arc::clone(inner);

        let ticks = Interval::new(Instant::now() + interval, interval)
            .map_err(|_| ())
            .for_each(move |_| {
                if *beat.state.read() != ConnectionState::Connected {
                    return Ok(());
                }

                let outstanding = beat.pings_out.fetch_add(1, Ordering::SeqCst) + 1;
                if outstanding > max_out {
                    let _ = beat.fault_tx.unbounded_send(NatsError::StaleConnection);
                    return Err(());
                }

                let _ = beat.sender.ping();
                Ok(())
            });

        tokio_executor::spawn(ticks.select2(stop).then(|_| Ok(())));
    }

    /// Reader-side dispatch of everything the server sends.
    fn process_op(inner: &Arc<NatsClientInner>, op: Op) {
        match op {
            Op::MSG(msg) => {
                if inner.mux.matches(&msg.subject) {
                    inner.mux.resolve(msg);
                } else {
                    match inner.registry.dispatch(msg) {
                        Dispatch::Overflowed => inner
                            .status
                            .publish(StatusEvent::Error(NatsError::SlowConsumer)),
                        Dispatch::Unknown => {
                            debug!(target: "natrix", "Dropping message for unknown sid");
                        }
                        Dispatch::Delivered | Dispatch::Finished => {}
                    }
                }
            }
            Op::PING => {
                let _ = inner.sender.pong();
            }
            Op::PONG => {
                inner.pings_out.store(0, Ordering::SeqCst);
                inner.sender.pong_received();
            }
            Op::INFO(info) => {
                if info.ldm {
                    inner.lame_duck();
                }
                if let Some(ref urls) = info.connect_urls {
                    let update = inner.pool.lock().update_from_info(urls);
                    if !update.is_empty() {
                        inner.status.publish(StatusEvent::ServersChanged {
                            added: update.added,
                            removed: update.removed,
                        });
                    }
                }
                *inner.server_info.write() = Some(info);
            }
            Op::OK => {}
            Op::ERR(server_error) => {
                if server_error.is_lame_duck() {
                    inner.lame_duck();
                    return;
                }
                let err = NatsError::from(server_error);
                if err.is_fatal() {
                    NatsClientInner::shutdown(inner, Some(err));
                } else {
                    inner.status.publish(StatusEvent::Error(err));
                }
            }
            op => {
                inner.status.publish(StatusEvent::Error(NatsError::ProtocolError(format!(
                    "unexpected {:?} from the server",
                    op
                ))));
            }
        }
    }

    fn lame_duck(&self) {
        self.status.publish(StatusEvent::LameDuck);
        if self.opts.reconnect_on_lame_duck {
            let _ = self
                .fault_tx
                .unbounded_send(NatsError::ServerError("lame duck mode".into()));
        }
    }

    /// Entry point for reader/writer/heartbeat faults: tear the socket's
    /// tasks down and start the reconnect loop, or close for good.
    fn handle_fault(inner: &Arc<NatsClientInner>, err: NatsError) {
        debug!(target: "natrix", "Connection fault: {}", err);

        {
            let mut state = inner.state.write();
            match *state {
                ConnectionState::Connected => {
                    if !inner.opts.reconnect {
                        drop(state);
                        NatsClientInner::shutdown(inner, Some(err));
                        return;
                    }
                    *state = ConnectionState::Reconnecting;
                }
                // Faults from retired generations, or mid-handshake
                // failures handled by the attempt future itself.
                _ => return,
            }
        }

        {
            let _wire = inner.wire_lock.lock();
            inner.sender.queue().pause();
            inner.sender.queue().purge_for_replay();
            inner.sender.cancel_pongs();
            inner.task_stops.lock().clear();
            inner.pings_out.store(0, Ordering::SeqCst);
        }

        let addr = inner
            .current_server
            .read()
            .as_ref()
            .map(|s| s.hostport())
            .unwrap_or_default();
        inner.status.publish(StatusEvent::Disconnect(addr));

        let finished = Arc::clone(inner);
        tokio_executor::spawn(NatsClientInner::reconnect_loop(Arc::clone(inner)).then(
            move |res| {
                match res {
                    Ok(()) => {
                        let addr = finished
                            .current_server
                            .read()
                            .as_ref()
                            .map(|s| s.hostport())
                            .unwrap_or_default();
                        finished.status.publish(StatusEvent::Reconnect(addr));
                    }
                    Err(e) => NatsClientInner::shutdown(&finished, Some(e)),
                }
                Ok(())
            },
        ));
    }

    /// Pool rotation with jittered backoff until a handshake succeeds or
    /// every server exhausts its budget.
    fn reconnect_loop(
        inner: Arc<NatsClientInner>,
    ) -> impl Future<Item = (), Error = NatsError> + Send {
        future::loop_fn(inner, |inner| {
            let server = inner.pool.lock().next_server();
            match server {
                None => Either::A(future::err(NatsError::ConnectionRefused(
                    "every server in the pool exhausted its reconnect budget".into(),
                ))),
                Some(server) => {
                    let wait = inner.pool.lock().backoff(&server);
                    debug!(
                        target: "natrix",
                        "Reconnecting to {} in {:?}", server.hostport(), wait
                    );

                    let attempt_inner = Arc::clone(&inner);
                    Either::B(
                        Delay::new(Instant::now() + wait)
                            .map_err(|_| {
                                NatsError::GenericError("the timer driver failed".into())
                            })
                            .and_then(move |_| {
                                NatsClientInner::attempt(attempt_inner, server)
                            })
                            .then(move |res| match res {
                                Ok(()) => Ok(Loop::Break(())),
                                Err(e) => {
                                    if e.is_fatal() || e == NatsError::ConnectionClosed {
                                        Err(e)
                                    } else {
                                        debug!(target: "natrix", "Reconnect attempt failed: {}", e);
                                        Ok(Loop::Continue(inner))
                                    }
                                }
                            }),
                    )
                }
            }
        })
    }

    /// Terminal teardown; the first caller wins, everyone else no-ops.
    fn shutdown(inner: &Arc<NatsClientInner>, err: Option<NatsError>) {
        {
            let mut state = inner.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        debug!(target: "natrix", "Closing the connection: {:?}", err);
        inner.sender.queue().close();
        inner.sender.cancel_pongs();
        inner.registry.close_all();
        inner.mux.clear();
        inner.task_stops.lock().clear();

        if let Some(tx) = inner.closed_tx.lock().take() {
            let _ = tx.send(err);
        }
    }
}

fn flatten_timeout(err: timeout::Error<NatsError>) -> NatsError {
    if err.is_elapsed() {
        NatsError::ConnectionTimeout
    } else {
        match err.into_inner() {
            Some(e) => e,
            None => NatsError::GenericError("the timer driver failed".into()),
        }
    }
}
