//! Explicit runtime wiring: one `Runtime` value owns the catalog, pools,
//! admission, throttling and the dispatch pipeline, and is handed to the
//! server loop. No global state; tests construct a private runtime per
//! case.

use crate::admission::{AdmissionConfig, AdmissionControl};
use crate::catalog::{CatalogBuilder, CatalogError, DeserializeFn, PacketCatalog, TransformerSet};
use crate::connection::{Authority, ConnectionView};
use crate::dispatch::middleware::{
    AuthMiddleware, RateLimitMiddleware, TimeoutMiddleware, TimingMiddleware, UnwrapMiddleware,
    WrapMiddleware,
};
use crate::dispatch::router::{HandlerResult, HandlerTable, RouterError};
use crate::dispatch::{Completion, DispatchContext, Effects, Middleware, Pipeline, Route};
use crate::net::endpoint::{ConnectionChange, Endpoint, EndpointSettings, FrameDispatcher};
use crate::packet::control::{ControlPacket, ReasonCode};
use crate::packet::RawPacket;
use crate::pool::buffer::{BufferPool, PoolConfig};
use crate::throttle::{LimiterConfig, RequestLimiter};
use crossbeam_channel::{Receiver, Sender};
use quark::crypto::{EncryptionMode, SigningIdentity};
use quark::logging::{self, Logger};
use quark::snowflake::ShortId;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_millis(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub server_address: String,
    pub port: u16,
    pub admission: AdmissionConfig,
    pub pool: PoolConfig,
    pub limiter: LimiterConfig,
    pub encryption_mode: EncryptionMode,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ingress_timeout: Duration,
    /// Worker pool size; zero means one per logical core.
    pub worker_threads: usize,
    /// Pipeline budget applied to handlers without their own.
    pub default_handler_timeout: Option<Duration>,
    /// Machine number baked into generated connection ids.
    pub machine: u16,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            server_address: "127.0.0.1".into(),
            port: 7777,
            admission: AdmissionConfig::default(),
            pool: PoolConfig::default(),
            limiter: LimiterConfig::default(),
            encryption_mode: EncryptionMode::None,
            handshake_timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(3000),
            ingress_timeout: Duration::from_millis(30_000),
            worker_threads: 0,
            default_handler_timeout: None,
            machine: 0,
        }
    }
}

#[derive(Debug)]
pub enum BuildError {
    Catalog(CatalogError),
    Router(RouterError),
}

impl From<CatalogError> for BuildError {
    fn from(err: CatalogError) -> BuildError {
        BuildError::Catalog(err)
    }
}

impl From<RouterError> for BuildError {
    fn from(err: RouterError) -> BuildError {
        BuildError::Router(err)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::Catalog(err) => write!(f, "catalog configuration: {}", err),
            BuildError::Router(err) => write!(f, "router configuration: {}", err),
        }
    }
}

impl std::error::Error for BuildError {}

#[derive(Debug)]
pub enum ServeError {
    /// The listener address could not be parsed or bound.
    Bind(io::Error),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServeError::Bind(err) => write!(f, "bind failed: {}", err),
        }
    }
}

impl std::error::Error for ServeError {}

/// Staged configuration for a `Runtime`: packet types, handlers and extra
/// middleware are registered here, with misconfiguration surfacing as
/// typed errors before anything binds.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    catalog: CatalogBuilder,
    handlers: HandlerTable,
    extra_middleware: Vec<Arc<dyn Middleware>>,
    identity: Option<SigningIdentity>,
    log: Option<Logger>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            catalog: CatalogBuilder::new(),
            handlers: HandlerTable::new(),
            extra_middleware: Vec::new(),
            identity: None,
            log: None,
        }
    }

    pub fn logger(mut self, log: Logger) -> RuntimeBuilder {
        self.log = Some(log);
        self
    }

    /// Long-term signing identity attached to handshake replies.
    pub fn identity(mut self, identity: SigningIdentity) -> RuntimeBuilder {
        self.identity = Some(identity);
        self
    }

    /// Registers an application packet type with the standard transformer
    /// set.
    pub fn register_packet(
        &mut self,
        magic: u32,
        deserializer: DeserializeFn,
    ) -> Result<&mut RuntimeBuilder, BuildError> {
        self.catalog.register(magic, deserializer)?;
        self.catalog.with_standard_transformers(magic)?;
        Ok(self)
    }

    /// Registers a packet type with an explicit transformer record, which
    /// may be empty for pipeline-managed types.
    pub fn register_packet_with_transformers(
        &mut self,
        magic: u32,
        deserializer: DeserializeFn,
        transformers: TransformerSet,
    ) -> Result<&mut RuntimeBuilder, BuildError> {
        self.catalog.register(magic, deserializer)?;
        self.catalog.with_transformers(magic, transformers)?;
        Ok(self)
    }

    /// Installs an opcode handler.
    pub fn register_handler<F>(
        &mut self,
        opcode: u16,
        name: &'static str,
        required_authority: Authority,
        timeout: Option<Duration>,
        handler: F,
    ) -> Result<&mut RuntimeBuilder, BuildError>
    where
        F: Fn(&mut crate::dispatch::router::HandlerContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .register(opcode, name, required_authority, timeout, handler)?;
        Ok(self)
    }

    /// Appends a user middleware; it is sorted into its declared stage.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut RuntimeBuilder {
        self.extra_middleware.push(middleware);
        self
    }

    /// Assembles the runtime: pools, canonical pipeline, worker pools.
    pub fn build(self) -> Runtime {
        let log = self.log.unwrap_or_else(logging::discard);

        let worker_count = match self.config.worker_threads {
            0 => num_cpus::get(),
            count => count,
        };

        let workers = threadpool::Builder::new()
            .num_threads(worker_count)
            .thread_name("tachyon-worker".into())
            .build();
        let timed = threadpool::Builder::new()
            .num_threads(worker_count)
            .thread_name("tachyon-timed".into())
            .build();

        let catalog = Arc::new(self.catalog.build());
        let pool = BufferPool::new(&self.config.pool, &log);
        let limiter = Arc::new(RequestLimiter::new(self.config.limiter.clone()));
        let admission = Arc::new(AdmissionControl::new(self.config.admission.clone(), &log));

        let mut chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(RateLimitMiddleware::new(limiter.clone())),
            Arc::new(UnwrapMiddleware::new(catalog.clone())),
            Arc::new(AuthMiddleware),
            Arc::new(TimeoutMiddleware::new(timed)),
            Arc::new(TimingMiddleware),
            Arc::new(WrapMiddleware::new(catalog.clone())),
        ];
        chain.extend(self.extra_middleware);

        let pipeline = Pipeline::new(chain, Arc::new(self.handlers), catalog.clone());

        for (stage, order, name) in pipeline.describe() {
            logging::debug!(log, "middleware installed";
                            "context" => "build",
                            "stage" => ?stage,
                            "order" => order,
                            "name" => name);
        }

        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();

        Runtime {
            config: self.config,
            catalog,
            pool,
            limiter,
            admission,
            pipeline,
            workers,
            outbound_tx,
            outbound_rx,
            identity: self.identity.map(Arc::new),
            shutdown: Arc::new(AtomicBool::new(false)),
            log,
        }
    }
}

/// A fully wired runtime, ready to bind its listener.
pub struct Runtime {
    config: RuntimeConfig,
    catalog: Arc<PacketCatalog>,
    pool: BufferPool,
    limiter: Arc<RequestLimiter>,
    admission: Arc<AdmissionControl>,
    pipeline: Pipeline,
    workers: threadpool::ThreadPool,
    outbound_tx: Sender<Completion>,
    outbound_rx: Receiver<Completion>,
    identity: Option<Arc<SigningIdentity>>,
    shutdown: Arc<AtomicBool>,
    log: Logger,
}

impl Runtime {
    /// Handle that trips the server-wide cancellation latch.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Binds the listener. Address parse failures and bind failures both
    /// surface as `ServeError::Bind`.
    pub fn bind(self) -> Result<Server, ServeError> {
        let addr: SocketAddr = format!("{}:{}", self.config.server_address, self.config.port)
            .parse()
            .map_err(|err| {
                ServeError::Bind(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad listen address: {}", err),
                ))
            })?;

        let settings = EndpointSettings {
            encryption_mode: self.config.encryption_mode,
            handshake_timeout: self.config.handshake_timeout,
            heartbeat_interval: self.config.heartbeat_interval,
            ingress_timeout: self.config.ingress_timeout,
            machine: self.config.machine,
        };

        let endpoint = Endpoint::bind(
            addr,
            self.pool.clone(),
            self.admission.clone(),
            self.identity.clone(),
            settings,
            self.log.new(logging::o!("subsystem" => "endpoint")),
        )
        .map_err(ServeError::Bind)?;

        let dispatcher = Dispatcher {
            shared: Arc::new(DispatchShared {
                pipeline: self.pipeline.clone(),
                catalog: self.catalog.clone(),
                workers: self.workers.clone(),
                outbound_tx: self.outbound_tx.clone(),
                default_timeout: self.config.default_handler_timeout,
                queues: std::sync::Mutex::new(hashbrown::HashMap::new()),
                log: self.log.new(logging::o!("subsystem" => "dispatch")),
            }),
        };

        Ok(Server {
            endpoint,
            dispatcher,
            outbound_rx: self.outbound_rx,
            workers: self.workers,
            limiter: self.limiter,
            shutdown: self.shutdown,
            log: self.log,
        })
    }
}

/// Submits decoded frames to the worker pool and funnels completions back
/// toward the network thread. Frames from one connection run through the
/// pipeline strictly in arrival order: while one is in flight, later ones
/// queue behind it and are chained onto the pool as each completes.
struct Dispatcher {
    shared: Arc<DispatchShared>,
}

struct DispatchShared {
    pipeline: Pipeline,
    catalog: Arc<PacketCatalog>,
    workers: threadpool::ThreadPool,
    outbound_tx: Sender<Completion>,
    default_timeout: Option<Duration>,
    queues: std::sync::Mutex<hashbrown::HashMap<u64, std::collections::VecDeque<DispatchContext>>>,
    log: Logger,
}

impl FrameDispatcher for Dispatcher {
    fn dispatch(&self, view: ConnectionView, packet: RawPacket) {
        let shared = &self.shared;

        // Unknown packet kinds never reach a worker
        if !shared.catalog.contains(packet.header.magic) {
            logging::debug!(shared.log, "unknown packet magic";
                            "context" => "dispatch",
                            "connection" => %ShortId::derive(view.id),
                            "magic" => packet.header.magic);

            let route = Route {
                slot: view.slot,
                generation: view.generation,
                connection_id: view.id,
            };

            drop(shared.outbound_tx.send(Completion::control(
                route,
                ControlPacket::fail(ReasonCode::UnknownMagic, &packet.header),
            )));
            return;
        }

        let attrs = shared.pipeline.handler_attrs(packet.header.opcode);

        let ctx = DispatchContext {
            view,
            packet,
            body: None,
            required_authority: attrs.map(|(authority, _)| authority),
            timeout: attrs.and_then(|(_, timeout)| timeout).or(shared.default_timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
            effects: Effects::default(),
            started: Instant::now(),
            log: shared.log.clone(),
        };

        let run_now = {
            let mut queues = shared
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            match queues.entry(ctx.view.id) {
                hashbrown::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().push_back(ctx);
                    None
                }
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    entry.insert(std::collections::VecDeque::new());
                    Some(ctx)
                }
            }
        };

        if let Some(ctx) = run_now {
            execute_chained(shared.clone(), ctx);
        }
    }
}

/// Runs one context on the pool, then chains the connection's next queued
/// frame so per-connection FIFO holds through handler entry.
fn execute_chained(shared: Arc<DispatchShared>, ctx: DispatchContext) {
    let pool = shared.workers.clone();

    pool.execute(move || {
        let connection_id = ctx.view.id;

        let completion = shared.pipeline.execute(ctx);
        drop(shared.outbound_tx.send(completion));

        let next = {
            let mut queues = shared
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let (next, drained) = match queues.get_mut(&connection_id) {
                Some(queue) => match queue.pop_front() {
                    Some(next) => (Some(next), false),
                    None => (None, true),
                },
                None => (None, false),
            };

            if drained {
                queues.remove(&connection_id);
            }

            next
        };

        if let Some(next_ctx) = next {
            execute_chained(shared.clone(), next_ctx);
        }
    });
}

/// A bound server. `run` drives the event loop on the calling thread;
/// `spawn` moves it onto a dedicated one.
pub struct Server {
    endpoint: Endpoint,
    dispatcher: Dispatcher,
    outbound_rx: Receiver<Completion>,
    workers: threadpool::ThreadPool,
    limiter: Arc<RequestLimiter>,
    shutdown: Arc<AtomicBool>,
    log: Logger,
}

impl Server {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// The serve loop: poll, dispatch, drain completions, housekeep.
    /// Returns after the shutdown latch trips and all clients were
    /// notified.
    pub fn run(mut self) {
        logging::info!(self.log, "server loop started";
                       "context" => "serve",
                       "address" => %self.endpoint.local_addr());

        let mut sweep_time = Instant::now();

        while !self.shutdown.load(Ordering::Acquire) {
            let now = Instant::now();

            self.endpoint.sync(now, &self.dispatcher, POLL_TIMEOUT);

            while let Ok(completion) = self.outbound_rx.try_recv() {
                self.endpoint.apply(completion);
            }

            for change in self.endpoint.changes() {
                match change {
                    ConnectionChange::Connected(id) => {
                        logging::trace!(self.log, "client connected";
                                        "context" => "serve",
                                        "connection" => %ShortId::derive(id));
                    }
                    ConnectionChange::Disconnected(id) => {
                        logging::trace!(self.log, "client disconnected";
                                        "context" => "serve",
                                        "connection" => %ShortId::derive(id));
                    }
                }
            }

            if now.duration_since(sweep_time) >= SWEEP_INTERVAL {
                self.limiter.sweep(quark::clock::unix_millis());
                sweep_time = now;
            }
        }

        logging::info!(self.log, "shutting down";
                       "context" => "serve",
                       "connections" => self.endpoint.connection_count());

        self.endpoint.shutdown_all();
        self.workers.join();
    }

    /// Runs the serve loop on a dedicated thread, returning a handle for
    /// tests and embedders.
    pub fn spawn(self) -> ServerHandle {
        let addr = self.local_addr();
        let shutdown = self.shutdown.clone();

        let thread = thread::Builder::new()
            .name("tachyon-net".into())
            .spawn(move || self.run())
            .expect("Failed to spawn the network thread");

        ServerHandle {
            addr,
            shutdown,
            thread,
        }
    }
}

/// Trips the server-wide cancellation latch. Safe to invoke repeatedly
/// and from any thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl ServerHandle {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Trips the latch and waits for the network thread to drain.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        drop(self.thread.join());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketError;

    fn noop_deserializer(
        _packet: &RawPacket,
    ) -> Result<crate::catalog::BoxedBody, PacketError> {
        Ok(Box::new(ControlPacket::heartbeat()))
    }

    #[test]
    fn test_duplicate_packet_registration_fails() {
        let mut builder = RuntimeBuilder::new(RuntimeConfig::default());

        builder.register_packet(0x1111, noop_deserializer).unwrap();

        match builder.register_packet(0x1111, noop_deserializer) {
            Err(BuildError::Catalog(CatalogError::DuplicateMagic(0x1111))) => (),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_handler_registration_fails() {
        let mut builder = RuntimeBuilder::new(RuntimeConfig::default());

        builder
            .register_handler(0x0001, "a", Authority::None, None, |_| Ok(None))
            .unwrap();

        match builder.register_handler(0x0001, "b", Authority::None, None, |_| Ok(None)) {
            Err(BuildError::Router(RouterError::DuplicateOpcode(0x0001))) => (),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bind_rejects_bad_address() {
        let mut config = RuntimeConfig::default();
        config.server_address = "not an address".into();

        let runtime = RuntimeBuilder::new(config).build();

        match runtime.bind() {
            Err(ServeError::Bind(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidInput),
            Ok(_) => panic!("Bind must fail on a bad address"),
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let mut config = RuntimeConfig::default();
        config.port = 0;
        config.worker_threads = 1;

        let server = RuntimeBuilder::new(config).build().bind().unwrap();

        assert_ne!(server.local_addr().port(), 0);
    }
}
