//! # Application Orchestrator
//!
//! [`App`] owns the listener, the session registry and the router. It runs
//! the accept loop, gives every connection a grace window to authenticate,
//! dispatches inbound packets to routes and pushes server-initiated messages.
//!
//! ## Task layout
//! - one accept loop (`serve`)
//! - per connection: a read loop, plus a task racing the grace window
//! - one task per dispatched packet
//! - the registry coordinator
//!
//! Routes must be registered before `run`/`serve` is called.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::message::{Message, MessageType};
use crate::core::packet::{Packet, PacketPool};
use crate::error::{ProtocolError, Result};
use crate::protocol::{Context, RawOpcode, RegisterParams, Route, Router};
use crate::service::module::Module;
use crate::session::{Session, SessionHandler, SessionRegistry};
use crate::transport::{self, Connection, Listener};
use crate::utils::metrics::Metrics;
use crate::utils::panic_message;

/// Pause after an I/O error from `accept` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub type HookFuture = BoxFuture<'static, Result<()>>;

/// Callback run for a session on connect or disconnect
pub type SessionHook = Arc<dyn Fn(Arc<Session>) -> HookFuture + Send + Sync>;

#[derive(Default, Clone)]
struct Hooks {
    connect: Option<SessionHook>,
    disconnect: Option<SessionHook>,
}

struct AppInner {
    me: Weak<AppInner>,
    version: String,
    listener: Box<dyn Listener>,
    registry: SessionRegistry,
    router: Router,
    pool: PacketPool,
    auth_timeout: Duration,
    connections: Arc<Semaphore>,
    modules: Mutex<Vec<Box<dyn Module>>>,
    hooks: RwLock<Hooks>,
    metrics: Metrics,
    shutdown: CancellationToken,
    destroyed: AtomicBool,
}

/// Handle to a running server. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    /// Bind the configured transport and build an app around it.
    #[instrument(skip(config), fields(address = %config.address, network = %config.network))]
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let pool = PacketPool::default();
        let listener =
            transport::listen(config.network, config.listen_options()?, pool.clone()).await?;
        Ok(Self::from_parts(listener, config, pool))
    }

    /// Build an app around an existing listener. Only the lifecycle settings
    /// of `config` are used.
    pub fn with_listener(listener: Box<dyn Listener>, config: &ServerConfig) -> Self {
        Self::from_parts(listener, config, PacketPool::default())
    }

    fn from_parts(listener: Box<dyn Listener>, config: &ServerConfig, pool: PacketPool) -> Self {
        let inner = Arc::new_cyclic(|me| AppInner {
            me: me.clone(),
            version: config.version.clone(),
            listener,
            registry: SessionRegistry::spawn(),
            router: Router::new(),
            pool,
            auth_timeout: config.auth_timeout,
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            modules: Mutex::new(Vec::new()),
            hooks: RwLock::new(Hooks::default()),
            metrics: Metrics::new(),
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        });
        Self { inner }
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn pool(&self) -> &PacketPool {
        &self.inner.pool
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Shorthand for [`Router::register`].
    pub fn register<M: Message>(
        &self,
        opcode: impl Into<RawOpcode>,
        params: RegisterParams,
    ) -> Result<()> {
        self.inner.router.register::<M>(opcode, params)
    }

    /// Run `hook` on its own task whenever a session authenticates.
    pub fn on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: SessionHook =
            Arc::new(move |session: Arc<Session>| -> HookFuture { Box::pin(hook(session)) });
        self.write_hooks().connect = Some(hook);
    }

    /// Run `hook` on its own task when a session that got the connect hook is
    /// torn down.
    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: SessionHook =
            Arc::new(move |session: Arc<Session>| -> HookFuture { Box::pin(hook(session)) });
        self.write_hooks().disconnect = Some(hook);
    }

    fn write_hooks(&self) -> std::sync::RwLockWriteGuard<'_, Hooks> {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered session for `user_id`
    pub async fn session(&self, user_id: u64) -> Option<Arc<Session>> {
        self.inner.registry.get(user_id).await
    }

    pub async fn session_count(&self) -> usize {
        self.inner.registry.count().await
    }

    /// Initialize and route `modules` in order, then serve until shutdown.
    pub async fn run(&self, modules: Vec<Box<dyn Module>>) -> Result<()> {
        self.install_modules(modules)?;
        let served = self.serve().await;
        self.destroy().await;
        served
    }

    /// Like [`run`](Self::run), but also stops when `signal` resolves.
    pub async fn run_until<S>(&self, modules: Vec<Box<dyn Module>>, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.install_modules(modules)?;
        let served = tokio::select! {
            served = self.serve() => served,
            _ = signal => {
                info!("Shutdown signal received");
                Ok(())
            }
        };
        self.destroy().await;
        served
    }

    fn install_modules(&self, modules: Vec<Box<dyn Module>>) -> Result<()> {
        for mut module in modules {
            info!(module = module.name(), "Initializing module");
            module.on_init(self)?;
            module.route(self)?;
            self.inner
                .modules
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(module);
        }
        Ok(())
    }

    /// Accept connections until shutdown. Failed accepts are logged and the
    /// loop continues.
    pub async fn serve(&self) -> Result<()> {
        let shutdown = self.inner.shutdown.clone();
        info!(
            version = %self.inner.version,
            address = ?self.local_addr(),
            routes = self.inner.router.inbound_opcodes().len(),
            "Accepting connections"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.inner.connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.inner.listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    self.inner.metrics.connection_accepted();
                    tokio::spawn(self.clone().handle_connection(conn, permit));
                }
                Err(ProtocolError::ListenerClosed) => break,
                Err(ProtocolError::Io(e)) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }

        info!("Accept loop stopped");
        Ok(())
    }

    async fn handle_connection(self, conn: Arc<dyn Connection>, permit: OwnedSemaphorePermit) {
        let handler: Weak<dyn SessionHandler> = self.inner.me.clone();
        let session = Session::new(conn, handler, self.inner.pool.clone());
        debug!(session = session.id(), peer = %session.real_ip(), "Connection accepted");

        let reader = {
            let app = self.clone();
            let session = session.clone();
            async move {
                session.run().await;
                app.inner.metrics.connection_closed();
                drop(permit);
            }
        };
        tokio::spawn(reader);

        tokio::select! {
            biased;
            _ = session.wait_for_authentication() => self.admit(session).await,
            _ = session.closed() => {
                debug!(session = session.id(), "Session closed before authenticating");
            }
            _ = self.inner.shutdown.cancelled() => session.destroy().await,
            _ = tokio::time::sleep(self.inner.auth_timeout) => {
                if session.is_authenticated() {
                    self.admit(session).await;
                } else {
                    self.inner.metrics.auth_timeout();
                    info!(
                        session = session.id(),
                        peer = %session.real_ip(),
                        "Authentication grace window elapsed"
                    );
                    session.destroy().await;
                }
            }
        }
    }

    async fn admit(&self, session: Arc<Session>) {
        match self.inner.registry.add(session.clone()).await {
            Ok(Some(_evicted)) => self.inner.metrics.duplicate_eviction(),
            Ok(None) => {}
            Err(e) => {
                warn!(session = session.id(), error = %e, "Failed to register session");
                session.destroy().await;
                return;
            }
        }
        if session.is_destroyed() || !session.mark_admitted() {
            return;
        }

        self.inner.metrics.session_authenticated();
        info!(
            session = session.id(),
            user_id = session.user_id(),
            peer = %session.real_ip(),
            "Session authenticated"
        );

        let hook = self.read_hooks().connect;
        if let Some(hook) = hook {
            spawn_hook("connect", hook, session);
        }
    }

    fn read_hooks(&self) -> Hooks {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `route` for `packet` on a fresh task. Failures and panics are
    /// logged; the packet is freed when the handler finishes.
    fn spawn_dispatch(&self, route: Arc<Route>, session: Arc<Session>, packet: Packet) {
        let app = self.clone();
        let session_id = session.id();
        let ctx = Context::new(self.clone(), session, packet);

        tokio::spawn(async move {
            let opcode = route.opcode();
            let outcome = AssertUnwindSafe(async move { route.call(ctx).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    app.inner.metrics.handler_failure();
                    warn!(session = session_id, opcode, error = %e, "Handler failed");
                }
                Err(panic) => {
                    app.inner.metrics.handler_panic();
                    let err = ProtocolError::HandlerPanic(panic_message(&*panic));
                    error!(session = session_id, opcode, error = %err, "Handler panicked");
                }
            }
        });
    }

    /// Deliver `message` to the session registered for `user_id`.
    ///
    /// An internal route for the message type is dispatched asynchronously as
    /// if the message had arrived from the peer. Otherwise the message is
    /// written under its outbound opcode. With no session for `user_id` this
    /// does nothing.
    pub async fn action<M: Message>(&self, user_id: u64, message: &M) -> Result<()> {
        let Some(session) = self.inner.registry.get(user_id).await else {
            debug!(user_id, message_type = %M::TYPE, "No session for action");
            return Ok(());
        };

        if let Some(route) = self.inner.router.resolve_internal(M::TYPE) {
            let packet = self.inner.pool.build(route.opcode(), &message.encode()?)?;
            self.spawn_dispatch(route, session, packet);
            return Ok(());
        }

        if let Some(opcode) = self.inner.router.resolve_outbound_opcode(M::TYPE) {
            return session.send_raw(opcode, &message.encode()?).await;
        }

        let err = ProtocolError::NotRegistered(M::TYPE.name());
        warn!(user_id, error = %err, "Action has no route");
        Err(err)
    }

    /// Stop accepting. Pending `run` calls return and tear the app down.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Tear down modules (reverse order), the listener and every session.
    /// Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down");

        let modules = std::mem::take(
            &mut *self
                .inner
                .modules
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for mut module in modules.into_iter().rev() {
            info!(module = module.name(), "Destroying module");
            module.on_destroy();
        }

        self.inner.shutdown.cancel();
        self.inner.listener.close().await;
        self.inner.registry.shutdown().await;
        self.inner.metrics.log_metrics();
    }
}

fn spawn_hook(kind: &'static str, hook: SessionHook, session: Arc<Session>) {
    tokio::spawn(async move {
        let session_id = session.id();
        let outcome = AssertUnwindSafe(async move { hook(session).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = session_id, hook = kind, error = %e, "Session hook failed"),
            Err(panic) => error!(
                session = session_id,
                hook = kind,
                panic = %panic_message(&*panic),
                "Session hook panicked"
            ),
        }
    });
}

impl AppInner {
    fn app(&self) -> Option<App> {
        self.me.upgrade().map(|inner| App { inner })
    }
}

impl SessionHandler for AppInner {
    fn on_message(&self, session: &Arc<Session>, packet: Packet) {
        self.metrics.packet_received(packet.as_bytes().len() as u64);

        let opcode = packet.opcode();
        let Some(route) = self.router.resolve_inbound(opcode) else {
            self.metrics.unroutable_packet();
            debug!(session = session.id(), opcode, "No route for opcode, dropping packet");
            return;
        };

        if let Some(app) = self.app() {
            app.spawn_dispatch(route, session.clone(), packet);
        }
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        if session.is_authenticated() {
            self.registry.remove(session);
        }
        if !session.take_admitted() {
            return;
        }

        let hook = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnect
            .clone();
        if let Some(hook) = hook {
            spawn_hook("disconnect", hook, session.clone());
        }
    }

    fn outbound_opcode(&self, message_type: MessageType) -> Option<u16> {
        self.router
            .resolve_internal(message_type)
            .map(|route| route.opcode())
            .or_else(|| self.router.resolve_outbound_opcode(message_type))
    }

    fn on_packet_sent(&self, len: usize) {
        self.metrics.packet_sent(len as u64);
    }
}
