//! # Sessions
//!
//! A [`Session`] wraps one accepted [`Connection`] for its whole life:
//!
//! ```text
//! Connected (user 0) ──set_identity──▶ Authenticated
//!        │                                  │
//!        └── grace window / read error / destroy / eviction ──▶ Destroyed
//! ```
//!
//! `Destroyed` is terminal. [`Session::destroy`] may be called from any task,
//! any number of times; only the first call has an effect.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::core::message::{Message, MessageType};
use crate::core::packet::{Packet, PacketPool};
use crate::error::{ProtocolError, Result};
use crate::transport::Connection;
use crate::utils::panic_message;

pub mod registry;

pub use registry::SessionRegistry;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const ADMISSION_PENDING: u8 = 0;
const ADMISSION_GRANTED: u8 = 1;
const ADMISSION_CLOSED: u8 = 2;

/// Receives what a session reads and observes its teardown.
pub trait SessionHandler: Send + Sync + 'static {
    /// Called in read order for every inbound packet.
    fn on_message(&self, session: &Arc<Session>, packet: Packet);

    /// Called exactly once, after the connection is closed.
    fn on_disconnect(&self, session: &Arc<Session>);

    /// Opcode [`Session::send`] writes a message of `message_type` under
    fn outbound_opcode(&self, message_type: MessageType) -> Option<u16>;

    fn on_packet_sent(&self, _len: usize) {}
}

pub struct Session {
    id: u64,
    conn: Arc<dyn Connection>,
    user_id: AtomicU64,
    authenticated: Notify,
    closed: CancellationToken,
    destroyed: AtomicBool,
    admission: AtomicU8,
    handler: Weak<dyn SessionHandler>,
    pool: PacketPool,
}

impl Session {
    pub fn new(
        conn: Arc<dyn Connection>,
        handler: Weak<dyn SessionHandler>,
        pool: PacketPool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            user_id: AtomicU64::new(0),
            authenticated: Notify::new(),
            closed: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            admission: AtomicU8::new(ADMISSION_PENDING),
            handler,
            pool,
        })
    }

    /// Process-unique, monotonically increasing id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Authenticated identity, or 0
    pub fn user_id(&self) -> u64 {
        self.user_id.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id() != 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn real_ip(&self) -> &str {
        self.conn.real_ip()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Token cancelled when the session is destroyed
    pub fn close_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Resolves once the session is destroyed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Bind the session to `user_id` and wake the authentication wait.
    ///
    /// Identities are set once. `0` is rejected with
    /// [`ProtocolError::InvalidIdentity`]; a second call fails with
    /// [`ProtocolError::AlreadyAuthenticated`] carrying the current identity.
    pub fn set_identity(&self, user_id: u64) -> Result<()> {
        if user_id == 0 {
            return Err(ProtocolError::InvalidIdentity);
        }

        self.user_id
            .compare_exchange(0, user_id, Ordering::AcqRel, Ordering::Acquire)
            .map_err(ProtocolError::AlreadyAuthenticated)?;

        debug!(session = self.id, user_id, "Session identity set");
        self.authenticated.notify_waiters();
        Ok(())
    }

    /// Resolves once an identity has been set.
    pub async fn wait_for_authentication(&self) {
        let notified = self.authenticated.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_authenticated() {
            return;
        }
        notified.await;
    }

    /// Record that the session was admitted. Fails once teardown has
    /// claimed the session, so admission and teardown pair up exactly.
    pub fn mark_admitted(&self) -> bool {
        self.admission
            .compare_exchange(
                ADMISSION_PENDING,
                ADMISSION_GRANTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Close admission. True if [`mark_admitted`](Self::mark_admitted)
    /// succeeded before this call; only the first call can return true.
    pub fn take_admitted(&self) -> bool {
        self.admission.swap(ADMISSION_CLOSED, Ordering::AcqRel) == ADMISSION_GRANTED
    }

    /// Encode `message` and push it under its outbound opcode.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        let handler = self.handler.upgrade().ok_or(ProtocolError::ConnectionClosed)?;
        let opcode = handler
            .outbound_opcode(M::TYPE)
            .ok_or(ProtocolError::NotRegistered(M::TYPE.name()))?;
        self.send_raw(opcode, &message.encode()?).await
    }

    /// Frame an already-encoded body and write it.
    pub async fn send_raw(&self, opcode: u16, body: &[u8]) -> Result<()> {
        if self.is_destroyed() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let packet = self.pool.build(opcode, body)?;
        let len = packet.as_bytes().len();
        self.conn.write_packet(packet).await?;

        if let Some(handler) = self.handler.upgrade() {
            handler.on_packet_sent(len);
        }
        Ok(())
    }

    /// Read until the connection fails or the session is destroyed, then
    /// destroy it. Panics inside the loop are contained here.
    #[instrument(skip(self), fields(session = self.id, peer = %self.real_ip()))]
    pub async fn run(self: Arc<Self>) {
        if let Err(panic) = AssertUnwindSafe(self.read_loop()).catch_unwind().await {
            let err = ProtocolError::HandlerPanic(panic_message(&*panic));
            error!(error = %err, "Session read loop panicked");
        }
        self.destroy().await;
    }

    async fn read_loop(self: &Arc<Self>) {
        loop {
            if self.closed.is_cancelled() {
                break;
            }

            match self.conn.read_packet().await {
                Ok(packet) => match self.handler.upgrade() {
                    Some(handler) => handler.on_message(self, packet),
                    None => break,
                },
                Err(e) if e.is_disconnect() => {
                    debug!("Peer disconnected");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Read failed, closing session");
                    break;
                }
            }
        }
    }

    /// Close the connection and notify the handler. Idempotent.
    pub async fn destroy(self: &Arc<Self>) {
        if self.mark_destroyed() {
            self.finish_destroy().await;
        }
    }

    /// Mark the session destroyed now and close the connection on a
    /// background task. Never waits on the peer.
    pub fn destroy_detached(self: &Arc<Self>) {
        if self.mark_destroyed() {
            let session = self.clone();
            tokio::spawn(async move { session.finish_destroy().await });
        }
    }

    /// True for the first caller only
    fn mark_destroyed(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        true
    }

    async fn finish_destroy(self: &Arc<Self>) {
        self.conn.close().await;
        info!(
            session = self.id,
            user_id = self.user_id(),
            peer = %self.real_ip(),
            "Session destroyed"
        );

        if let Some(handler) = self.handler.upgrade() {
            handler.on_disconnect(self);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local;
    use crate::transport::ConnTimeouts;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        opcodes: Mutex<Vec<u16>>,
        disconnects: AtomicU64,
    }

    impl SessionHandler for Recorder {
        fn on_message(&self, _session: &Arc<Session>, packet: Packet) {
            self.opcodes.lock().unwrap().push(packet.opcode());
        }

        fn on_disconnect(&self, _session: &Arc<Session>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn outbound_opcode(&self, _message_type: MessageType) -> Option<u16> {
            None
        }
    }

    async fn connected(
        handler: Weak<dyn SessionHandler>,
    ) -> (Arc<Session>, Arc<dyn Connection>, PacketPool) {
        let pool = PacketPool::new(4);
        let (listener, connector) = local::pipe(pool.clone(), ConnTimeouts::none());
        let client = connector.connect().await.unwrap();
        let server = crate::transport::Listener::accept(&listener).await.unwrap();
        (Session::new(server, handler, pool.clone()), client, pool)
    }

    #[tokio::test]
    async fn test_identity_is_set_once() {
        let (session, _client, _pool) = connected(Weak::<Recorder>::new()).await;
        assert!(!session.is_authenticated());

        assert!(matches!(session.set_identity(0), Err(ProtocolError::InvalidIdentity)));
        session.set_identity(7).unwrap();
        assert!(matches!(
            session.set_identity(8),
            Err(ProtocolError::AlreadyAuthenticated(7))
        ));
        assert_eq!(session.user_id(), 7);
    }

    #[tokio::test]
    async fn test_wait_for_authentication() {
        let (session, _client, _pool) = connected(Weak::<Recorder>::new()).await;
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_authentication().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        session.set_identity(3).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already authenticated: resolves immediately
        session.wait_for_authentication().await;
    }

    #[tokio::test]
    async fn test_run_delivers_in_order_and_destroys_once() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn SessionHandler> = recorder.clone();
        let (session, client, pool) = connected(Arc::downgrade(&handler)).await;

        let run = tokio::spawn(session.clone().run());
        for opcode in [1u16, 2, 3] {
            client.write_packet(pool.build(opcode, b"").unwrap()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close().await;
        run.await.unwrap();

        assert_eq!(*recorder.opcodes.lock().unwrap(), vec![1, 2, 3]);
        assert!(session.is_destroyed());

        session.destroy().await;
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_raw_after_destroy_fails() {
        let (session, _client, _pool) = connected(Weak::<Recorder>::new()).await;
        session.destroy().await;
        assert!(matches!(
            session.send_raw(5, b"x").await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_detached_destroy_marks_immediately() {
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn SessionHandler> = recorder.clone();
        let (session, client, _pool) = connected(Arc::downgrade(&handler)).await;

        session.destroy_detached();
        assert!(session.is_destroyed());
        assert!(session.close_token().is_cancelled());

        // The peer sees the close once the background task runs
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), client.read_packet())
                .await
                .unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        session.destroy().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_admission_pairs_with_teardown() {
        let (admitted, _c1, _) = connected(Weak::<Recorder>::new()).await;
        assert!(admitted.mark_admitted());
        assert!(!admitted.mark_admitted());
        assert!(admitted.take_admitted());
        assert!(!admitted.take_admitted());

        // Torn down first: admission can no longer be granted
        let (late, _c2, _) = connected(Weak::<Recorder>::new()).await;
        assert!(!late.take_admitted());
        assert!(!late.mark_admitted());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _ca, _) = connected(Weak::<Recorder>::new()).await;
        let (b, _cb, _) = connected(Weak::<Recorder>::new()).await;
        assert!(b.id() > a.id());
    }
}
