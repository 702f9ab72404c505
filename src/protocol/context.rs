//! Per-request context handed to route handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::message::Message;
use crate::core::packet::Packet;
use crate::error::Result;
use crate::service::app::App;
use crate::session::Session;

/// One dispatched packet together with the session it arrived on.
///
/// The packet is freed when the context is dropped, so every exit path of a
/// handler (including a panic) releases it.
pub struct Context {
    app: App,
    session: Arc<Session>,
    packet: Packet,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(app: App, session: Arc<Session>, packet: Packet) -> Self {
        let cancel = session.close_token().child_token();
        Self {
            app,
            session,
            packet,
            cancel,
        }
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn opcode(&self) -> u16 {
        self.packet.opcode()
    }

    /// Raw body bytes
    pub fn body(&self) -> &[u8] {
        self.packet.body()
    }

    /// Decode the body as `M`.
    pub fn bind<M: Message>(&self) -> Result<M> {
        M::decode(self.packet.body())
    }

    /// Cancelled when the session is destroyed or the request is abandoned.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
