//! Route tables and registration.
//!
//! Three independent tables:
//!
//! | key          | value   | used for                                  |
//! |--------------|---------|-------------------------------------------|
//! | opcode       | `Route` | inbound packets                           |
//! | message type | `Route` | internal re-dispatch through `App::action` |
//! | message type | opcode  | pushing messages that have no handler     |
//!
//! Registration is expected to finish before traffic starts, but the tables
//! tolerate concurrent reads and writes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::core::message::{Message, MessageType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::Context;
use crate::protocol::middleware::{validate_session, Handler, HandlerFuture, Middleware};
use crate::protocol::opcode::RawOpcode;

/// A handler with its middleware chain already applied.
pub struct Route {
    opcode: u16,
    message_type: MessageType,
    internal: bool,
    middleware_count: usize,
    handler: Handler,
}

impl Route {
    fn compose(
        opcode: u16,
        message_type: MessageType,
        internal: bool,
        handler: Handler,
        chain: Vec<Middleware>,
    ) -> Self {
        let middleware_count = chain.len();
        // Wrap from last to first so the first middleware runs outermost
        let handler = chain
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware(next));

        Self {
            opcode,
            message_type,
            internal,
            middleware_count,
            handler,
        }
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware_count
    }

    /// Run the middleware chain and handler for `ctx`.
    pub fn call(&self, ctx: Context) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("opcode", &self.opcode)
            .field("message_type", &self.message_type)
            .field("internal", &self.internal)
            .field("middleware_count", &self.middleware_count)
            .finish()
    }
}

/// Options consumed by [`Router::register`].
///
/// ```rust
/// use gamenet::protocol::{handler, RegisterParams};
///
/// let params = RegisterParams::new()
///     .with_handler(handler(|_ctx| async { Ok(()) }))
///     .with_skip_validation();
/// # let _ = params;
/// ```
#[derive(Default)]
pub struct RegisterParams {
    handler: Option<Handler>,
    internal: bool,
    middleware: Vec<Middleware>,
    skip_validation: bool,
}

impl RegisterParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Key the route by message type instead of opcode.
    pub fn with_internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Append a middleware; middleware runs in the order added.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Do not require an authenticated session.
    pub fn with_skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }
}

#[derive(Default)]
pub struct Router {
    inbound: RwLock<HashMap<u16, Arc<Route>>>,
    internal: RwLock<HashMap<MessageType, Arc<Route>>>,
    outbound: RwLock<HashMap<MessageType, u16>>,
}

fn write_lock_error<T>(_: PoisonError<T>) -> ProtocolError {
    ProtocolError::Custom(constants::ERR_ROUTER_WRITE_LOCK.to_string())
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register message type `M` under `opcode`.
    ///
    /// Without a handler this only records the outbound opcode for `M`.
    /// Opcodes that do not narrow to a non-zero `u16` are rejected.
    pub fn register<M: Message>(
        &self,
        opcode: impl Into<RawOpcode>,
        params: RegisterParams,
    ) -> Result<()> {
        let opcode = opcode.into().narrow()?;

        let Some(handler) = params.handler else {
            let previous = self
                .outbound
                .write()
                .map_err(write_lock_error)?
                .insert(M::TYPE, opcode);
            if let Some(previous) = previous.filter(|p| *p != opcode) {
                warn!(message_type = %M::TYPE, previous, opcode, "Outbound opcode replaced");
            }
            debug!(message_type = %M::TYPE, opcode, "Outbound opcode registered");
            return Ok(());
        };

        let mut chain = Vec::with_capacity(params.middleware.len() + 1);
        if !params.skip_validation {
            chain.push(validate_session());
        }
        chain.extend(params.middleware);

        let route = Arc::new(Route::compose(
            opcode,
            M::TYPE,
            params.internal,
            handler,
            chain,
        ));

        let replaced = if params.internal {
            self.internal
                .write()
                .map_err(write_lock_error)?
                .insert(M::TYPE, route)
                .is_some()
        } else {
            self.inbound
                .write()
                .map_err(write_lock_error)?
                .insert(opcode, route)
                .is_some()
        };

        if replaced {
            warn!(message_type = %M::TYPE, opcode, internal = params.internal, "Route replaced");
        }
        debug!(message_type = %M::TYPE, opcode, internal = params.internal, "Route registered");
        Ok(())
    }

    pub fn resolve_inbound(&self, opcode: u16) -> Option<Arc<Route>> {
        self.inbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&opcode)
            .cloned()
    }

    pub fn resolve_internal(&self, message_type: MessageType) -> Option<Arc<Route>> {
        self.internal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .cloned()
    }

    pub fn resolve_outbound_opcode(&self, message_type: MessageType) -> Option<u16> {
        self.outbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .copied()
    }

    /// Registered inbound opcodes, ascending
    pub fn inbound_opcodes(&self) -> Vec<u16> {
        let mut opcodes: Vec<u16> = self
            .inbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        opcodes.sort_unstable();
        opcodes
    }
}
