//! Handler and middleware types.
//!
//! A middleware takes the next handler in the chain and returns a handler
//! that wraps it. Returning early without calling `next` short-circuits the
//! rest of the chain.
//!
//! ```rust
//! use gamenet::protocol::{middleware, Context, Handler, HandlerFuture};
//! use std::sync::Arc;
//!
//! let trace = middleware(|next: Handler| -> Handler {
//!     Arc::new(move |ctx: Context| -> HandlerFuture {
//!         let next = next.clone();
//!         Box::pin(async move {
//!             tracing::debug!(opcode = ctx.opcode(), "dispatch");
//!             next(ctx).await
//!         })
//!     })
//! });
//! # let _ = trace;
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{ProtocolError, Result};
use crate::protocol::context::Context;

pub type HandlerFuture = BoxFuture<'static, Result<()>>;

/// Terminal request handler
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

/// Wraps a handler in another handler
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Box an async function as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: Context| -> HandlerFuture { Box::pin(f(ctx)) })
}

pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Reject requests from sessions without an identity.
pub fn validate_session() -> Middleware {
    middleware(|next: Handler| -> Handler {
        Arc::new(move |ctx: Context| -> HandlerFuture {
            if !ctx.session().is_authenticated() {
                return Box::pin(async { Err(ProtocolError::SessionInvalid) });
            }
            next(ctx)
        })
    })
}
