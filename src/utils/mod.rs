//! # Utility Modules
//!
//! Supporting utilities shared by the transports and the runtime.
//!
//! ## Components
//! - **Buffer Pool**: leased, reusable frame buffers with double-free detection
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Deadline wrappers and default timeouts
//! - **Metrics**: Thread-safe observability counters

use std::any::Any;

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod timeout;

/// Human-readable text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}
