//! User-supplied lifecycle units.

use crate::error::Result;
use crate::service::app::App;

/// A feature plugged into an [`App`].
///
/// `on_init` and `route` run in registration order before the accept loop
/// starts; `on_destroy` runs in reverse order during shutdown.
///
/// ```rust
/// use gamenet::error::Result;
/// use gamenet::service::{App, Module};
///
/// struct Chat;
///
/// impl Module for Chat {
///     fn name(&self) -> &str {
///         "chat"
///     }
///
///     fn route(&self, _app: &App) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn on_init(&mut self, _app: &App) -> Result<()> {
        Ok(())
    }

    /// Register routes with `app.register`.
    fn route(&self, app: &App) -> Result<()>;

    fn on_destroy(&mut self) {}
}
