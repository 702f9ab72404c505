//! Application messages carried in frame bodies.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Stable identity of a message kind, used as a routing key.
///
/// Computed once per kind, never per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(&'static str);

impl MessageType {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A typed message with a fixed [`MessageType`] and a bincode body.
///
/// ```rust
/// use gamenet::core::message::{Message, MessageType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Login {
///     token: String,
/// }
///
/// impl Message for Login {
///     const TYPE: MessageType = MessageType::new("account.Login");
/// }
///
/// let bytes = Login { token: "abc".into() }.encode().unwrap();
/// assert_eq!(Login::decode(&bytes).unwrap().token, "abc");
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: MessageType;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
