//! Registry error types

use super::frame::ChannelId;
use super::link::{LinkId, Role};

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registry is closing; no new links are accepted
    #[error("registry is shutting down")]
    ShuttingDown,

    /// A link was registered under the wrong role
    #[error("link {link} has role {actual}, expected {expected}")]
    RoleMismatch {
        link: LinkId,
        expected: &'static str,
        actual: Role,
    },

    /// The link is already registered
    #[error("link {link} already registered on channel {channel}")]
    AlreadyRegistered { link: LinkId, channel: ChannelId },
}
