#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod registry;
pub mod renewal;
pub mod shutdown;
pub mod signals;

pub mod test_utils;

pub use client::{AgentProtectionClient, NoopProtectionApi, ProtectionApi, ProtectionClient};
pub use config::ProtectionConfig;
pub use error::{Error, Result};
pub use manager::{ProtectionManager, ProtectionStatus};
pub use shutdown::{ExitStatus, ShutdownReason};

/// Identifier for one critical processing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
