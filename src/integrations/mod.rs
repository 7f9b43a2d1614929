//! # Integrations
//!
//! Vendor adapters (alarm panels, lighting controllers, ...) plug into the
//! hub by implementing [`Integration`]. The hub gives each adapter an
//! [`IntegrationRuntime`]: its own broker session, its own state namespace
//! and a router for topic patterns and commands.
//!
//! ```text
//! IntegrationSupervisor
//!    ├── Registry ── descriptor.module ──► Arc<dyn Integration>
//!    └── per integration:
//!          ConnectionSession ──inbound──► IntegrationRuntime::dispatch
//!                                            ├── RouteTable (first match)
//!                                            └── Integration::on_message (no match)
//! ```
//!
//! Adapters are compiled in and looked up by name in a [`Registry`]; no
//! code is loaded from paths found in the configuration.

pub mod echo;
pub mod loader;
pub mod manager;
pub mod runtime;

pub use echo::EchoIntegration;
pub use loader::{IntegrationDescriptor, Registry};
pub use manager::{IntegrationStatus, IntegrationSupervisor};
pub use runtime::IntegrationRuntime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::mqtt::{InboundMessage, SessionError};
use crate::persistence::StoreError;
use crate::routing::RoutingError;

/// A vendor adapter hosted by the hub
#[async_trait]
pub trait Integration: Send + Sync {
    /// Stable identifier used for logging and as the state namespace.
    ///
    /// Declared, never derived from a type name: renaming the adapter type
    /// must not move its persisted state to a new, empty namespace.
    fn canonical_name(&self) -> &'static str;

    /// Registers routes and subscriptions and starts the adapter's own work.
    ///
    /// Any retry policy (re-authentication, polling backoff) belongs here;
    /// the supervisor never retries a failed init.
    async fn init(&self, runtime: &IntegrationRuntime) -> Result<(), IntegrationError>;

    async fn destroy(&self, _runtime: &IntegrationRuntime) -> Result<(), IntegrationError> {
        Ok(())
    }

    /// Messages on raw subscriptions that no route matched
    async fn on_message(&self, _runtime: &IntegrationRuntime, message: InboundMessage) {
        warn!("No route for {}", message.topic);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Unknown integration module '{0}'")]
    UnknownModule(String),

    #[error("Invalid config for {id}: {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("Failed to serialize payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A device or service an adapter exposes, published under
/// `<prefix>/entity/<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub default_state: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}
