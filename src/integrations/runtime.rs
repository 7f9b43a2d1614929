//! Per-integration façade over session, state namespace and routes

use bytes::Bytes;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use super::{Entity, Integration, IntegrationError};
use crate::mqtt::{InboundMessage, SessionHandle};
use crate::persistence::{State, StateStore};
use crate::routing::{command_route, route_handler, Command, HandlerResult, RouteInfo, RouteTable};

/// Everything one adapter instance gets from the hub
///
/// Cloning is cheap; clones share the same session, routes and namespace.
#[derive(Clone)]
pub struct IntegrationRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    id: String,
    name: &'static str,
    device_id: String,
    config: Map<String, Value>,
    session: SessionHandle,
    store: StateStore,
    routes: RouteTable,
}

impl IntegrationRuntime {
    pub fn new(
        id: &str,
        name: &'static str,
        device_id: &str,
        config: Map<String, Value>,
        session: SessionHandle,
        store: StateStore,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                id: id.to_string(),
                name,
                device_id: device_id.to_string(),
                config,
                session,
                store,
                routes: RouteTable::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn canonical_name(&self) -> &'static str {
        self.inner.name
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.inner.config
    }

    /// Deserializes the descriptor's `config` mapping
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, IntegrationError> {
        serde_json::from_value(Value::Object(self.inner.config.clone())).map_err(|e| {
            IntegrationError::InvalidConfig {
                id: self.inner.id.clone(),
                reason: e.to_string(),
            }
        })
    }

    pub fn session(&self) -> &SessionHandle {
        &self.inner.session
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), IntegrationError> {
        self.inner.session.subscribe(topic)?;
        Ok(())
    }

    /// Publishes `value` serialized as JSON
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<(), IntegrationError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(topic, payload)
    }

    /// Publishes the payload bytes unchanged
    pub fn publish_raw(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), IntegrationError> {
        self.inner.session.publish(topic, payload)?;
        Ok(())
    }

    pub fn publish_entity(&self, prefix: &str, entity: &Entity) -> Result<(), IntegrationError> {
        self.publish(&format!("{}/entity/{}", prefix, entity.id), entity)
    }

    /// Registers a pattern route and subscribes to its wildcard topic.
    ///
    /// Routes are matched in registration order, first match wins.
    pub fn route<F, Fut>(&self, pattern: &str, handler: F) -> Result<(), IntegrationError>
    where
        F: Fn(RouteInfo, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let route = self.inner.routes.register(pattern, route_handler(handler))?;
        self.subscribe(route.subscription_topic())
    }

    /// Like [`route`](Self::route), but the payload is parsed as a
    /// [`Command`] and failures are reported on the error topic.
    pub fn route_command<F, Fut>(&self, pattern: &str, handler: F) -> Result<(), IntegrationError>
    where
        F: Fn(RouteInfo, Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = command_route(self.inner.session.clone(), handler);
        let route = self.inner.routes.register(pattern, handler)?;
        self.subscribe(route.subscription_topic())
    }

    pub async fn set_state(&self, partial: State) -> Result<(), IntegrationError> {
        self.inner.store.set_state(self.inner.name, partial).await?;
        Ok(())
    }

    pub async fn get_state(&self) -> State {
        self.inner.store.get_state(self.inner.name).await
    }

    pub fn log(&self, message: impl Display) {
        info!("{}", message);
    }

    pub fn error(&self, message: impl Display) {
        error!("{}", message);
    }

    /// Hands one inbound message to the first matching route, or to the
    /// adapter's raw message hook when nothing matches.
    ///
    /// Handler failures and panics are logged and end here.
    pub async fn dispatch(&self, adapter: &dyn Integration, message: InboundMessage) {
        debug!("< {}", message.topic);

        let outcome = match self.inner.routes.find(&message.topic) {
            Some((route, info)) => {
                let pattern = route.pattern().to_string();
                AssertUnwindSafe(route.invoke(info, message.payload.clone()))
                    .catch_unwind()
                    .await
                    .map(|result| result.map_err(|e| format!("route {}: {}", pattern, e)))
            }
            None => AssertUnwindSafe(adapter.on_message(self, message.clone()))
                .catch_unwind()
                .await
                .map(Ok),
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Error with {} on {}", e, message.topic),
            Err(_) => error!("Handler panicked on {}", message.topic),
        }
    }

    /// Delivers inbound messages one at a time, in transport order.
    pub(crate) fn spawn_dispatch(
        &self,
        adapter: Arc<dyn Integration>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> JoinHandle<()> {
        let runtime = self.clone();
        let span = tracing::info_span!("integration", id = %self.id(), name = self.canonical_name());
        tokio::spawn(
            async move {
                while let Some(message) = inbound.recv().await {
                    runtime.dispatch(adapter.as_ref(), message).await;
                }
                debug!("Dispatch loop stopped");
            }
            .instrument(span),
        )
    }

    /// Runs `destroy`, drops the routes and closes the session, all within
    /// `deadline`. `destroy` may use half of it; the session close gets
    /// whatever is left.
    pub async fn teardown(&self, adapter: &dyn Integration, deadline: Duration) {
        let started = Instant::now();
        match tokio::time::timeout(deadline / 2, adapter.destroy(self)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Error destroying {}: {}", self.id(), e),
            Err(_) => warn!("Destroying {} timed out", self.id()),
        }
        self.inner.routes.clear();

        let remaining = deadline.saturating_sub(started.elapsed());
        if let Err(e) = self.inner.session.shutdown(remaining).await {
            warn!("Error closing session of {}: {}", self.id(), e);
        }
    }
}
