//! # Topic Routing
//!
//! Turns adapter-declared topic patterns into broker subscriptions and
//! dispatches inbound messages to the handler of the first matching route.
//!
//! ## Module Architecture
//!
//! ```text
//! routing/
//! ├── pattern.rs  - `<name>` patterns, matching and wildcard subscriptions
//! ├── command.rs  - Command envelope parsing and error reporting
//! └── error.rs    - Routing and handler errors
//! ```
//!
//! ## Tie-Break Rule
//!
//! Two patterns may both match one topic (`lights/<id>/set` and
//! `lights/all/set`). This is not an error: routes are tried in
//! registration order and the first structural match wins. Adapters that
//! need the specific route to win must register it first.

pub mod command;
pub mod error;
pub mod pattern;

pub use command::{command_route, Command};
pub use error::{CommandParseError, HandlerError, RoutingError};
pub use pattern::{ParamMap, TopicPattern};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub type HandlerResult = Result<(), HandlerError>;

/// Handler invoked with the match information and the raw payload
pub type RouteHandler = Arc<dyn Fn(RouteInfo, Bytes) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Boxes an async closure into a [`RouteHandler`]
pub fn route_handler<F, Fut>(f: F) -> RouteHandler
where
    F: Fn(RouteInfo, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |info, payload| f(info, payload).boxed())
}

/// What a handler learns about the message it was dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    /// Pattern text of the route that matched
    pub pattern: String,
    /// Concrete topic the message arrived on
    pub topic: String,
    /// Parameter bindings for this message only
    pub params: ParamMap,
}

/// A compiled pattern and the handler it dispatches to
pub struct Route {
    pattern: TopicPattern,
    subscription_topic: String,
    handler: RouteHandler,
}

impl Route {
    pub fn new(pattern: TopicPattern, handler: RouteHandler) -> Self {
        let subscription_topic = pattern.subscription_topic();
        Self {
            pattern,
            subscription_topic,
            handler,
        }
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    pub fn subscription_topic(&self) -> &str {
        &self.subscription_topic
    }

    /// Runs the handler for a topic this route already matched
    pub async fn invoke(&self, info: RouteInfo, payload: Bytes) -> HandlerResult {
        (self.handler)(info, payload).await
    }
}

/// Ordered list of routes owned by one integration
///
/// Lookups iterate a snapshot, so a handler may register routes while it
/// runs without disturbing the dispatch in progress.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and appends a route. Nothing is registered on error.
    pub fn register(&self, pattern: &str, handler: RouteHandler) -> Result<Arc<Route>, RoutingError> {
        let compiled = TopicPattern::compile(pattern)?;
        let route = Arc::new(Route::new(compiled, handler));
        debug!(
            "Registered route {} -> {}",
            route.pattern(),
            route.subscription_topic()
        );
        self.routes.write().push(route.clone());
        Ok(route)
    }

    pub fn snapshot(&self) -> Vec<Arc<Route>> {
        self.routes.read().clone()
    }

    /// First route in registration order whose pattern matches `topic`
    pub fn find(&self, topic: &str) -> Option<(Arc<Route>, RouteInfo)> {
        self.snapshot().into_iter().find_map(|route| {
            route.pattern().matches(topic).map(|params| {
                let info = RouteInfo {
                    pattern: route.pattern().to_string(),
                    topic: topic.to_string(),
                    params,
                };
                (route, info)
            })
        })
    }

    /// De-duplicated subscription topics in registration order
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for route in self.routes.read().iter() {
            if !topics.iter().any(|t| t == route.subscription_topic()) {
                topics.push(route.subscription_topic().to_string());
            }
        }
        topics
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Drops every route; only called on runtime teardown
    pub fn clear(&self) {
        self.routes.write().clear();
    }
}
