//! Structured commands carried in message payloads
//!
//! Payload shape:
//!
//! ```json
//! { "id": "42", "name": "arm", "data": { "mode": "away" } }
//! ```
//!
//! When parsing or the handler fails, an error report is published to
//! `<topic>/cid/<id>/error` (or `<topic>/error` without an id) and the
//! message is dropped. Failures never reach the session's delivery loop.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use super::{route_handler, CommandParseError, HandlerError, HandlerResult, RouteHandler, RouteInfo};
use crate::mqtt::SessionHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Command {
    /// Parses a payload into a command. Partial commands do not exist:
    /// anything that is not a JSON object with a `name` fails.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandParseError> {
        serde_json::from_slice(payload).map_err(|e| CommandParseError(e.to_string()))
    }
}

/// Topic an error report goes to.
///
/// An id that is empty or not a single publishable topic level (`/`, `+`,
/// `#`) is treated as absent.
pub fn error_topic(topic: &str, id: Option<&str>) -> String {
    match id.filter(|id| is_topic_level(id)) {
        Some(id) => format!("{}/cid/{}/error", topic, id),
        None => format!("{}/error", topic),
    }
}

fn is_topic_level(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '+', '#'])
}

/// Error report payload: the original command plus an `error` field.
///
/// Without a parseable command the raw payload is echoed back as text.
pub fn error_report(command: Option<&Command>, payload: &[u8], message: &str) -> Value {
    let mut report = match command.map(serde_json::to_value) {
        Some(Ok(Value::Object(fields))) => fields,
        _ => {
            let mut fields = Map::new();
            fields.insert(
                "payload".to_string(),
                Value::String(String::from_utf8_lossy(payload).into_owned()),
            );
            fields
        }
    };
    report.insert("error".to_string(), Value::String(message.to_string()));
    Value::Object(report)
}

/// Wraps a command handler into a route handler that parses the payload
/// first and reports failures over `session`.
pub fn command_route<F, Fut>(session: SessionHandle, handler: F) -> RouteHandler
where
    F: Fn(RouteInfo, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let handler = Arc::new(handler);
    route_handler(move |info: RouteInfo, payload: Bytes| {
        let session = session.clone();
        let handler = handler.clone();
        async move {
            let command = match Command::parse(&payload) {
                Ok(command) => command,
                Err(e) => {
                    error!("Rejected command on {}: {}", info.topic, e);
                    report(&session, &info.topic, None, &payload, &e.to_string());
                    return Ok(());
                }
            };

            if let Err(e) = handler(info.clone(), command.clone()).await {
                match &e {
                    HandlerError::UnknownCommand(name) => {
                        error!("Unknown command '{}' on {}", name, info.topic)
                    }
                    HandlerError::Failed(reason) => error!(
                        "Error executing command '{}' on {}: {}",
                        command.name, info.topic, reason
                    ),
                }
                report(&session, &info.topic, Some(&command), &payload, &e.to_string());
            }
            Ok(())
        }
    })
}

fn report(session: &SessionHandle, topic: &str, command: Option<&Command>, payload: &[u8], message: &str) {
    let id = command.and_then(|c| c.id.as_deref());
    let body = error_report(command, payload, message);
    let result = serde_json::to_vec(&body)
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            session
                .publish(&error_topic(topic, id), bytes)
                .map_err(|e| e.to_string())
        });
    if let Err(e) = result {
        error!("Could not publish error report for {}: {}", topic, e);
    }
}
