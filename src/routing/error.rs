//! Error definitions for the routing module

use thiserror::Error;

/// Errors raised while compiling or registering a route
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The pattern cannot be compiled into a matcher
    ///
    /// Raised at registration time. A bad pattern is a programming error
    /// in the adapter, so the route is never registered.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl RoutingError {
    pub(crate) fn invalid(pattern: &str, reason: impl Into<String>) -> Self {
        RoutingError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a route or command handler that did not succeed
///
/// Handlers return this instead of panicking. The dispatcher only checks
/// the variant; nothing crosses back into the message delivery loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The command name is not handled by this route
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The handler ran and failed
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Wraps any displayable error as a handler failure
    pub fn failed(err: impl std::fmt::Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// A command payload that is not well-formed structured data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Malformed command payload: {0}")]
pub struct CommandParseError(pub String);
