//! Homeline: an MQTT hub hosting vendor integrations.
//!
//! Each integration gets its own broker session, a namespace in the shared
//! state file and a pattern router for topics and commands. See
//! [`integrations`] for the adapter contract.

pub mod config;
pub mod integrations;
pub mod mqtt;
pub mod persistence;
pub mod routing;
