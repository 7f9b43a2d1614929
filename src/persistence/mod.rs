//! # Persistence Module
//!
//! ## Why This Module Exists
//! Integrations need to keep small amounts of state across restarts:
//! authentication tokens, discovered device ids, the last known mode of an
//! alarm panel. This module provides one JSON document on disk, partitioned
//! into one namespace per integration.
//!
//! ## Key Abstractions
//! - **Namespaces**: Each integration only sees its own partition, keyed by
//!   its canonical name
//! - **Shallow merge**: `set_state` overwrites the keys it is given and keeps
//!   every other key, in its own namespace and in all others
//! - **Write-through**: Every mutation is on disk before `set_state` returns
//!
//! ## Error Handling Strategy
//! Unlike configuration, persisted state is never silently reset. A state
//! file that exists but cannot be parsed stops the process at startup with
//! [`StoreError::Corrupt`]; a missing file is treated as a fresh install.
//!
//! ## Concurrency
//! Single process, single writer, last write wins. The document lock is held
//! while the file is rewritten, so concurrent updates to different
//! namespaces are serialized and none of them is lost.

pub mod state_store;

pub use state_store::{resolve_path, State, StateStore, StoreError, DEFAULT_STATE_PATH};
