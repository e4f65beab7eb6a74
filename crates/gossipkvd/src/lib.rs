//! gossipkvd - gossip-replicated key-value store
//!
//! This crate provides:
//! - A versioned replica with codec-driven merges ([`store`])
//! - Gossip dissemination over a pluggable transport ([`sync`])
//! - A supervised background service per node ([`kv`])
//! - Init-once lifecycle wrapping and failure relay ([`init`], [`watcher`])
//! - Diagnostics: message history and a JSON status report

pub mod config;
pub mod init;
pub mod kv;
pub mod message_log;
pub mod service;
pub mod status;
pub mod store;
pub mod sync;
pub mod watcher;

#[cfg(test)]
mod test_utils;

pub use config::{Config, KvConfig};
pub use init::{InitState, KvInitService, TransportFactory};
pub use kv::Kv;
pub use message_log::{Direction, Message, MessageLog};
pub use service::{Service, ServiceError, ServiceState};
pub use status::StatusReport;
pub use store::{KeyChange, MergeOutcome, Origin, Store, StoreError, Watch};
pub use sync::{Disseminator, MergeReport, SyncError, SyncStats};
pub use watcher::FailureWatcher;
