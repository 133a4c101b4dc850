//! areakvd - area-partitioned replicated key-value store
//!
//! This crate provides:
//! - Versioned entry storage with deterministic conflict resolution
//! - TTL expiry, tombstones and refresh of self-originated keys
//! - Filtered snapshot-plus-delta subscriptions
//! - Rate-limited flooding over an optional spanning tree
//! - Full sync and periodic anti-entropy with peers

pub mod area;
pub mod config;
pub mod filter;
pub mod flood;
pub mod kvstore;
pub mod publisher;
pub mod server;
pub mod spt;
pub mod store;
pub mod sync;
pub mod ttl;

pub use config::{AreaConfig, Cli, KvStoreConfig, ValidationError};
pub use filter::CompiledFilter;
pub use kvstore::{KvStore, KvStoreError};
pub use publisher::{Subscription, SubscriptionError};
pub use server::Server;
