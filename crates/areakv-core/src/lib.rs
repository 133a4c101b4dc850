//! areakv core library
//!
//! This crate provides the data model, wire message types, canonical
//! encoding and entry hashing shared by the areakv engine and transport.
//!
//! # Modules
//!
//! - [`types`]: Entries, identifiers, filters, publications, peer messages
//! - [`canonical`]: Deterministic serialization and entry hashing
//! - [`error`]: Error types

pub mod canonical;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
