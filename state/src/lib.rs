//! The skald state engine.
//!
//! Maintains the in-memory account map, the authenticated state trie,
//! the per-block delta log, and the latest-block pointer.

pub mod error;
pub mod statedb;

pub use error::StateError;
pub use statedb::ChainStateDb;
