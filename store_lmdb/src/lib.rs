//! LMDB storage backend for skald.
//!
//! Implements the `KvStore` trait from `skald-store` using the `heed`
//! LMDB bindings. Each logical namespace maps to one named LMDB
//! database within a single environment.

pub mod environment;

pub use environment::{LmdbEnvironment, LmdbKv};
