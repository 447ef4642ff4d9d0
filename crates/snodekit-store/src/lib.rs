//! # snodekit-store
//!
//! Local persistence for the snode networking core, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` with typed helpers for the node pool, swarms,
//! retrieve cursors, seen message hashes and guard nodes, plus the async
//! [`SwarmStore`] trait the services are written against.

pub mod database;
pub mod guard_nodes;
pub mod last_hashes;
pub mod migrations;
pub mod models;
pub mod seen_messages;
pub mod snode_pool;
pub mod store;
pub mod swarms;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use store::{MemoryStore, SqliteStore, SwarmStore};
