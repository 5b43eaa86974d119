//! # Ferrite Database Layer
//!
//! Task-aware connection management and pooling for the Ferrite framework.
//!
//! Thousands of concurrent lightweight tasks share a small number of real
//! database connections through this crate:
//!
//! - **Pooling** (`pool` module): per-name pools hand out checkouts, bounded
//!   by `max_connections` with FIFO waiters and a `wait_timeout`.
//! - **Per-checkout isolation**: hooks, query log, counters and transaction
//!   state registered during a checkout are wiped on release, so a later
//!   checkout of the same handle starts clean.
//! - **Shared-handle mode**: non-durable in-process SQLite stores
//!   (`:memory:`, `mode=memory` URIs) resolve every checkout to one resident
//!   handle, because pooling them naively would silently lose data.
//! - **Task-local context** (`context` module): connection overrides and
//!   per-task caches live in task-scoped storage, never visible to sibling
//!   tasks and not inherited by spawned children.
//!
//! Query building, ORM mapping and migrations are separate layers; they
//! consume only [`Connection::select`], [`Connection::statement`],
//! [`Connection::transaction`] and the [`ConnectionEstablished`] event.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use ferrite_db::{ConnectionManager, Context, DatabaseConfig, PoolFactory};
//!
//! # async fn example() -> ferrite_db::Result<()> {
//! let mut configs = HashMap::new();
//! configs.insert("default".to_string(), DatabaseConfig::sqlite("app.db"));
//! let manager = ConnectionManager::new(Arc::new(PoolFactory::new(configs)));
//!
//! Context::scope(async {
//!     let shared = manager.connection(None).await?;
//!     let mut checkout = shared.lock().await;
//!     let conn = checkout.connection().await?;
//!     conn.select("SELECT 1", vec![]).await?;
//!     drop(checkout);
//!     manager.release_all().await;
//!     Ok::<_, ferrite_db::DatabaseError>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod events;
pub mod manager;
pub mod pool;
pub mod types;

pub use config::{DatabaseConfig, PoolConfig};
pub use connection::Connection;
pub use context::Context;
pub use errors::{DatabaseError, Result};
pub use events::{ConnectionEstablished, ConnectionEventListener, EventDispatcher, without_events};
pub use manager::{ConnectionManager, SharedConnection};
pub use pool::{DbPool, PoolFactory, PooledConnection, is_in_memory_single_file};
pub use types::{QueryLogEntry, QueryResult, QueryValue, Row};

/// Re-export commonly used types.
#[allow(ambiguous_glob_reexports)]
pub mod prelude {
	pub use crate::config::*;
	pub use crate::connection::*;
	pub use crate::context::*;
	pub use crate::errors::*;
	pub use crate::events::*;
	pub use crate::manager::*;
	pub use crate::pool::*;
	pub use crate::types::*;
}
