//! Connection pooling
//!
//! Hands out database connections to concurrent tasks: per-checkout pooling
//! for durable stores, a resident shared handle for non-durable in-process
//! ones, and a process-wide factory keyed by connection name.

pub mod factory;
// Allow module_inception: re-exporting the pool submodule from pool.rs is
// intentional so imports read `ferrite_db::pool::DbPool`.
#[allow(clippy::module_inception)]
pub mod pool;

pub use factory::PoolFactory;
pub use pool::{DbPool, IN_MEMORY_SENTINEL, PooledConnection, is_in_memory_single_file};
