//! Error taxonomy for the database layer

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by pools, checkouts and connections.
#[derive(Debug, Error)]
pub enum DatabaseError {
	/// `wait_timeout` elapsed with no free pool slot. Surfaced to the
	/// caller as-is; acquisition is never retried automatically.
	#[error("connection pool `{name}` exhausted after waiting {waited:?}")]
	PoolExhausted { name: String, waited: Duration },

	/// The handle was found dead on use. The connection drops its handle
	/// reference so the next access reconnects transparently.
	#[error("connection lost: {0}")]
	ConnectionLost(String),

	/// Commit or rollback attempted outside an active transaction, or a
	/// rollback target deeper than the current nesting level.
	#[error("transaction state error: {0}")]
	TransactionState(String),

	/// Unknown connection name or unsupported driver. Detected eagerly at
	/// pool creation, never lazily on first query.
	#[error("configuration error: {0}")]
	Configuration(String),

	/// A released or closed checkout was used again.
	#[error("stale checkout: {0}")]
	StaleCheckout(&'static str),

	#[error("column `{0}` not found in row")]
	ColumnNotFound(String),

	#[error("type conversion failed: {0}")]
	TypeConversion(String),

	#[error(transparent)]
	Driver(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
