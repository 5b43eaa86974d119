//! Connection manager facade
//!
//! Resolves "the current connection" for a task: a task-local override (set
//! by [`ConnectionManager::using_connection`]) wins over the caller's
//! argument, which wins over the configured default. Checkouts are cached in
//! the task-local context so repeated lookups within one task reuse the same
//! checkout; sibling tasks never share cache entries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::context::Context;
use crate::errors::Result;
use crate::pool::factory::PoolFactory;
use crate::pool::pool::PooledConnection;

const CONNECTION_OVERRIDE_KEY: &str = "database.connection_override";
const CONNECTION_CACHE_KEY: &str = "database.connections";

/// A checkout shared within one task via the context cache.
pub type SharedConnection = Arc<Mutex<PooledConnection>>;

type ConnectionCache = HashMap<String, SharedConnection>;

pub struct ConnectionManager {
	factory: Arc<PoolFactory>,
	default_connection: String,
}

impl ConnectionManager {
	pub fn new(factory: Arc<PoolFactory>) -> Self {
		Self {
			factory,
			default_connection: "default".to_string(),
		}
	}

	pub fn with_default(mut self, name: impl Into<String>) -> Self {
		self.default_connection = name.into();
		self
	}

	pub fn factory(&self) -> &Arc<PoolFactory> {
		&self.factory
	}

	pub fn default_connection(&self) -> &str {
		&self.default_connection
	}

	fn resolve_name(&self, name: Option<&str>) -> String {
		Context::get::<String>(CONNECTION_OVERRIDE_KEY)
			.or_else(|| name.map(str::to_string))
			.unwrap_or_else(|| self.default_connection.clone())
	}

	/// Resolve the current connection for this task.
	///
	/// An active task-local override wins regardless of `name`. Within a
	/// context scope the checkout is cached per resolved name; without one,
	/// every call is an independent checkout the caller must release.
	pub async fn connection(&self, name: Option<&str>) -> Result<SharedConnection> {
		let resolved = self.resolve_name(name);
		let cached = Context::with::<ConnectionCache, _, _>(CONNECTION_CACHE_KEY, |cache| {
			cache.get(&resolved).cloned()
		})
		.flatten();
		if let Some(shared) = cached {
			return Ok(shared);
		}
		let pooled = self.factory.get_pool(&resolved)?.get().await?;
		let shared: SharedConnection = Arc::new(Mutex::new(pooled));
		Context::with_default::<ConnectionCache, _, _>(CONNECTION_CACHE_KEY, |cache| {
			cache.insert(resolved.clone(), Arc::clone(&shared));
		});
		Ok(shared)
	}

	/// Make `name` the current connection for the dynamic extent of `f`.
	///
	/// The override is a task-local context entry: it is removed on normal
	/// return and on error, and is never visible to sibling or child tasks.
	/// Without an active context scope an ephemeral one is opened around `f`,
	/// so the override always applies within its extent.
	pub async fn using_connection<F, Fut, T>(&self, name: &str, f: F) -> T
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		Context::scope(Context::using(CONNECTION_OVERRIDE_KEY, name.to_string(), f())).await
	}

	/// Disconnect the handle of the task's cached connection for `name`.
	/// The next access reconnects transparently. No-op when nothing is
	/// cached.
	pub async fn disconnect(&self, name: Option<&str>) {
		let resolved = self.resolve_name(name);
		let cached = Context::with::<ConnectionCache, _, _>(CONNECTION_CACHE_KEY, |cache| {
			cache.get(&resolved).cloned()
		})
		.flatten();
		if let Some(shared) = cached {
			let mut checkout = shared.lock().await;
			if let Ok(conn) = checkout.connection_mut() {
				conn.disconnect();
			}
		}
	}

	/// Re-establish the cached connection for `name`, or acquire a fresh
	/// checkout when none is cached.
	pub async fn reconnect(&self, name: Option<&str>) -> Result<SharedConnection> {
		let resolved = self.resolve_name(name);
		let cached = Context::with::<ConnectionCache, _, _>(CONNECTION_CACHE_KEY, |cache| {
			cache.get(&resolved).cloned()
		})
		.flatten();
		match cached {
			Some(shared) => {
				{
					let mut checkout = shared.lock().await;
					if let Ok(conn) = checkout.connection_mut() {
						conn.reconnect().await?;
					}
				}
				Ok(shared)
			}
			None => self.connection(Some(&resolved)).await,
		}
	}

	/// Flush the pool for `name` and drop the task's cache entry, so the
	/// next `connection(name)` is an entirely fresh checkout from a fresh
	/// pool.
	pub async fn purge(&self, name: Option<&str>) {
		let resolved = self.resolve_name(name);
		let cached = Context::with::<ConnectionCache, _, _>(CONNECTION_CACHE_KEY, |cache| {
			cache.remove(&resolved)
		})
		.flatten();
		if let Some(shared) = cached {
			shared.lock().await.close().await;
		}
		self.factory.flush_pool(&resolved).await;
	}

	/// Return the task's cached checkout for `name` to its pool.
	pub async fn release(&self, name: Option<&str>) {
		let resolved = self.resolve_name(name);
		let cached = Context::with::<ConnectionCache, _, _>(CONNECTION_CACHE_KEY, |cache| {
			cache.remove(&resolved)
		})
		.flatten();
		if let Some(shared) = cached {
			shared.lock().await.release().await;
		}
	}

	/// Return every cached checkout of this task to its pool. Framework
	/// entry points call this at task teardown.
	pub async fn release_all(&self) {
		let drained: Vec<SharedConnection> = Context::take::<ConnectionCache>(CONNECTION_CACHE_KEY)
			.map(|cache| cache.into_values().collect())
			.unwrap_or_default();
		for shared in drained {
			shared.lock().await.release().await;
		}
	}
}
