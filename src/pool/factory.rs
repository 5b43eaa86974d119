//! Process-wide pool registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DatabaseConfig;
use crate::errors::{DatabaseError, Result};
use crate::events::{ConnectionEventListener, EventDispatcher};
use crate::pool::pool::DbPool;

/// Registry mapping connection name to its pool, created on demand.
///
/// Pool state is process-local; there is no cross-process coordination.
pub struct PoolFactory {
	configs: HashMap<String, DatabaseConfig>,
	pools: Mutex<HashMap<String, Arc<DbPool>>>,
	events: Arc<EventDispatcher>,
}

impl PoolFactory {
	pub fn new(configs: HashMap<String, DatabaseConfig>) -> Self {
		Self {
			configs,
			pools: Mutex::new(HashMap::new()),
			events: Arc::new(EventDispatcher::new()),
		}
	}

	/// Register (or replace) a named configuration. Pools already built for
	/// `name` are unaffected until flushed.
	pub fn register(&mut self, name: impl Into<String>, config: DatabaseConfig) {
		self.configs.insert(name.into(), config);
	}

	pub fn events(&self) -> &Arc<EventDispatcher> {
		&self.events
	}

	pub async fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
		self.events.add_listener(listener).await;
	}

	/// Pool for `name`, creating and memoizing it on first call.
	///
	/// Unknown names and unsupported drivers fail here, eagerly; handle
	/// creation failures surface lazily on first acquire.
	pub fn get_pool(&self, name: &str) -> Result<Arc<DbPool>> {
		if let Some(pool) = self.pools.lock().get(name) {
			return Ok(Arc::clone(pool));
		}
		let config = self
			.configs
			.get(name)
			.ok_or_else(|| {
				DatabaseError::Configuration(format!("unknown database connection `{name}`"))
			})?
			.clone();
		let pool = DbPool::new(name, config, Arc::clone(&self.events))?;
		let mut pools = self.pools.lock();
		// A concurrent creator may have won the race; keep the first pool.
		let entry = pools.entry(name.to_string()).or_insert(pool);
		Ok(Arc::clone(entry))
	}

	/// Close every idle handle and the shared handle (if any) owned by the
	/// pool for `name`, then drop it from the registry. A later `get_pool`
	/// builds a fresh pool.
	pub async fn flush_pool(&self, name: &str) {
		let pool = self.pools.lock().remove(name);
		if let Some(pool) = pool {
			pool.flush_all().await;
		}
	}

	/// Apply [`PoolFactory::flush_pool`] to every registered pool.
	pub async fn flush_all(&self) {
		let drained: Vec<Arc<DbPool>> = {
			let mut pools = self.pools.lock();
			pools.drain().map(|(_, pool)| pool).collect()
		};
		for pool in drained {
			pool.flush_all().await;
		}
	}
}
