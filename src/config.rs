//! Connection and pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one named database connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
	/// Driver identifier. Only `sqlite` is supported by this crate.
	pub driver: String,
	/// Backing store identifier: a file path, `:memory:`, or a
	/// `file:` URI (possibly carrying a `mode=memory` query token).
	pub database: String,
	/// Table prefix applied by query-building consumers.
	#[serde(default)]
	pub prefix: String,
	#[serde(default)]
	pub pool: PoolConfig,
}

impl DatabaseConfig {
	/// Create a SQLite configuration with default pool settings.
	pub fn sqlite(database: impl Into<String>) -> Self {
		Self {
			driver: "sqlite".to_string(),
			database: database.into(),
			prefix: String::new(),
			pool: PoolConfig::default(),
		}
	}

	pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.prefix = prefix.into();
		self
	}

	pub fn with_pool(mut self, pool: PoolConfig) -> Self {
		self.pool = pool;
		self
	}

	pub fn validate(&self) -> Result<(), String> {
		if self.driver.is_empty() {
			return Err("driver must not be empty".to_string());
		}
		self.pool.validate()
	}
}

/// Pool sizing and timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
	/// Idle handles retained on release even when older than `max_idle_time`.
	#[serde(default = "default_min_connections")]
	pub min_connections: u32,
	/// Hard cap on live handles; acquisition waits once reached.
	#[serde(default = "default_max_connections")]
	pub max_connections: u32,
	/// Bound on opening a physical handle.
	#[serde(default = "default_connect_timeout")]
	pub connect_timeout: Duration,
	/// How long `get()` may wait for a free slot before `PoolExhausted`.
	#[serde(default = "default_wait_timeout")]
	pub wait_timeout: Duration,
	/// When set, idle handles older than this are pinged before reuse and
	/// replaced if dead.
	#[serde(default)]
	pub heartbeat: Option<Duration>,
	/// When set, idle handles older than this are discarded on checkout.
	#[serde(default = "default_max_idle_time")]
	pub max_idle_time: Option<Duration>,
}

fn default_min_connections() -> u32 {
	1
}

fn default_max_connections() -> u32 {
	10
}

fn default_connect_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_wait_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_max_idle_time() -> Option<Duration> {
	Some(Duration::from_secs(600))
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			min_connections: default_min_connections(),
			max_connections: default_max_connections(),
			connect_timeout: default_connect_timeout(),
			wait_timeout: default_wait_timeout(),
			heartbeat: None,
			max_idle_time: default_max_idle_time(),
		}
	}
}

impl PoolConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_min_connections(mut self, min: u32) -> Self {
		self.min_connections = min;
		self
	}

	pub fn with_max_connections(mut self, max: u32) -> Self {
		self.max_connections = max;
		self
	}

	pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
		self.wait_timeout = timeout;
		self
	}

	pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
		self.heartbeat = interval;
		self
	}

	pub fn with_max_idle_time(mut self, idle: Option<Duration>) -> Self {
		self.max_idle_time = idle;
		self
	}

	pub fn validate(&self) -> Result<(), String> {
		if self.max_connections == 0 {
			return Err("max_connections must be greater than zero".to_string());
		}
		if self.max_connections < self.min_connections {
			return Err("max_connections must be >= min_connections".to_string());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_pool_config_is_valid() {
		let config = PoolConfig::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.min_connections, 1);
		assert_eq!(config.max_connections, 10);
	}

	#[test]
	fn rejects_min_above_max() {
		let config = PoolConfig::new()
			.with_min_connections(10)
			.with_max_connections(5);
		assert!(config.validate().is_err());
	}

	#[test]
	fn rejects_zero_max() {
		let config = PoolConfig::new().with_max_connections(0);
		assert!(config.validate().is_err());
	}

	#[test]
	fn deserializes_with_defaults() {
		let config: DatabaseConfig =
			serde_json::from_str(r#"{"driver":"sqlite","database":":memory:"}"#)
				.expect("config should deserialize");
		assert_eq!(config.prefix, "");
		assert_eq!(config.pool.max_connections, 10);
	}
}
