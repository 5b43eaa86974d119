//! Basic connection pool tests
//! Covers pool creation, configuration validation, acquisition and release.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ferrite_db::{
	ConnectionEstablished, ConnectionEventListener, DatabaseConfig, DatabaseError, DbPool,
	EventDispatcher, PoolConfig, PoolFactory, QueryValue,
};

fn file_config(dir: &tempfile::TempDir, pool: PoolConfig) -> DatabaseConfig {
	let path = dir.path().join("test.db");
	DatabaseConfig::sqlite(path.to_string_lossy().into_owned()).with_pool(pool)
}

fn events() -> Arc<EventDispatcher> {
	Arc::new(EventDispatcher::new())
}

#[tokio::test]
async fn test_pool_creation_modes() {
	// Mode is fixed once at construction from the database identifier
	let shared = DbPool::new("mem", DatabaseConfig::sqlite(":memory:"), events())
		.expect("failed to create pool");
	assert!(shared.shared_handle_mode());

	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let file = DbPool::new("file", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");
	assert!(!file.shared_handle_mode());
	assert_eq!(file.config().pool.max_connections, 10);
}

#[tokio::test]
async fn test_pool_rejects_invalid_config() {
	let config = DatabaseConfig::sqlite(":memory:")
		.with_pool(PoolConfig::new().with_min_connections(10).with_max_connections(5));
	let result = DbPool::new("bad", config, events());
	assert!(matches!(result, Err(DatabaseError::Configuration(_))));

	let config = DatabaseConfig::sqlite(":memory:").with_pool(PoolConfig::new().with_max_connections(0));
	let result = DbPool::new("bad", config, events());
	assert!(matches!(result, Err(DatabaseError::Configuration(_))));
}

#[tokio::test]
async fn test_pool_rejects_unsupported_driver_eagerly() {
	let mut config = DatabaseConfig::sqlite(":memory:");
	config.driver = "postgres".to_string();
	// Detection happens at pool creation, before any handle is opened
	let result = DbPool::new("pg", config, events());
	assert!(matches!(result, Err(DatabaseError::Configuration(_))));
}

#[tokio::test]
async fn test_connection_acquisition_and_query() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let pool = DbPool::new("db", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	let conn = checkout.connection().await.expect("failed to bind connection");
	let rows = conn
		.select("SELECT 1 AS one", vec![])
		.await
		.expect("failed to execute query");
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].get::<i64>("one").expect("missing column"), 1);
	checkout.release().await;
}

#[tokio::test]
async fn test_release_returns_handle_to_idle_queue() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let pool = DbPool::new("db", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");
	assert_eq!(pool.current_connections().await, 0);

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	assert_eq!(pool.current_connections().await, 1);
	checkout.release().await;
	// The handle stays tracked as idle and is reused by the next checkout
	assert_eq!(pool.current_connections().await, 1);

	let mut again = pool.get().await.expect("failed to acquire connection");
	assert_eq!(pool.current_connections().await, 1);
	again.release().await;
}

#[tokio::test]
async fn test_close_discards_handle() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let pool = DbPool::new("db", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	assert_eq!(pool.current_connections().await, 1);
	checkout.close().await;
	assert_eq!(pool.current_connections().await, 0);
}

#[tokio::test]
async fn test_stale_checkout_after_release() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let pool = DbPool::new("db", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	checkout.release().await;
	let result = checkout.connection().await;
	assert!(matches!(result, Err(DatabaseError::StaleCheckout(_))));
	// Releasing again is a harmless no-op
	checkout.release().await;
}

#[tokio::test]
async fn test_flush_all_closes_idle_handles() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let pool = DbPool::new("db", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	checkout.release().await;
	assert_eq!(pool.current_connections().await, 1);
	pool.flush_all().await;
	assert_eq!(pool.current_connections().await, 0);
}

#[tokio::test]
async fn test_binding_round_trip() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let pool = DbPool::new("db", file_config(&dir, PoolConfig::default()), events())
		.expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	let conn = checkout.connection().await.expect("failed to bind connection");
	conn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT, score REAL, blob BLOB)")
		.await
		.expect("failed to create table");
	let result = conn
		.statement(
			"INSERT INTO items (label, score, blob) VALUES (?1, ?2, ?3)",
			vec![
				QueryValue::String("alpha".to_string()),
				QueryValue::Float(1.5),
				QueryValue::Bytes(vec![1, 2, 3]),
			],
		)
		.await
		.expect("failed to insert");
	assert_eq!(result.rows_affected, 1);

	let rows = conn
		.select(
			"SELECT label, score, blob FROM items WHERE label = ?1",
			vec![QueryValue::String("alpha".to_string())],
		)
		.await
		.expect("failed to select");
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].get::<String>("label").expect("label"), "alpha");
	assert_eq!(rows[0].get::<f64>("score").expect("score"), 1.5);
	assert_eq!(rows[0].get::<Vec<u8>>("blob").expect("blob"), vec![1, 2, 3]);
	checkout.release().await;
}

#[derive(Default)]
struct ConnectCounter {
	connects: AtomicUsize,
}

#[async_trait]
impl ConnectionEventListener for ConnectCounter {
	async fn connection_established(&self, _event: &ConnectionEstablished) {
		self.connects.fetch_add(1, Ordering::SeqCst);
	}
}

async fn counting_events() -> (Arc<EventDispatcher>, Arc<ConnectCounter>) {
	let dispatcher = Arc::new(EventDispatcher::new());
	let counter = Arc::new(ConnectCounter::default());
	let listener: Arc<dyn ConnectionEventListener> = counter.clone();
	dispatcher.add_listener(listener).await;
	(dispatcher, counter)
}

#[tokio::test]
async fn test_idle_handle_discarded_past_max_idle_time() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let (dispatcher, counter) = counting_events().await;
	let config = file_config(&dir, PoolConfig::new().with_max_idle_time(Some(Duration::ZERO)));
	let pool = DbPool::new("db", config, dispatcher).expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	assert_eq!(counter.connects.load(Ordering::SeqCst), 1);
	checkout.release().await;

	tokio::time::sleep(Duration::from_millis(5)).await;
	// The idle handle is past max_idle_time, so it is discarded and a
	// fresh physical handle opened in its place.
	let mut again = pool.get().await.expect("failed to acquire connection");
	assert_eq!(counter.connects.load(Ordering::SeqCst), 2);
	assert_eq!(pool.current_connections().await, 1);
	again.release().await;
}

#[tokio::test]
async fn test_idle_handle_reused_within_max_idle_time() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let (dispatcher, counter) = counting_events().await;
	let config =
		file_config(&dir, PoolConfig::new().with_max_idle_time(Some(Duration::from_secs(60))));
	let pool = DbPool::new("db", config, dispatcher).expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	checkout.release().await;
	let mut again = pool.get().await.expect("failed to acquire connection");
	assert_eq!(counter.connects.load(Ordering::SeqCst), 1, "idle handle was reused");
	again.release().await;
}

#[tokio::test]
async fn test_heartbeat_keeps_healthy_idle_handle() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let (dispatcher, counter) = counting_events().await;
	let config = file_config(
		&dir,
		PoolConfig::new()
			.with_heartbeat(Some(Duration::ZERO))
			.with_max_idle_time(None),
	);
	let pool = DbPool::new("db", config, dispatcher).expect("failed to create pool");

	let mut checkout = pool.get().await.expect("failed to acquire connection");
	checkout.release().await;

	tokio::time::sleep(Duration::from_millis(5)).await;
	// Past the heartbeat interval the idle handle is pinged before reuse;
	// a healthy handle survives the ping and no new one is opened.
	let mut again = pool.get().await.expect("failed to acquire connection");
	assert_eq!(counter.connects.load(Ordering::SeqCst), 1);
	assert_eq!(pool.current_connections().await, 1);
	again.release().await;
}

#[tokio::test]
async fn test_connect_timeout_bounds_physical_open() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let config = file_config(&dir, PoolConfig::new().with_connect_timeout(Duration::ZERO));
	let pool = DbPool::new("db", config, events()).expect("failed to create pool");

	let result = pool.get().await;
	assert!(matches!(result, Err(DatabaseError::ConnectionLost(_))));
	assert_eq!(pool.current_connections().await, 0);
}

#[tokio::test]
async fn test_factory_memoizes_pools() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let mut factory = PoolFactory::new(std::collections::HashMap::new());
	factory.register("db", file_config(&dir, PoolConfig::default()));

	let first = factory.get_pool("db").expect("failed to build pool");
	let second = factory.get_pool("db").expect("failed to build pool");
	assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_factory_rejects_unknown_connection_name() {
	let factory = PoolFactory::new(std::collections::HashMap::new());
	let result = factory.get_pool("nope");
	assert!(matches!(result, Err(DatabaseError::Configuration(_))));
}

#[tokio::test]
async fn test_factory_flush_pool_builds_fresh_pool() {
	let dir = tempfile::tempdir().expect("failed to create temp dir");
	let mut factory = PoolFactory::new(std::collections::HashMap::new());
	factory.register("db", file_config(&dir, PoolConfig::default()));

	let first = factory.get_pool("db").expect("failed to build pool");
	factory.flush_pool("db").await;
	let second = factory.get_pool("db").expect("failed to build pool");
	assert!(!Arc::ptr_eq(&first, &second));
}
