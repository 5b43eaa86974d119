//! Logical database connection
//!
//! A `Connection` binds one pooled handle to the task that checked it out.
//! Everything registered here — hooks, the query log, duration and error
//! counters, the pretending flag — is transient checkout state and is wiped
//! by the pool on release, so a later checkout of the same handle starts
//! clean.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};
use tracing::debug;

use crate::errors::{DatabaseError, Result};
use crate::events::{ConnectionEstablished, EventDispatcher};
use crate::pool::pool::{DbPool, Handle};
use crate::types::{QueryLogEntry, QueryResult, QueryValue, Row};

type StatementHook = Box<dyn Fn(&str) + Send>;
type TransactionHook = Box<dyn Fn() + Send>;
type SlowQueryHook = Box<dyn Fn(Duration) + Send>;

struct SlowQueryWatcher {
	threshold: Duration,
	fired: bool,
	hook: SlowQueryHook,
}

/// Logical database client bound to one pooled handle.
pub struct Connection {
	name: String,
	prefix: String,
	/// `None` after `disconnect()`; the next access reconnects.
	handle: Option<Handle>,
	pool: Arc<DbPool>,
	events: Arc<EventDispatcher>,
	transaction_depth: usize,
	before_executing_hooks: Vec<StatementHook>,
	before_transaction_hooks: Vec<TransactionHook>,
	slow_query_watchers: Vec<SlowQueryWatcher>,
	query_log: Vec<QueryLogEntry>,
	logging_queries: bool,
	total_duration: Duration,
	error_count: u64,
	pretending: bool,
	reads_on_write_connection: bool,
}

impl Connection {
	pub(crate) fn new(
		name: String,
		prefix: String,
		handle: Handle,
		pool: Arc<DbPool>,
		events: Arc<EventDispatcher>,
	) -> Self {
		Self {
			name,
			prefix,
			handle: Some(handle),
			pool,
			events,
			transaction_depth: 0,
			before_executing_hooks: Vec::new(),
			before_transaction_hooks: Vec::new(),
			slow_query_watchers: Vec::new(),
			query_log: Vec::new(),
			logging_queries: false,
			total_duration: Duration::ZERO,
			error_count: 0,
			pretending: false,
			reads_on_write_connection: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn table_prefix(&self) -> &str {
		&self.prefix
	}

	pub fn is_connected(&self) -> bool {
		self.handle.is_some()
	}

	// ------------------------------------------------------------------
	// Statement execution
	// ------------------------------------------------------------------

	/// Run a query and return its rows.
	pub async fn select(&mut self, sql: &str, bindings: Vec<QueryValue>) -> Result<Vec<Row>> {
		for hook in &self.before_executing_hooks {
			hook(sql);
		}
		if self.pretending {
			self.log_query(sql, &bindings, None);
			return Ok(Vec::new());
		}
		let handle = self.acquire_handle().await?;
		let started = Instant::now();
		let outcome = {
			let mut guard = handle.lock().await;
			bind_values(sqlx::query(sql), &bindings)
				.fetch_all(&mut *guard)
				.await
		};
		let elapsed = started.elapsed();
		match outcome {
			Ok(rows) => {
				self.finish_query(sql, &bindings, elapsed);
				rows.iter().map(decode_row).collect()
			}
			Err(err) => Err(self.register_failure(err)),
		}
	}

	/// Run a write statement and return the affected row count.
	pub async fn statement(
		&mut self,
		sql: &str,
		bindings: Vec<QueryValue>,
	) -> Result<QueryResult> {
		for hook in &self.before_executing_hooks {
			hook(sql);
		}
		if self.pretending {
			self.log_query(sql, &bindings, None);
			return Ok(QueryResult { rows_affected: 0 });
		}
		let handle = self.acquire_handle().await?;
		let started = Instant::now();
		let outcome = {
			let mut guard = handle.lock().await;
			bind_values(sqlx::query(sql), &bindings)
				.execute(&mut *guard)
				.await
		};
		let elapsed = started.elapsed();
		match outcome {
			Ok(result) => {
				self.finish_query(sql, &bindings, elapsed);
				Ok(QueryResult {
					rows_affected: result.rows_affected(),
				})
			}
			Err(err) => Err(self.register_failure(err)),
		}
	}

	/// Run an unbound statement.
	pub async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
		self.statement(sql, Vec::new()).await
	}

	// ------------------------------------------------------------------
	// Transactions
	// ------------------------------------------------------------------

	/// Start a transaction, or a savepoint when one is already active.
	pub async fn begin_transaction(&mut self) -> Result<()> {
		if self.transaction_depth == 0 {
			for hook in &self.before_transaction_hooks {
				hook();
			}
			self.raw_statement("BEGIN").await?;
		} else {
			let savepoint = format!("SAVEPOINT trans{}", self.transaction_depth + 1);
			self.raw_statement(&savepoint).await?;
		}
		self.transaction_depth += 1;
		Ok(())
	}

	pub async fn commit(&mut self) -> Result<()> {
		match self.transaction_depth {
			0 => Err(DatabaseError::TransactionState(
				"commit outside of transaction".to_string(),
			)),
			1 => {
				self.raw_statement("COMMIT").await?;
				self.transaction_depth = 0;
				Ok(())
			}
			depth => {
				let savepoint = format!("RELEASE SAVEPOINT trans{depth}");
				self.raw_statement(&savepoint).await?;
				self.transaction_depth = depth - 1;
				Ok(())
			}
		}
	}

	/// Roll back to `to_level`, or one level when `None`.
	///
	/// `Some(0)` fully aborts all nesting with a single `ROLLBACK`.
	pub async fn rollback(&mut self, to_level: Option<usize>) -> Result<()> {
		if self.transaction_depth == 0 {
			return Err(DatabaseError::TransactionState(
				"rollback outside of transaction".to_string(),
			));
		}
		let target = to_level.unwrap_or(self.transaction_depth - 1);
		if target >= self.transaction_depth {
			return Err(DatabaseError::TransactionState(format!(
				"cannot roll back to level {target} from depth {}",
				self.transaction_depth
			)));
		}
		if target == 0 {
			self.raw_statement("ROLLBACK").await?;
		} else {
			let savepoint = format!("ROLLBACK TO SAVEPOINT trans{}", target + 1);
			self.raw_statement(&savepoint).await?;
		}
		self.transaction_depth = target;
		Ok(())
	}

	pub fn transaction_level(&self) -> usize {
		self.transaction_depth
	}

	/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
	pub async fn transaction<T, F>(&mut self, f: F) -> Result<T>
	where
		F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
	{
		self.begin_transaction().await?;
		match f(self).await {
			Ok(value) => {
				self.commit().await?;
				Ok(value)
			}
			Err(err) => {
				if let Err(rollback_err) = self.rollback(None).await {
					tracing::warn!(
						connection = %self.name,
						error = %rollback_err,
						"rollback after failed transaction closure also failed"
					);
				}
				Err(err)
			}
		}
	}

	// ------------------------------------------------------------------
	// Hooks and instrumentation
	// ------------------------------------------------------------------

	/// Register a hook fired with the statement text before each execution.
	pub fn before_executing<F>(&mut self, hook: F)
	where
		F: Fn(&str) + Send + 'static,
	{
		self.before_executing_hooks.push(Box::new(hook));
	}

	/// Register a hook fired when the transaction depth goes 0 -> 1.
	pub fn before_starting_transaction<F>(&mut self, hook: F)
	where
		F: Fn() + Send + 'static,
	{
		self.before_transaction_hooks.push(Box::new(hook));
	}

	/// Register a hook fired once when the cumulative query duration of this
	/// checkout crosses `threshold`.
	pub fn when_querying_for_longer_than<F>(&mut self, threshold: Duration, hook: F)
	where
		F: Fn(Duration) + Send + 'static,
	{
		self.slow_query_watchers.push(SlowQueryWatcher {
			threshold,
			fired: false,
			hook: Box::new(hook),
		});
	}

	pub fn enable_query_log(&mut self) {
		self.logging_queries = true;
	}

	pub fn disable_query_log(&mut self) {
		self.logging_queries = false;
	}

	pub fn is_logging_queries(&self) -> bool {
		self.logging_queries
	}

	pub fn query_log(&self) -> &[QueryLogEntry] {
		&self.query_log
	}

	pub fn flush_query_log(&mut self) {
		self.query_log.clear();
	}

	pub fn total_query_duration(&self) -> Duration {
		self.total_duration
	}

	pub fn error_count(&self) -> u64 {
		self.error_count
	}

	pub fn pretending(&self) -> bool {
		self.pretending
	}

	/// Force read statements onto the write connection for the rest of this
	/// checkout (cleared on release).
	pub fn use_write_connection_when_reading(&mut self, flag: bool) {
		self.reads_on_write_connection = flag;
	}

	pub fn is_reading_on_write_connection(&self) -> bool {
		self.reads_on_write_connection
	}

	/// Run `f` against a log-only execution path and return the statements
	/// that would have run. The pretending flag and the caller's query log
	/// are restored whether `f` succeeds or fails.
	pub async fn pretend<F>(&mut self, f: F) -> Result<Vec<QueryLogEntry>>
	where
		F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<()>>,
	{
		let was_pretending = self.pretending;
		let was_logging = self.logging_queries;
		let saved_log = std::mem::take(&mut self.query_log);
		self.pretending = true;
		self.logging_queries = true;

		let outcome = f(self).await;

		let captured = std::mem::replace(&mut self.query_log, saved_log);
		self.pretending = was_pretending;
		self.logging_queries = was_logging;
		outcome.map(|()| captured)
	}

	// ------------------------------------------------------------------
	// Handle lifecycle
	// ------------------------------------------------------------------

	/// Null the handle reference. The physical connection closes once no
	/// other holder references it; in shared-handle mode the pool's resident
	/// handle is untouched.
	pub fn disconnect(&mut self) {
		if self.handle.take().is_some() {
			self.pool.note_handle_dropped();
			debug!(connection = %self.name, "connection handle dropped");
		}
	}

	/// Re-establish the handle. For a shared-handle pool this rebinds to the
	/// pool's resident singleton (same identity), never an independent one.
	pub async fn reconnect(&mut self) -> Result<()> {
		if self.handle.is_some() {
			self.disconnect();
		}
		let handle = self.pool.reconnect_handle().await?;
		self.handle = Some(handle);
		self.events
			.dispatch(ConnectionEstablished {
				connection_name: self.name.clone(),
				database: self.pool.database().to_string(),
				reconnect: true,
			})
			.await;
		Ok(())
	}

	pub(crate) fn into_handle(mut self) -> Option<Handle> {
		self.handle.take()
	}

	/// Wipe all per-checkout transient state ahead of returning the handle
	/// to the pool. Returns `false` when the handle is dirty (an open
	/// transaction could not be rolled back) and must not be recycled.
	///
	/// Never fails: rollback errors are logged, not returned, so releasing a
	/// checkout cannot break the surrounding caller's flow.
	pub(crate) async fn reset_for_release(&mut self) -> bool {
		let mut clean = true;
		if self.transaction_depth > 0 {
			if let Err(err) = self.rollback(Some(0)).await {
				tracing::warn!(
					connection = %self.name,
					error = %err,
					"failed to roll back open transaction during release"
				);
				self.transaction_depth = 0;
				clean = false;
			}
		}
		self.before_executing_hooks.clear();
		self.before_transaction_hooks.clear();
		self.slow_query_watchers.clear();
		self.query_log.clear();
		self.logging_queries = false;
		self.total_duration = Duration::ZERO;
		self.error_count = 0;
		self.pretending = false;
		self.reads_on_write_connection = false;
		clean
	}

	// ------------------------------------------------------------------
	// Internals
	// ------------------------------------------------------------------

	async fn acquire_handle(&mut self) -> Result<Handle> {
		if self.handle.is_none() {
			self.reconnect().await?;
		}
		self.handle.clone().ok_or_else(|| {
			DatabaseError::ConnectionLost("handle unavailable after reconnect".to_string())
		})
	}

	/// Transaction control bypasses hooks and the query log.
	async fn raw_statement(&mut self, sql: &str) -> Result<()> {
		if self.pretending {
			return Ok(());
		}
		let handle = self.acquire_handle().await?;
		let outcome = {
			let mut guard = handle.lock().await;
			sqlx::query(sql).execute(&mut *guard).await
		};
		outcome.map_err(|err| self.register_failure(err))?;
		Ok(())
	}

	fn finish_query(&mut self, sql: &str, bindings: &[QueryValue], elapsed: Duration) {
		self.total_duration += elapsed;
		self.log_query(sql, bindings, Some(elapsed));
		let total = self.total_duration;
		for watcher in &mut self.slow_query_watchers {
			if !watcher.fired && total > watcher.threshold {
				watcher.fired = true;
				(watcher.hook)(total);
			}
		}
	}

	fn log_query(&mut self, sql: &str, bindings: &[QueryValue], duration: Option<Duration>) {
		if self.logging_queries {
			self.query_log.push(QueryLogEntry {
				sql: sql.to_string(),
				bindings: bindings.to_vec(),
				duration,
			});
		}
	}

	fn register_failure(&mut self, err: sqlx::Error) -> DatabaseError {
		self.error_count += 1;
		if is_connection_lost(&err) {
			// Drop the dead handle so the next access reconnects.
			self.disconnect();
			DatabaseError::ConnectionLost(err.to_string())
		} else {
			DatabaseError::Driver(err)
		}
	}
}

fn is_connection_lost(err: &sqlx::Error) -> bool {
	matches!(err, sqlx::Error::WorkerCrashed | sqlx::Error::Io(_))
}

fn bind_values<'q>(
	mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
	bindings: &[QueryValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
	for value in bindings {
		query = match value {
			QueryValue::Null => query.bind(Option::<i64>::None),
			QueryValue::Bool(v) => query.bind(*v),
			QueryValue::Int(v) => query.bind(*v),
			QueryValue::Float(v) => query.bind(*v),
			QueryValue::String(v) => query.bind(v.clone()),
			QueryValue::Bytes(v) => query.bind(v.clone()),
			QueryValue::Timestamp(v) => query.bind(*v),
			QueryValue::Uuid(v) => query.bind(*v),
		};
	}
	query
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
	let mut out = Row::new();
	for (index, column) in row.columns().iter().enumerate() {
		let raw = row.try_get_raw(index)?;
		let value = if raw.is_null() {
			QueryValue::Null
		} else {
			match raw.type_info().name() {
				"INTEGER" | "BOOLEAN" => QueryValue::Int(row.try_get::<i64, _>(index)?),
				"REAL" => QueryValue::Float(row.try_get::<f64, _>(index)?),
				"BLOB" => QueryValue::Bytes(row.try_get::<Vec<u8>, _>(index)?),
				_ => QueryValue::String(row.try_get::<String, _>(index)?),
			}
		};
		out.insert(column.name().to_string(), value);
	}
	Ok(out)
}
