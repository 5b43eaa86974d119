//! Connection pool implementation
//!
//! A `DbPool` owns the physical handles for one named configuration. At
//! construction it inspects the backing-store identifier once and commits to
//! one of two modes:
//!
//! - **Per-checkout**: each checkout exclusively owns a handle drawn from an
//!   idle queue, bounded by `max_connections` with FIFO waiters.
//! - **Shared-handle**: non-durable in-process stores (`:memory:`,
//!   `mode=memory` URIs) get one resident handle that every checkout
//!   references. Pooling such a store per-checkout would hand every task its
//!   own private, empty database and silently lose data.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection as _, SqliteConnection};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::errors::{DatabaseError, Result};
use crate::events::{ConnectionEstablished, EventDispatcher};

/// Well-known identifier for a transient in-memory SQLite database.
pub const IN_MEMORY_SENTINEL: &str = ":memory:";

/// A live physical connection, shared behind a lock so that shared-handle
/// pools can hand the same handle to multiple concurrent checkouts.
pub(crate) type Handle = Arc<Mutex<SqliteConnection>>;

/// Whether `database` names a non-durable in-process, single-file store.
///
/// True for the `:memory:` sentinel and for identifiers carrying a
/// `mode=memory` query token delimited by `?`, `&`, or end-of-string. A
/// coincidental substring (a path named `mode_memory`) does not count.
pub fn is_in_memory_single_file(database: &str) -> bool {
	if database == IN_MEMORY_SENTINEL {
		return true;
	}
	match database.split_once('?') {
		Some((_, query)) => query.split('&').any(|token| token == "mode=memory"),
		None => false,
	}
}

struct IdleHandle {
	handle: Handle,
	idle_since: Instant,
}

struct SharedState {
	/// Lazily created resident handle; `None` until first acquire and again
	/// after a pool-level flush.
	handle: Mutex<Option<Handle>>,
}

struct CheckoutState {
	idle: SyncMutex<VecDeque<IdleHandle>>,
	/// One permit per allowed live handle. Tokio semaphores queue waiters
	/// FIFO, which is the fairness policy for exhausted pools.
	permits: Arc<Semaphore>,
	/// Handles alive in this pool: idle plus checked out.
	tracked: AtomicUsize,
}

enum PoolMode {
	Shared(SharedState),
	PerCheckout(CheckoutState),
}

/// Pool of handles for one named connection configuration.
pub struct DbPool {
	name: String,
	config: DatabaseConfig,
	events: Arc<EventDispatcher>,
	mode: PoolMode,
	/// Back-reference to the owning `Arc`, so checkouts can hold the pool
	/// alive without threading an `Arc` through every call.
	weak: Weak<DbPool>,
}

impl DbPool {
	/// Validate the configuration eagerly and fix the pooling mode.
	///
	/// Unsupported drivers and inconsistent pool bounds fail here, at pool
	/// creation, never lazily on the first query.
	pub fn new(
		name: impl Into<String>,
		config: DatabaseConfig,
		events: Arc<EventDispatcher>,
	) -> Result<Arc<Self>> {
		let name = name.into();
		config.validate().map_err(DatabaseError::Configuration)?;
		if config.driver != "sqlite" {
			return Err(DatabaseError::Configuration(format!(
				"unsupported driver `{}` for connection `{name}`",
				config.driver
			)));
		}
		let mode = if is_in_memory_single_file(&config.database) {
			PoolMode::Shared(SharedState {
				handle: Mutex::new(None),
			})
		} else {
			PoolMode::PerCheckout(CheckoutState {
				idle: SyncMutex::new(VecDeque::new()),
				permits: Arc::new(Semaphore::new(config.pool.max_connections as usize)),
				tracked: AtomicUsize::new(0),
			})
		};
		Ok(Arc::new_cyclic(|weak| Self {
			name,
			config,
			events,
			mode,
			weak: weak.clone(),
		}))
	}

	/// Strong handle on this pool. Fails only if the last external `Arc`
	/// was dropped while a checkout is still in flight.
	fn strong(&self) -> Result<Arc<Self>> {
		self.weak.upgrade().ok_or_else(|| {
			DatabaseError::ConnectionLost(format!("pool `{}` dropped during checkout", self.name))
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn config(&self) -> &DatabaseConfig {
		&self.config
	}

	pub fn database(&self) -> &str {
		&self.config.database
	}

	pub fn shared_handle_mode(&self) -> bool {
		matches!(self.mode, PoolMode::Shared(_))
	}

	/// Check out a connection.
	///
	/// Shared-handle mode never waits: every call binds a fresh checkout to
	/// the resident handle, creating it on first use. Per-checkout mode pops
	/// an idle handle, opens a new one while under `max_connections`, or
	/// suspends the calling task until a slot frees or `wait_timeout`
	/// elapses.
	pub async fn get(&self) -> Result<PooledConnection> {
		let this = self.strong()?;
		match &self.mode {
			PoolMode::Shared(state) => {
				let (handle, opened) = self.shared_handle(state).await?;
				if opened {
					self.dispatch_established(false).await;
				}
				Ok(PooledConnection::new(
					self.make_connection(handle)?,
					this,
					None,
				))
			}
			PoolMode::PerCheckout(state) => {
				let wait = self.config.pool.wait_timeout;
				let permit = match timeout(wait, Arc::clone(&state.permits).acquire_owned()).await
				{
					Ok(Ok(permit)) => permit,
					Ok(Err(_)) | Err(_) => {
						return Err(DatabaseError::PoolExhausted {
							name: self.name.clone(),
							waited: wait,
						});
					}
				};
				let (handle, opened) = self.checkout_handle(state).await?;
				if opened {
					self.dispatch_established(false).await;
				}
				debug!(pool = %self.name, opened, "connection checked out");
				Ok(PooledConnection::new(
					self.make_connection(handle)?,
					this,
					Some(permit),
				))
			}
		}
	}

	/// Number of tracked handles: idle plus checked out, or 1 once the
	/// shared handle exists.
	pub async fn current_connections(&self) -> usize {
		match &self.mode {
			PoolMode::Shared(state) => usize::from(state.handle.lock().await.is_some()),
			PoolMode::PerCheckout(state) => state.tracked.load(Ordering::SeqCst),
		}
	}

	/// Destroy all idle handles and the shared handle if present.
	///
	/// Handles currently checked out are untouched; they are discarded when
	/// their checkout ends.
	pub async fn flush_all(&self) {
		match &self.mode {
			PoolMode::Shared(state) => {
				if state.handle.lock().await.take().is_some() {
					debug!(pool = %self.name, "shared handle flushed");
				}
			}
			PoolMode::PerCheckout(state) => {
				let drained: Vec<IdleHandle> = {
					let mut idle = state.idle.lock();
					idle.drain(..).collect()
				};
				state.tracked.fetch_sub(drained.len(), Ordering::SeqCst);
				debug!(pool = %self.name, count = drained.len(), "idle handles flushed");
			}
		}
	}

	// ------------------------------------------------------------------
	// Handle plumbing (used by Connection and PooledConnection)
	// ------------------------------------------------------------------

	/// Handle for a reconnecting connection. Shared mode always resolves to
	/// the resident singleton, recreating it only when a flush removed it;
	/// per-checkout mode opens a fresh physical handle.
	pub(crate) async fn reconnect_handle(&self) -> Result<Handle> {
		match &self.mode {
			PoolMode::Shared(state) => {
				let (handle, _opened) = self.shared_handle(state).await?;
				Ok(handle)
			}
			PoolMode::PerCheckout(state) => {
				let handle = self.open_physical().await?;
				state.tracked.fetch_add(1, Ordering::SeqCst);
				Ok(handle)
			}
		}
	}

	/// A checked-out handle was physically dropped (disconnect, close, or
	/// drop without release).
	pub(crate) fn note_handle_dropped(&self) {
		if let PoolMode::PerCheckout(state) = &self.mode {
			state.tracked.fetch_sub(1, Ordering::SeqCst);
		}
	}

	/// Return a handle at the end of a checkout. Dirty handles (a failed
	/// rollback) are discarded instead of recycled; shared-mode handles stay
	/// resident in the pool and this is a no-op for them.
	pub(crate) fn recycle(&self, handle: Handle, clean: bool) {
		if let PoolMode::PerCheckout(state) = &self.mode {
			if clean {
				let mut idle = state.idle.lock();
				idle.push_back(IdleHandle {
					handle,
					idle_since: Instant::now(),
				});
			} else {
				drop(handle);
				state.tracked.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

	fn make_connection(&self, handle: Handle) -> Result<Connection> {
		Ok(Connection::new(
			self.name.clone(),
			self.config.prefix.clone(),
			handle,
			self.strong()?,
			Arc::clone(&self.events),
		))
	}

	async fn dispatch_established(&self, reconnect: bool) {
		self.events
			.dispatch(ConnectionEstablished {
				connection_name: self.name.clone(),
				database: self.config.database.clone(),
				reconnect,
			})
			.await;
	}

	async fn shared_handle(&self, state: &SharedState) -> Result<(Handle, bool)> {
		let mut slot = state.handle.lock().await;
		if let Some(handle) = slot.as_ref() {
			return Ok((Arc::clone(handle), false));
		}
		let handle = self.open_physical().await?;
		*slot = Some(Arc::clone(&handle));
		Ok((handle, true))
	}

	/// Pop a usable idle handle or open a fresh one. The caller already
	/// holds a permit, so opening cannot exceed `max_connections`.
	async fn checkout_handle(&self, state: &CheckoutState) -> Result<(Handle, bool)> {
		loop {
			let candidate = state.idle.lock().pop_front();
			let Some(entry) = candidate else {
				let handle = self.open_physical().await?;
				state.tracked.fetch_add(1, Ordering::SeqCst);
				return Ok((handle, true));
			};
			if let Some(max_idle) = self.config.pool.max_idle_time {
				if entry.idle_since.elapsed() > max_idle {
					state.tracked.fetch_sub(1, Ordering::SeqCst);
					debug!(pool = %self.name, "discarded idle handle past max_idle_time");
					continue;
				}
			}
			if let Some(heartbeat) = self.config.pool.heartbeat {
				if entry.idle_since.elapsed() > heartbeat && !ping(&entry.handle).await {
					state.tracked.fetch_sub(1, Ordering::SeqCst);
					warn!(pool = %self.name, "discarded dead idle handle");
					continue;
				}
			}
			return Ok((entry.handle, false));
		}
	}

	async fn open_physical(&self) -> Result<Handle> {
		let options = if is_in_memory_single_file(&self.config.database) {
			SqliteConnectOptions::from_str("sqlite::memory:")?
		} else {
			SqliteConnectOptions::new()
				.filename(&self.config.database)
				.create_if_missing(true)
				.busy_timeout(Duration::from_secs(5))
		};
		match timeout(self.config.pool.connect_timeout, options.connect()).await {
			Ok(conn) => Ok(Arc::new(Mutex::new(conn?))),
			Err(_) => Err(DatabaseError::ConnectionLost(format!(
				"connect to `{}` timed out after {:?}",
				self.config.database, self.config.pool.connect_timeout
			))),
		}
	}
}

async fn ping(handle: &Handle) -> bool {
	let mut guard = handle.lock().await;
	guard.ping().await.is_ok()
}

/// A checkout: one `Connection` bound to one pool (and, in per-checkout
/// mode, one pool slot).
///
/// States: checked out, then released (handle back to the idle queue) or
/// closed (handle discarded). Released and closed checkouts are inert; using
/// them yields `StaleCheckout`.
pub struct PooledConnection {
	conn: Option<Connection>,
	pool: Arc<DbPool>,
	permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
	pub(crate) fn new(
		conn: Connection,
		pool: Arc<DbPool>,
		permit: Option<OwnedSemaphorePermit>,
	) -> Self {
		Self {
			conn: Some(conn),
			pool,
			permit,
		}
	}

	pub fn pool(&self) -> &Arc<DbPool> {
		&self.pool
	}

	/// The bound connection, transparently reconnecting its handle if it was
	/// disconnected. A (re)connect dispatches `ConnectionEstablished`.
	pub async fn connection(&mut self) -> Result<&mut Connection> {
		match self.conn.as_mut() {
			Some(conn) => {
				if !conn.is_connected() {
					conn.reconnect().await?;
				}
				Ok(conn)
			}
			None => Err(DatabaseError::StaleCheckout(
				"checkout already released or closed",
			)),
		}
	}

	/// The bound connection without the transparent reconnect.
	pub fn connection_mut(&mut self) -> Result<&mut Connection> {
		self.conn.as_mut().ok_or(DatabaseError::StaleCheckout(
			"checkout already released or closed",
		))
	}

	/// End the checkout: roll back any open transaction (all levels), wipe
	/// the per-checkout transient state, and hand the handle back.
	///
	/// Never fails; cleanup errors are logged and the dirty handle is
	/// discarded rather than recycled. Idempotent.
	pub async fn release(&mut self) {
		let Some(mut conn) = self.conn.take() else {
			return;
		};
		let clean = conn.reset_for_release().await;
		match conn.into_handle() {
			Some(handle) => self.pool.recycle(handle, clean),
			// Already disconnected; nothing to return.
			None => {}
		}
		self.permit.take();
		debug!(pool = %self.pool.name(), clean, "connection released");
	}

	/// Discard the checkout and its handle.
	///
	/// In shared-handle mode this only unbinds the checkout: the pool's
	/// resident handle must stay alive for other live checkouts and future
	/// acquires. Only a pool-level flush destroys it.
	pub async fn close(&mut self) {
		let Some(mut conn) = self.conn.take() else {
			return;
		};
		if !self.pool.shared_handle_mode() {
			conn.disconnect();
		}
		drop(conn);
		self.permit.take();
		debug!(pool = %self.pool.name(), "connection closed");
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		// No implicit recycle: an abandoned checkout may hold arbitrary
		// transaction state, so the handle is discarded, not reused.
		if let Some(mut conn) = self.conn.take() {
			warn!(
				pool = %self.pool.name(),
				"pooled connection dropped without release; discarding handle"
			);
			if !self.pool.shared_handle_mode() {
				conn.disconnect();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case(":memory:")]
	#[case("file:x?mode=memory")]
	#[case("file:x?cache=shared&mode=memory")]
	#[case("file:x?other=value&mode=memory")]
	fn detects_in_memory_identifiers(#[case] database: &str) {
		assert!(is_in_memory_single_file(database), "{database}");
	}

	#[rstest]
	#[case("/tmp/memory.db")]
	#[case("database.db")]
	#[case("")]
	#[case("file:test?mode_memory")]
	#[case("mode_memory")]
	fn rejects_durable_identifiers(#[case] database: &str) {
		assert!(!is_in_memory_single_file(database), "{database}");
	}
}
