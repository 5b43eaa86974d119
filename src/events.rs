//! Connection lifecycle events

use crate::context::Context;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Context key suppressing event dispatch for the current task extent.
pub const EVENTS_DISABLED_KEY: &str = "database.events_disabled";

/// Emitted on every physical (re)connect of a handle.
#[derive(Debug, Clone)]
pub struct ConnectionEstablished {
	pub connection_name: String,
	pub database: String,
	/// `false` for the first connect of a handle, `true` for re-establishes.
	pub reconnect: bool,
}

/// Observer of connection lifecycle events.
#[async_trait]
pub trait ConnectionEventListener: Send + Sync {
	async fn connection_established(&self, event: &ConnectionEstablished);
}

/// Fan-out dispatcher shared by all pools of a factory.
#[derive(Default)]
pub struct EventDispatcher {
	listeners: RwLock<Vec<Arc<dyn ConnectionEventListener>>>,
}

impl EventDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
		let mut listeners = self.listeners.write().await;
		listeners.push(listener);
	}

	/// Deliver `event` to every listener, unless the calling task disabled
	/// events via [`without_events`].
	pub async fn dispatch(&self, event: ConnectionEstablished) {
		if Context::get::<bool>(EVENTS_DISABLED_KEY).unwrap_or(false) {
			return;
		}
		let listeners = self.listeners.read().await;
		for listener in listeners.iter() {
			listener.connection_established(&event).await;
		}
	}
}

/// Run `f` with event dispatch suppressed for this task's dynamic extent.
///
/// The suppression is a task-scoped context entry, not a process-global
/// switch; sibling tasks keep dispatching normally. Without an active
/// context scope an ephemeral one is opened around `f`.
pub async fn without_events<F, T>(f: F) -> T
where
	F: Future<Output = T>,
{
	Context::scope(Context::using(EVENTS_DISABLED_KEY, true, f)).await
}
