//! Task-scoped key/value storage
//!
//! Each cooperatively-scheduled task gets its own context; it is never
//! shared with sibling tasks and is not inherited by spawned children
//! (tokio task-locals do not propagate across `tokio::spawn`). Framework
//! entry points wrap each unit of work in [`Context::scope`]; outside a
//! scope every accessor degrades to a no-op.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;

tokio::task_local! {
	/// Task-local storage. Follows the task across thread boundaries in
	/// work-stealing async runtimes.
	static CONTEXT: Context;
}

type Slot = Box<dyn Any + Send>;

/// Per-task storage behind [`Context::scope`].
#[derive(Default)]
pub struct Context {
	slots: RefCell<HashMap<&'static str, Slot>>,
}

impl Context {
	/// Execute a future within a fresh context scope.
	///
	/// If a scope is already active (nested call), the provided future runs
	/// directly within the existing scope; entries set by the outer extent
	/// stay visible.
	pub async fn scope<F, T>(f: F) -> T
	where
		F: Future<Output = T>,
	{
		let already_scoped = CONTEXT.try_with(|_| ()).is_ok();
		if already_scoped {
			f.await
		} else {
			CONTEXT.scope(Context::default(), f).await
		}
	}

	/// Whether the current task runs inside a context scope.
	pub fn is_active() -> bool {
		CONTEXT.try_with(|_| ()).is_ok()
	}

	/// Store a value, returning the previous value of the same type if any.
	///
	/// Dropped silently when no scope is active.
	pub fn set<T: Any + Send>(key: &'static str, value: T) -> Option<T> {
		CONTEXT
			.try_with(|cx| cx.slots.borrow_mut().insert(key, Box::new(value) as Slot))
			.ok()
			.flatten()
			.and_then(|prev| prev.downcast::<T>().ok().map(|boxed| *boxed))
	}

	/// Clone the value stored under `key`, if present and of type `T`.
	pub fn get<T: Any + Clone + Send>(key: &'static str) -> Option<T> {
		CONTEXT
			.try_with(|cx| {
				cx.slots
					.borrow()
					.get(key)
					.and_then(|slot| slot.downcast_ref::<T>())
					.cloned()
			})
			.ok()
			.flatten()
	}

	/// Remove and return the value stored under `key`.
	pub fn take<T: Any + Send>(key: &'static str) -> Option<T> {
		CONTEXT
			.try_with(|cx| cx.slots.borrow_mut().remove(key))
			.ok()
			.flatten()
			.and_then(|slot| slot.downcast::<T>().ok().map(|boxed| *boxed))
	}

	/// Remove the value stored under `key`, discarding it.
	pub fn remove(key: &'static str) {
		let _ = CONTEXT.try_with(|cx| {
			cx.slots.borrow_mut().remove(key);
		});
	}

	/// Run `f` against a mutable borrow of the value under `key`.
	pub fn with<T, R, F>(key: &'static str, f: F) -> Option<R>
	where
		T: Any + Send,
		F: FnOnce(&mut T) -> R,
	{
		CONTEXT
			.try_with(|cx| {
				let mut slots = cx.slots.borrow_mut();
				slots
					.get_mut(key)
					.and_then(|slot| slot.downcast_mut::<T>())
					.map(f)
			})
			.ok()
			.flatten()
	}

	/// Like [`Context::with`], inserting `T::default()` when the key is
	/// absent. Returns `None` only when no scope is active (or the slot
	/// holds a value of a different type).
	pub fn with_default<T, R, F>(key: &'static str, f: F) -> Option<R>
	where
		T: Any + Send + Default,
		F: FnOnce(&mut T) -> R,
	{
		CONTEXT
			.try_with(|cx| {
				let mut slots = cx.slots.borrow_mut();
				let slot = slots
					.entry(key)
					.or_insert_with(|| Box::new(T::default()) as Slot);
				slot.downcast_mut::<T>().map(f)
			})
			.ok()
			.flatten()
	}

	/// Install `value` under `key` for the dynamic extent of `f` only.
	///
	/// The previous value (or absence) is restored when `f` returns, when it
	/// errors, and when the future is dropped mid-flight. Without an active
	/// scope the future simply runs with no override installed.
	pub async fn using<T, F, R>(key: &'static str, value: T, f: F) -> R
	where
		T: Any + Send,
		F: Future<Output = R>,
	{
		let _guard = OverrideGuard::install(key, value);
		f.await
	}
}

/// RAII restore of a single context slot.
struct OverrideGuard {
	key: &'static str,
	previous: Option<Slot>,
	installed: bool,
}

impl OverrideGuard {
	fn install<T: Any + Send>(key: &'static str, value: T) -> Self {
		match CONTEXT.try_with(|cx| cx.slots.borrow_mut().insert(key, Box::new(value) as Slot)) {
			Ok(previous) => Self {
				key,
				previous,
				installed: true,
			},
			Err(_) => Self {
				key,
				previous: None,
				installed: false,
			},
		}
	}
}

impl Drop for OverrideGuard {
	fn drop(&mut self) {
		if !self.installed {
			return;
		}
		let previous = self.previous.take();
		let _ = CONTEXT.try_with(|cx| {
			let mut slots = cx.slots.borrow_mut();
			match previous {
				Some(prev) => {
					slots.insert(self.key, prev);
				}
				None => {
					slots.remove(self.key);
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn set_and_get_within_scope() {
		Context::scope(async {
			assert!(Context::is_active());
			assert_eq!(Context::set("k", 1_i64), None);
			assert_eq!(Context::get::<i64>("k"), Some(1));
			assert_eq!(Context::set("k", 2_i64), Some(1));
			assert_eq!(Context::take::<i64>("k"), Some(2));
			assert_eq!(Context::get::<i64>("k"), None);
		})
		.await;
	}

	#[tokio::test]
	async fn accessors_are_noops_without_scope() {
		assert!(!Context::is_active());
		assert_eq!(Context::set("k", 1_i64), None);
		assert_eq!(Context::get::<i64>("k"), None);
	}

	#[tokio::test]
	async fn using_restores_previous_value() {
		Context::scope(async {
			Context::set("name", "outer".to_string());
			let seen = Context::using("name", "inner".to_string(), async {
				Context::get::<String>("name")
			})
			.await;
			assert_eq!(seen.as_deref(), Some("inner"));
			assert_eq!(Context::get::<String>("name").as_deref(), Some("outer"));
		})
		.await;
	}

	#[tokio::test]
	async fn spawned_child_starts_clean() {
		Context::scope(async {
			Context::set("k", 42_i64);
			let child = tokio::spawn(async { (Context::is_active(), Context::get::<i64>("k")) });
			let (active, value) = child.await.expect("child task panicked");
			assert!(!active);
			assert_eq!(value, None);
		})
		.await;
	}
}
