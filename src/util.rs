//! Small shared-state helpers used by the readout threads.

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A value that is mutated under a lock by its owning thread and snapshotted by readers.
#[derive(Debug, Default)]
pub struct Protected<T> {
	inner: Mutex<T>,
}

impl<T> Protected<T> {
	pub fn new(value: T) -> Self {
		Self { inner: Mutex::new(value) }
	}

	/// Lock the value for mutation.
	pub fn access(&self) -> MutexGuard<T> {
		self.inner.lock()
	}

	/// Take a snapshot of the current value.
	pub fn copy(&self) -> T
	where
		T: Clone,
	{
		self.inner.lock().clone()
	}
}

/// A [`Protected`] value that readers can wait on.
#[derive(Debug, Default)]
pub struct Waitable<T> {
	value: Mutex<T>,
	condition: Condvar,
}

impl<T> Waitable<T> {
	pub fn new(value: T) -> Self {
		Self {
			value: Mutex::new(value),
			condition: Condvar::new(),
		}
	}

	/// Replace the value and wake all waiters.
	pub fn set(&self, value: T) {
		*self.value.lock() = value;
		self.condition.notify_all();
	}

	pub fn get(&self) -> T
	where
		T: Clone,
	{
		self.value.lock().clone()
	}

	/// Block until the predicate holds for the stored value.
	pub fn wait<F>(&self, mut predicate: F) -> T
	where
		T: Clone,
		F: FnMut(&T) -> bool,
	{
		let mut guard = self.value.lock();
		while !predicate(&guard) {
			self.condition.wait(&mut guard);
		}
		guard.clone()
	}

	/// Block until the predicate holds or the timeout expires.
	///
	/// Returns `None` on timeout.
	pub fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<T>
	where
		T: Clone,
		F: FnMut(&T) -> bool,
	{
		let deadline = std::time::Instant::now() + timeout;
		let mut guard = self.value.lock();
		while !predicate(&guard) {
			if self.condition.wait_until(&mut guard, deadline).timed_out() {
				return None;
			}
		}
		Some(guard.clone())
	}
}
