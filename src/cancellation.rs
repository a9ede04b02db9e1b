//! Cooperative cancellation for in-flight updates.
//!
//! Cancellation is a flag, not unwinding: the update task polls
//! [`CancellationToken::is_cancelled`] immediately after every suspension
//! point (the debounce delay, the network call) and exits without further
//! side effects once it observes the flag. No tree mutation ever starts after
//! a cancellation has been observed.
//!
//! Everything runs on one thread under cooperative scheduling, so the flag is
//! a plain `Cell` behind an `Rc`; there is no atomics or locking discipline
//! to uphold.

use std::{cell::Cell, rc::Rc};

/// The control side: held by the coordinator's per-scope pending slot.
///
/// Dropping the source does not cancel the token; supersession calls
/// [`cancel`](Self::cancel) explicitly.
#[derive(Debug, Default)]
pub struct CancellationSource {
	flag: Rc<Cell<bool>>,
}

/// The observing side, passed through every suspension point of an update.
#[derive(Debug, Clone)]
pub struct CancellationToken {
	flag: Rc<Cell<bool>>,
}

impl CancellationSource {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn token(&self) -> CancellationToken {
		CancellationToken { flag: Rc::clone(&self.flag) }
	}

	/// Signals cancellation. The pending task observes it at its next poll
	/// site; nothing is interrupted synchronously.
	pub fn cancel(&self) {
		self.flag.set(true);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.flag.get()
	}
}

impl CancellationToken {
	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.flag.get()
	}

	/// A token that can never be cancelled, for updates outside any scope
	/// slot (tests, one-shot tools).
	#[must_use]
	pub fn never() -> Self {
		Self { flag: Rc::new(Cell::new(false)) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_observes_cancel() {
		let source = CancellationSource::new();
		let token = source.token();
		assert!(!token.is_cancelled());
		source.cancel();
		assert!(token.is_cancelled());
		assert!(source.token().is_cancelled());
	}
}
