// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tracks live LMDB transactions so a map resize can quiesce them.
//!
//! Every transaction holds a [`TxnTicket`] for its lifetime. A resize
//! closes the gate (no new tickets), waits for the active count to reach
//! zero, grows the map, and reopens the gate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

pub(crate) struct TxnGate {
	gate: AtomicBool,
	active: AtomicU64,
}

pub(crate) struct TxnTicket<'a> {
	gate: &'a TxnGate,
}

impl TxnGate {
	pub(crate) fn new() -> TxnGate {
		TxnGate { gate: AtomicBool::new(false), active: AtomicU64::new(0) }
	}

	fn acquire_gate(&self) {
		while self.gate.swap(true, Ordering::Acquire) {
			thread::sleep(Duration::from_millis(1));
		}
	}

	/// Register a new transaction; blocks while the gate is closed.
	pub(crate) fn enter(&self) -> TxnTicket<'_> {
		self.acquire_gate();
		self.active.fetch_add(1, Ordering::SeqCst);
		self.gate.store(false, Ordering::Release);
		TxnTicket { gate: self }
	}

	/// Close the gate. Pair with [`TxnGate::allow_new`].
	pub(crate) fn prevent_new(&self) {
		self.acquire_gate();
	}

	pub(crate) fn allow_new(&self) {
		self.gate.store(false, Ordering::Release);
	}

	/// Spin until every ticketed transaction has finished.
	pub(crate) fn wait_no_active(&self) {
		while self.active.load(Ordering::SeqCst) > 0 {
			thread::sleep(Duration::from_millis(10));
		}
	}
}

impl Drop for TxnTicket<'_> {
	fn drop(&mut self) {
		self.gate.active.fetch_sub(1, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tickets_track_active_count() {
		let gate = TxnGate::new();
		let t1 = gate.enter();
		let t2 = gate.enter();
		assert_eq!(gate.active.load(Ordering::SeqCst), 2);
		drop(t1);
		drop(t2);
		assert_eq!(gate.active.load(Ordering::SeqCst), 0);
		// nothing active, so this returns immediately
		gate.wait_no_active();
	}
}
