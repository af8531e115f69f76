// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Separates plain read/write operations from transaction commits.
//!
//! Any number of read/write operations may be in flight together, and so
//! may commits, but never both at once: a commit waits for in-flight
//! operations to drain and operations wait for in-flight commits. The lock
//! is held only to adjust the two counters, the waiting itself spins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

pub(crate) struct OpGate {
	guard: Mutex<()>,
	rw_count: AtomicUsize,
	tx_count: AtomicUsize,
}

pub(crate) struct RwPermit<'a>(&'a OpGate);
pub(crate) struct TxPermit<'a>(&'a OpGate);

impl OpGate {
	pub(crate) fn new() -> OpGate {
		OpGate { guard: Mutex::new(()), rw_count: AtomicUsize::new(0), tx_count: AtomicUsize::new(0) }
	}

	/// Admit a plain read/write; blocks while a commit is in flight.
	pub(crate) fn enter_rw(&self) -> RwPermit<'_> {
		loop {
			// the check and the increment must be one step, or a commit
			// could slip its increment in between; the wait itself happens
			// with the lock released
			{
				let _guard = self.guard.lock();
				if self.tx_count.load(Ordering::Acquire) == 0 {
					self.rw_count.fetch_add(1, Ordering::AcqRel);
					return RwPermit(self);
				}
			}
			thread::yield_now();
		}
	}

	/// Admit a transaction commit; blocks until plain operations drain.
	pub(crate) fn enter_tx(&self) -> TxPermit<'_> {
		// raising the count first keeps new read/write operations out
		// while this commit waits for the in-flight ones
		{
			let _guard = self.guard.lock();
			self.tx_count.fetch_add(1, Ordering::AcqRel);
		}
		while self.rw_count.load(Ordering::Acquire) > 0 {
			thread::yield_now();
		}
		TxPermit(self)
	}
}

impl Drop for RwPermit<'_> {
	fn drop(&mut self) {
		self.0.rw_count.fetch_sub(1, Ordering::AcqRel);
	}
}

impl Drop for TxPermit<'_> {
	fn drop(&mut self) {
		self.0.tx_count.fetch_sub(1, Ordering::AcqRel);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicBool;
	use std::sync::Arc;
	use std::time::Duration;

	#[test]
	fn permits_balance_the_counters() {
		let gate = OpGate::new();
		{
			let _a = gate.enter_rw();
			let _b = gate.enter_rw();
			assert_eq!(gate.rw_count.load(Ordering::SeqCst), 2);
		}
		assert_eq!(gate.rw_count.load(Ordering::SeqCst), 0);
		{
			let _t = gate.enter_tx();
			assert_eq!(gate.tx_count.load(Ordering::SeqCst), 1);
		}
		assert_eq!(gate.tx_count.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn commit_waits_for_in_flight_operations() {
		let gate = Arc::new(OpGate::new());
		let admitted = Arc::new(AtomicBool::new(false));

		let rw = gate.enter_rw();
		let committer = {
			let gate = gate.clone();
			let admitted = admitted.clone();
			thread::spawn(move || {
				let _tx = gate.enter_tx();
				// no read/write permit may be live at this point
				assert_eq!(gate.rw_count.load(Ordering::SeqCst), 0);
				admitted.store(true, Ordering::SeqCst);
			})
		};

		// the commit has raised its count and is now waiting on the permit
		// this thread still holds
		thread::sleep(Duration::from_millis(100));
		assert!(!admitted.load(Ordering::SeqCst));

		drop(rw);
		committer.join().unwrap();
		assert!(admitted.load(Ordering::SeqCst));
	}

	#[test]
	fn operations_wait_for_in_flight_commit() {
		let gate = Arc::new(OpGate::new());
		let admitted = Arc::new(AtomicBool::new(false));

		let tx = gate.enter_tx();
		let readers: Vec<_> = (0..4)
			.map(|_| {
				let gate = gate.clone();
				let admitted = admitted.clone();
				thread::spawn(move || {
					let _rw = gate.enter_rw();
					assert_eq!(gate.tx_count.load(Ordering::SeqCst), 0);
					admitted.store(true, Ordering::SeqCst);
				})
			})
			.collect();

		thread::sleep(Duration::from_millis(100));
		assert!(!admitted.load(Ordering::SeqCst));

		drop(tx);
		for reader in readers {
			reader.join().unwrap();
		}
		assert!(admitted.load(Ordering::SeqCst));
	}
}
