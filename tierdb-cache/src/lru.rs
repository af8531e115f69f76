// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Journal-backed caching layer.
//!
//! No coherent value cache: every write, erase and committed transaction
//! is pushed onto an ordered journal, and reads assemble the effective
//! state by walking the journal in reverse until an erase cuts the history
//! (including the backend state underneath). Once the journaled bytes
//! exceed `flush_on_size`, the whole journal drains in submission order
//! into one backend batched-write transaction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::{Mutex, RwLock};
use tierdb::{DbError, DbResult, DbValue, Index, KeyValueDB};

use crate::common::{self, TxMulti};
use crate::hierarchical::HierarchicalDb;
use crate::journal::{JournalEntry, JournalStore, StoredEntry};

/// A [`KeyValueDB`] that journals writes and drains them in bulk.
pub struct LruCache {
	db: Arc<dyn KeyValueDB>,
	flush_on_size: u64,
	journal: Mutex<JournalStore>,
	approx_size: AtomicU64,
	flush_count: AtomicU64,
	flush_failures: AtomicU64,
	tx: RwLock<Option<Arc<HierarchicalDb>>>,
}

impl LruCache {
	/// Layer a journal cache over `db`. `flush_on_size` is the journaled
	/// byte budget that triggers a drain to the backend; 0 disables it.
	pub fn new(db: Arc<dyn KeyValueDB>, flush_on_size: u64) -> LruCache {
		LruCache {
			db,
			flush_on_size,
			journal: Mutex::new(JournalStore::new()),
			approx_size: AtomicU64::new(0),
			flush_count: AtomicU64::new(0),
			flush_failures: AtomicU64::new(0),
			tx: RwLock::new(None),
		}
	}

	/// Drain the journal, in submission order, into one backend
	/// batched-write transaction, then clear it. On failure the journal is
	/// kept so a later flush can retry.
	pub fn flush(&self) -> DbResult<()> {
		let mut journal = self.journal.lock();
		if journal.is_empty() {
			return Ok(());
		}

		if let Err(e) = self.db.begin_transaction(self.approx_size.load(Ordering::Acquire) as usize) {
			self.flush_failures.fetch_add(1, Ordering::Release);
			error!("journal drain failed, keeping journaled data for retry: {}", e);
			return Err(e);
		}
		let applied = (|| -> DbResult<()> {
			for entry in journal.entries() {
				match entry {
					JournalEntry::Write { index, key, value } => {
						self.db.write(*index, key, value)?;
					}
					JournalEntry::Erase { index, key } => {
						self.db.erase_all(*index, key)?;
					}
					JournalEntry::Transaction(tx) => {
						for index in Index::ALL {
							for (key, op) in tx.get_all_for_index(index) {
								common::apply_tx_op(&*self.db, index, &key, &op)?;
							}
						}
					}
				}
			}
			self.db.commit_transaction()
		})();

		match applied {
			Ok(()) => {
				journal.clear();
				self.approx_size.store(0, Ordering::Release);
				self.flush_count.fetch_add(1, Ordering::Release);
				Ok(())
			}
			Err(e) => {
				let _ = self.db.abort_transaction();
				self.flush_failures.fetch_add(1, Ordering::Release);
				error!("journal drain failed, keeping journaled data for retry: {}", e);
				Err(e)
			}
		}
	}

	pub fn flush_count(&self) -> u64 {
		self.flush_count.load(Ordering::Acquire)
	}

	pub fn flush_failures(&self) -> u64 {
		self.flush_failures.load(Ordering::Acquire)
	}

	fn maybe_flush(&self) {
		if self.flush_on_size == 0 {
			return;
		}
		if self.approx_size.load(Ordering::Acquire) > self.flush_on_size {
			// failures are counted and logged inside flush; the journal is
			// kept, so a later flush retries
			let _ = self.flush();
		}
	}
}

impl KeyValueDB for LruCache {
	fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				if let Some(answer) = common::tx_read_single(tx, index, key, offset, size) {
					return Ok(answer);
				}
			}
		}

		match self.journal.lock().get_one(index, key) {
			Some(StoredEntry::Erase) => Ok(None),
			Some(StoredEntry::Write(value)) => Ok(Some(tierdb::slice_value(&value, offset, size))),
			None => self.db.read(index, key, offset, size),
		}
	}

	fn read_multiple(&self, index: Index, key: &[u8]) -> DbResult<Vec<DbValue>> {
		let tx_extend = {
			let tx = self.tx.read();
			match tx.as_ref() {
				Some(tx) => match common::tx_multi_values(tx, index, key) {
					TxMulti::Erased(values) => return Ok(values),
					TxMulti::Extend(values) => values,
				},
				None => Vec::new(),
			}
		};

		if !index.duplicates_allowed() {
			// a single-value key has no collection to assemble, the newest
			// record wins
			let mut values = match self.journal.lock().get_one(index, key) {
				Some(StoredEntry::Erase) => Vec::new(),
				Some(StoredEntry::Write(value)) => vec![value],
				None => self.db.read_multiple(index, key)?,
			};
			values.extend(tx_extend);
			return Ok(values);
		}

		let stored = self.journal.lock().get(index, key);
		let mut journaled = Vec::new();
		let mut backend_cut = false;
		for entry in stored {
			match entry {
				StoredEntry::Erase => {
					// everything older than the erase is void, the backend
					// state included
					backend_cut = true;
					journaled.clear();
				}
				StoredEntry::Write(value) => journaled.push(value),
			}
		}

		let mut values = if backend_cut { Vec::new() } else { self.db.read_multiple(index, key)? };
		values.extend(journaled);
		values.extend(tx_extend);
		Ok(values)
	}

	fn read_all(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>> {
		let tx_ops = self.tx.read().as_ref().map(|tx| tx.get_all_for_index(index));
		let journaled = self.journal.lock().get_all(index);

		let mut all = self.db.read_all(index)?;
		for (key, entries) in journaled {
			for entry in entries {
				match entry {
					StoredEntry::Erase => {
						all.remove(&key);
					}
					StoredEntry::Write(value) => {
						if index.duplicates_allowed() {
							all.entry(key.clone()).or_default().push(value);
						} else {
							all.insert(key.clone(), vec![value]);
						}
					}
				}
			}
		}

		if let Some(ops) = tx_ops {
			common::merge_tx_ops_multi(&mut all, ops);
		}
		Ok(all)
	}

	fn read_all_unique(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, DbValue>> {
		let tx_ops = self.tx.read().as_ref().map(|tx| tx.get_all_for_index(index));
		let journaled = self.journal.lock().get_all(index);

		let mut all = self.db.read_all_unique(index)?;
		for (key, entries) in journaled {
			for entry in entries {
				match entry {
					StoredEntry::Erase => {
						all.remove(&key);
					}
					StoredEntry::Write(value) => {
						all.insert(key.clone(), value);
					}
				}
			}
		}

		if let Some(ops) = tx_ops {
			common::merge_tx_ops_unique(&mut all, ops);
		}
		Ok(all)
	}

	fn write(&self, index: Index, key: &[u8], value: &[u8]) -> DbResult<()> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				return if index.duplicates_allowed() {
					tx.append(index, key, value).map_err(DbError::from)
				} else {
					tx.set(index, key, value).map_err(DbError::from)
				};
			}
		}

		self.journal.lock().add(JournalEntry::Write {
			index,
			key: key.to_vec(),
			value: value.to_vec(),
		});
		self.approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
		self.maybe_flush();
		Ok(())
	}

	fn erase(&self, index: Index, key: &[u8]) -> DbResult<()> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				return tx.erase(index, key).map_err(DbError::from);
			}
		}
		self.journal.lock().add(JournalEntry::Erase { index, key: key.to_vec() });
		Ok(())
	}

	fn erase_all(&self, index: Index, key: &[u8]) -> DbResult<()> {
		self.erase(index, key)
	}

	fn exists(&self, index: Index, key: &[u8]) -> DbResult<bool> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				if let Some(answer) = common::tx_read_exists(tx, index, key) {
					return Ok(answer);
				}
			}
		}

		match self.journal.lock().get_one(index, key) {
			Some(StoredEntry::Erase) => Ok(false),
			Some(StoredEntry::Write(_)) => Ok(true),
			None => self.db.exists(index, key),
		}
	}

	fn begin_transaction(&self, _expected_bytes: usize) -> DbResult<()> {
		let mut tx = self.tx.write();
		if tx.is_some() {
			return Err(DbError::TransactionAlreadyActive);
		}
		*tx = Some(HierarchicalDb::new("journal"));
		Ok(())
	}

	fn commit_transaction(&self) -> DbResult<()> {
		let tx = self.tx.write().take().ok_or(DbError::NoActiveTransaction)?;
		let payload = common::tx_payload_bytes(&common::collect_tx_data(&tx));
		self.approx_size.fetch_add(payload as u64, Ordering::Relaxed);
		self.journal.lock().add(JournalEntry::Transaction(tx));
		self.maybe_flush();
		Ok(())
	}

	fn abort_transaction(&self) -> DbResult<()> {
		if self.tx.write().take().is_none() {
			return Err(DbError::NoActiveTransaction);
		}
		Ok(())
	}

	fn clear_all_data(&self) -> DbResult<()> {
		*self.tx.write() = None;
		self.journal.lock().clear();
		self.approx_size.store(0, Ordering::Release);
		self.db.clear_all_data()
	}

	fn close(&self) {
		*self.tx.write() = None;
		// best effort: journaled writes are lost otherwise
		let _ = self.flush();
		self.db.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tierdb_memorydb::InMemory;

	const MAIN: Index = Index::Main;
	const NAMES: Index = Index::Ntp1TokenNames;

	fn setup() -> (Arc<InMemory>, LruCache) {
		let backend = Arc::new(tierdb_memorydb::create());
		let cache = LruCache::new(backend.clone(), 0);
		(backend, cache)
	}

	#[test]
	fn shared_trait_tests() {
		let (_, cache) = setup();
		tierdb_shared_tests::run_all(&cache).unwrap();
	}

	#[test]
	fn reads_assemble_backend_and_journal() {
		let (backend, cache) = setup();
		backend.write(NAMES, b"k", b"durable").unwrap();

		cache.write(NAMES, b"k", b"j1").unwrap();
		cache.write(NAMES, b"k", b"j2").unwrap();

		assert_eq!(
			cache.read_multiple(NAMES, b"k").unwrap(),
			vec![b"durable".to_vec(), b"j1".to_vec(), b"j2".to_vec()]
		);
	}

	#[test]
	fn an_erase_voids_the_backend_state_underneath() {
		let (backend, cache) = setup();
		backend.write(NAMES, b"k", b"durable").unwrap();

		cache.erase_all(NAMES, b"k").unwrap();
		cache.write(NAMES, b"k", b"fresh").unwrap();

		assert_eq!(cache.read_multiple(NAMES, b"k").unwrap(), vec![b"fresh".to_vec()]);
		// the backend still holds the value until the journal drains
		assert!(backend.exists(NAMES, b"k").unwrap());

		cache.flush().unwrap();
		assert_eq!(backend.read_multiple(NAMES, b"k").unwrap(), vec![b"fresh".to_vec()]);
	}

	#[test]
	fn committed_transactions_are_journaled_atomically() {
		let (backend, cache) = setup();
		cache.begin_transaction(0).unwrap();
		cache.write(MAIN, b"a", b"1").unwrap();
		cache.write(NAMES, b"m", b"x").unwrap();
		cache.commit_transaction().unwrap();

		assert!(!backend.exists(MAIN, b"a").unwrap());
		assert_eq!(cache.read(MAIN, b"a", 0, None).unwrap().unwrap(), b"1");
		assert_eq!(cache.read_multiple(NAMES, b"m").unwrap(), vec![b"x".to_vec()]);

		cache.flush().unwrap();
		assert_eq!(backend.read(MAIN, b"a", 0, None).unwrap().unwrap(), b"1");
		assert_eq!(backend.read_multiple(NAMES, b"m").unwrap(), vec![b"x".to_vec()]);
	}

	#[test]
	fn drain_preserves_submission_order() {
		let (backend, cache) = setup();
		cache.write(MAIN, b"k", b"first").unwrap();
		cache.erase(MAIN, b"k").unwrap();
		cache.write(MAIN, b"k", b"second").unwrap();

		cache.flush().unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"second");
	}

	#[test]
	fn automatic_drain_when_journaled_bytes_exceed_budget() {
		let backend = Arc::new(tierdb_memorydb::create());
		let cache = LruCache::new(backend.clone(), 16);

		cache.write(MAIN, b"small", b"x").unwrap();
		assert_eq!(cache.flush_count(), 0);

		cache.write(MAIN, b"large", &[0u8; 64]).unwrap();
		assert_eq!(cache.flush_count(), 1);
		assert!(backend.exists(MAIN, b"large").unwrap());
	}

	#[test]
	fn failed_drain_keeps_the_journal() {
		let (backend, cache) = setup();
		cache.write(MAIN, b"k", b"v").unwrap();

		backend.begin_transaction(0).unwrap();
		assert!(cache.flush().is_err());
		assert_eq!(cache.flush_failures(), 1);
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");

		backend.abort_transaction().unwrap();
		cache.flush().unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
	}
}
