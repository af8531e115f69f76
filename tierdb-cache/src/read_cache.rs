// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Read-through caching layer.
//!
//! Writes hit the backend first and are mirrored into the cache; reads
//! consult the cache and populate it from the backend on miss. The backend
//! therefore always holds the durable truth and the cache may be dropped
//! at any time — which is exactly what [`ReadCache::flush`] does once the
//! cached bytes exceed `flush_on_size`.
//!
//! The cache holds a multi-index key only when its *complete* value set
//! passed through this layer: a plain write for an uncached multi key is
//! not inserted alone (a later read pulls the full set), and the same rule
//! applies when a committed transaction is mirrored. A transaction commit
//! is serialised against all plain operations by a counter gate, so no
//! reader observes a half-applied commit in the cache.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;
use tierdb::{slice_value, DbError, DbResult, DbValue, Index, KeyValueDB};

use crate::common::{self, TxMulti};
use crate::concurrent_map::ConcurrentMap;
use crate::gate::OpGate;
use crate::hierarchical::HierarchicalDb;
use crate::operation::{ReadCacheEntry, ReadOperation, WriteOperation};

// large enough that bucket collisions stay rare under realistic load
const READ_CACHE_BUCKETS: usize = 5000;

/// A [`KeyValueDB`] that writes through to the backend and caches reads.
pub struct ReadCache {
	db: Arc<dyn KeyValueDB>,
	flush_on_size: u64,
	cache: Vec<ConcurrentMap<Vec<u8>, ReadCacheEntry>>,
	approx_size: AtomicU64,
	flush_count: AtomicU64,
	gate: OpGate,
	tx: RwLock<Option<Arc<HierarchicalDb>>>,
}

impl ReadCache {
	/// Layer a read-through cache over `db`. `flush_on_size` bounds the
	/// cached bytes before the cache is dropped wholesale; 0 disables it.
	pub fn new(db: Arc<dyn KeyValueDB>, flush_on_size: u64) -> ReadCache {
		ReadCache {
			db,
			flush_on_size,
			cache: (0..Index::COUNT).map(|_| ConcurrentMap::new(READ_CACHE_BUCKETS)).collect(),
			approx_size: AtomicU64::new(0),
			flush_count: AtomicU64::new(0),
			gate: OpGate::new(),
			tx: RwLock::new(None),
		}
	}

	/// Drop the cache. The backend holds everything, so this only costs
	/// future read misses.
	pub fn flush(&self) -> DbResult<()> {
		info!("clearing the read cache");
		self.clear_cache();
		self.flush_count.fetch_add(1, Ordering::Release);
		Ok(())
	}

	pub fn flush_count(&self) -> u64 {
		self.flush_count.load(Ordering::Acquire)
	}

	pub fn clear_cache(&self) {
		let _permit = self.gate.enter_rw();
		for map in &self.cache {
			map.clear();
		}
		self.approx_size.store(0, Ordering::Release);
	}

	fn maybe_clear(&self) {
		if self.flush_on_size == 0 {
			return;
		}
		if self.approx_size.load(Ordering::Acquire) > self.flush_on_size {
			let _ = self.flush();
		}
	}

	// Mirror one appended value into the cache, but only for keys the
	// cache already holds completely; an uncached key stays uncached so it
	// cannot shadow values only the backend knows.
	fn append_if_present(&self, index: Index, key: &[u8], value: &[u8]) {
		let mut added = 0u64;
		self.cache[index as usize].apply(&key.to_vec(), |bucket, k| {
			if let Some(entry) = bucket.get_mut(k) {
				if entry.is_negative() {
					*entry = ReadCacheEntry::written(vec![value.to_vec()]);
				} else {
					entry.values_mut().push(value.to_vec());
					entry.switch_to_written();
				}
				added = value.len() as u64;
			}
		});
		self.approx_size.fetch_add(added, Ordering::Relaxed);
	}

	fn read_impl(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>> {
		let _permit = self.gate.enter_rw();

		if let Some(entry) = self.cache[index as usize].get(key) {
			if entry.is_negative() {
				return Ok(None);
			}
			if let Some(first) = entry.values().first() {
				return Ok(Some(slice_value(first, offset, size)));
			}
			warn!("cached entry in {:?} is unexpectedly empty, refreshing from the backend", index);
		}

		if index.duplicates_allowed() {
			let values = self.db.read_multiple(index, key)?;
			if values.is_empty() {
				return Ok(None);
			}
			let total: usize = values.iter().map(|v| v.len()).sum();
			self.approx_size.fetch_add(total as u64, Ordering::Relaxed);
			let answer = slice_value(&values[0], offset, size);
			self.cache[index as usize].set(key.to_vec(), ReadCacheEntry::read(values));
			Ok(Some(answer))
		} else {
			match self.db.read(index, key, 0, None)? {
				Some(value) => {
					self.approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
					let answer = slice_value(&value, offset, size);
					self.cache[index as usize].set(key.to_vec(), ReadCacheEntry::read(vec![value]));
					Ok(Some(answer))
				}
				None => Ok(None),
			}
		}
	}

	fn commit_impl(&self, tx_data: &common::TxData) -> DbResult<()> {
		let _permit = self.gate.enter_tx();

		self.db.begin_transaction(common::tx_payload_bytes(tx_data))?;
		let applied = (|| -> DbResult<()> {
			for (position, ops) in tx_data.iter().enumerate() {
				let index = Index::ALL[position];
				for (key, op) in ops {
					match op.op() {
						WriteOperation::Append => {
							for value in op.values() {
								self.db.write(index, key, value)?;
							}
						}
						WriteOperation::Set => {
							if let Some(first) = op.values().first() {
								self.db.write(index, key, first)?;
							}
						}
						WriteOperation::Erase => self.db.erase(index, key)?,
					}
				}
			}
			self.db.commit_transaction()
		})();
		if let Err(e) = applied {
			let _ = self.db.abort_transaction();
			error!("backend commit of a transaction failed, cache left untouched: {}", e);
			return Err(e);
		}

		// mirror the committed operations into the cache
		for (position, ops) in tx_data.iter().enumerate() {
			let index = Index::ALL[position];
			for (key, op) in ops {
				match op.op() {
					WriteOperation::Append => {
						// only keys the cache already holds; see the
						// module docs
						if self.cache[position].get(key.as_slice()).is_some() {
							for value in op.values() {
								self.append_if_present(index, key, value);
							}
						}
					}
					WriteOperation::Set => {
						if let Some(first) = op.values().first() {
							self.approx_size.fetch_add(first.len() as u64, Ordering::Relaxed);
							self.cache[position]
								.set(key.clone(), ReadCacheEntry::written(vec![first.clone()]));
						}
					}
					WriteOperation::Erase => {
						self.cache[position].set(key.clone(), ReadCacheEntry::erased());
					}
				}
			}
		}
		Ok(())
	}
}

impl KeyValueDB for ReadCache {
	fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				if let Some(answer) = common::tx_read_single(tx, index, key, offset, size) {
					return Ok(answer);
				}
			}
		}
		let result = self.read_impl(index, key, offset, size);
		self.maybe_clear();
		result
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

		let result = (|| -> DbResult<Vec<DbValue>> {
			let _permit = self.gate.enter_rw();

			if let Some(entry) = self.cache[index as usize].get(key) {
				if entry.is_negative() {
					return Ok(Vec::new());
				}
				return Ok(entry.values().to_vec());
			}

			let values = self.db.read_multiple(index, key)?;
			let total: usize = values.iter().map(|v| v.len()).sum();
			self.approx_size.fetch_add(total as u64, Ordering::Relaxed);
			self.cache[index as usize].set(key.to_vec(), ReadCacheEntry::read(values.clone()));
			Ok(values)
		})();
		self.maybe_clear();

		let mut values = result?;
		values.extend(tx_extend);
		Ok(values)
	}

	fn read_all(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>> {
		let tx_ops = self.tx.read().as_ref().map(|tx| tx.get_all_for_index(index));

		let result = (|| -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>> {
			let _permit = self.gate.enter_rw();
			let mut all = self.db.read_all(index)?;
			for (key, entry) in self.cache[index as usize].get_all_data() {
				match entry.op() {
					ReadOperation::ValueRead | ReadOperation::ValueWritten => {
						if !entry.values().is_empty() {
							all.insert(key, entry.values().to_vec());
						}
					}
					ReadOperation::Erased => {
						all.remove(&key);
					}
					ReadOperation::NotFound => {}
				}
			}
			Ok(all)
		})();
		self.maybe_clear();

		let mut all = result?;
		if let Some(ops) = tx_ops {
			common::merge_tx_ops_multi(&mut all, ops);
		}
		Ok(all)
	}

	fn read_all_unique(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, DbValue>> {
		let tx_ops = self.tx.read().as_ref().map(|tx| tx.get_all_for_index(index));

		let result = (|| -> DbResult<BTreeMap<Vec<u8>, DbValue>> {
			let _permit = self.gate.enter_rw();
			let mut all = self.db.read_all_unique(index)?;
			for (key, entry) in self.cache[index as usize].get_all_data() {
				match entry.op() {
					ReadOperation::ValueRead | ReadOperation::ValueWritten => {
						if let Some(first) = entry.values().first() {
							all.insert(key, first.clone());
						}
					}
					ReadOperation::Erased => {
						all.remove(&key);
					}
					ReadOperation::NotFound => {}
				}
			}
			Ok(all)
		})();
		self.maybe_clear();

		let mut all = result?;
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

		{
			let _permit = self.gate.enter_rw();
			// the backend first; if it refuses, the cache stays coherent
			self.db.write(index, key, value)?;
			if index.duplicates_allowed() {
				self.append_if_present(index, key, value);
			} else {
				self.approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
				self.cache[index as usize]
					.set(key.to_vec(), ReadCacheEntry::written(vec![value.to_vec()]));
			}
		}
		self.maybe_clear();
		Ok(())
	}

	fn erase(&self, index: Index, key: &[u8]) -> DbResult<()> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				return tx.erase(index, key).map_err(DbError::from);
			}
		}
		let _permit = self.gate.enter_rw();
		self.db.erase(index, key)?;
		self.cache[index as usize].set(key.to_vec(), ReadCacheEntry::erased());
		Ok(())
	}

	fn erase_all(&self, index: Index, key: &[u8]) -> DbResult<()> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				return tx.erase(index, key).map_err(DbError::from);
			}
		}
		let _permit = self.gate.enter_rw();
		self.db.erase_all(index, key)?;
		self.cache[index as usize].set(key.to_vec(), ReadCacheEntry::erased());
		Ok(())
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
		let result = self.read_impl(index, key, 0, None).map(|value| value.is_some());
		self.maybe_clear();
		result
	}

	fn begin_transaction(&self, _expected_bytes: usize) -> DbResult<()> {
		let mut tx = self.tx.write();
		if tx.is_some() {
			return Err(DbError::TransactionAlreadyActive);
		}
		*tx = Some(HierarchicalDb::new("read-cache"));
		Ok(())
	}

	fn commit_transaction(&self) -> DbResult<()> {
		let tx = self.tx.write().take().ok_or(DbError::NoActiveTransaction)?;
		let tx_data = common::collect_tx_data(&tx);
		drop(tx);

		let result = self.commit_impl(&tx_data);
		self.maybe_clear();
		result
	}

	fn abort_transaction(&self) -> DbResult<()> {
		if self.tx.write().take().is_none() {
			return Err(DbError::NoActiveTransaction);
		}
		Ok(())
	}

	fn clear_all_data(&self) -> DbResult<()> {
		*self.tx.write() = None;
		self.clear_cache();
		self.db.clear_all_data()
	}

	fn close(&self) {
		*self.tx.write() = None;
		self.clear_cache();
		self.db.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tierdb_memorydb::InMemory;

	const MAIN: Index = Index::Main;
	const NAMES: Index = Index::Ntp1TokenNames;

	fn setup() -> (Arc<InMemory>, ReadCache) {
		let backend = Arc::new(tierdb_memorydb::create());
		let cache = ReadCache::new(backend.clone(), 0);
		(backend, cache)
	}

	#[test]
	fn shared_trait_tests() {
		let (_, cache) = setup();
		tierdb_shared_tests::run_all(&cache).unwrap();
	}

	#[test]
	fn writes_reach_the_backend_immediately() {
		let (backend, cache) = setup();
		cache.write(MAIN, b"k", b"v").unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");

		// the backend is the source of truth: drop the cache, read again
		cache.clear_cache();
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
	}

	#[test]
	fn uncached_multi_key_is_not_half_mirrored() {
		let (backend, cache) = setup();
		// the backend holds a value this layer has never read
		backend.write(NAMES, b"k", b"v1").unwrap();

		cache.write(NAMES, b"k", b"v2").unwrap();
		// both values reach the backend, and because the key was uncached
		// the cache did not shadow v1
		assert_eq!(
			cache.read_multiple(NAMES, b"k").unwrap(),
			vec![b"v1".to_vec(), b"v2".to_vec()]
		);

		// once cached, further writes extend the cached set
		cache.write(NAMES, b"k", b"v3").unwrap();
		assert_eq!(
			cache.read_multiple(NAMES, b"k").unwrap(),
			vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]
		);
	}

	#[test]
	fn commit_applies_to_backend_before_cache() {
		let (backend, cache) = setup();
		backend.write(MAIN, b"gone", b"x").unwrap();

		cache.begin_transaction(0).unwrap();
		cache.write(MAIN, b"k", b"v").unwrap();
		cache.erase(MAIN, b"gone").unwrap();
		assert!(!backend.exists(MAIN, b"k").unwrap());

		cache.commit_transaction().unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
		assert!(!backend.exists(MAIN, b"gone").unwrap());
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
		assert!(!cache.exists(MAIN, b"gone").unwrap());
	}

	#[test]
	fn committed_append_to_uncached_key_leaves_cache_empty() {
		let (backend, cache) = setup();
		backend.write(NAMES, b"k", b"old").unwrap();

		cache.begin_transaction(0).unwrap();
		cache.write(NAMES, b"k", b"new").unwrap();
		cache.commit_transaction().unwrap();

		// the key was never cached, so the mirror skipped it and the next
		// read pulls the complete set from the backend
		let mut values = cache.read_multiple(NAMES, b"k").unwrap();
		values.sort_unstable();
		assert_eq!(values, vec![b"new".to_vec(), b"old".to_vec()]);
	}

	#[test]
	fn failed_backend_commit_leaves_cache_unmirrored() {
		let (backend, cache) = setup();
		cache.begin_transaction(0).unwrap();
		cache.write(MAIN, b"k", b"v").unwrap();

		// occupy the backend's one batched-write slot to make the commit fail
		backend.begin_transaction(0).unwrap();
		assert!(cache.commit_transaction().is_err());

		backend.abort_transaction().unwrap();
		assert!(!cache.exists(MAIN, b"k").unwrap());
	}

	#[test]
	fn cache_is_dropped_once_budget_is_exceeded() {
		let backend = Arc::new(tierdb_memorydb::create());
		let cache = ReadCache::new(backend.clone(), 8);

		cache.write(MAIN, b"k", &[0u8; 32]).unwrap();
		assert_eq!(cache.flush_count(), 1);
		// nothing lost: the value is durable
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), vec![0u8; 32]);
	}
}
