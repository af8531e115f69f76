// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Write-back caching layer.
//!
//! Reads populate the cache from the backend on miss; writes update the
//! cache only. Nothing reaches the backend until [`WriteBackCache::flush`],
//! which replays the whole cache into one backend batched-write
//! transaction. A byte counter triggers the flush automatically once it
//! crosses `flush_on_size` (0 disables).
//!
//! For a multi index the cache only ever holds the *complete* value set of
//! a key: a write to an uncached key pulls the existing set from the
//! backend before appending, and a read populates via `read_multiple`.
//! Flushing would otherwise drop values only the backend knew about.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::error;
use parking_lot::{Mutex, RwLock};
use tierdb::{slice_value, DbError, DbResult, DbValue, Index, KeyValueDB};

use crate::common::{self, TxMulti};
use crate::hierarchical::HierarchicalDb;
use crate::operation::{ReadCacheEntry, ReadOperation, WriteOperation};

type CacheMaps = Vec<BTreeMap<Vec<u8>, ReadCacheEntry>>;

/// A [`KeyValueDB`] that buffers all writes in memory until flushed.
pub struct WriteBackCache {
	db: Arc<dyn KeyValueDB>,
	flush_on_size: u64,
	cache: Mutex<CacheMaps>,
	approx_size: AtomicU64,
	flush_count: AtomicU64,
	flush_failures: AtomicU64,
	tx: RwLock<Option<Arc<HierarchicalDb>>>,
}

impl WriteBackCache {
	/// Layer a write-back cache over `db`. `flush_on_size` is the buffered
	/// byte budget that triggers an automatic flush; 0 disables it.
	pub fn new(db: Arc<dyn KeyValueDB>, flush_on_size: u64) -> WriteBackCache {
		WriteBackCache {
			db,
			flush_on_size,
			cache: Mutex::new((0..Index::COUNT).map(|_| BTreeMap::new()).collect()),
			approx_size: AtomicU64::new(0),
			flush_count: AtomicU64::new(0),
			flush_failures: AtomicU64::new(0),
			tx: RwLock::new(None),
		}
	}

	/// Replay the cache into the backend inside one batched write, then
	/// clear it. On failure the cache is kept so a later flush can retry.
	pub fn flush(&self) -> DbResult<()> {
		let mut cache = self.cache.lock();
		if let Err(e) = self.db.begin_transaction(self.approx_size.load(Ordering::Acquire) as usize) {
			self.flush_failures.fetch_add(1, Ordering::Release);
			error!("write-back cache flush failed, keeping cached data for retry: {}", e);
			return Err(e);
		}
		let applied = (|| -> DbResult<()> {
			for (position, map) in cache.iter().enumerate() {
				let index = Index::ALL[position];
				for (key, entry) in map {
					match entry.op() {
						ReadOperation::ValueRead | ReadOperation::ValueWritten => {
							self.db.erase_all(index, key)?;
							for value in entry.values() {
								self.db.write(index, key, value)?;
							}
						}
						ReadOperation::Erased => self.db.erase_all(index, key)?,
						ReadOperation::NotFound => {}
					}
				}
			}
			self.db.commit_transaction()
		})();

		match applied {
			Ok(()) => {
				for map in cache.iter_mut() {
					map.clear();
				}
				self.approx_size.store(0, Ordering::Release);
				self.flush_count.fetch_add(1, Ordering::Release);
				Ok(())
			}
			Err(e) => {
				let _ = self.db.abort_transaction();
				self.flush_failures.fetch_add(1, Ordering::Release);
				error!("write-back cache flush failed, keeping cached data for retry: {}", e);
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

	/// Drop all cached state without touching the backend.
	pub fn clear_cache(&self) {
		let mut cache = self.cache.lock();
		for map in cache.iter_mut() {
			map.clear();
		}
		self.approx_size.store(0, Ordering::Release);
	}

	fn maybe_flush(&self) {
		if self.flush_on_size == 0 {
			return;
		}
		if self.approx_size.load(Ordering::Acquire) > self.flush_on_size {
			// failures are counted and logged inside flush; the cache is
			// kept, so a later flush retries
			let _ = self.flush();
		}
	}

	// Append one value to a cached multi-index key. An uncached key is
	// first populated with the backend's full value set.
	fn append_to_cache(
		db: &dyn KeyValueDB,
		approx_size: &AtomicU64,
		map: &mut BTreeMap<Vec<u8>, ReadCacheEntry>,
		index: Index,
		key: &[u8],
		value: &[u8],
	) -> DbResult<()> {
		match map.get_mut(key) {
			Some(entry) if !entry.is_negative() => {
				approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
				entry.values_mut().push(value.to_vec());
				entry.switch_to_written();
			}
			Some(entry) => {
				approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
				*entry = ReadCacheEntry::written(vec![value.to_vec()]);
			}
			None => {
				let mut values = db.read_multiple(index, key)?;
				let total: usize = values.iter().map(|v| v.len()).sum::<usize>() + value.len();
				approx_size.fetch_add(total as u64, Ordering::Relaxed);
				values.push(value.to_vec());
				map.insert(key.to_vec(), ReadCacheEntry::written(values));
			}
		}
		Ok(())
	}
}

impl KeyValueDB for WriteBackCache {
	fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>> {
		{
			let tx = self.tx.read();
			if let Some(tx) = tx.as_ref() {
				if let Some(answer) = common::tx_read_single(tx, index, key, offset, size) {
					return Ok(answer);
				}
			}
		}

		let mut cache = self.cache.lock();
		let map = &mut cache[index as usize];
		if let Some(entry) = map.get(key) {
			if entry.is_negative() {
				return Ok(None);
			}
			if let Some(first) = entry.values().first() {
				return Ok(Some(slice_value(first, offset, size)));
			}
			// an empty positive entry is refreshed from the backend below
		}

		if index.duplicates_allowed() {
			let values = self.db.read_multiple(index, key)?;
			if values.is_empty() {
				return Ok(None);
			}
			let total: usize = values.iter().map(|v| v.len()).sum();
			self.approx_size.fetch_add(total as u64, Ordering::Relaxed);
			let answer = slice_value(&values[0], offset, size);
			map.insert(key.to_vec(), ReadCacheEntry::read(values));
			Ok(Some(answer))
		} else {
			match self.db.read(index, key, 0, None)? {
				Some(value) => {
					self.approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
					let answer = slice_value(&value, offset, size);
					map.insert(key.to_vec(), ReadCacheEntry::read(vec![value]));
					Ok(Some(answer))
				}
				None => Ok(None),
			}
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

		let mut cache = self.cache.lock();
		let map = &mut cache[index as usize];
		if let Some(entry) = map.get(key) {
			if entry.is_negative() {
				return Ok(tx_extend);
			}
			let mut values = entry.values().to_vec();
			values.extend(tx_extend);
			return Ok(values);
		}

		let values = self.db.read_multiple(index, key)?;
		let total: usize = values.iter().map(|v| v.len()).sum();
		self.approx_size.fetch_add(total as u64, Ordering::Relaxed);
		map.insert(key.to_vec(), ReadCacheEntry::read(values.clone()));

		let mut out = values;
		out.extend(tx_extend);
		Ok(out)
	}

	fn read_all(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>> {
		let tx_ops = self.tx.read().as_ref().map(|tx| tx.get_all_for_index(index));
		let snapshot = self.cache.lock()[index as usize].clone();

		let mut all = self.db.read_all(index)?;
		for (key, entry) in snapshot {
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
		if let Some(ops) = tx_ops {
			common::merge_tx_ops_multi(&mut all, ops);
		}
		Ok(all)
	}

	fn read_all_unique(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, DbValue>> {
		let tx_ops = self.tx.read().as_ref().map(|tx| tx.get_all_for_index(index));
		let snapshot = self.cache.lock()[index as usize].clone();

		let mut all = self.db.read_all_unique(index)?;
		for (key, entry) in snapshot {
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
			let mut cache = self.cache.lock();
			let map = &mut cache[index as usize];
			if index.duplicates_allowed() {
				Self::append_to_cache(&*self.db, &self.approx_size, map, index, key, value)?;
			} else {
				self.approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
				map.insert(key.to_vec(), ReadCacheEntry::written(vec![value.to_vec()]));
			}
		}
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
		self.cache.lock()[index as usize].insert(key.to_vec(), ReadCacheEntry::erased());
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

		let mut cache = self.cache.lock();
		let map = &mut cache[index as usize];
		if let Some(entry) = map.get(key) {
			if entry.is_negative() {
				return Ok(false);
			}
			if !entry.values().is_empty() {
				return Ok(true);
			}
		}

		if index.duplicates_allowed() {
			let values = self.db.read_multiple(index, key)?;
			if values.is_empty() {
				return Ok(false);
			}
			let total: usize = values.iter().map(|v| v.len()).sum();
			self.approx_size.fetch_add(total as u64, Ordering::Relaxed);
			map.insert(key.to_vec(), ReadCacheEntry::read(values));
			Ok(true)
		} else {
			match self.db.read(index, key, 0, None)? {
				Some(value) => {
					self.approx_size.fetch_add(value.len() as u64, Ordering::Relaxed);
					map.insert(key.to_vec(), ReadCacheEntry::read(vec![value]));
					Ok(true)
				}
				None => Ok(false),
			}
		}
	}

	fn begin_transaction(&self, _expected_bytes: usize) -> DbResult<()> {
		let mut tx = self.tx.write();
		if tx.is_some() {
			return Err(DbError::TransactionAlreadyActive);
		}
		*tx = Some(HierarchicalDb::new("write-back"));
		Ok(())
	}

	fn commit_transaction(&self) -> DbResult<()> {
		let tx = self.tx.write().take().ok_or(DbError::NoActiveTransaction)?;
		let tx_data = common::collect_tx_data(&tx);
		drop(tx);

		{
			let mut cache = self.cache.lock();
			for (position, ops) in tx_data.into_iter().enumerate() {
				let index = Index::ALL[position];
				let map = &mut cache[position];
				for (key, op) in ops {
					match op.op() {
						WriteOperation::Append => {
							for value in op.values() {
								Self::append_to_cache(
									&*self.db,
									&self.approx_size,
									map,
									index,
									&key,
									value,
								)?;
							}
						}
						WriteOperation::Set => {
							if let Some(first) = op.values().first() {
								self.approx_size.fetch_add(first.len() as u64, Ordering::Relaxed);
								map.insert(key, ReadCacheEntry::written(vec![first.clone()]));
							}
						}
						WriteOperation::Erase => {
							map.insert(key, ReadCacheEntry::erased());
						}
					}
				}
			}
		}
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
		self.clear_cache();
		self.db.clear_all_data()
	}

	fn close(&self) {
		*self.tx.write() = None;
		// best effort: buffered writes are lost otherwise
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

	fn setup() -> (Arc<InMemory>, WriteBackCache) {
		let backend = Arc::new(tierdb_memorydb::create());
		let cache = WriteBackCache::new(backend.clone(), 0);
		(backend, cache)
	}

	#[test]
	fn shared_trait_tests() {
		let (_, cache) = setup();
		tierdb_shared_tests::run_all(&cache).unwrap();
	}

	#[test]
	fn writes_stay_buffered_until_flush() {
		let (backend, cache) = setup();
		cache.write(MAIN, b"k", b"v").unwrap();

		assert!(!backend.exists(MAIN, b"k").unwrap());
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");

		cache.flush().unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
		assert_eq!(cache.flush_count(), 1);

		// the cache was cleared, the value now comes from the backend
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
	}

	#[test]
	fn erase_reaches_backend_on_flush() {
		let (backend, cache) = setup();
		backend.write(MAIN, b"k", b"durable").unwrap();

		cache.erase(MAIN, b"k").unwrap();
		assert!(!cache.exists(MAIN, b"k").unwrap());
		assert!(backend.exists(MAIN, b"k").unwrap());

		cache.flush().unwrap();
		assert!(!backend.exists(MAIN, b"k").unwrap());
	}

	#[test]
	fn multi_write_pulls_existing_backend_values_first() {
		let (backend, cache) = setup();
		backend.write(NAMES, b"k", b"v1").unwrap();

		cache.write(NAMES, b"k", b"v2").unwrap();
		assert_eq!(
			cache.read_multiple(NAMES, b"k").unwrap(),
			vec![b"v1".to_vec(), b"v2".to_vec()]
		);

		cache.flush().unwrap();
		assert_eq!(
			backend.read_multiple(NAMES, b"k").unwrap(),
			vec![b"v1".to_vec(), b"v2".to_vec()]
		);
	}

	#[test]
	fn commit_drains_into_the_cache_not_the_backend() {
		let (backend, cache) = setup();
		cache.begin_transaction(0).unwrap();
		cache.write(MAIN, b"k", b"v").unwrap();
		cache.commit_transaction().unwrap();

		assert!(!backend.exists(MAIN, b"k").unwrap());
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");

		cache.flush().unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
	}

	#[test]
	fn automatic_flush_when_buffered_bytes_exceed_budget() {
		let backend = Arc::new(tierdb_memorydb::create());
		let cache = WriteBackCache::new(backend.clone(), 16);

		cache.write(MAIN, b"small", b"x").unwrap();
		assert_eq!(cache.flush_count(), 0);

		cache.write(MAIN, b"large", &[0u8; 64]).unwrap();
		assert_eq!(cache.flush_count(), 1);
		assert!(backend.exists(MAIN, b"small").unwrap());
		assert!(backend.exists(MAIN, b"large").unwrap());
	}

	#[test]
	fn failed_flush_keeps_the_cache() {
		let (backend, cache) = setup();
		cache.write(MAIN, b"k", b"v").unwrap();

		// a backend with an already-open batch refuses another one
		backend.begin_transaction(0).unwrap();
		assert!(cache.flush().is_err());
		assert_eq!(cache.flush_failures(), 1);
		assert_eq!(cache.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");

		backend.abort_transaction().unwrap();
		cache.flush().unwrap();
		assert_eq!(backend.read(MAIN, b"k", 0, None).unwrap().unwrap(), b"v");
	}
}
