// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A [`KeyValueDB`] implementation living in memory.
//!
//! Generally intended for tests and not particularly optimized. Values per
//! key keep insertion order on multi indices.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use tierdb::{slice_value, DbError, DbResult, DbValue, Index, KeyValueDB};

type IndexMaps = Vec<BTreeMap<Vec<u8>, Vec<DbValue>>>;

enum PendingOp {
	Write(Index, Vec<u8>, DbValue),
	Erase(Index, Vec<u8>),
}

/// An in-memory database fulfilling the [`KeyValueDB`] trait.
pub struct InMemory {
	// `None` when closed
	maps: RwLock<Option<IndexMaps>>,
	batch: Mutex<Option<Vec<PendingOp>>>,
}

/// Create an in-memory database with one map per [`Index`].
pub fn create() -> InMemory {
	InMemory { maps: RwLock::new(Some(empty_maps())), batch: Mutex::new(None) }
}

fn empty_maps() -> IndexMaps {
	(0..Index::COUNT).map(|_| BTreeMap::new()).collect()
}

// The net effect the open batch has on one key: whether the committed state
// underneath is shadowed by an erase, and the values written since.
struct BatchEffect {
	erased: bool,
	values: Vec<DbValue>,
}

fn batch_effect(ops: &[PendingOp], index: Index, key: &[u8]) -> Option<BatchEffect> {
	let mut effect: Option<BatchEffect> = None;
	for op in ops {
		match op {
			PendingOp::Write(i, k, v) if *i == index && k == key => {
				let e = effect.get_or_insert(BatchEffect { erased: false, values: Vec::new() });
				if index.duplicates_allowed() {
					e.values.push(v.clone());
				} else {
					e.values = vec![v.clone()];
				}
			}
			PendingOp::Erase(i, k) if *i == index && k == key => {
				effect = Some(BatchEffect { erased: true, values: Vec::new() });
			}
			_ => {}
		}
	}
	effect
}

impl InMemory {
	fn with_maps<R>(&self, f: impl FnOnce(&IndexMaps) -> R) -> DbResult<R> {
		match &*self.maps.read() {
			Some(maps) => Ok(f(maps)),
			None => Err(DbError::Closed),
		}
	}

	fn with_maps_mut<R>(&self, f: impl FnOnce(&mut IndexMaps) -> R) -> DbResult<R> {
		match &mut *self.maps.write() {
			Some(maps) => Ok(f(maps)),
			None => Err(DbError::Closed),
		}
	}

	fn apply(maps: &mut IndexMaps, op: &PendingOp) {
		match op {
			PendingOp::Write(index, key, value) => {
				let map = &mut maps[*index as usize];
				if index.duplicates_allowed() {
					map.entry(key.clone()).or_default().push(value.clone());
				} else {
					map.insert(key.clone(), vec![value.clone()]);
				}
			}
			PendingOp::Erase(index, key) => {
				maps[*index as usize].remove(key);
			}
		}
	}
}

impl KeyValueDB for InMemory {
	fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>> {
		let batch = self.batch.lock();
		if let Some(effect) = batch.as_deref().and_then(|ops| batch_effect(ops, index, key)) {
			if let Some(first) = effect.values.first() {
				return Ok(Some(slice_value(first, offset, size)));
			}
			if effect.erased {
				return Ok(None);
			}
		}
		self.with_maps(|maps| {
			maps[index as usize]
				.get(key)
				.and_then(|values| values.first())
				.map(|v| slice_value(v, offset, size))
		})
	}

	fn read_multiple(&self, index: Index, key: &[u8]) -> DbResult<Vec<DbValue>> {
		let batch = self.batch.lock();
		let effect = batch.as_deref().and_then(|ops| batch_effect(ops, index, key));
		let mut values =
			self.with_maps(|maps| maps[index as usize].get(key).cloned().unwrap_or_default())?;
		if let Some(effect) = effect {
			if effect.erased {
				return Ok(effect.values);
			}
			if index.duplicates_allowed() {
				values.extend(effect.values);
			} else if !effect.values.is_empty() {
				values = effect.values;
			}
		}
		Ok(values)
	}

	fn read_all(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>> {
		let batch = self.batch.lock();
		let mut all = self.with_maps(|maps| maps[index as usize].clone())?;
		if let Some(ops) = batch.as_deref() {
			for op in ops {
				match op {
					PendingOp::Write(i, k, v) if *i == index => {
						if index.duplicates_allowed() {
							all.entry(k.clone()).or_default().push(v.clone());
						} else {
							all.insert(k.clone(), vec![v.clone()]);
						}
					}
					PendingOp::Erase(i, k) if *i == index => {
						all.remove(k);
					}
					_ => {}
				}
			}
		}
		Ok(all)
	}

	fn read_all_unique(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, DbValue>> {
		Ok(self
			.read_all(index)?
			.into_iter()
			.filter_map(|(k, mut vs)| if vs.is_empty() { None } else { Some((k, vs.swap_remove(0))) })
			.collect())
	}

	fn write(&self, index: Index, key: &[u8], value: &[u8]) -> DbResult<()> {
		let mut batch = self.batch.lock();
		let op = PendingOp::Write(index, key.to_vec(), value.to_vec());
		match &mut *batch {
			Some(ops) => {
				// the store stays untouched until commit
				self.with_maps(|_| ())?;
				ops.push(op);
				Ok(())
			}
			None => self.with_maps_mut(|maps| Self::apply(maps, &op)),
		}
	}

	fn erase(&self, index: Index, key: &[u8]) -> DbResult<()> {
		let mut batch = self.batch.lock();
		let op = PendingOp::Erase(index, key.to_vec());
		match &mut *batch {
			Some(ops) => {
				self.with_maps(|_| ())?;
				ops.push(op);
				Ok(())
			}
			None => self.with_maps_mut(|maps| Self::apply(maps, &op)),
		}
	}

	fn erase_all(&self, index: Index, key: &[u8]) -> DbResult<()> {
		self.erase(index, key)
	}

	fn exists(&self, index: Index, key: &[u8]) -> DbResult<bool> {
		Ok(self.read(index, key, 0, None)?.is_some())
	}

	fn begin_transaction(&self, _expected_bytes: usize) -> DbResult<()> {
		let mut batch = self.batch.lock();
		if batch.is_some() {
			return Err(DbError::TransactionAlreadyActive);
		}
		self.with_maps(|_| ())?;
		*batch = Some(Vec::new());
		Ok(())
	}

	fn commit_transaction(&self) -> DbResult<()> {
		let mut batch = self.batch.lock();
		let ops = batch.take().ok_or(DbError::NoActiveTransaction)?;
		self.with_maps_mut(|maps| {
			for op in &ops {
				Self::apply(maps, op);
			}
		})
	}

	fn abort_transaction(&self) -> DbResult<()> {
		let mut batch = self.batch.lock();
		if batch.take().is_none() {
			return Err(DbError::NoActiveTransaction);
		}
		Ok(())
	}

	fn clear_all_data(&self) -> DbResult<()> {
		*self.batch.lock() = None;
		self.with_maps_mut(|maps| *maps = empty_maps())
	}

	fn close(&self) {
		*self.batch.lock() = None;
		*self.maps.write() = None;
	}
}
