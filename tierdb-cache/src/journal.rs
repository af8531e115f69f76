// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ordered journal of writes, erases and whole committed transactions.
//!
//! Reads walk the journal in reverse: per key, the walk stops at the first
//! `Erase` encountered, because it nullifies everything older, including
//! the backend's durable state underneath the journal.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tierdb::{DbValue, Index};

use crate::hierarchical::HierarchicalDb;
use crate::operation::WriteOperation;

/// One record in submission order.
pub enum JournalEntry {
	Write { index: Index, key: Vec<u8>, value: DbValue },
	Erase { index: Index, key: Vec<u8> },
	/// A committed transaction, recorded atomically; queried through its
	/// collapsed per-key operations.
	Transaction(Arc<HierarchicalDb>),
}

/// What the journal knows about one key, one record's worth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredEntry {
	Write(DbValue),
	Erase,
}

/// The journal itself. Callers provide the locking.
#[derive(Default)]
pub struct JournalStore {
	entries: Vec<JournalEntry>,
}

impl JournalStore {
	pub fn new() -> JournalStore {
		JournalStore { entries: Vec::new() }
	}

	pub fn add(&mut self, entry: JournalEntry) {
		self.entries.push(entry);
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// The records in submission order, for draining to a backend.
	pub fn entries(&self) -> &[JournalEntry] {
		&self.entries
	}

	/// The newest record concerning (index, key), if any.
	pub fn get_one(&self, index: Index, key: &[u8]) -> Option<StoredEntry> {
		for entry in self.entries.iter().rev() {
			match entry {
				JournalEntry::Write { index: i, key: k, value } if *i == index && k == key => {
					return Some(StoredEntry::Write(value.clone()))
				}
				JournalEntry::Erase { index: i, key: k } if *i == index && k == key => {
					return Some(StoredEntry::Erase)
				}
				JournalEntry::Transaction(tx) => {
					if let Some(op) = tx.get_op(index, key) {
						match op.op() {
							WriteOperation::Append | WriteOperation::Set => {
								if let Some(value) = op.first_value() {
									return Some(StoredEntry::Write(value.clone()));
								}
							}
							WriteOperation::Erase => return Some(StoredEntry::Erase),
						}
					}
				}
				_ => {}
			}
		}
		None
	}

	/// Every record concerning (index, key), oldest first. The walk stops
	/// at the newest `Erase`, which is then the first element returned.
	pub fn get(&self, index: Index, key: &[u8]) -> Vec<StoredEntry> {
		let mut collected = Vec::new();
		'walk: for entry in self.entries.iter().rev() {
			match entry {
				JournalEntry::Write { index: i, key: k, value } if *i == index && k == key => {
					collected.push(StoredEntry::Write(value.clone()));
				}
				JournalEntry::Erase { index: i, key: k } if *i == index && k == key => {
					collected.push(StoredEntry::Erase);
					break 'walk;
				}
				JournalEntry::Transaction(tx) => {
					if let Some(op) = tx.get_op(index, key) {
						match op.op() {
							WriteOperation::Append => {
								for value in op.visible_values().iter().rev() {
									collected.push(StoredEntry::Write(value.clone()));
								}
							}
							WriteOperation::Set => {
								if let Some(value) = op.first_value() {
									collected.push(StoredEntry::Write(value.clone()));
								}
							}
							WriteOperation::Erase => {
								collected.push(StoredEntry::Erase);
								break 'walk;
							}
						}
					}
				}
				_ => {}
			}
		}
		collected.reverse();
		collected
	}

	/// Per-key journal effect for a whole index, each value list oldest
	/// first with an `Erase` marker in front where one cuts off the
	/// backend state.
	pub fn get_all(&self, index: Index) -> BTreeMap<Vec<u8>, Vec<StoredEntry>> {
		// an erase means everything before it does not count, so track
		// erased keys while walking backwards
		let mut erased: BTreeSet<Vec<u8>> = BTreeSet::new();
		let mut result: BTreeMap<Vec<u8>, Vec<StoredEntry>> = BTreeMap::new();

		for entry in self.entries.iter().rev() {
			match entry {
				JournalEntry::Write { index: i, key, value } if *i == index => {
					if erased.contains(key) {
						continue;
					}
					result.entry(key.clone()).or_default().push(StoredEntry::Write(value.clone()));
				}
				JournalEntry::Erase { index: i, key } if *i == index => {
					if erased.contains(key) {
						continue;
					}
					result.entry(key.clone()).or_default().push(StoredEntry::Erase);
					erased.insert(key.clone());
				}
				JournalEntry::Transaction(tx) => {
					for (key, op) in tx.get_all_for_index(index) {
						if erased.contains(&key) {
							continue;
						}
						match op.op() {
							WriteOperation::Append => {
								let slot = result.entry(key).or_default();
								for value in op.visible_values().iter().rev() {
									slot.push(StoredEntry::Write(value.clone()));
								}
							}
							WriteOperation::Set => {
								if let Some(value) = op.first_value() {
									result
										.entry(key)
										.or_default()
										.push(StoredEntry::Write(value.clone()));
								}
							}
							WriteOperation::Erase => {
								result.entry(key.clone()).or_default().push(StoredEntry::Erase);
								erased.insert(key);
							}
						}
					}
				}
				_ => {}
			}
		}

		for entries in result.values_mut() {
			entries.reverse();
		}
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const NAMES: Index = Index::Ntp1TokenNames;

	fn write(index: Index, key: &[u8], value: &[u8]) -> JournalEntry {
		JournalEntry::Write { index, key: key.to_vec(), value: value.to_vec() }
	}

	fn erase(index: Index, key: &[u8]) -> JournalEntry {
		JournalEntry::Erase { index, key: key.to_vec() }
	}

	#[test]
	fn newest_record_wins() {
		let mut journal = JournalStore::new();
		journal.add(write(Index::Main, b"k", b"old"));
		journal.add(write(Index::Main, b"k", b"new"));
		assert_eq!(journal.get_one(Index::Main, b"k"), Some(StoredEntry::Write(b"new".to_vec())));
		assert_eq!(journal.get_one(Index::Main, b"other"), None);

		journal.add(erase(Index::Main, b"k"));
		assert_eq!(journal.get_one(Index::Main, b"k"), Some(StoredEntry::Erase));
	}

	#[test]
	fn reverse_walk_stops_at_erase() {
		let mut journal = JournalStore::new();
		journal.add(write(NAMES, b"k", b"before"));
		journal.add(erase(NAMES, b"k"));
		journal.add(write(NAMES, b"k", b"v1"));
		journal.add(write(NAMES, b"k", b"v2"));

		assert_eq!(
			journal.get(NAMES, b"k"),
			vec![
				StoredEntry::Erase,
				StoredEntry::Write(b"v1".to_vec()),
				StoredEntry::Write(b"v2".to_vec()),
			]
		);
	}

	#[test]
	fn transaction_entries_expose_collapsed_ops() {
		let tx = HierarchicalDb::new("tx");
		tx.append(NAMES, b"k", b"t1").unwrap();
		tx.append(NAMES, b"k", b"t2").unwrap();
		tx.erase(Index::Main, b"gone").unwrap();

		let mut journal = JournalStore::new();
		journal.add(write(NAMES, b"k", b"w0"));
		journal.add(JournalEntry::Transaction(tx));

		assert_eq!(
			journal.get(NAMES, b"k"),
			vec![
				StoredEntry::Write(b"w0".to_vec()),
				StoredEntry::Write(b"t1".to_vec()),
				StoredEntry::Write(b"t2".to_vec()),
			]
		);
		assert_eq!(journal.get_one(NAMES, b"k"), Some(StoredEntry::Write(b"t1".to_vec())));
		assert_eq!(journal.get_one(Index::Main, b"gone"), Some(StoredEntry::Erase));
	}

	#[test]
	fn get_all_tracks_erased_keys() {
		let mut journal = JournalStore::new();
		journal.add(write(NAMES, b"a", b"lost"));
		journal.add(erase(NAMES, b"a"));
		journal.add(write(NAMES, b"a", b"kept"));
		journal.add(write(NAMES, b"b", b"b1"));

		let all = journal.get_all(NAMES);
		assert_eq!(
			all[&b"a".to_vec()],
			vec![StoredEntry::Erase, StoredEntry::Write(b"kept".to_vec())]
		);
		assert_eq!(all[&b"b".to_vec()], vec![StoredEntry::Write(b"b1".to_vec())]);
	}
}
