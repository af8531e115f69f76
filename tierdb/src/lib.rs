// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Indexed key-value store abstraction.
//!
//! A store is split into a fixed set of logical sub-databases ([`Index`]),
//! some of which keep a single value per key and some of which keep many
//! ("multi" indices). Implementations provide point reads with slice
//! semantics, duplicate-aware reads, and a single batched-write transaction
//! at a time with commit/abort.

use std::collections::BTreeMap;

use thiserror::Error;

/// Database value.
pub type DbValue = Vec<u8>;

/// Result alias used across every store boundary.
pub type DbResult<T> = Result<T, DbError>;

/// Error returned by store implementations.
///
/// An absent key is not an error anywhere in this interface: reads return
/// `Ok(None)` or an empty collection instead.
#[derive(Debug, Error)]
pub enum DbError {
	/// The backing store failed with a backend-specific error code.
	#[error("backend error (code {code}): {message}")]
	Backend { code: i32, message: String },
	/// Filesystem-level failure.
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
	/// Operation attempted on a closed database.
	#[error("database is closed")]
	Closed,
	/// `begin_transaction` while a batched-write transaction is open.
	#[error("a batched-write transaction is already active")]
	TransactionAlreadyActive,
	/// `commit_transaction`/`abort_transaction` without an open transaction.
	#[error("no batched-write transaction is active")]
	NoActiveTransaction,
	/// Misuse of a transaction overlay layered above the store.
	#[error("transaction error: {0}")]
	Transaction(String),
	/// The store returned data that failed internal checks.
	#[error("database corrupted: {0}")]
	Corrupted(String),
}

/// Logical sub-databases of the store.
///
/// The numbering and on-disk names are stable: data files written by one
/// version must remain readable by the next, so neither may ever change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Index {
	Main = 0,
	BlockIndex = 1,
	Blocks = 2,
	Tx = 3,
	Ntp1Tx = 4,
	Ntp1TokenNames = 5,
	AddrsVsPubKeys = 6,
	BlockMetadata = 7,
	BlockHeights = 8,
	Stakes = 9,
}

impl Index {
	/// Number of indices.
	pub const COUNT: usize = 10;

	/// All indices, in numbering order.
	pub const ALL: [Index; Index::COUNT] = [
		Index::Main,
		Index::BlockIndex,
		Index::Blocks,
		Index::Tx,
		Index::Ntp1Tx,
		Index::Ntp1TokenNames,
		Index::AddrsVsPubKeys,
		Index::BlockMetadata,
		Index::BlockHeights,
		Index::Stakes,
	];

	/// Whether this index keeps multiple values per key.
	pub fn duplicates_allowed(self) -> bool {
		matches!(self, Index::Ntp1TokenNames)
	}

	/// Name of the named database backing this index on disk.
	pub fn db_name(self) -> &'static str {
		match self {
			Index::Main => "MainDb",
			Index::BlockIndex => "BlockIndexDb",
			Index::Blocks => "BlocksDb",
			Index::Tx => "TxDb",
			Index::Ntp1Tx => "Ntp1txDb",
			Index::Ntp1TokenNames => "Ntp1NamesDb",
			Index::AddrsVsPubKeys => "AddrsVsPubKeysDb",
			Index::BlockMetadata => "BlockMetadataDb",
			// the trailing-caps spelling is what older data files were
			// created with
			Index::BlockHeights => "BlockHeightsDB",
			Index::Stakes => "StakesDB",
		}
	}
}

/// Returns `value[offset .. offset + size]`, clipped to the value bounds.
///
/// An offset past the end yields an empty value, not an absent one; a size
/// running past the end clips to the end.
pub fn slice_value(value: &[u8], offset: usize, size: Option<usize>) -> DbValue {
	let start = offset.min(value.len());
	let wanted = size.unwrap_or(value.len()).min(value.len());
	let take = wanted.min(value.len() - start);
	value[start..start + take].to_vec()
}

/// Generic indexed key-value database.
///
/// The `Sync` bound implies interior synchronization: all methods take
/// `&self` and implementations guard their own state.
///
/// At most one batched-write transaction is open at a time; nested
/// transactions are not supported. While one is open, `write`/`erase` are
/// recorded into it and reads observe its uncommitted state.
pub trait KeyValueDB: Send + Sync {
	/// Get a slice of the value stored under `key`, per [`slice_value`]
	/// semantics. For a multi index this addresses one arbitrary value.
	fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>>;

	/// Get every value stored under `key`. An absent key yields an empty
	/// vector. Only meaningful for indices with duplicates, but valid on
	/// any index.
	fn read_multiple(&self, index: Index, key: &[u8]) -> DbResult<Vec<DbValue>>;

	/// Get the full contents of an index, all values per key.
	fn read_all(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>>;

	/// Get the full contents of an index, one value per key. For a multi
	/// index the surviving value per key is arbitrary; callers must not
	/// rely on which one it is.
	fn read_all_unique(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, DbValue>>;

	/// Store `value` under `key`. Overwrites on a unique index, adds to the
	/// key's values on a multi index.
	fn write(&self, index: Index, key: &[u8], value: &[u8]) -> DbResult<()>;

	/// Remove `key`. Removing an absent key succeeds.
	fn erase(&self, index: Index, key: &[u8]) -> DbResult<()>;

	/// Remove `key` and every value stored under it. The spelling clients
	/// use on multi indices; equivalent to [`KeyValueDB::erase`] elsewhere.
	fn erase_all(&self, index: Index, key: &[u8]) -> DbResult<()>;

	/// Whether any value is stored under `key`.
	fn exists(&self, index: Index, key: &[u8]) -> DbResult<bool>;

	/// Open the batched-write transaction. `expected_bytes` is a sizing
	/// hint for backends that reserve space up front; 0 means unknown.
	fn begin_transaction(&self, expected_bytes: usize) -> DbResult<()>;

	/// Atomically apply everything recorded since `begin_transaction`.
	fn commit_transaction(&self) -> DbResult<()>;

	/// Discard everything recorded since `begin_transaction`.
	fn abort_transaction(&self) -> DbResult<()>;

	/// Remove all stored data and leave the store open and empty.
	fn clear_all_data(&self) -> DbResult<()>;

	/// Shut the store down. Further calls return [`DbError::Closed`] or
	/// behave as no-ops, implementation-defined.
	fn close(&self);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn index_numbering_is_stable() {
		for (position, index) in Index::ALL.iter().enumerate() {
			assert_eq!(*index as usize, position);
		}
		assert_eq!(Index::ALL.len(), Index::COUNT);
	}

	#[test]
	fn only_token_names_allows_duplicates() {
		let dup: Vec<_> = Index::ALL.iter().filter(|i| i.duplicates_allowed()).collect();
		assert_eq!(dup, vec![&Index::Ntp1TokenNames]);
	}

	#[test]
	fn db_names_are_unique() {
		let mut names: Vec<_> = Index::ALL.iter().map(|i| i.db_name()).collect();
		names.sort_unstable();
		names.dedup();
		assert_eq!(names.len(), Index::COUNT);
	}

	#[test]
	fn slice_semantics() {
		let v = b"0123456789";
		assert_eq!(slice_value(v, 0, None), b"0123456789");
		assert_eq!(slice_value(v, 3, None), b"3456789");
		assert_eq!(slice_value(v, 3, Some(4)), b"3456");
		// size past the end clips
		assert_eq!(slice_value(v, 8, Some(100)), b"89");
		// offset past the end yields empty, not absent
		assert_eq!(slice_value(v, 100, None), b"");
		assert_eq!(slice_value(v, 10, Some(1)), b"");
		assert_eq!(slice_value(b"", 0, None), b"");
	}
}
