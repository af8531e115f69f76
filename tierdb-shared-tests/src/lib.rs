// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared tests for tierdb functionality, to be executed against actual
//! implementations.
//!
//! Each function expects an open, empty database. Multi-index value order
//! is backend-defined, so tests over duplicates either use values whose
//! byte order matches insertion order or compare sorted.

use tierdb::{DbResult, Index, KeyValueDB};

/// Store, read back, erase, check gone on a unique index.
pub fn test_unique_round_trip(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"k1", b"val1")?;
	assert_eq!(db.read(Index::Main, b"k1", 0, None)?.unwrap(), b"val1");
	assert!(db.exists(Index::Main, b"k1")?);

	db.erase(Index::Main, b"k1")?;
	assert!(!db.exists(Index::Main, b"k1")?);
	assert_eq!(db.read(Index::Main, b"k1", 0, None)?, None);
	Ok(())
}

/// A second write on a unique index overwrites the sole value.
pub fn test_unique_overwrite(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Tx, b"k", b"first")?;
	db.write(Index::Tx, b"k", b"second")?;
	assert_eq!(db.read(Index::Tx, b"k", 0, None)?.unwrap(), b"second");
	assert_eq!(db.read_multiple(Index::Tx, b"k")?, vec![b"second".to_vec()]);
	Ok(())
}

/// Multi-index accumulation and `erase_all`.
pub fn test_multi_append_and_erase_all(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Ntp1TokenNames, b"k1", b"v1")?;
	db.write(Index::Ntp1TokenNames, b"k1", b"v2")?;
	db.write(Index::Ntp1TokenNames, b"k1", b"v3")?;

	let values = db.read_multiple(Index::Ntp1TokenNames, b"k1")?;
	assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);

	let all = db.read_all(Index::Ntp1TokenNames)?;
	assert_eq!(all.len(), 1);
	assert_eq!(all[&b"k1".to_vec()], vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]);

	db.erase_all(Index::Ntp1TokenNames, b"k1")?;
	assert!(!db.exists(Index::Ntp1TokenNames, b"k1")?);
	assert!(db.read_multiple(Index::Ntp1TokenNames, b"k1")?.is_empty());
	Ok(())
}

/// Offset/size clipping on reads.
pub fn test_slice_reads(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Blocks, b"k", b"0123456789")?;

	assert_eq!(db.read(Index::Blocks, b"k", 0, None)?.unwrap(), b"0123456789");
	assert_eq!(db.read(Index::Blocks, b"k", 4, None)?.unwrap(), b"456789");
	assert_eq!(db.read(Index::Blocks, b"k", 4, Some(3))?.unwrap(), b"456");
	// size past the end clips to the end
	assert_eq!(db.read(Index::Blocks, b"k", 8, Some(50))?.unwrap(), b"89");
	// offset past the end returns the empty value, not absent
	assert_eq!(db.read(Index::Blocks, b"k", 50, None)?.unwrap(), b"");
	// a miss stays a miss regardless of offset/size
	assert_eq!(db.read(Index::Blocks, b"missing", 50, Some(3))?, None);
	Ok(())
}

/// Absent keys are not errors anywhere.
pub fn test_absent_keys(db: &dyn KeyValueDB) -> DbResult<()> {
	assert_eq!(db.read(Index::Main, b"nope", 0, None)?, None);
	assert!(db.read_multiple(Index::Ntp1TokenNames, b"nope")?.is_empty());
	assert!(!db.exists(Index::Main, b"nope")?);
	db.erase(Index::Main, b"nope")?;
	db.erase_all(Index::Ntp1TokenNames, b"nope")?;
	Ok(())
}

/// `read_all` and `read_all_unique` over mixed contents.
pub fn test_read_all(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"a", b"1")?;
	db.write(Index::Main, b"b", b"2")?;
	db.write(Index::Main, b"c", b"3")?;
	db.erase(Index::Main, b"b")?;

	let all = db.read_all(Index::Main)?;
	assert_eq!(all.len(), 2);
	assert_eq!(all[&b"a".to_vec()], vec![b"1".to_vec()]);
	assert_eq!(all[&b"c".to_vec()], vec![b"3".to_vec()]);

	let unique = db.read_all_unique(Index::Main)?;
	assert_eq!(unique.len(), 2);
	assert_eq!(unique[&b"a".to_vec()], b"1".to_vec());

	// for a multi index one arbitrary value per key survives
	db.write(Index::Ntp1TokenNames, b"t", b"x")?;
	db.write(Index::Ntp1TokenNames, b"t", b"y")?;
	let unique = db.read_all_unique(Index::Ntp1TokenNames)?;
	assert_eq!(unique.len(), 1);
	let survivor = &unique[&b"t".to_vec()];
	assert!(survivor == &b"x".to_vec() || survivor == &b"y".to_vec());
	Ok(())
}

/// `begin; write; commit` makes the writes durable and atomic.
pub fn test_batch_commit(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"kept", b"before")?;

	db.begin_transaction(1 << 12)?;
	db.write(Index::Main, b"kept", b"after")?;
	db.write(Index::Main, b"fresh", b"value")?;
	db.erase(Index::Main, b"gone")?;
	db.commit_transaction()?;

	assert_eq!(db.read(Index::Main, b"kept", 0, None)?.unwrap(), b"after");
	assert_eq!(db.read(Index::Main, b"fresh", 0, None)?.unwrap(), b"value");
	assert!(!db.exists(Index::Main, b"gone")?);
	Ok(())
}

/// `begin; write; abort` leaves the store untouched.
pub fn test_batch_abort(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"stable", b"original")?;

	db.begin_transaction(0)?;
	db.write(Index::Main, b"stable", b"changed")?;
	db.write(Index::Main, b"new", b"value")?;
	db.abort_transaction()?;

	assert_eq!(db.read(Index::Main, b"stable", 0, None)?.unwrap(), b"original");
	assert!(!db.exists(Index::Main, b"new")?);
	Ok(())
}

/// Reads observe the uncommitted state of the open batch.
pub fn test_batch_reads_uncommitted(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"k", b"committed")?;
	db.write(Index::Ntp1TokenNames, b"m", b"v1")?;

	db.begin_transaction(0)?;
	db.write(Index::Main, b"k", b"pending")?;
	db.write(Index::Ntp1TokenNames, b"m", b"v2")?;

	assert_eq!(db.read(Index::Main, b"k", 0, None)?.unwrap(), b"pending");
	let mut values = db.read_multiple(Index::Ntp1TokenNames, b"m")?;
	values.sort_unstable();
	assert_eq!(values, vec![b"v1".to_vec(), b"v2".to_vec()]);

	db.erase(Index::Main, b"k")?;
	assert_eq!(db.read(Index::Main, b"k", 0, None)?, None);
	assert!(!db.exists(Index::Main, b"k")?);

	db.abort_transaction()?;
	assert_eq!(db.read(Index::Main, b"k", 0, None)?.unwrap(), b"committed");
	Ok(())
}

/// Indices do not leak into each other.
pub fn test_index_isolation(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"shared-key", b"main")?;
	db.write(Index::BlockIndex, b"shared-key", b"blockindex")?;

	assert_eq!(db.read(Index::Main, b"shared-key", 0, None)?.unwrap(), b"main");
	assert_eq!(db.read(Index::BlockIndex, b"shared-key", 0, None)?.unwrap(), b"blockindex");

	db.erase(Index::Main, b"shared-key")?;
	assert!(db.exists(Index::BlockIndex, b"shared-key")?);
	Ok(())
}

/// `clear_all_data` leaves an open, empty store behind.
pub fn test_clear_all_data(db: &dyn KeyValueDB) -> DbResult<()> {
	db.write(Index::Main, b"k", b"v")?;
	db.write(Index::Ntp1TokenNames, b"m", b"v")?;
	db.clear_all_data()?;

	assert!(!db.exists(Index::Main, b"k")?);
	assert!(db.read_all(Index::Ntp1TokenNames)?.is_empty());

	// still usable afterwards
	db.write(Index::Main, b"k2", b"v2")?;
	assert!(db.exists(Index::Main, b"k2")?);
	Ok(())
}

/// Run every shared test against a fresh view of the same database.
///
/// The tests use disjoint keys except where they deliberately overwrite, so
/// running them in sequence against one store is fine as long as it starts
/// empty.
pub fn run_all(db: &dyn KeyValueDB) -> DbResult<()> {
	test_unique_round_trip(db)?;
	test_unique_overwrite(db)?;
	test_multi_append_and_erase_all(db)?;
	test_slice_reads(db)?;
	test_absent_keys(db)?;
	test_read_all(db)?;
	test_batch_commit(db)?;
	test_batch_abort(db)?;
	test_batch_reads_uncommitted(db)?;
	test_index_isolation(db)?;
	test_clear_all_data(db)?;
	Ok(())
}
