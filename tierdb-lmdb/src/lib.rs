// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! [`KeyValueDB`] implementation backed by LMDB.
//!
//! One environment per database, one named LMDB database per [`Index`];
//! indices with duplicates are opened with `DUP_SORT` (value order within a
//! key is therefore LMDB's, not insertion order). Reads outside a
//! batched-write transaction run inside a short-lived read-only LMDB
//! transaction.
//!
//! The memory map auto-grows: when free space drops below the configured
//! margin, the map is enlarged. While the resize runs, a gate keeps new
//! LMDB transactions from starting and waits for in-flight ones to drain,
//! which is also the recovery path for `MDB_MAP_RESIZED` reported when
//! another process grew the map underneath us.

mod batch;
mod gate;

use std::{collections::BTreeMap, fs, path::{Path, PathBuf}};

use lmdb::{Cursor, Database as LmdbDb, DatabaseFlags, Environment, Error as LmdbError, RoTransaction, RwTransaction, Transaction};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tierdb::{slice_value, DbError, DbResult, DbValue, Index, KeyValueDB};

use crate::batch::{BatchOp, PendingBatch};
use crate::gate::{TxnGate, TxnTicket};

const MIB: usize = 1024 * 1024;

fn backend_err(e: LmdbError) -> DbError {
	DbError::Backend { code: e.to_err_code(), message: e.to_string() }
}

/// Database configuration.
#[derive(Clone)]
pub struct DatabaseConfig {
	/// Initial size of the memory map in bytes.
	pub map_size: usize,
	/// Fraction of the map that may be used before a resize is triggered.
	pub resize_percent: f64,
	/// Bytes added to the map by a percent-triggered resize.
	pub resize_step: usize,
	/// Lower bound on any single map increase.
	pub min_resize_step: usize,
	/// Remove any existing data before opening.
	pub start_new: bool,
}

impl Default for DatabaseConfig {
	fn default() -> DatabaseConfig {
		DatabaseConfig {
			map_size: 1 << 30,
			resize_percent: 0.9,
			resize_step: 1 << 30,
			min_resize_step: 1 << 28,
			start_new: false,
		}
	}
}

struct EnvironmentWithDatabases {
	// Transactions are atomic across all databases in an environment.
	env: Environment,
	// One named database per index. `LmdbDb` is essentially a `c_int`.
	dbs: Vec<LmdbDb>,
}

/// LMDB-backed database.
pub struct Database {
	path: PathBuf,
	config: DatabaseConfig,
	// write lock only to close or rebuild the environment
	env: RwLock<Option<EnvironmentWithDatabases>>,
	batch: Mutex<Option<PendingBatch>>,
	gate: TxnGate,
}

impl Database {
	/// Open the database directory with default settings. Creates it if it
	/// does not exist.
	pub fn open_default(path: &Path) -> DbResult<Database> {
		Database::open(path, DatabaseConfig::default())
	}

	/// Open the database directory. Creates it if it does not exist.
	///
	/// Note that it is unsafe to open the same path twice within one
	/// process.
	pub fn open(path: &Path, config: DatabaseConfig) -> DbResult<Database> {
		let db = Database {
			path: path.to_owned(),
			config,
			env: RwLock::new(None),
			batch: Mutex::new(None),
			gate: TxnGate::new(),
		};
		if db.config.start_new && path.exists() {
			fs::remove_dir_all(path)?;
		}
		let env = db.open_env()?;
		if db.need_resize(&env.env, 0) {
			info!("lmdb memory map needs a resize right after opening, doing that now");
			db.do_resize(&env.env, 0)?;
		}
		*db.env.write() = Some(env);
		Ok(db)
	}

	fn open_env(&self) -> DbResult<EnvironmentWithDatabases> {
		fs::create_dir_all(&self.path)?;
		let mut builder = Environment::new();
		builder.set_max_dbs(Index::COUNT as u32);
		builder.set_map_size(self.config.map_size);
		let env = builder.open(&self.path).map_err(backend_err)?;

		let mut dbs = Vec::with_capacity(Index::COUNT);
		for index in Index::ALL {
			let flags = if index.duplicates_allowed() {
				DatabaseFlags::DUP_SORT
			} else {
				DatabaseFlags::empty()
			};
			dbs.push(env.create_db(Some(index.db_name()), flags).map_err(backend_err)?);
		}

		info!("opened lmdb environment at {}", self.path.display());
		Ok(EnvironmentWithDatabases { env, dbs })
	}

	// `threshold` is the space an upcoming batch expects to need; 0 asks
	// for the percent-based check.
	fn need_resize(&self, env: &Environment, threshold: usize) -> bool {
		let (info, stat) = match (env.info(), env.stat()) {
			(Ok(i), Ok(s)) => (i, s),
			_ => return false,
		};
		let size_used = stat.page_size() as usize * info.last_pgno();

		if threshold > 0 {
			if info.map_size().saturating_sub(size_used) < threshold {
				warn!("lmdb map resize threshold met (size-based)");
				return true;
			}
			return false;
		}

		if size_used as f64 / info.map_size() as f64 > self.config.resize_percent {
			warn!("lmdb map resize threshold met (percent-based)");
			return true;
		}
		false
	}

	// Must not be called while this thread holds a transaction ticket.
	fn do_resize(&self, env: &Environment, increase: usize) -> DbResult<()> {
		let increase = if increase == 0 {
			self.config.resize_step
		} else {
			// very small incremental changes in the map size are not
			// worth the quiesce they cost
			increase.max(self.config.min_resize_step)
		};

		let info = env.info().map_err(backend_err)?;
		let stat = env.stat().map_err(backend_err)?;
		let mut new_size = info.map_size() + increase;
		new_size += new_size % stat.page_size() as usize;

		self.gate.prevent_new();
		self.gate.wait_no_active();
		let result = env.set_map_size(new_size).map_err(backend_err);
		self.gate.allow_new();
		result?;

		info!(
			"lmdb map size increased. old: {} MiB, new: {} MiB",
			info.map_size() / MIB,
			new_size / MIB
		);
		Ok(())
	}

	// Recovery for `MDB_MAP_RESIZED`: another handle grew the map; adopt
	// the on-disk size. The caller must have dropped its ticket.
	fn adopt_resized(&self, env: &Environment) {
		warn!("MDB_MAP_RESIZED detected, adopting the new lmdb map size");
		self.gate.prevent_new();
		self.gate.wait_no_active();
		// a size of zero adopts whatever is on disk
		if let Err(e) = env.set_map_size(0) {
			error!("failed to adopt the resized lmdb map: {}", e);
		}
		self.gate.allow_new();
	}

	fn ro_txn<'e>(&self, env: &'e Environment) -> DbResult<(TxnTicket<'_>, RoTransaction<'e>)> {
		let ticket = self.gate.enter();
		match env.begin_ro_txn() {
			Ok(txn) => Ok((ticket, txn)),
			Err(LmdbError::MapResized) => {
				drop(ticket);
				self.adopt_resized(env);
				let ticket = self.gate.enter();
				Ok((ticket, env.begin_ro_txn().map_err(backend_err)?))
			}
			Err(e) => Err(backend_err(e)),
		}
	}

	fn rw_txn<'e>(&self, env: &'e Environment) -> DbResult<(TxnTicket<'_>, RwTransaction<'e>)> {
		let ticket = self.gate.enter();
		match env.begin_rw_txn() {
			Ok(txn) => Ok((ticket, txn)),
			Err(LmdbError::MapResized) => {
				drop(ticket);
				self.adopt_resized(env);
				let ticket = self.gate.enter();
				Ok((ticket, env.begin_rw_txn().map_err(backend_err)?))
			}
			Err(e) => Err(backend_err(e)),
		}
	}

	fn apply_op(txn: &mut RwTransaction<'_>, dbs: &[LmdbDb], op: &BatchOp) -> DbResult<()> {
		match op {
			BatchOp::Insert { index, key, value } => {
				debug_assert!(key.len() < 512, "lmdb: MDB_MAXKEYSIZE is 511");
				txn.put(dbs[*index as usize], key, value, lmdb::WriteFlags::empty())
					.map_err(backend_err)
			}
			BatchOp::Delete { index, key } => {
				match txn.del(dbs[*index as usize], key, None) {
					Ok(()) | Err(LmdbError::NotFound) => Ok(()),
					Err(e) => Err(backend_err(e)),
				}
			}
		}
	}

	// Run a single op in its own write transaction, resizing first when the
	// map is nearly full.
	fn write_single(&self, op: BatchOp) -> DbResult<()> {
		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		if self.need_resize(&env.env, 0) {
			info!("lmdb memory map needs to be resized, doing that now");
			self.do_resize(&env.env, 0)?;
		}
		let (_ticket, mut txn) = self.rw_txn(&env.env)?;
		Self::apply_op(&mut txn, &env.dbs, &op)?;
		txn.commit().map_err(backend_err)
	}
}

impl KeyValueDB for Database {
	fn read(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> DbResult<Option<DbValue>> {
		{
			let batch = self.batch.lock();
			if let Some(state) = batch.as_ref().and_then(|b| b.get(index, key)) {
				if let Some(first) = state.values.first() {
					return Ok(Some(slice_value(first, offset, size)));
				}
				if state.erased {
					return Ok(None);
				}
			}
		}

		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		let (_ticket, txn) = self.ro_txn(&env.env)?;
		match txn.get(env.dbs[index as usize], &key) {
			Ok(value) => Ok(Some(slice_value(value, offset, size))),
			Err(LmdbError::NotFound) => {
				debug!("lmdb read miss for a key in {:?}", index);
				Ok(None)
			}
			Err(e) => {
				error!("lmdb read failed in {:?}: {}", index, e);
				Err(backend_err(e))
			}
		}
	}

	fn read_multiple(&self, index: Index, key: &[u8]) -> DbResult<Vec<DbValue>> {
		let overlay = {
			let batch = self.batch.lock();
			batch.as_ref().and_then(|b| b.get(index, key).cloned())
		};
		if let Some(state) = &overlay {
			if state.erased {
				return Ok(state.values.clone());
			}
		}

		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		let (_ticket, txn) = self.ro_txn(&env.env)?;
		let mut values = Vec::new();
		{
			let mut cursor = txn.open_ro_cursor(env.dbs[index as usize]).map_err(backend_err)?;
			for item in cursor.iter_dup_of(&key) {
				let (_, value) = item.map_err(|e| {
					error!("lmdb cursor failed reading duplicates in {:?}: {}", index, e);
					backend_err(e)
				})?;
				values.push(value.to_vec());
			}
		}

		if let Some(state) = overlay {
			if index.duplicates_allowed() {
				values.extend(state.values);
			} else if !state.values.is_empty() {
				values = state.values;
			}
		}
		Ok(values)
	}

	fn read_all(&self, index: Index) -> DbResult<BTreeMap<Vec<u8>, Vec<DbValue>>> {
		// snapshot the batch before touching the environment so the two
		// locks are always taken in the same order
		let pending = self.batch.lock().as_ref().map(|b| b.ops_for(index));

		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		let (_ticket, txn) = self.ro_txn(&env.env)?;
		let mut all: BTreeMap<Vec<u8>, Vec<DbValue>> = BTreeMap::new();
		{
			let mut cursor = txn.open_ro_cursor(env.dbs[index as usize]).map_err(backend_err)?;
			for item in cursor.iter_start() {
				let (key, value) = item.map_err(|e| {
					error!("lmdb cursor failed reading all of {:?}: {}", index, e);
					backend_err(e)
				})?;
				all.entry(key.to_vec()).or_default().push(value.to_vec());
			}
		}

		if let Some(ops) = pending {
			batch::replay_ops(index, &ops, &mut all);
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
		{
			let mut batch = self.batch.lock();
			if let Some(b) = batch.as_mut() {
				b.insert(index, key, value);
				return Ok(());
			}
		}
		self.write_single(BatchOp::insert(index, key, value)).map_err(|e| {
			error!("lmdb write of {} bytes failed in {:?}: {}", value.len(), index, e);
			e
		})
	}

	fn erase(&self, index: Index, key: &[u8]) -> DbResult<()> {
		{
			let mut batch = self.batch.lock();
			if let Some(b) = batch.as_mut() {
				b.delete(index, key);
				return Ok(());
			}
		}
		self.write_single(BatchOp::delete(index, key))
	}

	fn erase_all(&self, index: Index, key: &[u8]) -> DbResult<()> {
		// `mdb_del` with no value drops every duplicate of the key, so the
		// two spellings coincide here
		self.erase(index, key)
	}

	fn exists(&self, index: Index, key: &[u8]) -> DbResult<bool> {
		{
			let batch = self.batch.lock();
			if let Some(state) = batch.as_ref().and_then(|b| b.get(index, key)) {
				if !state.values.is_empty() {
					return Ok(true);
				}
				if state.erased {
					return Ok(false);
				}
			}
		}

		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		let (_ticket, txn) = self.ro_txn(&env.env)?;
		match txn.get(env.dbs[index as usize], &key) {
			Ok(_) => Ok(true),
			Err(LmdbError::NotFound) => Ok(false),
			Err(e) => Err(backend_err(e)),
		}
	}

	fn begin_transaction(&self, expected_bytes: usize) -> DbResult<()> {
		let mut batch = self.batch.lock();
		if batch.is_some() {
			return Err(DbError::TransactionAlreadyActive);
		}
		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		if self.need_resize(&env.env, expected_bytes) {
			info!("lmdb memory map needs to be resized ahead of a batch, doing that now");
			self.do_resize(&env.env, expected_bytes)?;
		}
		*batch = Some(PendingBatch::new());
		Ok(())
	}

	fn commit_transaction(&self) -> DbResult<()> {
		let mut batch_guard = self.batch.lock();
		let pending = batch_guard.take().ok_or(DbError::NoActiveTransaction)?;

		let env_guard = self.env.read();
		let env = env_guard.as_ref().ok_or(DbError::Closed)?;
		let (_ticket, mut txn) = self.rw_txn(&env.env)?;
		for op in pending.ops() {
			Self::apply_op(&mut txn, &env.dbs, op)?;
		}
		txn.commit().map_err(|e| {
			error!("lmdb batch commit failed: {}", e);
			backend_err(e)
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
		let mut env = self.env.write();
		// close the environment before deleting the directory under it
		*env = None;
		fs::remove_dir_all(&self.path)?;
		*env = Some(self.open_env()?);
		Ok(())
	}

	fn close(&self) {
		*self.batch.lock() = None;
		*self.env.write() = None;
	}
}

impl Drop for Database {
	fn drop(&mut self) {
		if let Some(env) = &*self.env.read() {
			if let Err(e) = env.env.sync(false) {
				warn!("lmdb flush on close failed: {}", e);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn open_db(dir: &TempDir) -> Database {
		Database::open(dir.path(), DatabaseConfig::default()).unwrap()
	}

	#[test]
	fn shared_trait_tests() {
		let dir = TempDir::new().unwrap();
		let db = open_db(&dir);
		tierdb_shared_tests::run_all(&db).unwrap();
	}

	#[test]
	fn data_survives_reopen() {
		let dir = TempDir::new().unwrap();
		{
			let db = open_db(&dir);
			db.write(Index::Main, b"k", b"persisted").unwrap();
			db.write(Index::Ntp1TokenNames, b"t", b"a").unwrap();
			db.write(Index::Ntp1TokenNames, b"t", b"b").unwrap();
			db.close();
		}
		let db = open_db(&dir);
		assert_eq!(db.read(Index::Main, b"k", 0, None).unwrap().unwrap(), b"persisted");
		assert_eq!(
			db.read_multiple(Index::Ntp1TokenNames, b"t").unwrap(),
			vec![b"a".to_vec(), b"b".to_vec()]
		);
	}

	#[test]
	fn start_new_clears_existing_data() {
		let dir = TempDir::new().unwrap();
		{
			let db = open_db(&dir);
			db.write(Index::Main, b"k", b"v").unwrap();
			db.close();
		}
		let config = DatabaseConfig { start_new: true, ..DatabaseConfig::default() };
		let db = Database::open(dir.path(), config).unwrap();
		assert!(!db.exists(Index::Main, b"k").unwrap());
	}

	#[test]
	fn duplicate_values_are_value_ordered() {
		let dir = TempDir::new().unwrap();
		let db = open_db(&dir);
		db.write(Index::Ntp1TokenNames, b"k", b"zebra").unwrap();
		db.write(Index::Ntp1TokenNames, b"k", b"ant").unwrap();
		db.write(Index::Ntp1TokenNames, b"k", b"mole").unwrap();
		assert_eq!(
			db.read_multiple(Index::Ntp1TokenNames, b"k").unwrap(),
			vec![b"ant".to_vec(), b"mole".to_vec(), b"zebra".to_vec()]
		);
	}

	#[test]
	fn map_auto_resize_under_load() {
		let dir = TempDir::new().unwrap();
		let config = DatabaseConfig {
			map_size: 1 << 20,
			min_resize_step: 1 << 20,
			resize_step: 1 << 21,
			..DatabaseConfig::default()
		};
		let db = Database::open(dir.path(), config).unwrap();

		// push well past the initial 1 MiB map
		let value = vec![0xabu8; 16 * 1024];
		for batch in 0u32..64 {
			// the hint leaves plenty of headroom over what the batch
			// actually needs, so the resize always happens up front
			db.begin_transaction(1 << 18).unwrap();
			for slot in 0u32..4 {
				let key = [batch.to_be_bytes(), slot.to_be_bytes()].concat();
				db.write(Index::Blocks, &key, &value).unwrap();
			}
			db.commit_transaction().unwrap();
		}

		let key = [5u32.to_be_bytes(), 2u32.to_be_bytes()].concat();
		assert_eq!(db.read(Index::Blocks, &key, 0, None).unwrap().unwrap(), value);
	}

	#[test]
	fn closed_db_reports_closed() {
		let dir = TempDir::new().unwrap();
		let db = open_db(&dir);
		db.close();
		assert!(matches!(db.read(Index::Main, b"k", 0, None), Err(DbError::Closed)));
	}
}
