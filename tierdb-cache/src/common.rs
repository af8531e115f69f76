// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Helpers shared by the cache layers: consulting the open transaction on
//! the read path, draining transaction data, and applying collapsed
//! operations to a backend.

use std::collections::BTreeMap;

use tierdb::{slice_value, DbResult, DbValue, Index, KeyValueDB};

use crate::hierarchical::HierarchicalDb;
use crate::operation::{TransactionOperation, WriteOperation};

/// Collapsed per-key operations of a transaction, one map per index.
pub(crate) type TxData = Vec<BTreeMap<Vec<u8>, TransactionOperation>>;

pub(crate) fn collect_tx_data(tx: &HierarchicalDb) -> TxData {
	Index::ALL.iter().map(|index| tx.get_all_for_index(*index)).collect()
}

/// Bytes of value payload a transaction carries, for backend sizing hints.
pub(crate) fn tx_payload_bytes(data: &TxData) -> usize {
	data.iter()
		.flat_map(|map| map.values())
		.flat_map(|op| op.values())
		.map(|value| value.len())
		.sum()
}

/// What the open transaction says about a single-value read.
/// `None` means it says nothing and lower layers decide.
pub(crate) fn tx_read_single(
	tx: &HierarchicalDb,
	index: Index,
	key: &[u8],
	offset: usize,
	size: Option<usize>,
) -> Option<Option<DbValue>> {
	let op = tx.get_op(index, key)?;
	match op.op() {
		WriteOperation::Append | WriteOperation::Set => {
			op.first_value().map(|value| Some(slice_value(value, offset, size)))
		}
		WriteOperation::Erase => Some(None),
	}
}

/// What the open transaction says about a key's existence.
pub(crate) fn tx_read_exists(tx: &HierarchicalDb, index: Index, key: &[u8]) -> Option<bool> {
	let op = tx.get_op(index, key)?;
	match op.op() {
		WriteOperation::Append | WriteOperation::Set => {
			if op.first_value().is_some() {
				Some(true)
			} else {
				None
			}
		}
		WriteOperation::Erase => Some(false),
	}
}

/// What the open transaction contributes to a multi-value read.
pub(crate) enum TxMulti {
	/// The transaction erased the key; its values are the whole answer.
	Erased(Vec<DbValue>),
	/// The transaction's values extend whatever lower layers hold.
	Extend(Vec<DbValue>),
}

pub(crate) fn tx_multi_values(tx: &HierarchicalDb, index: Index, key: &[u8]) -> TxMulti {
	match tx.get_op(index, key) {
		Some(op) => match op.op() {
			WriteOperation::Erase => TxMulti::Erased(Vec::new()),
			WriteOperation::Append | WriteOperation::Set => TxMulti::Extend(op.into_values()),
		},
		None => TxMulti::Extend(Vec::new()),
	}
}

/// Lay collapsed transaction operations over a full-index multi view.
pub(crate) fn merge_tx_ops_multi(
	data: &mut BTreeMap<Vec<u8>, Vec<DbValue>>,
	tx_ops: BTreeMap<Vec<u8>, TransactionOperation>,
) {
	for (key, op) in tx_ops {
		match op.op() {
			WriteOperation::Append => data.entry(key).or_default().extend(op.into_values()),
			WriteOperation::Set => {
				if !op.values().is_empty() {
					data.insert(key, op.into_values());
				}
			}
			WriteOperation::Erase => {
				data.remove(&key);
			}
		}
	}
}

/// Lay collapsed transaction operations over a full-index unique view.
pub(crate) fn merge_tx_ops_unique(
	data: &mut BTreeMap<Vec<u8>, DbValue>,
	tx_ops: BTreeMap<Vec<u8>, TransactionOperation>,
) {
	for (key, op) in tx_ops {
		match op.op() {
			WriteOperation::Append | WriteOperation::Set => {
				if let Some(value) = op.first_value() {
					data.insert(key, value.clone());
				}
			}
			WriteOperation::Erase => {
				data.remove(&key);
			}
		}
	}
}

/// Apply one collapsed operation to a backend. Used when a transaction or
/// journal drains into the durable store.
pub(crate) fn apply_tx_op(
	db: &dyn KeyValueDB,
	index: Index,
	key: &[u8],
	op: &TransactionOperation,
) -> DbResult<()> {
	match op.op() {
		WriteOperation::Append => {
			for value in op.values() {
				db.write(index, key, value)?;
			}
			Ok(())
		}
		WriteOperation::Set => match op.values().first() {
			Some(first) => {
				if index.duplicates_allowed() {
					// replace the whole collection, not just one slot
					db.erase_all(index, key)?;
					for value in op.values() {
						db.write(index, key, value)?;
					}
					Ok(())
				} else {
					db.write(index, key, first)
				}
			}
			None => Ok(()),
		},
		WriteOperation::Erase => db.erase_all(index, key),
	}
}
