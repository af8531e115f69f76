// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The pending state of an open batched-write transaction.
//!
//! Ops are stored twice: as an ordered list for atomic application at
//! commit time, and folded into a per-index overlay so reads can observe
//! the uncommitted state without replaying the list.

use std::collections::HashMap;

use smallvec::SmallVec;
use tierdb::{DbValue, Index};

type BatchKey = SmallVec<[u8; 32]>;

#[derive(Clone)]
pub(crate) enum BatchOp {
	Insert { index: Index, key: BatchKey, value: DbValue },
	Delete { index: Index, key: BatchKey },
}

impl BatchOp {
	pub(crate) fn insert(index: Index, key: &[u8], value: &[u8]) -> BatchOp {
		BatchOp::Insert { index, key: SmallVec::from_slice(key), value: value.to_vec() }
	}

	pub(crate) fn delete(index: Index, key: &[u8]) -> BatchOp {
		BatchOp::Delete { index, key: SmallVec::from_slice(key) }
	}
}

/// What the batch has done to one key so far: whether the committed state
/// underneath is shadowed by a delete, and the values inserted since.
#[derive(Clone)]
pub(crate) struct OverlayState {
	pub erased: bool,
	pub values: Vec<DbValue>,
}

pub(crate) struct PendingBatch {
	ops: Vec<BatchOp>,
	overlay: Vec<HashMap<Vec<u8>, OverlayState>>,
}

impl PendingBatch {
	pub(crate) fn new() -> PendingBatch {
		PendingBatch { ops: Vec::new(), overlay: (0..Index::COUNT).map(|_| HashMap::new()).collect() }
	}

	pub(crate) fn insert(&mut self, index: Index, key: &[u8], value: &[u8]) {
		let state = self.overlay[index as usize]
			.entry(key.to_vec())
			.or_insert_with(|| OverlayState { erased: false, values: Vec::new() });
		if index.duplicates_allowed() {
			state.values.push(value.to_vec());
		} else {
			state.values = vec![value.to_vec()];
		}
		self.ops.push(BatchOp::insert(index, key, value));
	}

	pub(crate) fn delete(&mut self, index: Index, key: &[u8]) {
		self.overlay[index as usize]
			.insert(key.to_vec(), OverlayState { erased: true, values: Vec::new() });
		self.ops.push(BatchOp::delete(index, key));
	}

	pub(crate) fn get(&self, index: Index, key: &[u8]) -> Option<&OverlayState> {
		self.overlay[index as usize].get(key)
	}

	pub(crate) fn ops(&self) -> &[BatchOp] {
		&self.ops
	}

	/// The batch's ops touching `index`, in submission order.
	pub(crate) fn ops_for(&self, index: Index) -> Vec<BatchOp> {
		self.ops
			.iter()
			.filter(|op| match op {
				BatchOp::Insert { index: i, .. } | BatchOp::Delete { index: i, .. } => *i == index,
			})
			.cloned()
			.collect()
	}
}

/// Apply batch ops on top of a full-index snapshot, in op order.
pub(crate) fn replay_ops(
	index: Index,
	ops: &[BatchOp],
	all: &mut std::collections::BTreeMap<Vec<u8>, Vec<DbValue>>,
) {
	for op in ops {
		match op {
			BatchOp::Insert { key, value, .. } => {
				if index.duplicates_allowed() {
					all.entry(key.to_vec()).or_default().push(value.clone());
				} else {
					all.insert(key.to_vec(), vec![value.clone()]);
				}
			}
			BatchOp::Delete { key, .. } => {
				all.remove(key.as_slice());
			}
		}
	}
}
