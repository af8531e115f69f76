// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A recursive transaction overlay.
//!
//! A [`HierarchicalDb`] node records pending writes per (index, key),
//! invisible to anything below it until committed. A node may parent
//! further nodes; a read collapses, left to right, the operations found
//! along the chain: the parent's view up to the snapshot taken when this
//! node started, then this node's own writes, then the writes of children
//! that committed into it, in commit order.
//!
//! Sibling nodes are isolated from one another. Committing a node into its
//! parent fails with [`CommitError::Conflict`] if a sibling that committed
//! after this node started touched any of the same (index, key) pairs.
//!
//! Nodes are reference counted; a child holds only a weak pointer to its
//! parent, so the parent must outlive any live child. Dropping an
//! uncommitted node cancels it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tierdb::{slice_value, DbError, DbValue, Index};

use crate::operation::{collapse_ops, TransactionOperation, WriteOperation};

const PARENT_PROOF: &str = "a transaction's parent outlives it by contract; qed";
const SELF_PROOF: &str = "the self reference is set at construction and lives as long as the node; qed";

/// Why a [`HierarchicalDb::commit`] was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommitError {
	#[error("the transaction was already committed")]
	AlreadyCommitted,
	#[error("the transaction still has uncommitted children")]
	UncommittedChildren,
	#[error("a sibling transaction committed a conflicting change")]
	Conflict,
}

impl From<CommitError> for DbError {
	fn from(err: CommitError) -> DbError {
		DbError::Transaction(err.to_string())
	}
}

type KeyOps = BTreeMap<Vec<u8>, TransactionOperation>;

struct NodeInner {
	// one pending-write map per index
	data: Vec<KeyOps>,
	committed: bool,
	// children that committed into this node, in commit order, interleaved
	// with empty committed "separator" nodes that receive this node's own
	// later writes
	committed_children: Vec<Arc<HierarchicalDb>>,
}

impl NodeInner {
	fn new(committed: bool) -> NodeInner {
		NodeInner {
			data: (0..Index::COUNT).map(|_| KeyOps::new()).collect(),
			committed,
			committed_children: Vec::new(),
		}
	}
}

/// One node of the transaction overlay. See the module docs.
pub struct HierarchicalDb {
	name: String,
	self_ref: Weak<HierarchicalDb>,
	parent: Option<Weak<HierarchicalDb>>,
	// how many committed children the parent had when this node started;
	// bounds both the read view into the parent and the conflict scan
	parent_committed_on_start: usize,
	open_children: AtomicI32,
	inner: Mutex<NodeInner>,
}

impl HierarchicalDb {
	/// Create a root node. Its commit is a no-op with no receiver.
	pub fn new(name: &str) -> Arc<HierarchicalDb> {
		Arc::new_cyclic(|weak| HierarchicalDb {
			name: name.to_owned(),
			self_ref: weak.clone(),
			parent: None,
			parent_committed_on_start: 0,
			open_children: AtomicI32::new(0),
			inner: Mutex::new(NodeInner::new(false)),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Open a child transaction of this node.
	pub fn start_transaction(&self, tx_name: &str) -> Arc<HierarchicalDb> {
		self.open_children.fetch_add(1, Ordering::SeqCst);
		let snapshot = {
			let mut inner = self.inner.lock();
			let snapshot = inner.committed_children.len();
			if snapshot > 0 {
				// freeze the live separator: writes applied to this node
				// from now on land past the child's snapshot and stay
				// invisible to it
				let separator = self.make_separator();
				inner.committed_children.push(separator);
			}
			snapshot
		};
		Arc::new_cyclic(|weak| HierarchicalDb {
			name: format!("{}-{}", self.name, tx_name),
			self_ref: weak.clone(),
			parent: Some(self.self_ref.clone()),
			parent_committed_on_start: snapshot,
			open_children: AtomicI32::new(0),
			inner: Mutex::new(NodeInner::new(false)),
		})
	}

	// An empty, already-committed node appended after a commit (or child
	// start) so that later writes to this node go somewhere fresh.
	fn make_separator(&self) -> Arc<HierarchicalDb> {
		Arc::new_cyclic(|weak| HierarchicalDb {
			name: format!("{}-separator", self.name),
			self_ref: weak.clone(),
			parent: Some(self.self_ref.clone()),
			parent_committed_on_start: 0,
			open_children: AtomicI32::new(0),
			inner: Mutex::new(NodeInner::new(true)),
		})
	}

	fn ensure_not_committed(&self) -> Result<(), CommitError> {
		if self.inner.lock().committed {
			return Err(CommitError::AlreadyCommitted);
		}
		Ok(())
	}

	// Writes are applied to the last committed child when there is one,
	// which keeps the chain of committed children append-only.
	fn with_write_target<R>(&self, f: impl FnOnce(&mut NodeInner) -> R) -> R {
		let mut inner = self.inner.lock();
		match inner.committed_children.last().cloned() {
			Some(target) => {
				drop(inner);
				let mut target_inner = target.inner.lock();
				f(&mut target_inner)
			}
			None => f(&mut inner),
		}
	}

	/// Record `Set{value}` for (index, key), discarding any earlier entry.
	pub fn set(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), CommitError> {
		self.ensure_not_committed()?;
		self.with_write_target(|inner| {
			inner.data[index as usize].insert(key.to_vec(), TransactionOperation::set(value.to_vec()));
		});
		Ok(())
	}

	/// Record an appended value for (index, key). Extends an existing
	/// `Append`; any other existing entry is replaced by a fresh
	/// `Append{value}`.
	pub fn append(&self, index: Index, key: &[u8], value: &[u8]) -> Result<(), CommitError> {
		self.ensure_not_committed()?;
		self.with_write_target(|inner| {
			let map = &mut inner.data[index as usize];
			match map.get_mut(key) {
				Some(entry) if entry.op() == WriteOperation::Append => {
					entry.push_value(value.to_vec())
				}
				_ => {
					map.insert(key.to_vec(), TransactionOperation::append(value.to_vec()));
				}
			}
		});
		Ok(())
	}

	/// Record `Erase` for (index, key), discarding any earlier entry.
	pub fn erase(&self, index: Index, key: &[u8]) -> Result<(), CommitError> {
		self.ensure_not_committed()?;
		self.with_write_target(|inner| {
			inner.data[index as usize].insert(key.to_vec(), TransactionOperation::erase());
		});
		Ok(())
	}

	// Collect the operations pertinent to (index, key) along the chain:
	// parent view (bounded by our snapshot), own data, committed children.
	// Locks are taken one node at a time, ancestors before descendants.
	fn collect_ops(
		&self,
		index: usize,
		key: &[u8],
		look_into_parent: bool,
		limit: usize,
		out: &mut Vec<TransactionOperation>,
	) {
		if look_into_parent {
			if let Some(parent) = &self.parent {
				let parent = parent.upgrade().expect(PARENT_PROOF);
				parent.collect_ops(index, key, true, self.parent_committed_on_start, out);
			}
		}

		let inner = self.inner.lock();
		if let Some(op) = inner.data[index].get(key) {
			out.push(op.clone());
		}
		let children: Vec<_> = inner.committed_children.iter().take(limit).cloned().collect();
		drop(inner);

		for child in children {
			child.collect_ops(index, key, false, usize::MAX, out);
		}
	}

	fn collect_all_ops(
		&self,
		index: usize,
		look_into_parent: bool,
		limit: usize,
		out: &mut BTreeMap<Vec<u8>, Vec<TransactionOperation>>,
	) {
		if look_into_parent {
			if let Some(parent) = &self.parent {
				let parent = parent.upgrade().expect(PARENT_PROOF);
				parent.collect_all_ops(index, true, self.parent_committed_on_start, out);
			}
		}

		let inner = self.inner.lock();
		for (key, op) in &inner.data[index] {
			out.entry(key.clone()).or_default().push(op.clone());
		}
		let children: Vec<_> = inner.committed_children.iter().take(limit).cloned().collect();
		drop(inner);

		for child in children {
			child.collect_all_ops(index, false, usize::MAX, out);
		}
	}

	/// The collapsed effective operation for (index, key), if any part of
	/// the chain touched it.
	pub fn get_op(&self, index: Index, key: &[u8]) -> Option<TransactionOperation> {
		let mut ops = Vec::new();
		self.collect_ops(index as usize, key, true, usize::MAX, &mut ops);
		collapse_ops(ops)
	}

	/// Single-value read with slice semantics; `None` when the chain holds
	/// nothing or an erase for the key.
	pub fn get(&self, index: Index, key: &[u8], offset: usize, size: Option<usize>) -> Option<DbValue> {
		self.get_op(index, key)
			.and_then(|op| op.first_value().map(|v| slice_value(v, offset, size)))
	}

	/// All values the chain holds for (index, key).
	pub fn get_multi(&self, index: Index, key: &[u8]) -> Vec<DbValue> {
		self.get_op(index, key).map(|op| op.visible_values().to_vec()).unwrap_or_default()
	}

	/// Whether the chain asserts the key's presence. `None` when it says
	/// nothing about the key at all.
	pub fn exists(&self, index: Index, key: &[u8]) -> Option<bool> {
		self.get_op(index, key).map(|op| op.key_exists())
	}

	/// The collapsed effective operation per key for a whole index.
	pub fn get_all_for_index(&self, index: Index) -> BTreeMap<Vec<u8>, TransactionOperation> {
		let mut ops = BTreeMap::new();
		self.collect_all_ops(index as usize, true, usize::MAX, &mut ops);
		ops.into_iter()
			.filter_map(|(key, key_ops)| collapse_ops(key_ops).map(|op| (key, op)))
			.collect()
	}

	/// Key-to-values view of a whole index, erased keys omitted.
	pub fn get_multi_all(&self, index: Index) -> BTreeMap<Vec<u8>, Vec<DbValue>> {
		self.get_all_for_index(index)
			.into_iter()
			.filter_map(|(key, op)| {
				let values = op.visible_values();
				if values.is_empty() {
					None
				} else {
					Some((key, values.to_vec()))
				}
			})
			.collect()
	}

	// Every (index, key) this node changed, committed descendants included.
	fn collect_touched(&self, out: &mut BTreeSet<(usize, Vec<u8>)>) {
		let inner = self.inner.lock();
		for (index, map) in inner.data.iter().enumerate() {
			for key in map.keys() {
				out.insert((index, key.clone()));
			}
		}
		let children = inner.committed_children.clone();
		drop(inner);
		for child in children {
			child.collect_touched(out);
		}
	}

	fn touches(&self, index: usize, key: &[u8]) -> bool {
		let inner = self.inner.lock();
		if inner.data[index].contains_key(key) {
			return true;
		}
		let children = inner.committed_children.clone();
		drop(inner);
		children.iter().any(|child| child.touches(index, key))
	}

	/// Commit this node into its parent.
	///
	/// Fails when the node was already committed or cancelled, when it has
	/// open children, or when a sibling that committed after this node
	/// started touched an overlapping (index, key). Committing the root is
	/// a successful no-op: the root has no receiver.
	pub fn commit(&self) -> Result<(), CommitError> {
		if self.inner.lock().committed {
			return Err(CommitError::AlreadyCommitted);
		}
		if self.open_children.load(Ordering::SeqCst) > 0 {
			return Err(CommitError::UncommittedChildren);
		}

		let parent = match &self.parent {
			Some(parent) => parent.upgrade().expect(PARENT_PROOF),
			None => return Ok(()),
		};
		let this = self.self_ref.upgrade().expect(SELF_PROOF);

		let mut touched = BTreeSet::new();
		self.collect_touched(&mut touched);

		let mut parent_inner = parent.inner.lock();
		for sibling in parent_inner.committed_children[self.parent_committed_on_start..].iter().rev() {
			for (index, key) in &touched {
				if sibling.touches(*index, key) {
					return Err(CommitError::Conflict);
				}
			}
		}
		parent_inner.committed_children.push(this);
		// later writes to the parent must flow into a fresh node, not into
		// the one that just committed
		let separator = parent.make_separator();
		parent_inner.committed_children.push(separator);
		drop(parent_inner);

		self.cancel();
		Ok(())
	}

	/// Deem the node unusable, as if committed, without promoting its data.
	pub fn cancel(&self) {
		let mut inner = self.inner.lock();
		if inner.committed {
			return;
		}
		inner.committed = true;
		drop(inner);
		if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
			let before = parent.open_children.fetch_sub(1, Ordering::SeqCst);
			debug_assert!(before > 0);
		}
	}

	/// Number of children that are neither committed nor cancelled.
	pub fn open_transactions_count(&self) -> i32 {
		self.open_children.load(Ordering::SeqCst)
	}
}

impl Drop for HierarchicalDb {
	fn drop(&mut self) {
		if !self.inner.get_mut().committed {
			self.cancel();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MAIN: Index = Index::Main;
	const NAMES: Index = Index::Ntp1TokenNames;

	#[test]
	fn set_get_roundtrip() {
		let root = HierarchicalDb::new("root");
		root.set(MAIN, b"k", b"v").unwrap();
		assert_eq!(root.get(MAIN, b"k", 0, None).unwrap(), b"v");
		assert_eq!(root.get(MAIN, b"k", 1, Some(1)).unwrap(), b"");
		assert_eq!(root.exists(MAIN, b"k"), Some(true));
		assert_eq!(root.exists(MAIN, b"other"), None);

		root.erase(MAIN, b"k").unwrap();
		assert_eq!(root.get(MAIN, b"k", 0, None), None);
		assert_eq!(root.exists(MAIN, b"k"), Some(false));
	}

	#[test]
	fn append_accumulates_and_replaces_other_entries() {
		let root = HierarchicalDb::new("root");
		root.append(NAMES, b"k", b"v1").unwrap();
		root.append(NAMES, b"k", b"v2").unwrap();
		assert_eq!(root.get_multi(NAMES, b"k"), vec![b"v1".to_vec(), b"v2".to_vec()]);

		// an erase entry is replaced by a fresh append
		root.erase(NAMES, b"k").unwrap();
		root.append(NAMES, b"k", b"v3").unwrap();
		assert_eq!(root.get_multi(NAMES, b"k"), vec![b"v3".to_vec()]);
	}

	#[test]
	fn children_are_isolated_from_each_other() {
		let root = HierarchicalDb::new("root");
		root.set(MAIN, b"TheBigK", b"A").unwrap();

		let t1 = root.start_transaction("t1");
		let t2 = root.start_transaction("t2");
		t1.set(MAIN, b"TheBigK", b"B").unwrap();

		assert_eq!(root.get(MAIN, b"TheBigK", 0, None).unwrap(), b"A");
		assert_eq!(t1.get(MAIN, b"TheBigK", 0, None).unwrap(), b"B");
		assert_eq!(t2.get(MAIN, b"TheBigK", 0, None).unwrap(), b"A");

		t1.cancel();
		t2.cancel();
	}

	#[test]
	fn sibling_commit_conflict() {
		let root = HierarchicalDb::new("root");
		let t1 = root.start_transaction("t1");
		let t2 = root.start_transaction("t2");
		t1.set(MAIN, b"k", b"from-t1").unwrap();
		t2.set(MAIN, b"k", b"from-t2").unwrap();

		t2.commit().unwrap();
		assert_eq!(t1.commit(), Err(CommitError::Conflict));

		// the successful commit is visible in the root
		assert_eq!(root.get(MAIN, b"k", 0, None).unwrap(), b"from-t2");
	}

	#[test]
	fn disjoint_sibling_commits_succeed() {
		let root = HierarchicalDb::new("root");
		let t1 = root.start_transaction("t1");
		let t2 = root.start_transaction("t2");
		t1.set(MAIN, b"a", b"1").unwrap();
		t2.set(MAIN, b"b", b"2").unwrap();

		t2.commit().unwrap();
		t1.commit().unwrap();

		assert_eq!(root.get(MAIN, b"a", 0, None).unwrap(), b"1");
		assert_eq!(root.get(MAIN, b"b", 0, None).unwrap(), b"2");
	}

	#[test]
	fn commit_with_open_children_is_refused() {
		let root = HierarchicalDb::new("root");
		let parent = root.start_transaction("parent");
		let child = parent.start_transaction("child");
		parent.set(MAIN, b"k", b"v").unwrap();

		assert_eq!(parent.commit(), Err(CommitError::UncommittedChildren));
		child.commit().unwrap();
		parent.commit().unwrap();
		assert_eq!(parent.commit(), Err(CommitError::AlreadyCommitted));
	}

	#[test]
	fn writes_after_commit_are_refused() {
		let root = HierarchicalDb::new("root");
		let t = root.start_transaction("t");
		t.set(MAIN, b"k", b"v").unwrap();
		t.commit().unwrap();
		assert_eq!(t.set(MAIN, b"k", b"w"), Err(CommitError::AlreadyCommitted));
		assert_eq!(t.append(NAMES, b"k", b"w"), Err(CommitError::AlreadyCommitted));
		assert_eq!(t.erase(MAIN, b"k"), Err(CommitError::AlreadyCommitted));
	}

	#[test]
	fn nested_append_then_erase() {
		let root = HierarchicalDb::new("root");
		root.append(NAMES, b"TheBigK", b"v1").unwrap();
		root.append(NAMES, b"TheBigK", b"v2").unwrap();

		let t3 = root.start_transaction("t3");
		t3.append(NAMES, b"TheBigK", b"v3").unwrap();
		assert_eq!(
			t3.get_multi(NAMES, b"TheBigK"),
			vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]
		);
		t3.commit().unwrap();

		let t4 = root.start_transaction("t4");
		assert_eq!(
			t4.get_multi(NAMES, b"TheBigK"),
			vec![b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()]
		);
		t4.erase(NAMES, b"TheBigK").unwrap();
		t4.commit().unwrap();

		assert!(root.get_multi(NAMES, b"TheBigK").is_empty());
		assert_eq!(root.exists(NAMES, b"TheBigK"), Some(false));
	}

	#[test]
	fn parent_writes_after_child_start_stay_invisible() {
		let root = HierarchicalDb::new("root");
		let warmup = root.start_transaction("warmup");
		warmup.set(MAIN, b"seen", b"yes").unwrap();
		warmup.commit().unwrap();

		let t = root.start_transaction("t");
		assert_eq!(t.get(MAIN, b"seen", 0, None).unwrap(), b"yes");

		// lands in a separator past t's snapshot
		root.set(MAIN, b"late", b"write").unwrap();
		assert_eq!(t.get(MAIN, b"late", 0, None), None);
		assert_eq!(root.get(MAIN, b"late", 0, None).unwrap(), b"write");
		t.cancel();
	}

	#[test]
	fn get_all_for_index_collapses_the_chain() {
		let root = HierarchicalDb::new("root");
		root.set(MAIN, b"a", b"old").unwrap();
		root.set(MAIN, b"b", b"kept").unwrap();

		let t = root.start_transaction("t");
		t.set(MAIN, b"a", b"new").unwrap();
		t.erase(MAIN, b"b").unwrap();
		t.set(MAIN, b"c", b"fresh").unwrap();

		let all = t.get_all_for_index(MAIN);
		assert_eq!(all[&b"a".to_vec()].first_value().unwrap(), &b"new".to_vec());
		assert!(!all[&b"b".to_vec()].key_exists());
		assert_eq!(all[&b"c".to_vec()].first_value().unwrap(), &b"fresh".to_vec());

		let multi = t.get_multi_all(MAIN);
		assert_eq!(multi.len(), 2);
		assert!(multi.contains_key(&b"a".to_vec()));
		assert!(!multi.contains_key(&b"b".to_vec()));
		t.cancel();
	}

	#[test]
	fn cancel_decrements_open_count_and_drop_cancels() {
		let root = HierarchicalDb::new("root");
		{
			let _t1 = root.start_transaction("t1");
			let t2 = root.start_transaction("t2");
			assert_eq!(root.open_transactions_count(), 2);
			t2.cancel();
			assert_eq!(root.open_transactions_count(), 1);
		}
		// t1 dropped uncommitted
		assert_eq!(root.open_transactions_count(), 0);
	}

	#[test]
	fn cancelled_data_is_not_promoted() {
		let root = HierarchicalDb::new("root");
		let t = root.start_transaction("t");
		t.set(MAIN, b"k", b"v").unwrap();
		t.cancel();
		assert_eq!(root.get(MAIN, b"k", 0, None), None);
	}
}
