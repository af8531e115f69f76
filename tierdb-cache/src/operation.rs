// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Pending-write and cached-read records.
//!
//! [`TransactionOperation`] is the unit a transaction overlay stores per
//! (index, key); sequences of them collapse left-to-right into a single
//! equivalent operation. [`ReadCacheEntry`] is what the value caches store
//! per key, including negative entries.

use tierdb::DbValue;

/// Kind of a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
	/// Remove the key and everything stored under it.
	Erase,
	/// Add a value to the key's collection.
	Append,
	/// Replace whatever the key holds with a single value.
	Set,
}

/// A pending write against one (index, key), possibly the collapse of
/// several earlier writes.
///
/// The value list can outgrow what the op kind suggests: collapsing an
/// `Append` onto a `Set` keeps the `Set` base and extends its list, and
/// appends collapsed onto an `Erase` stay recorded but invisible — the op
/// kind decides how reads interpret the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOperation {
	op: WriteOperation,
	values: Vec<DbValue>,
}

impl TransactionOperation {
	pub fn set(value: DbValue) -> TransactionOperation {
		TransactionOperation { op: WriteOperation::Set, values: vec![value] }
	}

	pub fn append(value: DbValue) -> TransactionOperation {
		TransactionOperation { op: WriteOperation::Append, values: vec![value] }
	}

	pub fn erase() -> TransactionOperation {
		TransactionOperation { op: WriteOperation::Erase, values: Vec::new() }
	}

	pub fn op(&self) -> WriteOperation {
		self.op
	}

	pub fn values(&self) -> &[DbValue] {
		&self.values
	}

	pub fn into_values(self) -> Vec<DbValue> {
		self.values
	}

	pub(crate) fn push_value(&mut self, value: DbValue) {
		self.values.push(value);
	}

	/// Fold a later operation onto this one.
	///
	/// A later `Erase` or `Set` wins outright; a later `Append` extends the
	/// value list while this operation stays the base.
	pub fn collapse_with(&mut self, later: &TransactionOperation) {
		match later.op {
			WriteOperation::Erase | WriteOperation::Set => *self = later.clone(),
			WriteOperation::Append => self.values.extend_from_slice(&later.values),
		}
	}

	/// The values a read actually sees: nothing for an `Erase` base.
	pub fn visible_values(&self) -> &[DbValue] {
		match self.op {
			WriteOperation::Erase => &[],
			WriteOperation::Append | WriteOperation::Set => &self.values,
		}
	}

	/// The value a single-value read sees.
	pub fn first_value(&self) -> Option<&DbValue> {
		self.visible_values().first()
	}

	/// Whether the key exists as far as this operation is concerned.
	pub fn key_exists(&self) -> bool {
		self.op != WriteOperation::Erase
	}
}

/// Collapse a sequence of operations (oldest first) into one.
pub fn collapse_ops(ops: Vec<TransactionOperation>) -> Option<TransactionOperation> {
	let mut iter = ops.into_iter();
	let mut result = iter.next()?;
	for op in iter {
		result.collapse_with(&op);
	}
	Some(result)
}

/// Kind of a cached read entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOperation {
	/// The values were fetched from the backend.
	ValueRead,
	/// The values were written through this layer.
	ValueWritten,
	/// The backend was consulted and holds nothing for the key.
	NotFound,
	/// The key was erased through this layer.
	Erased,
}

/// One cached key: either a full value set or a negative entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCacheEntry {
	op: ReadOperation,
	values: Vec<DbValue>,
}

impl ReadCacheEntry {
	pub fn read(values: Vec<DbValue>) -> ReadCacheEntry {
		ReadCacheEntry { op: ReadOperation::ValueRead, values }
	}

	pub fn written(values: Vec<DbValue>) -> ReadCacheEntry {
		ReadCacheEntry { op: ReadOperation::ValueWritten, values }
	}

	pub fn not_found() -> ReadCacheEntry {
		ReadCacheEntry { op: ReadOperation::NotFound, values: Vec::new() }
	}

	pub fn erased() -> ReadCacheEntry {
		ReadCacheEntry { op: ReadOperation::Erased, values: Vec::new() }
	}

	pub fn op(&self) -> ReadOperation {
		self.op
	}

	pub fn values(&self) -> &[DbValue] {
		&self.values
	}

	pub fn values_mut(&mut self) -> &mut Vec<DbValue> {
		&mut self.values
	}

	/// Whether this entry asserts the key's absence.
	pub fn is_negative(&self) -> bool {
		matches!(self.op, ReadOperation::NotFound | ReadOperation::Erased)
	}

	/// Flip a backend-read entry to written once the layer modifies it.
	pub fn switch_to_written(&mut self) {
		self.op = ReadOperation::ValueWritten;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn v(s: &[u8]) -> DbValue {
		s.to_vec()
	}

	#[test]
	fn later_set_wins() {
		let mut op = TransactionOperation::append(v(b"a"));
		op.collapse_with(&TransactionOperation::set(v(b"b")));
		assert_eq!(op.op(), WriteOperation::Set);
		assert_eq!(op.visible_values(), &[v(b"b")]);
	}

	#[test]
	fn later_erase_wins() {
		let mut op = TransactionOperation::set(v(b"a"));
		op.collapse_with(&TransactionOperation::erase());
		assert_eq!(op.op(), WriteOperation::Erase);
		assert!(op.visible_values().is_empty());
		assert!(!op.key_exists());
	}

	#[test]
	fn appends_concatenate() {
		let mut op = TransactionOperation::append(v(b"a"));
		op.collapse_with(&TransactionOperation::append(v(b"b")));
		op.collapse_with(&TransactionOperation::append(v(b"c")));
		assert_eq!(op.op(), WriteOperation::Append);
		assert_eq!(op.visible_values(), &[v(b"a"), v(b"b"), v(b"c")]);
	}

	#[test]
	fn append_onto_set_keeps_the_set_base() {
		let mut op = TransactionOperation::set(v(b"a"));
		op.collapse_with(&TransactionOperation::append(v(b"b")));
		assert_eq!(op.op(), WriteOperation::Set);
		assert_eq!(op.first_value(), Some(&v(b"a")));
		assert_eq!(op.visible_values(), &[v(b"a"), v(b"b")]);
	}

	#[test]
	fn append_onto_erase_stays_invisible() {
		let mut op = TransactionOperation::erase();
		op.collapse_with(&TransactionOperation::append(v(b"b")));
		assert_eq!(op.op(), WriteOperation::Erase);
		assert!(op.visible_values().is_empty());
		assert_eq!(op.first_value(), None);
	}

	#[test]
	fn collapse_ops_folds_left_to_right() {
		let collapsed = collapse_ops(vec![
			TransactionOperation::set(v(b"a")),
			TransactionOperation::append(v(b"b")),
			TransactionOperation::erase(),
			TransactionOperation::append(v(b"c")),
		])
		.unwrap();
		assert_eq!(collapsed.op(), WriteOperation::Erase);
		assert!(collapse_ops(Vec::new()).is_none());
	}
}
