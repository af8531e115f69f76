// Copyright 2020 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A bucketed map with per-bucket reader-writer locks.
//!
//! Keys are spread over a fixed number of buckets by hash, so reads of
//! different buckets proceed in parallel and writes serialise only within
//! their bucket. `get_all_data` shared-locks each bucket in turn; it is a
//! consistent copy per bucket, not an atomic snapshot of the whole map.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use parking_lot::RwLock;

pub struct ConcurrentMap<K, V> {
	buckets: Vec<RwLock<HashMap<K, V>>>,
	hasher: RandomState,
}

impl<K: Eq + Hash, V: Clone> ConcurrentMap<K, V> {
	/// Create a map with `bucket_count` buckets. Pick a count large enough
	/// (thousands) to make bucket collisions rare under realistic load.
	pub fn new(bucket_count: usize) -> ConcurrentMap<K, V> {
		assert!(bucket_count > 0, "a bucketed map needs at least one bucket");
		ConcurrentMap {
			buckets: (0..bucket_count).map(|_| RwLock::new(HashMap::new())).collect(),
			hasher: RandomState::new(),
		}
	}

	fn bucket_of<Q: Hash + ?Sized>(&self, key: &Q) -> usize {
		let mut hasher = self.hasher.build_hasher();
		key.hash(&mut hasher);
		(hasher.finish() as usize) % self.buckets.len()
	}

	pub fn get<Q>(&self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.buckets[self.bucket_of(key)].read().get(key).cloned()
	}

	pub fn set(&self, key: K, value: V) {
		self.buckets[self.bucket_of(&key)].write().insert(key, value);
	}

	pub fn erase<Q>(&self, key: &Q) -> bool
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.buckets[self.bucket_of(key)].write().remove(key).is_some()
	}

	pub fn exists<Q>(&self, key: &Q) -> bool
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.buckets[self.bucket_of(key)].read().contains_key(key)
	}

	pub fn size(&self) -> usize {
		self.buckets.iter().map(|b| b.read().len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.size() == 0
	}

	pub fn clear(&self) {
		for bucket in &self.buckets {
			bucket.write().clear();
		}
	}

	/// Run a compound consult-then-modify step under the exclusive lock of
	/// the bucket owning `key`.
	pub fn apply<R>(&self, key: &K, f: impl FnOnce(&mut HashMap<K, V>, &K) -> R) -> R {
		let mut bucket = self.buckets[self.bucket_of(key)].write();
		f(&mut bucket, key)
	}

	/// A flat copy of every entry.
	pub fn get_all_data(&self) -> HashMap<K, V>
	where
		K: Clone,
	{
		let mut all = HashMap::with_capacity(self.size());
		for bucket in &self.buckets {
			let bucket = bucket.read();
			all.extend(bucket.iter().map(|(k, v)| (k.clone(), v.clone())));
		}
		all
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn basic_operations() {
		let map: ConcurrentMap<Vec<u8>, u32> = ConcurrentMap::new(16);
		assert!(map.is_empty());

		map.set(b"a".to_vec(), 1);
		map.set(b"b".to_vec(), 2);
		map.set(b"a".to_vec(), 3);

		assert_eq!(map.get(b"a".as_slice()), Some(3));
		assert_eq!(map.get(b"b".as_slice()), Some(2));
		assert_eq!(map.get(b"c".as_slice()), None);
		assert!(map.exists(b"a".as_slice()));
		assert_eq!(map.size(), 2);

		assert!(map.erase(b"a".as_slice()));
		assert!(!map.erase(b"a".as_slice()));
		assert_eq!(map.size(), 1);

		map.clear();
		assert!(map.is_empty());
	}

	#[test]
	fn apply_is_atomic_per_bucket() {
		let map: ConcurrentMap<Vec<u8>, Vec<u32>> = ConcurrentMap::new(8);
		map.set(b"k".to_vec(), vec![1]);
		map.apply(&b"k".to_vec(), |bucket, key| {
			if let Some(values) = bucket.get_mut(key) {
				values.push(2);
			}
		});
		assert_eq!(map.get(b"k".as_slice()), Some(vec![1, 2]));
	}

	#[test]
	fn get_all_data_flattens_buckets() {
		let map: ConcurrentMap<Vec<u8>, u32> = ConcurrentMap::new(4);
		for i in 0u32..100 {
			map.set(i.to_be_bytes().to_vec(), i);
		}
		let all = map.get_all_data();
		assert_eq!(all.len(), 100);
		assert_eq!(all[&7u32.to_be_bytes().to_vec()], 7);
	}

	#[test]
	fn concurrent_writers_do_not_lose_entries() {
		let map: Arc<ConcurrentMap<Vec<u8>, u32>> = Arc::new(ConcurrentMap::new(64));
		let mut handles = Vec::new();
		for t in 0u32..8 {
			let map = map.clone();
			handles.push(thread::spawn(move || {
				for i in 0u32..250 {
					let key = (t * 1000 + i).to_be_bytes().to_vec();
					map.set(key.clone(), i);
					assert_eq!(map.get(key.as_slice()), Some(i));
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}
		assert_eq!(map.size(), 2000);
	}
}
