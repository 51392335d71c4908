use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use parking_lot::Mutex;

/// A bucket holds up to `bucket_size` key/value pairs and distinguishes the
/// low `local_depth` bits of the hash.
#[derive(Debug)]
struct Bucket<K, V> {
    local_depth: usize,
    items: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(local_depth: usize, capacity: usize) -> Self {
        Self {
            local_depth,
            items: Vec::with_capacity(capacity),
        }
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Inserts or overwrites. Returns false when the bucket is full and the
    /// key is not already present.
    fn insert(&mut self, key: K, value: V, bucket_size: usize) -> bool {
        if let Some((_, v)) = self.items.iter_mut().find(|(k, _)| *k == key) {
            *v = value;
            return true;
        }
        if self.items.len() >= bucket_size {
            return false;
        }
        self.items.push((key, value));
        true
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }
}

struct Directory<K, V> {
    global_depth: usize,
    /// Directory entries index into `buckets`; entries sharing a hash suffix
    /// alias the same slab slot.
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

/// Concurrent extendible hash table.
///
/// The directory doubles when a bucket at maximum local depth overflows;
/// overflowing buckets split into the original plus one sibling, with every
/// aliasing directory entry whose newly-distinguished bit is set redirected
/// to the sibling. All operations serialize on a single mutex.
///
/// Termination of the split loop relies on the hasher dispersing keys: any
/// set of distinct keys is eventually separated once enough low bits are
/// distinguished, so a full bucket of distinct keys always becomes splittable.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hasher: S,
    inner: Mutex<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table with a single bucket of the given capacity.
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Creates a table using the supplied hasher. Tests use this to pin down
    /// which bucket a key lands in.
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            hasher,
            inner: Mutex::new(Directory {
                global_depth: 0,
                dir: vec![0],
                buckets: vec![Bucket::new(0, bucket_size)],
            }),
        }
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn index_of(&self, key: &K, global_depth: usize) -> usize {
        let mask = (1usize << global_depth) - 1;
        (self.hash_of(key) as usize) & mask
    }

    /// Looks up the value for a key.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let idx = self.index_of(key, inner.global_depth);
        inner.buckets[inner.dir[idx]].find(key).cloned()
    }

    /// Inserts a key/value pair, overwriting the value if the key already
    /// exists. Splits buckets (and doubles the directory) as needed.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        loop {
            let idx = self.index_of(&key, inner.global_depth);
            let slot = inner.dir[idx];
            if inner.buckets[slot].insert(key.clone(), value.clone(), self.bucket_size) {
                return;
            }

            // Overflow: the bucket must start distinguishing one more bit.
            let depth = inner.buckets[slot].local_depth;
            if depth == inner.global_depth {
                inner.global_depth += 1;
                let len = inner.dir.len();
                for i in 0..len {
                    let alias = inner.dir[i];
                    inner.dir.push(alias);
                }
            }

            let sibling = inner.buckets.len();
            inner.buckets.push(Bucket::new(depth + 1, self.bucket_size));
            inner.buckets[slot].local_depth = depth + 1;

            // Entries aliasing the old bucket with bit `depth` set move to
            // the sibling.
            for i in 0..inner.dir.len() {
                if inner.dir[i] == slot && (i >> depth) & 1 == 1 {
                    inner.dir[i] = sibling;
                }
            }

            let displaced = std::mem::take(&mut inner.buckets[slot].items);
            for (k, v) in displaced {
                let idx = self.index_of(&k, inner.global_depth);
                let target = inner.dir[idx];
                let ok = inner.buckets[target].insert(k, v, self.bucket_size);
                debug_assert!(ok, "rehashed item cannot overflow a fresh sibling");
            }
        }
    }

    /// Removes a key. Returns true if the key was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let idx = self.index_of(key, inner.global_depth);
        let slot = inner.dir[idx];
        inner.buckets[slot].remove(key)
    }

    /// Returns the number of bits of hash the directory distinguishes.
    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    /// Returns the local depth of the bucket behind a directory index.
    pub fn local_depth(&self, dir_index: usize) -> usize {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].local_depth
    }

    /// Returns the number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Returns the number of stored key/value pairs.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.iter().map(|b| b.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
