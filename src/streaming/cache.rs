//! Content-addressed cache backend
//!
//! Values are stored LZ4-compressed and shared by reference count. A batch
//! get fetches many values in one cache transaction; the block transfer
//! decompresses each into its destination view.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::streaming::block::StreamableBlock;
use crate::streaming::storage::DataKind;

/// Key of one resource's bucket in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

/// Content id of one value inside a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u64);

impl ValueId {
    /// Stable id of a block: FNV-1a over its kind and encoded descriptor
    pub fn for_block(kind: DataKind, block: &StreamableBlock) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut feed = |byte: u8| {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        };
        feed(kind as u8);
        for byte in block.encode() {
            feed(byte);
        }
        ValueId(hash)
    }
}

/// Cache collaborator: one batched get per transfer
pub trait ContentCache: Send + Sync {
    /// Fetch compressed values. The result has one entry per id, in order.
    fn batch_get(&self, key: CacheKey, ids: &[ValueId]) -> Vec<io::Result<Arc<[u8]>>>;
}

/// Compress a raw value into the cache's stored form
pub fn compress_value(raw: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(raw)
}

/// Decompress a stored value
pub fn decompress_value(stored: &[u8]) -> io::Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(stored)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("LZ4 decompression failed: {}", e)))
}

struct LruState {
    values: HashMap<(CacheKey, ValueId), Arc<[u8]>>,
    /// Access order: oldest first, newest last
    access_order: Vec<(CacheKey, ValueId)>,
}

/// In-memory LRU content cache.
///
/// When full, the least recently used value is evicted. Values already
/// handed out stay alive through their reference count.
pub struct MemoryContentCache {
    state: Mutex<LruState>,
    max_values: usize,
    batches: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryContentCache {
    pub fn new(max_values: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                values: HashMap::with_capacity(max_values),
                access_order: Vec::with_capacity(max_values),
            }),
            max_values: max_values.max(1),
            batches: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    /// Store a raw value (compressed on insert)
    pub fn put(&self, key: CacheKey, id: ValueId, raw: &[u8]) {
        let stored: Arc<[u8]> = compress_value(raw).into();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.values.contains_key(&(key, id)) {
            Self::remove_from_access_order(&mut state, (key, id));
        } else if state.values.len() >= self.max_values {
            if let Some(oldest) = state.access_order.first().copied() {
                Self::remove_from_access_order(&mut state, oldest);
                state.values.remove(&oldest);
                log::trace!("Evicted cache value {:?}", oldest);
            }
        }

        state.values.insert((key, id), stored);
        state.access_order.push((key, id));
    }

    /// Store the raw bytes of a block under its content id
    pub fn put_block(&self, key: CacheKey, kind: DataKind, block: &StreamableBlock, raw: &[u8]) {
        self.put(key, ValueId::for_block(kind, block), raw);
    }

    pub fn contains(&self, key: CacheKey, id: ValueId) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).values.contains_key(&(key, id))
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batch transactions served
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    /// Number of individual values requested
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    fn remove_from_access_order(state: &mut LruState, entry: (CacheKey, ValueId)) {
        if let Some(pos) = state.access_order.iter().position(|&e| e == entry) {
            state.access_order.remove(pos);
        }
    }
}

impl ContentCache for MemoryContentCache {
    fn batch_get(&self, key: CacheKey, ids: &[ValueId]) -> Vec<io::Result<Arc<[u8]>>> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.gets.fetch_add(ids.len(), Ordering::Relaxed);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .map(|&id| match state.values.get(&(key, id)).cloned() {
                Some(value) => {
                    Self::remove_from_access_order(&mut state, (key, id));
                    state.access_order.push((key, id));
                    Ok(value)
                }
                None => Err(io::Error::new(io::ErrorKind::NotFound, format!("cache miss for {:?}", id))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: CacheKey = CacheKey(0xABCD);

    fn get_raw(cache: &MemoryContentCache, id: u64) -> Option<Vec<u8>> {
        cache.batch_get(KEY, &[ValueId(id)]).pop()?.ok().map(|v| decompress_value(&v).unwrap())
    }

    #[test]
    fn test_value_id_is_stable_and_distinct() {
        let block = StreamableBlock::new(1, 0, 64);
        assert_eq!(ValueId::for_block(DataKind::Model, &block), ValueId::for_block(DataKind::Model, &block));
        assert_ne!(ValueId::for_block(DataKind::Model, &block), ValueId::for_block(DataKind::Clothing, &block));
        assert_ne!(
            ValueId::for_block(DataKind::Model, &block),
            ValueId::for_block(DataKind::Model, &StreamableBlock::new(1, 0, 65))
        );
    }

    #[test]
    fn test_put_and_batch_get() {
        let cache = MemoryContentCache::new(8);
        cache.put(KEY, ValueId(1), b"hello");
        cache.put(KEY, ValueId(2), b"world");

        let results = cache.batch_get(KEY, &[ValueId(2), ValueId(3), ValueId(1)]);
        assert_eq!(results.len(), 3);
        assert_eq!(decompress_value(results[0].as_ref().unwrap()).unwrap(), b"world");
        assert_eq!(results[1].as_ref().unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(decompress_value(results[2].as_ref().unwrap()).unwrap(), b"hello");

        assert_eq!(cache.batch_count(), 1);
        assert_eq!(cache.get_count(), 3);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MemoryContentCache::new(3);
        cache.put(KEY, ValueId(1), &[1]);
        cache.put(KEY, ValueId(2), &[2]);
        cache.put(KEY, ValueId(3), &[3]);

        // Touch 1 so 2 becomes the oldest
        assert_eq!(get_raw(&cache, 1), Some(vec![1]));

        cache.put(KEY, ValueId(4), &[4]);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(KEY, ValueId(1)));
        assert!(!cache.contains(KEY, ValueId(2)));
        assert!(cache.contains(KEY, ValueId(4)));
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = MemoryContentCache::new(2);
        cache.put(KEY, ValueId(1), &[1]);
        cache.put(KEY, ValueId(2), &[2]);
        cache.put(KEY, ValueId(1), &[9]);
        assert_eq!(cache.len(), 2);
        assert_eq!(get_raw(&cache, 1), Some(vec![9]));
        assert_eq!(get_raw(&cache, 2), Some(vec![2]));
    }

    #[test]
    fn test_handed_out_value_survives_eviction() {
        let cache = MemoryContentCache::new(1);
        cache.put(KEY, ValueId(1), &[7; 32]);
        let held = cache.batch_get(KEY, &[ValueId(1)]).pop().unwrap().unwrap();
        cache.put(KEY, ValueId(2), &[8]);
        assert!(!cache.contains(KEY, ValueId(1)));
        assert_eq!(decompress_value(&held).unwrap(), vec![7; 32]);
    }
}
