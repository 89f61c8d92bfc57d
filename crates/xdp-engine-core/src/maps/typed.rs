// SPDX-License-Identifier: GPL-2.0

//! Typed facades over [`Map`]
//!
//! The facades check the schema once at construction and then convert keys
//! and values with [`Pod`]. They go through the same byte-level operations
//! programs use.

use std::marker::PhantomData;
use std::sync::Arc;

use super::ringbuf::{Reservation, RingBufStore};
use super::{Map, MapKind, UpdateMode};
use crate::core::error::MapError;

/// Fixed-size plain data with a little-endian byte representation
pub trait Pod: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Encode into `out`, which is exactly `SIZE` bytes
    fn write_bytes(&self, out: &mut [u8]);

    /// Decode from exactly `SIZE` bytes
    fn from_bytes(bytes: &[u8]) -> Option<Self>;

    /// Encode into a new buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut v = vec![0u8; Self::SIZE];
        self.write_bytes(&mut v);
        v
    }
}

macro_rules! impl_pod_int {
    ($($t:ty),*) => {$(
        impl Pod for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn write_bytes(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn from_bytes(bytes: &[u8]) -> Option<Self> {
                Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
            }
        }
    )*};
}

impl_pod_int!(u8, u16, u32, u64, i32, i64);

impl<const N: usize> Pod for [u8; N] {
    const SIZE: usize = N;

    fn write_bytes(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok()
    }
}

fn check_schema(map: &Map, kind: MapKind, key_size: usize, value_size: usize) -> Result<(), MapError> {
    let s = map.schema();
    if s.kind != kind || s.key_size as usize != key_size || s.value_size as usize != value_size {
        return Err(MapError::InvalidSchema(format!(
            "map {:?} is {} key {} value {}, expected {} key {} value {}",
            map.name(),
            s.kind,
            s.key_size,
            s.value_size,
            kind,
            key_size,
            value_size
        )));
    }
    Ok(())
}

fn decode<V: Pod>(bytes: Vec<u8>) -> Result<V, MapError> {
    V::from_bytes(&bytes).ok_or(MapError::ValueSize {
        expected: V::SIZE,
        got: bytes.len(),
    })
}

macro_rules! keyed_facade {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name<K, V> {
            map: Arc<Map>,
            _types: PhantomData<fn() -> (K, V)>,
        }

        impl<K: Pod, V: Pod> $name<K, V> {
            /// Wrap `map`, checking kind and sizes
            pub fn new(map: Arc<Map>) -> Result<Self, MapError> {
                check_schema(&map, $kind, K::SIZE, V::SIZE)?;
                Ok(Self {
                    map,
                    _types: PhantomData,
                })
            }

            /// Underlying map
            pub fn map(&self) -> &Arc<Map> {
                &self.map
            }

            /// Value stored under `key`
            pub fn get(&self, key: &K) -> Result<Option<V>, MapError> {
                self.map.lookup(&key.to_bytes())?.map(decode).transpose()
            }

            /// Insert or update according to `mode`
            pub fn insert(&self, key: &K, value: &V, mode: UpdateMode) -> Result<(), MapError> {
                self.map.update(&key.to_bytes(), &value.to_bytes(), mode)
            }

            /// Remove `key`, returning the value it held
            pub fn remove(&self, key: &K) -> Result<Option<V>, MapError> {
                self.map.take(&key.to_bytes())?.map(decode).transpose()
            }

            /// All keys present
            pub fn keys(&self) -> Vec<K> {
                self.map
                    .keys()
                    .iter()
                    .filter_map(|k| K::from_bytes(k))
                    .collect()
            }

            /// Entry count
            pub fn len(&self) -> usize {
                self.map.len()
            }

            /// Whether the map is empty
            pub fn is_empty(&self) -> bool {
                self.map.is_empty()
            }
        }
    };
}

keyed_facade!(
    /// Bounded hash map; inserts fail with `Full` at capacity
    HashMap,
    MapKind::Hash
);

keyed_facade!(
    /// Hash map that evicts its least recently used entry at capacity
    LruHashMap,
    MapKind::LruHash
);

/// Fixed-size array of `V`
#[derive(Debug, Clone)]
pub struct Array<V> {
    map: Arc<Map>,
    _types: PhantomData<fn() -> V>,
}

impl<V: Pod> Array<V> {
    /// Wrap `map`, checking kind and sizes
    pub fn new(map: Arc<Map>) -> Result<Self, MapError> {
        check_schema(&map, MapKind::Array, 4, V::SIZE)?;
        Ok(Self {
            map,
            _types: PhantomData,
        })
    }

    /// Underlying map
    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Value at `idx`
    pub fn get(&self, idx: u32) -> Result<Option<V>, MapError> {
        self.map.lookup(&idx.to_le_bytes())?.map(decode).transpose()
    }

    /// Overwrite the value at `idx`
    pub fn set(&self, idx: u32, value: &V) -> Result<(), MapError> {
        self.map
            .update(&idx.to_le_bytes(), &value.to_bytes(), UpdateMode::Upsert)
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the array has no slots
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One array of `V` per worker
#[derive(Debug, Clone)]
pub struct PerWorkerArray<V> {
    map: Arc<Map>,
    _types: PhantomData<fn() -> V>,
}

impl<V: Pod> PerWorkerArray<V> {
    /// Wrap `map`, checking kind and sizes
    pub fn new(map: Arc<Map>) -> Result<Self, MapError> {
        check_schema(&map, MapKind::PerWorkerArray, 4, V::SIZE)?;
        Ok(Self {
            map,
            _types: PhantomData,
        })
    }

    /// Underlying map
    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.map.as_per_worker().map_or(0, |p| p.workers())
    }

    /// Value at `idx` on one worker
    pub fn get(&self, worker: usize, idx: u32) -> Option<V> {
        let bytes = self.map.as_per_worker()?.get(worker, idx)?;
        V::from_bytes(&bytes)
    }

    /// Every worker's value at `idx`
    pub fn values(&self, idx: u32) -> Vec<V> {
        self.map
            .as_per_worker()
            .map(|p| p.values(idx))
            .unwrap_or_default()
            .iter()
            .filter_map(|b| V::from_bytes(b))
            .collect()
    }

    /// Set `idx` to `value` on every worker
    pub fn set_all(&self, idx: u32, value: &V) -> Result<(), MapError> {
        self.map
            .update(&idx.to_le_bytes(), &value.to_bytes(), UpdateMode::Upsert)
    }
}

impl PerWorkerArray<u64> {
    /// Wrapping sum of `idx` over all workers
    pub fn sum(&self, idx: u32) -> u64 {
        self.map.as_per_worker().map_or(0, |p| p.sum_u64(idx, 0))
    }
}

/// Consumer side of a ring buffer map
#[derive(Debug, Clone)]
pub struct RingBuffer {
    map: Arc<Map>,
}

impl RingBuffer {
    /// Wrap `map`, checking its kind
    pub fn new(map: Arc<Map>) -> Result<Self, MapError> {
        if map.as_ringbuf().is_none() {
            return Err(MapError::InvalidSchema(format!(
                "map {:?} is {}, expected ringbuf",
                map.name(),
                map.kind()
            )));
        }
        Ok(Self { map })
    }

    fn ring(&self) -> Option<&RingBufStore> {
        self.map.as_ringbuf()
    }

    /// Underlying map
    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Claim a record
    pub fn reserve(&self, len: usize) -> Option<Reservation<'_>> {
        self.ring()?.reserve(len)
    }

    /// Publish a copy of `data`
    pub fn output(&self, data: &[u8]) -> Result<(), MapError> {
        self.ring().ok_or(MapError::RingFull)?.output(data)
    }

    /// Take the next record
    pub fn poll(&self) -> Option<Vec<u8>> {
        self.ring()?.poll()
    }

    /// Consume every available record
    pub fn drain(&self, f: impl FnMut(&[u8])) -> usize {
        self.ring().map_or(0, |r| r.drain(f))
    }

    /// Reservations refused because the ring was full
    pub fn dropped(&self) -> u64 {
        self.ring().map_or(0, |r| r.dropped())
    }
}
