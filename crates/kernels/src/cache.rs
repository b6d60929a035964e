//! Bounded memoization of scaled distance matrices.
//!
//! Entries are keyed by the identity of the `(x, x2)` inputs (address, shape and
//! strides of the arrays) together with the lengthscale generation and the
//! distance table generation. An identity hit is confirmed by comparing the
//! stored inputs so that a reused allocation never serves a stale matrix.
//! A single writer is assumed, the store sits behind a mutex to keep kernels `Sync`.

use crate::errors::Result;
use linfa::Float;
use log::debug;
use ndarray::{Array2, ArrayView2};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of memoized scaled distance matrices
pub const DISTANCE_CACHE_LIMIT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InputId {
    ptr: usize,
    shape: [usize; 2],
    strides: [isize; 2],
}

impl InputId {
    fn of<F>(x: &ArrayView2<F>) -> Self {
        let strides = x.strides();
        InputId {
            ptr: x.as_ptr() as usize,
            shape: [x.nrows(), x.ncols()],
            strides: [strides[0], strides[1]],
        }
    }
}

/// Identity of a scaled distance request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheKey {
    generation: u64,
    builder_generation: u64,
    x: InputId,
    x2: Option<InputId>,
}

impl CacheKey {
    /// Key of `(x, x2)` for the given lengthscale and distance table generations
    pub fn new<F>(
        generation: u64,
        builder_generation: u64,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
    ) -> Self {
        CacheKey {
            generation,
            builder_generation,
            x: InputId::of(x),
            x2: x2.map(InputId::of),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<F: Float> {
    key: CacheKey,
    x: Array2<F>,
    x2: Option<Array2<F>>,
    value: Array2<F>,
}

impl<F: Float> CacheEntry<F> {
    fn matches(&self, key: &CacheKey, x: &ArrayView2<F>, x2: Option<&ArrayView2<F>>) -> bool {
        if self.key != *key || self.x != *x {
            return false;
        }
        match (&self.x2, x2) {
            (None, None) => true,
            (Some(a), Some(b)) => *a == *b,
            _ => false,
        }
    }
}

/// Bounded store of the most recent scaled distance matrices,
/// the oldest inserted entry is evicted first.
#[derive(Debug)]
pub struct ScaledDistanceCache<F: Float> {
    limit: usize,
    entries: Mutex<VecDeque<CacheEntry<F>>>,
}

impl<F: Float> Default for ScaledDistanceCache<F> {
    fn default() -> Self {
        Self::new(DISTANCE_CACHE_LIMIT)
    }
}

/// A cloned cache starts empty
impl<F: Float> Clone for ScaledDistanceCache<F> {
    fn clone(&self) -> Self {
        Self::new(self.limit)
    }
}

impl<F: Float> ScaledDistanceCache<F> {
    /// Cache keeping at most `limit` matrices
    pub fn new(limit: usize) -> Self {
        ScaledDistanceCache {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Maximum number of entries
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Return the memoized matrix for `(key, x, x2)` or compute and store it.
    /// Errors from `compute` are returned and nothing is stored.
    pub fn get_or_compute(
        &self,
        key: CacheKey,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
        compute: impl FnOnce() -> Result<Array2<F>>,
    ) -> Result<Array2<F>> {
        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.iter().find(|e| e.matches(&key, x, x2)) {
                return Ok(entry.value.to_owned());
            }
        }
        debug!("Scaled distance cache miss for {:?}", key);
        let value = compute()?;
        if self.limit > 0 {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            while entries.len() >= self.limit {
                entries.pop_front();
            }
            entries.push_back(CacheEntry {
                key,
                x: x.to_owned(),
                x2: x2.map(|v| v.to_owned()),
                value: value.to_owned(),
            });
        }
        Ok(value)
    }
}
