//! Kernel row cache
//!
//! Stores whole rows of the kernel matrix in a fixed buffer carved into
//! slots of `active_count()` values each. Rows are identified by their
//! (folded) vector index, columns by their position in the active set:
//! shrinking removes columns physically, which makes every row shorter and
//! lets more rows fit into the same budget.
//!
//! With regression doubling the index space is `2n` wide and index `i >= n`
//! stands for vector `2n - 1 - i`. Rows are always stored under the folded
//! index, so a vector and its mirror share one cache row.
//!
//! Eviction is least-recently-used over per-slot stamps taken from a
//! monotonically increasing clock; ties go to the lowest slot.

mod fill;

use crate::core::{KernelEvaluator, Result, SVMError};
use self::fill::RowFill;
use log::{debug, info, warn};
use rayon::ThreadPool;
use std::sync::Arc;

/// Smallest number of resident rows a cache may be configured with
pub const MIN_CACHE_ROWS: usize = 2;

/// Clock value at which stamps are renormalised
const LRU_CLOCK_LIMIT: i64 = 1 << 40;

const ELEMENT_SIZE: usize = std::mem::size_of::<f64>();

/// Which columns of a row to return
#[derive(Debug, Clone, Copy)]
pub enum Columns<'a> {
    /// Every index of the problem
    All,
    /// Only the listed indices
    Subset(&'a [usize]),
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// `get_row` calls served from a resident row
    pub hits: u64,
    /// `get_row` calls computed on the fly
    pub misses: u64,
    /// Rows dropped to make room for others
    pub evictions: u64,
    /// Rows computed and stored
    pub rows_filled: u64,
    /// Maximum number of resident rows
    pub capacity: usize,
    /// Currently resident rows
    pub occupied: usize,
    /// Highest number of rows resident at the same time
    pub peak_occupied: usize,
}

impl CacheStats {
    /// Fraction of `get_row` calls served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache of kernel matrix rows
pub struct KernelCache<E: KernelEvaluator> {
    kernel: Arc<E>,
    /// Vectors known to the kernel
    num_vectors: usize,
    /// Width of the index space (`num_vectors`, or twice that when doubled)
    total: usize,
    buffer: Vec<f64>,
    /// Maximum number of resident rows at the current row length
    capacity: usize,
    occupied: Vec<bool>,
    lru_stamp: Vec<i64>,
    lru_clock: i64,
    /// Folded index -> slot
    row_of_index: Vec<Option<usize>>,
    /// Slot -> folded index
    index_of_row: Vec<Option<usize>>,
    active_to_original: Vec<usize>,
    original_to_active: Vec<Option<usize>>,
    elems: usize,
    pool: Option<ThreadPool>,
    stats: CacheStats,
}

impl<E: KernelEvaluator> KernelCache<E> {
    /// Create a cache holding as many rows as fit into `capacity_bytes`
    ///
    /// Fails with [`SVMError::Config`] when fewer than [`MIN_CACHE_ROWS`]
    /// rows would fit.
    pub fn new(kernel: Arc<E>, capacity_bytes: usize, regression_doubling: bool) -> Result<Self> {
        let num_vectors = kernel.num_vectors();
        if num_vectors == 0 {
            return Err(SVMError::Config("kernel has zero vectors".into()));
        }
        let total = if regression_doubling {
            2 * num_vectors
        } else {
            num_vectors
        };

        let rows = capacity_bytes / (total * ELEMENT_SIZE);
        let capacity = rows.min(num_vectors);
        if capacity < MIN_CACHE_ROWS {
            return Err(SVMError::Config(format!(
                "cache budget of {} bytes holds {} rows of {} values, need at least {}",
                capacity_bytes, capacity, total, MIN_CACHE_ROWS
            )));
        }

        let buffer_len = (capacity_bytes / ELEMENT_SIZE).min(num_vectors * total);
        info!(
            "using a kernel cache of {} rows ({:.2} MB) for {} vectors",
            capacity,
            (buffer_len * ELEMENT_SIZE) as f64 / (1024.0 * 1024.0),
            num_vectors
        );

        Ok(Self {
            kernel,
            num_vectors,
            total,
            buffer: vec![0.0; buffer_len],
            capacity,
            occupied: vec![false; total],
            lru_stamp: vec![0; total],
            lru_clock: 0,
            row_of_index: vec![None; total],
            index_of_row: vec![None; total],
            active_to_original: (0..total).collect(),
            original_to_active: (0..total).map(Some).collect(),
            elems: 0,
            pool: None,
            stats: CacheStats {
                capacity,
                ..CacheStats::default()
            },
        })
    }

    /// Use a pool of `num_threads` workers for batch fills
    pub fn with_threads(mut self, num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(SVMError::Config("num_threads must be at least 1".into()));
        }
        self.pool = if num_threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| SVMError::Config(format!("cannot build fill pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        Ok(self)
    }

    pub fn kernel(&self) -> &Arc<E> {
        &self.kernel
    }

    pub fn num_vectors(&self) -> usize {
        self.num_vectors
    }

    /// Width of the index space rows and columns are addressed in
    pub fn total(&self) -> usize {
        self.total
    }

    /// Maximum number of resident rows
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident rows
    pub fn occupied(&self) -> usize {
        self.elems
    }

    /// Number of columns stored per row
    pub fn active_count(&self) -> usize {
        self.active_to_original.len()
    }

    /// Whether `index` still has a stored column
    pub fn is_active_column(&self, index: usize) -> bool {
        self.original_to_active[index].is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            occupied: self.elems,
            ..self.stats
        }
    }

    /// Map an index of the doubled space onto its kernel vector
    #[inline]
    pub fn fold(&self, index: usize) -> usize {
        assert!(
            index < self.total,
            "index {} outside cache index space of {}",
            index,
            self.total
        );
        if index >= self.num_vectors {
            2 * self.num_vectors - 1 - index
        } else {
            index
        }
    }

    /// Slot holding the row of `index`, without touching its LRU stamp
    pub fn slot_of(&self, index: usize) -> Option<usize> {
        self.row_of_index[self.fold(index)]
    }

    pub fn is_cached(&self, index: usize) -> bool {
        self.slot_of(index).is_some()
    }

    /// Kernel diagonal over the whole index space
    pub fn diagonal(&self) -> Vec<f64> {
        let diag: Vec<f64> = (0..self.num_vectors)
            .map(|i| self.kernel.value(i, i))
            .collect();
        (0..self.total).map(|i| diag[self.fold(i)]).collect()
    }

    /// Write kernel values `K(index, j)` into `buffer[j]` for the requested `j`
    ///
    /// A resident row is served from the buffer (columns removed by a shrink
    /// are computed on the fly) and its stamp refreshed. A row that is not
    /// resident is computed directly and not stored.
    pub fn get_row(&mut self, index: usize, columns: Columns<'_>, buffer: &mut [f64]) {
        let doc = self.fold(index);
        match self.row_of_index[doc] {
            Some(slot) => {
                self.stats.hits += 1;
                self.touch(slot);
                let start = slot * self.active_count();
                match columns {
                    Columns::All => {
                        for j in 0..self.total {
                            buffer[j] = self.resident_value(start, doc, j);
                        }
                    }
                    Columns::Subset(cols) => {
                        for &j in cols {
                            buffer[j] = self.resident_value(start, doc, j);
                        }
                    }
                }
            }
            None => {
                self.stats.misses += 1;
                match columns {
                    Columns::All => {
                        for j in 0..self.total {
                            buffer[j] = self.kernel.value(doc, self.fold(j));
                        }
                    }
                    Columns::Subset(cols) => {
                        for &j in cols {
                            buffer[j] = self.kernel.value(doc, self.fold(j));
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn resident_value(&self, start: usize, doc: usize, j: usize) -> f64 {
        match self.original_to_active[j] {
            Some(col) => self.buffer[start + col],
            None => self.kernel.value(doc, self.fold(j)),
        }
    }

    /// Make the row of `index` resident, evicting the LRU row if needed
    ///
    /// Returns the slot holding the row.
    pub fn cache_row(&mut self, index: usize) -> Result<usize> {
        self.cache_row_keeping(index, &[])
    }

    /// Like [`cache_row`](Self::cache_row), but never evicts the rows of `keep`
    ///
    /// Fails with the recoverable [`SVMError::CacheFull`] when every slot
    /// holds a row of `keep`.
    pub fn cache_row_keeping(&mut self, index: usize, keep: &[usize]) -> Result<usize> {
        let doc = self.fold(index);
        if let Some(slot) = self.row_of_index[doc] {
            self.touch(slot);
            return Ok(slot);
        }

        let pinned: Vec<usize> = keep.iter().filter_map(|&k| self.slot_of(k)).collect();
        let slot = self
            .claim_slot(doc, &pinned)
            .ok_or(SVMError::CacheFull { row: doc })?;
        self.fill_rows(&[(doc, slot)]);
        self.verify();
        Ok(slot)
    }

    /// Make several rows resident at once
    ///
    /// Slots are assigned sequentially, then the rows are computed in
    /// parallel when a worker pool is configured. A batch never evicts its
    /// own rows: once every slot holds a row of this batch the remaining
    /// indices are left uncached. Returns the number of rows computed.
    pub fn cache_rows(&mut self, indices: &[usize]) -> usize {
        let mut pending: Vec<(usize, usize)> = Vec::new();
        let mut pinned: Vec<usize> = Vec::new();

        for &index in indices {
            let doc = self.fold(index);
            if let Some(slot) = self.row_of_index[doc] {
                self.touch(slot);
                continue;
            }
            if pending.len() >= self.capacity {
                warn!(
                    "batch of {} rows exceeds cache capacity {}, remaining rows stay uncached",
                    indices.len(),
                    self.capacity
                );
                break;
            }
            match self.claim_slot(doc, &pinned) {
                Some(slot) => {
                    pending.push((doc, slot));
                    pinned.push(slot);
                }
                None => {
                    warn!("kernel cache full while caching row {}", doc);
                    break;
                }
            }
        }

        self.fill_rows(&pending);
        self.verify();
        pending.len()
    }

    /// Compute the given `(row, slot)` pairs into their slots
    fn fill_rows(&mut self, pending: &[(usize, usize)]) {
        let stride = self.active_to_original.len();
        if pending.is_empty() || stride == 0 {
            return;
        }

        let mut is_pending = vec![false; self.capacity];
        for &(_, slot) in pending {
            is_pending[slot] = true;
        }

        let Self {
            kernel,
            buffer,
            capacity,
            index_of_row,
            row_of_index,
            active_to_original,
            original_to_active,
            num_vectors,
            pool,
            ..
        } = self;

        let mut targets: Vec<(usize, &mut [f64])> = Vec::with_capacity(pending.len());
        let mut resident: Vec<Option<&[f64]>> = vec![None; *capacity];
        for (slot, chunk) in buffer.chunks_mut(stride).take(*capacity).enumerate() {
            match index_of_row[slot] {
                Some(doc) if is_pending[slot] => targets.push((doc, chunk)),
                Some(_) => {
                    let chunk: &[f64] = chunk;
                    resident[slot] = Some(chunk);
                }
                None => {}
            }
        }

        let fill = RowFill {
            kernel: &**kernel,
            num_vectors: *num_vectors,
            active_to_original,
            original_to_active,
            row_of_index,
            resident: &resident,
        };
        fill.run(&mut targets, pool.as_ref());

        self.stats.rows_filled += pending.len() as u64;
    }

    /// Find a slot for `doc`, evicting the LRU row (never one in `pinned`)
    fn claim_slot(&mut self, doc: usize, pinned: &[usize]) -> Option<usize> {
        let slot = match self.alloc_slot() {
            Some(slot) => slot,
            None => {
                if !self.evict_lru(pinned) {
                    return None;
                }
                self.alloc_slot()?
            }
        };

        if let Some(previous) = self.index_of_row[slot] {
            panic!(
                "kernel cache slot {} handed out for row {} while still holding row {}",
                slot, doc, previous
            );
        }
        self.row_of_index[doc] = Some(slot);
        self.index_of_row[slot] = Some(doc);
        self.touch(slot);
        self.stats.peak_occupied = self.stats.peak_occupied.max(self.elems);
        Some(slot)
    }

    fn alloc_slot(&mut self) -> Option<usize> {
        if self.elems >= self.capacity {
            return None;
        }
        let slot = (0..self.capacity).find(|&slot| !self.occupied[slot])?;
        self.occupied[slot] = true;
        self.elems += 1;
        Some(slot)
    }

    /// Drop the least recently used row; ties go to the lowest slot
    fn evict_lru(&mut self, pinned: &[usize]) -> bool {
        let victim = (0..self.capacity)
            .filter(|&slot| self.index_of_row[slot].is_some() && !pinned.contains(&slot))
            .min_by_key(|&slot| (self.lru_stamp[slot], slot));

        match victim {
            Some(slot) => {
                let doc = self.index_of_row[slot].take().unwrap_or_else(|| {
                    panic!("kernel cache slot {} selected for eviction while empty", slot)
                });
                self.row_of_index[doc] = None;
                self.occupied[slot] = false;
                self.elems -= 1;
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn touch(&mut self, slot: usize) {
        self.lru_clock += 1;
        self.lru_stamp[slot] = self.lru_clock;
        if self.lru_clock >= LRU_CLOCK_LIMIT {
            self.reset_lru();
        }
    }

    /// Shift all stamps so the newest is zero, keeping their order
    pub fn reset_lru(&mut self) {
        let max_stamp = self.lru_stamp[..self.capacity]
            .iter()
            .copied()
            .fold(0, i64::max);
        for stamp in &mut self.lru_stamp[..self.capacity] {
            *stamp -= max_stamp;
        }
        self.lru_clock -= max_stamp;
    }

    /// Physically remove up to `num_to_remove` columns flagged `!should_keep`
    ///
    /// Columns are taken in active order. Every resident row is compacted
    /// in place and the active maps are rebuilt; rows become shorter, so the
    /// capacity in rows grows to what the buffer now holds. Queries on a
    /// removed column still return correct values but compute them on the
    /// fly. Must not overlap with any other cache access.
    pub fn shrink(&mut self, num_to_remove: usize, should_keep: &[bool]) {
        assert_eq!(
            should_keep.len(),
            self.total,
            "shrink mask must cover the whole index space"
        );

        let mut keep = vec![true; self.total];
        let mut removed = 0;
        for &j in &self.active_to_original {
            if removed >= num_to_remove {
                break;
            }
            if !should_keep[j] {
                keep[j] = false;
                removed += 1;
            }
        }
        if removed == 0 {
            return;
        }

        let old_stride = self.active_to_original.len();
        let mut to = 0;
        let mut from = 0;
        for _slot in 0..self.capacity {
            for &j in &self.active_to_original {
                if keep[j] {
                    self.buffer[to] = self.buffer[from];
                    to += 1;
                }
                from += 1;
            }
        }

        self.active_to_original.clear();
        for j in 0..self.total {
            if keep[j] && self.original_to_active[j].is_some() {
                self.original_to_active[j] = Some(self.active_to_original.len());
                self.active_to_original.push(j);
            } else {
                self.original_to_active[j] = None;
            }
        }

        let stride = self.active_to_original.len();
        if stride > 0 {
            self.capacity = (self.buffer.len() / stride).min(self.num_vectors);
        }
        debug!(
            "kernel cache shrunk from {} to {} columns, capacity now {} rows",
            old_stride, stride, self.capacity
        );
        self.verify();
    }

    /// Drop every row and restore all columns
    pub fn reset(&mut self) {
        self.occupied.iter_mut().for_each(|o| *o = false);
        self.lru_stamp.iter_mut().for_each(|s| *s = 0);
        self.row_of_index.iter_mut().for_each(|r| *r = None);
        self.index_of_row.iter_mut().for_each(|r| *r = None);
        self.active_to_original = (0..self.total).collect();
        self.original_to_active = (0..self.total).map(Some).collect();
        self.capacity = (self.buffer.len() / self.total).min(self.num_vectors);
        self.elems = 0;
        self.lru_clock = 0;
        debug!("kernel cache reset to {} rows", self.capacity);
    }

    /// Panic if the bookkeeping maps disagree
    pub fn check_invariants(&self) {
        let mut count = 0;
        for slot in 0..self.total {
            match self.index_of_row[slot] {
                Some(doc) => {
                    count += 1;
                    assert!(
                        slot < self.capacity,
                        "row {} resident in slot {} beyond capacity {}",
                        doc,
                        slot,
                        self.capacity
                    );
                    assert!(self.occupied[slot], "slot {} mapped but not occupied", slot);
                    assert_eq!(
                        self.row_of_index[doc],
                        Some(slot),
                        "row {} and slot {} disagree",
                        doc,
                        slot
                    );
                }
                None => assert!(!self.occupied[slot], "slot {} occupied but unmapped", slot),
            }
        }
        assert_eq!(count, self.elems, "occupancy count out of sync");
        assert!(self.elems <= self.capacity, "more rows than capacity");
        for (doc, slot) in self.row_of_index.iter().enumerate() {
            if let Some(slot) = slot {
                assert_eq!(
                    self.index_of_row[*slot],
                    Some(doc),
                    "row {} points at slot {} owned by another row",
                    doc,
                    slot
                );
            }
        }
        for (col, &j) in self.active_to_original.iter().enumerate() {
            assert_eq!(self.original_to_active[j], Some(col), "active maps disagree");
        }
    }

    #[inline]
    fn verify(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CountingKernel, PrecomputedKernel};

    fn gram(n: usize) -> PrecomputedKernel {
        PrecomputedKernel::from_fn(n, |i, j| 1.0 + 0.25 * (i + j) as f64 + (i * j) as f64)
    }

    fn direct(kernel: &PrecomputedKernel, i: usize, j: usize) -> f64 {
        kernel.value(i, j)
    }

    /// Budget for exactly `rows` rows of `width` values
    fn budget(rows: usize, width: usize) -> usize {
        rows * width * ELEMENT_SIZE
    }

    #[test]
    fn test_capacity_from_budget() {
        let cache = KernelCache::new(Arc::new(gram(5)), budget(3, 5), false).expect("valid");
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.total(), 5);
        assert_eq!(cache.occupied(), 0);

        let cache = KernelCache::new(Arc::new(gram(5)), 1 << 20, false).expect("valid");
        assert_eq!(cache.capacity(), 5);
    }

    #[test]
    fn test_budget_too_small() {
        let result = KernelCache::new(Arc::new(gram(5)), budget(1, 5), false);
        assert!(matches!(result, Err(SVMError::Config(_))));

        let result = KernelCache::new(Arc::new(gram(5)), budget(2, 5), false).map(|_| ());
        assert!(result.is_ok());
    }

    #[test]
    fn test_regression_doubling_geometry() {
        let cache = KernelCache::new(Arc::new(gram(4)), budget(3, 8), true).expect("valid");
        assert_eq!(cache.total(), 8);
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.fold(2), 2);
        assert_eq!(cache.fold(4), 3);
        assert_eq!(cache.fold(7), 0);
    }

    #[test]
    fn test_get_row_uncached_is_a_peek() {
        let kernel = Arc::new(gram(4));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 4), false).expect("valid");
        let mut row = vec![0.0; 4];

        cache.get_row(1, Columns::All, &mut row);
        for j in 0..4 {
            assert_eq!(row[j], direct(&kernel, 1, j));
        }
        assert_eq!(cache.occupied(), 0);
        assert!(!cache.is_cached(1));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_get_row_cached_matches_kernel() {
        let kernel = Arc::new(gram(5));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 5), false).expect("valid");

        cache.cache_row(3).expect("row fits");
        cache.cache_row(0).expect("row fits");

        let mut row = vec![f64::NAN; 5];
        cache.get_row(3, Columns::Subset(&[0, 2, 4]), &mut row);
        assert_eq!(row[0], direct(&kernel, 3, 0));
        assert_eq!(row[2], direct(&kernel, 3, 2));
        assert_eq!(row[4], direct(&kernel, 3, 4));
        assert!(row[1].is_nan());

        cache.get_row(0, Columns::All, &mut row);
        for j in 0..5 {
            assert_eq!(row[j], direct(&kernel, 0, j));
        }
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_cache_row_idempotent() {
        let mut cache = KernelCache::new(Arc::new(gram(4)), budget(2, 4), false).expect("valid");

        let first = cache.cache_row(2).expect("row fits");
        let second = cache.cache_row(2).expect("row fits");
        assert_eq!(first, second);
        assert_eq!(cache.occupied(), 1);
        assert_eq!(cache.stats().rows_filled, 1);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let kernel = Arc::new(gram(6));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(3, 6), false).expect("valid");

        cache.cache_row(0).expect("fits");
        cache.cache_row(1).expect("fits");
        cache.cache_row(2).expect("fits");
        let slot_of_zero = cache.slot_of(0).expect("resident");

        let slot = cache.cache_row(3).expect("fits after eviction");
        assert_eq!(slot, slot_of_zero);
        assert!(!cache.is_cached(0));
        assert!(cache.is_cached(3));
        assert_eq!(cache.occupied(), 3);
        assert_eq!(cache.stats().evictions, 1);

        // The evicted row must be recomputed, not read from the reused slot
        let mut row = vec![0.0; 6];
        cache.get_row(0, Columns::All, &mut row);
        for j in 0..6 {
            assert_eq!(row[j], direct(&kernel, 0, j));
        }
    }

    #[test]
    fn test_touch_protects_recent_rows() {
        let mut cache = KernelCache::new(Arc::new(gram(5)), budget(2, 5), false).expect("valid");
        let mut row = vec![0.0; 5];

        cache.cache_row(0).expect("fits");
        cache.cache_row(1).expect("fits");
        cache.get_row(0, Columns::All, &mut row);

        cache.cache_row(2).expect("fits");
        assert!(cache.is_cached(0));
        assert!(!cache.is_cached(1));
    }

    #[test]
    fn test_keep_overrides_lru_order() {
        let kernel = gram(5);
        let mut cache = KernelCache::new(Arc::new(kernel.clone()), budget(2, 5), false).expect("valid");

        cache.cache_row(0).expect("fits");
        cache.cache_row(1).expect("fits");

        // Row 0 is the LRU victim unless it is kept
        cache.cache_row_keeping(2, &[0]).expect("fits");
        assert!(cache.is_cached(0));
        assert!(!cache.is_cached(1));
        assert!(cache.is_cached(2));
    }

    #[test]
    fn test_cache_full_when_every_row_is_kept() {
        let kernel = gram(5);
        let mut cache = KernelCache::new(Arc::new(kernel.clone()), budget(2, 5), false).expect("valid");
        cache.cache_row(0).expect("fits");
        cache.cache_row(1).expect("fits");

        let err = cache.cache_row_keeping(3, &[0, 1]).unwrap_err();
        assert!(matches!(err, SVMError::CacheFull { row: 3 }));
        assert!(err.is_recoverable());
        assert!(cache.is_cached(0) && cache.is_cached(1));
        assert!(!cache.is_cached(3));

        // The row is still served, computed on the fly
        let mut row = vec![0.0; 5];
        cache.get_row(3, Columns::All, &mut row);
        for j in 0..5 {
            assert_eq!(row[j], direct(&kernel, 3, j));
        }
        assert_eq!(cache.stats().misses, 1);
        cache.check_invariants();
    }

    #[test]
    fn test_symmetric_fill_reuses_resident_rows() {
        let kernel = Arc::new(CountingKernel::new(gram(5)));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 5), false).expect("valid");

        cache.cache_row(0).expect("fits");
        assert_eq!(kernel.calls(), 5);

        // K(1, 0) is copied from row 0
        cache.cache_row(1).expect("fits");
        assert_eq!(kernel.calls(), 9);

        let mut row = vec![0.0; 5];
        cache.get_row(1, Columns::All, &mut row);
        for j in 0..5 {
            assert_eq!(row[j], kernel.inner().value(1, j));
        }
    }

    #[test]
    fn test_cache_rows_batch() {
        let kernel = Arc::new(gram(6));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(4, 6), false).expect("valid");

        let filled = cache.cache_rows(&[5, 1, 5, 3]);
        assert_eq!(filled, 3);
        assert_eq!(cache.occupied(), 3);

        let mut row = vec![0.0; 6];
        for &i in &[1, 3, 5] {
            cache.get_row(i, Columns::All, &mut row);
            for j in 0..6 {
                assert_eq!(row[j], direct(&kernel, i, j));
            }
        }
    }

    #[test]
    fn test_cache_rows_larger_than_capacity() {
        let kernel = Arc::new(gram(6));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 6), false).expect("valid");
        cache.cache_row(4).expect("fits");

        let filled = cache.cache_rows(&[0, 1, 2, 3]);
        assert_eq!(filled, 2);
        assert!(cache.is_cached(0));
        assert!(cache.is_cached(1));
        assert!(!cache.is_cached(4));

        let mut row = vec![0.0; 6];
        for i in 0..6 {
            cache.get_row(i, Columns::All, &mut row);
            for j in 0..6 {
                assert_eq!(row[j], direct(&kernel, i, j));
            }
        }
    }

    #[test]
    fn test_cache_rows_never_evicts_own_batch() {
        let kernel = Arc::new(gram(5));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 5), false).expect("valid");
        cache.cache_row(1).expect("fits");
        cache.cache_row(2).expect("fits");

        // 0 takes the slot of 1, then 2 is touched and becomes newer than 0;
        // 3 must evict 2 rather than the still-unfilled row 0
        cache.cache_rows(&[0, 2, 3]);
        assert!(cache.is_cached(0));
        assert!(cache.is_cached(3));

        let mut row = vec![0.0; 5];
        cache.get_row(0, Columns::All, &mut row);
        for j in 0..5 {
            assert_eq!(row[j], direct(&kernel, 0, j));
        }
    }

    #[test]
    fn test_parallel_fill_matches_sequential() {
        let kernel = Arc::new(gram(16));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(12, 16), false)
            .expect("valid")
            .with_threads(4)
            .expect("pool");

        cache.cache_rows(&[0, 1, 2, 3]);
        let filled = cache.cache_rows(&(4..12).collect::<Vec<_>>());
        assert_eq!(filled, 8);

        let mut row = vec![0.0; 16];
        for i in 0..12 {
            assert!(cache.is_cached(i));
            cache.get_row(i, Columns::All, &mut row);
            for j in 0..16 {
                assert_eq!(row[j], direct(&kernel, i, j));
            }
        }
    }

    #[test]
    fn test_zero_threads_rejected() {
        let cache = KernelCache::new(Arc::new(gram(4)), budget(2, 4), false).expect("valid");
        assert!(matches!(cache.with_threads(0), Err(SVMError::Config(_))));
    }

    #[test]
    fn test_doubled_rows_share_storage() {
        let kernel = Arc::new(gram(3));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 6), true).expect("valid");

        let slot = cache.cache_row(5).expect("fits");
        assert_eq!(cache.cache_row(0).expect("fits"), slot);
        assert_eq!(cache.occupied(), 1);

        let mut row = vec![0.0; 6];
        cache.get_row(5, Columns::All, &mut row);
        for j in 0..6 {
            assert_eq!(row[j], direct(&kernel, 0, cache.fold(j)));
        }

        let diag = cache.diagonal();
        assert_eq!(diag.len(), 6);
        assert_eq!(diag[5], direct(&kernel, 0, 0));
        assert_eq!(diag[3], direct(&kernel, 2, 2));
    }

    #[test]
    fn test_shrink_keeps_values_consistent() {
        let kernel = Arc::new(gram(6));
        let mut cache = KernelCache::new(Arc::clone(&kernel), budget(2, 6), false).expect("valid");
        cache.cache_row(1).expect("fits");
        cache.cache_row(4).expect("fits");

        let keep = vec![true, false, true, false, true, true];
        cache.shrink(2, &keep);

        assert_eq!(cache.active_count(), 4);
        assert!(!cache.is_active_column(1));
        assert!(cache.is_active_column(4));
        // Shorter rows leave room for more of them
        assert_eq!(cache.capacity(), 3);

        let mut row = vec![0.0; 6];
        for &i in &[1, 4] {
            assert!(cache.is_cached(i));
            cache.get_row(i, Columns::All, &mut row);
            for j in 0..6 {
                assert_eq!(row[j], direct(&kernel, i, j));
            }
        }

        // Rows filled after the shrink only store the kept columns
        cache.cache_row(0).expect("fits");
        cache.get_row(0, Columns::Subset(&[0, 2, 4, 5]), &mut row);
        for &j in &[0, 2, 4, 5] {
            assert_eq!(row[j], direct(&kernel, 0, j));
        }
    }

    #[test]
    fn test_shrink_respects_removal_count() {
        let mut cache = KernelCache::new(Arc::new(gram(5)), budget(2, 5), false).expect("valid");
        let keep = vec![false, false, false, true, true];
        cache.shrink(2, &keep);

        assert_eq!(cache.active_count(), 3);
        assert!(!cache.is_active_column(0));
        assert!(!cache.is_active_column(1));
        assert!(cache.is_active_column(2));
    }

    #[test]
    fn test_reset_restores_columns() {
        let mut cache = KernelCache::new(Arc::new(gram(5)), budget(2, 5), false).expect("valid");
        cache.cache_row(0).expect("fits");
        cache.shrink(1, &[true, false, true, true, true]);
        assert_eq!(cache.capacity(), 2);

        cache.reset();
        assert_eq!(cache.occupied(), 0);
        assert_eq!(cache.active_count(), 5);
        assert_eq!(cache.capacity(), 2);
        assert!(!cache.is_cached(0));
        cache.check_invariants();
    }

    #[test]
    fn test_reset_lru_keeps_order() {
        let mut cache = KernelCache::new(Arc::new(gram(5)), budget(3, 5), false).expect("valid");
        cache.cache_row(0).expect("fits");
        cache.cache_row(1).expect("fits");
        cache.cache_row(2).expect("fits");

        let before: Vec<i64> = cache.lru_stamp[..3].to_vec();
        cache.reset_lru();
        let after: Vec<i64> = cache.lru_stamp[..3].to_vec();

        assert_eq!(after.iter().copied().max(), Some(0));
        for k in 0..3 {
            assert_eq!(before[k] - after[k], before[2]);
        }

        // Still evicts the oldest row, and new stamps sort after old ones
        cache.cache_row(3).expect("fits");
        assert!(!cache.is_cached(0));
        assert!(cache.lru_stamp[cache.slot_of(3).expect("resident")] > 0);
    }

    #[test]
    fn test_occupancy_never_exceeds_capacity() {
        let mut cache = KernelCache::new(Arc::new(gram(8)), budget(3, 8), false).expect("valid");
        let mut row = vec![0.0; 8];
        let sequence = [0, 5, 3, 5, 7, 1, 0, 2, 6, 6, 4, 1];

        for (step, &i) in sequence.iter().enumerate() {
            if step % 3 == 0 {
                cache.cache_rows(&[i, (i + 1) % 8]);
            } else {
                cache.cache_row(i).expect("fits");
            }
            cache.get_row(i, Columns::All, &mut row);
            assert!(cache.occupied() <= cache.capacity());
            cache.check_invariants();
        }
        assert!(cache.stats().peak_occupied <= 3);
        assert!(cache.stats().hit_rate() > 0.0);
    }
}
