//! Row computation for the kernel cache

use crate::core::KernelEvaluator;
use rayon::prelude::*;
use rayon::ThreadPool;

/// Read-only view of the cache needed to compute rows into their slots
pub(super) struct RowFill<'a, E: KernelEvaluator> {
    pub kernel: &'a E,
    pub num_vectors: usize,
    pub active_to_original: &'a [usize],
    pub original_to_active: &'a [Option<usize>],
    pub row_of_index: &'a [Option<usize>],
    /// Rows resident before this fill, by slot
    pub resident: &'a [Option<&'a [f64]>],
}

impl<'a, E: KernelEvaluator> RowFill<'a, E> {
    /// Fill every `(row, slot buffer)` target, on `pool` when there is one
    pub fn run(&self, targets: &mut [(usize, &mut [f64])], pool: Option<&ThreadPool>) {
        match pool {
            Some(pool) if targets.len() > 1 => pool.install(|| {
                targets
                    .par_iter_mut()
                    .for_each(|(doc, dst)| self.fill_row(*doc, dst))
            }),
            _ => {
                for (doc, dst) in targets.iter_mut() {
                    self.fill_row(*doc, dst);
                }
            }
        }
    }

    /// Compute row `doc` over the active columns
    ///
    /// `K(doc, k)` is copied from row `k` when that row is resident and still
    /// stores column `doc`.
    fn fill_row(&self, doc: usize, dst: &mut [f64]) {
        let own_column = self.original_to_active[doc];
        for (col, out) in dst.iter_mut().enumerate() {
            let other = self.fold(self.active_to_original[col]);
            let mirrored = match own_column {
                Some(own) if other != doc => self.row_of_index[other]
                    .and_then(|slot| self.resident[slot])
                    .map(|row| row[own]),
                _ => None,
            };
            *out = match mirrored {
                Some(value) => value,
                None => self.kernel.value(doc, other),
            };
        }
    }

    #[inline]
    fn fold(&self, index: usize) -> usize {
        if index >= self.num_vectors {
            2 * self.num_vectors - 1 - index
        } else {
            index
        }
    }
}
