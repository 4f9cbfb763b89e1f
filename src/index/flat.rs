//! Exhaustive-scan index: the correctness baseline every collection can use.

use crate::cancel::CancelToken;
use crate::distance::Metric;
use crate::error::Result;
use crate::index::{Candidate, TopK, VectorSet};

/// How many distance computations run between cancellation checks.
const CANCEL_STRIDE: usize = 256;

pub struct FlatIndex {
    metric: Metric,
}

impl FlatIndex {
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }

    /// Scans every live vector and keeps the `k` nearest. The result order
    /// is deterministic regardless of map iteration order because ties break
    /// on the slot.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        vectors: &VectorSet,
        token: &CancelToken,
    ) -> Result<Vec<Candidate>> {
        let mut top = TopK::new(k);
        for (scanned, (slot, vector)) in vectors.iter_live().enumerate() {
            if scanned % CANCEL_STRIDE == 0 {
                token.check()?;
            }
            top.push(Candidate {
                slot,
                distance: self.metric.distance(query, vector),
            });
        }
        Ok(top.into_sorted())
    }
}
