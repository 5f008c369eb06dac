//! Ranking of hidden units by activation.

use std::cmp::Ordering;

use ndarray::{ArrayView1, ArrayView2, Axis};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Units with output strictly above this are "activated".
pub const DEFAULT_CUTOFF: f32 = 0.0;

/// Activated units of one example, strongest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationSelection {
    pub cutoff: f32,
    /// Original unit indices.
    pub indices: Vec<usize>,
    /// Activation values, same order as `indices`.
    pub values: Vec<f32>,
}

impl ActivationSelection {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }

    pub fn min_value(&self) -> Option<f32> {
        self.values.last().copied()
    }

    pub fn max_value(&self) -> Option<f32> {
        self.values.first().copied()
    }
}

/// Sorts descending (stable, NaN last) and returns the permutation of
/// original indices alongside the sorted values.
pub fn sort_descending(activations: ArrayView1<'_, f32>) -> (Vec<usize>, Vec<f32>) {
    let mut order: Vec<usize> = (0..activations.len()).collect();
    order.sort_by(|&a, &b| {
        let (x, y) = (activations[a], activations[b]);
        match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        }
    });
    let values = order.iter().map(|&i| activations[i]).collect();
    (order, values)
}

/// Prefix of the descending order whose values are strictly above `cutoff`.
pub fn select(activations: ArrayView1<'_, f32>, cutoff: f32) -> ActivationSelection {
    let (mut indices, mut values) = sort_descending(activations);
    let keep = values.iter().take_while(|&&v| v > cutoff).count();
    indices.truncate(keep);
    values.truncate(keep);
    ActivationSelection {
        cutoff,
        indices,
        values,
    }
}

/// One selection per row of a `[batch, units]` record.
pub fn select_batch(record: ArrayView2<'_, f32>, cutoff: f32) -> Vec<ActivationSelection> {
    #[cfg(feature = "parallel")]
    {
        let rows: Vec<_> = record.axis_iter(Axis(0)).collect();
        rows.into_par_iter().map(|row| select(row, cutoff)).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        record
            .axis_iter(Axis(0))
            .map(|row| select(row, cutoff))
            .collect()
    }
}
