//! Euclidean distance and brute-force k-nearest-neighbour search.

use std::cmp::Ordering;

use crate::error::{AnomalyError, Result};

/// A stored point found by a neighbour search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

impl Neighbor {
    fn cmp_by_distance(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

/// Euclidean distance between two feature vectors of equal length
pub fn euclidean(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(AnomalyError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }
    Ok(euclidean_unchecked(a, b))
}

/// Euclidean distance for vectors already validated to share a length
pub(crate) fn euclidean_unchecked(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Up to `k` nearest candidates to `query`, ascending by distance.
///
/// `skip` names the candidate that *is* the query when the query is itself a
/// stored point; it is excluded only while its distance is exactly zero.
/// Ties are broken by candidate index so results are deterministic.
pub fn k_nearest<'a, I>(candidates: I, query: &[f64], k: usize, skip: Option<usize>) -> Vec<Neighbor>
where
    I: IntoIterator<Item = &'a [f64]>,
{
    if k == 0 {
        return Vec::new();
    }

    let mut neighbors: Vec<Neighbor> = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(index, candidate)| {
            let distance = euclidean_unchecked(query, candidate);
            if Some(index) == skip && distance == 0.0 {
                None
            } else {
                Some(Neighbor { index, distance })
            }
        })
        .collect();

    if neighbors.len() > k {
        neighbors.select_nth_unstable_by(k - 1, Neighbor::cmp_by_distance);
        neighbors.truncate(k);
    }
    neighbors.sort_unstable_by(Neighbor::cmp_by_distance);
    neighbors
}

/// Checked k-NN over a slice of stored points
pub fn find_k_nearest_neighbors(
    points: &[Vec<f64>],
    query: &[f64],
    k: usize,
    skip: Option<usize>,
) -> Result<Vec<Neighbor>> {
    if let Some(first) = points.first() {
        if first.len() != query.len() {
            return Err(AnomalyError::DimensionMismatch {
                expected: first.len(),
                got: query.len(),
            });
        }
    }
    Ok(k_nearest(
        points.iter().map(Vec::as_slice),
        query,
        k,
        skip,
    ))
}
