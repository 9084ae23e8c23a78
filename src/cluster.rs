//! One-dimensional density clustering of bubble coordinates.
//!
//! A value is a core point when at least `min_samples` values (itself
//! included) lie within `eps` of it. Cores closer than `eps` chain into one
//! cluster. Everything else is noise, except for border values: a non-core
//! value within `eps` of a core joins the cluster of its nearest core, the
//! lower one on a tie. Expansion order plays no part, so a border value
//! between two clusters does not go to whichever cluster is grown first.

use serde::{Deserialize, Serialize};

/// How a cluster is collapsed to its canonical position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reducer {
    Mean,
    Median,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterParams {
    pub eps: f32,
    pub min_samples: usize,
    pub reducer: Reducer,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps: 10.0,
            min_samples: 3,
            reducer: Reducer::Mean,
        }
    }
}

/// Cluster label per input value, in input order; `None` marks noise.
pub fn dbscan_1d(values: &[i32], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| values[i]);
    let sorted: Vec<f32> = order.iter().map(|&i| values[i] as f32).collect();
    let n = sorted.len();

    // neighbour counts with a sliding window over the sorted values
    let mut is_core = vec![false; n];
    let (mut lo, mut hi) = (0usize, 0usize);
    for i in 0..n {
        while sorted[i] - sorted[lo] > eps {
            lo += 1;
        }
        while hi + 1 < n && sorted[hi + 1] - sorted[i] <= eps {
            hi += 1;
        }
        is_core[i] = hi - lo + 1 >= min_samples.max(1);
    }

    let mut sorted_labels: Vec<Option<usize>> = vec![None; n];
    let mut next_label = 0usize;
    let mut previous_core: Option<usize> = None;
    for i in (0..n).filter(|&i| is_core[i]) {
        let label = match previous_core {
            Some(p) if sorted[i] - sorted[p] <= eps => sorted_labels[p].unwrap_or(next_label),
            _ => {
                next_label += 1;
                next_label - 1
            }
        };
        sorted_labels[i] = Some(label);
        previous_core = Some(i);
    }

    let cores: Vec<usize> = (0..n).filter(|&i| is_core[i]).collect();
    for i in (0..n).filter(|&i| !is_core[i]) {
        let nearest = cores
            .iter()
            .map(|&c| (c, (sorted[c] - sorted[i]).abs()))
            .filter(|(_, d)| *d <= eps)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((core, _)) = nearest {
            sorted_labels[i] = sorted_labels[core];
        }
    }

    let mut labels = vec![None; n];
    for (sorted_index, &original_index) in order.iter().enumerate() {
        labels[original_index] = sorted_labels[sorted_index];
    }
    labels
}

/// Canonical, ascending positions of the clusters found in `values`.
pub fn canonical_positions(values: &[i32], params: &ClusterParams) -> Vec<i32> {
    let labels = dbscan_1d(values, params.eps, params.min_samples);
    let cluster_count = labels.iter().flatten().max().map_or(0, |max| max + 1);
    let mut members: Vec<Vec<i32>> = vec![vec![]; cluster_count];
    for (value, label) in values.iter().zip(&labels) {
        if let Some(label) = label {
            members[*label].push(*value);
        }
    }

    let mut positions: Vec<i32> = members
        .into_iter()
        .filter(|group| !group.is_empty())
        .map(|group| reduce(group, params.reducer))
        .collect();
    positions.sort_unstable();
    positions
}

fn reduce(mut group: Vec<i32>, reducer: Reducer) -> i32 {
    match reducer {
        Reducer::Mean => {
            let sum: i64 = group.iter().map(|&v| v as i64).sum();
            (sum as f64 / group.len() as f64).trunc() as i32
        }
        Reducer::Median => {
            group.sort_unstable();
            let mid = group.len() / 2;
            if group.len() % 2 == 1 {
                group[mid]
            } else {
                ((group[mid - 1] as f64 + group[mid] as f64) / 2.0).trunc() as i32
            }
        }
    }
}
