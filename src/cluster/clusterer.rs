use ndarray::Array2;
use tracing::debug;

use super::gmm::gmm_soft_clusters;
use super::reduce::reduce;
use crate::config::ClusteringConfig;

/// Two-stage soft clusterer: a global reduce+GMM pass partitions the whole set into
/// overlapping global groups, then each global group is independently reduced and
/// re-clustered locally (§4.3). A point can end up in more than one returned group.
pub struct GmmRaptorClusterer {
    metric: String,
    reduction_dim: usize,
    threshold: f64,
    random_state: u64,
}

impl GmmRaptorClusterer {
    pub fn new(config: &ClusteringConfig) -> Self {
        Self {
            metric: config.metric.clone(),
            reduction_dim: config.reduction_dim,
            threshold: config.threshold,
            random_state: config.random_state,
        }
    }

    /// Returns a list of point-index groups; a point may appear in more than one group,
    /// and a group of 0 points is never emitted. Falls back to one single all-inclusive
    /// group when there are too few points to cluster meaningfully.
    pub fn fit_predict(&self, vectors: &[Vec<f32>], min_k: usize, max_k: usize) -> Vec<Vec<usize>> {
        let n = vectors.len();
        debug!(n, min_k, max_k, "clusterer fit_predict start");

        if n == 0 {
            return Vec::new();
        }
        if n <= min_k || n <= 3 {
            return vec![(0..n).collect()];
        }

        let x = to_array(vectors);

        let x_global = reduce(&x, self.reduction_dim, &self.metric, None, false);
        let (global_labels_per_point, n_global) =
            gmm_soft_clusters(&x_global, self.threshold, max_k, self.random_state);
        debug!(n_global, "global clusters chosen");

        let mut global_groups: Vec<Vec<usize>> = vec![Vec::new(); n_global];
        for (idx, labels) in global_labels_per_point.iter().enumerate() {
            for &g in labels {
                global_groups[g].push(idx);
            }
        }

        let mut all_local_cluster_ids_per_point: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut total_local_clusters = 0usize;

        for (gi, member_idx) in global_groups.iter().enumerate() {
            if member_idx.is_empty() {
                continue;
            }
            debug!(global_group = gi, size = member_idx.len(), "processing global group");

            if member_idx.len() <= self.reduction_dim + 1 {
                for &idx in member_idx {
                    all_local_cluster_ids_per_point[idx].push(total_local_clusters);
                }
                total_local_clusters += 1;
                continue;
            }

            let x_local = select_rows(&x, member_idx);
            let x_local_reduced = reduce(&x_local, self.reduction_dim, &self.metric, Some(10), true);
            let (local_labels_per_point, n_local) =
                gmm_soft_clusters(&x_local_reduced, self.threshold, max_k, self.random_state);
            debug!(global_group = gi, n_local, "local clusters chosen");

            for (offset, local_labels) in local_labels_per_point.iter().enumerate() {
                let orig_idx = member_idx[offset];
                for &lab in local_labels {
                    all_local_cluster_ids_per_point[orig_idx].push(total_local_clusters + lab);
                }
            }
            total_local_clusters += n_local;
        }

        if total_local_clusters == 0 {
            return vec![(0..n).collect()];
        }

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); total_local_clusters];
        for (i, labels) in all_local_cluster_ids_per_point.iter().enumerate() {
            for &lab in labels {
                groups[lab].push(i);
            }
        }

        groups
    }
}

fn to_array(vectors: &[Vec<f32>]) -> Array2<f64> {
    let n = vectors.len();
    let d = vectors.first().map(|v| v.len()).unwrap_or(0);
    Array2::from_shape_fn((n, d), |(i, j)| vectors[i][j] as f64)
}

fn select_rows(x: &Array2<f64>, indices: &[usize]) -> Array2<f64> {
    let d = x.ncols();
    Array2::from_shape_fn((indices.len(), d), |(i, j)| x[[indices[i], j]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            min_k: 2,
            max_k: 10,
            reduction_dim: 3,
            threshold: 0.1,
            metric: "cosine".to_string(),
            random_state: 224,
        }
    }

    #[test]
    fn empty_input_yields_no_groups() {
        let clusterer = GmmRaptorClusterer::new(&config());
        let groups = clusterer.fit_predict(&[], 2, 10);
        assert!(groups.is_empty());
    }

    #[test]
    fn small_input_falls_back_to_single_group() {
        let clusterer = GmmRaptorClusterer::new(&config());
        let vectors = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        let groups = clusterer.fit_predict(&vectors, 2, 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn every_point_is_covered_by_at_least_one_group() {
        let clusterer = GmmRaptorClusterer::new(&config());
        let mut vectors = Vec::new();
        for i in 0..8 {
            vectors.push(vec![0.0, 0.0, i as f32 * 0.01]);
        }
        for i in 0..8 {
            vectors.push(vec![10.0, 10.0, i as f32 * 0.01]);
        }
        let groups = clusterer.fit_predict(&vectors, 2, 10);

        let mut covered = vec![false; vectors.len()];
        for g in &groups {
            for &idx in g {
                covered[idx] = true;
            }
        }
        assert!(covered.iter().all(|&c| c), "every point must be covered by some group");
    }
}
