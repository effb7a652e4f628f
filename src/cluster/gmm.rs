use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

const EM_MAX_ITER: usize = 100;
const EM_TOL: f64 = 1e-4;
const MIN_VARIANCE: f64 = 1e-6;

/// A fitted diagonal-covariance Gaussian mixture.
pub struct GmmFit {
    pub weights: Array1<f64>,
    pub means: Array2<f64>,
    /// Row j holds the per-dimension variances of component j (diagonal covariance only).
    pub variances: Array2<f64>,
    pub log_likelihood: f64,
}

impl GmmFit {
    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    /// Posterior responsibility matrix, one row per sample, one column per component.
    pub fn responsibilities(&self, x: &Array2<f64>) -> Array2<f64> {
        let (log_resp, _) = e_step(x, &self.weights, &self.means, &self.variances);
        log_resp.mapv(f64::exp)
    }
}

fn log_gaussian_pdf(x_row: &[f64], mean: &[f64], var: &[f64]) -> f64 {
    let mut acc = 0.0;
    for ((&xi, &mi), &vi) in x_row.iter().zip(mean.iter()).zip(var.iter()) {
        let v = vi.max(MIN_VARIANCE);
        acc += -0.5 * (2.0 * std::f64::consts::PI * v).ln() - 0.5 * (xi - mi).powi(2) / v;
    }
    acc
}

fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Returns (log responsibilities [m x k], total log-likelihood).
fn e_step(
    x: &Array2<f64>,
    weights: &Array1<f64>,
    means: &Array2<f64>,
    variances: &Array2<f64>,
) -> (Array2<f64>, f64) {
    let m = x.nrows();
    let k = weights.len();
    let mut log_resp = Array2::<f64>::zeros((m, k));
    let mut total_ll = 0.0;

    for i in 0..m {
        let x_row = x.row(i);
        let mut log_probs = vec![0.0; k];
        for j in 0..k {
            log_probs[j] = weights[j].max(1e-300).ln()
                + log_gaussian_pdf(
                    x_row.as_slice().expect("contiguous row"),
                    means.row(j).as_slice().expect("contiguous row"),
                    variances.row(j).as_slice().expect("contiguous row"),
                );
        }
        let lse = logsumexp(&log_probs);
        total_ll += lse;
        for j in 0..k {
            log_resp[[i, j]] = log_probs[j] - lse;
        }
    }

    (log_resp, total_ll)
}

fn kmeans_plus_plus_init(x: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let m = x.nrows();
    let d = x.ncols();
    let mut centers = Array2::<f64>::zeros((k, d));

    let first = Uniform::new(0, m).sample(rng);
    centers.row_mut(0).assign(&x.row(first));

    let mut nearest_sq_dist = vec![f64::INFINITY; m];
    for chosen in 1..k {
        for i in 0..m {
            let d2 = sq_dist(x.row(i), centers.row(chosen - 1));
            if d2 < nearest_sq_dist[i] {
                nearest_sq_dist[i] = d2;
            }
        }
        let total: f64 = nearest_sq_dist.iter().sum();
        let pick = if total <= 0.0 {
            Uniform::new(0, m).sample(rng)
        } else {
            let target = Uniform::new(0.0, total).sample(rng);
            let mut acc = 0.0;
            let mut idx = m - 1;
            for (i, &d2) in nearest_sq_dist.iter().enumerate() {
                acc += d2;
                if acc >= target {
                    idx = i;
                    break;
                }
            }
            idx
        };
        centers.row_mut(chosen).assign(&x.row(pick));
    }

    centers
}

fn sq_dist(a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(p, q)| (p - q).powi(2)).sum()
}

/// Fits a k-component diagonal-covariance GMM to `x` (m samples x d dims) via EM,
/// seeded with k-means++ initialization for reproducible-per-seed starting means.
pub fn fit_gmm(x: &Array2<f64>, k: usize, random_state: u64) -> GmmFit {
    let m = x.nrows();
    let d = x.ncols();
    assert!(k >= 1 && k <= m, "k must be in [1, n_samples]");

    let mut rng = StdRng::seed_from_u64(random_state);
    let mut means = kmeans_plus_plus_init(x, k, &mut rng);
    let mut variances = Array2::<f64>::ones((k, d));
    let mut weights = Array1::<f64>::from_elem(k, 1.0 / k as f64);

    let mut prev_ll = f64::NEG_INFINITY;
    let mut log_resp;
    let mut ll = prev_ll;

    for _ in 0..EM_MAX_ITER {
        let (lr, new_ll) = e_step(x, &weights, &means, &variances);
        log_resp = lr;
        ll = new_ll;

        let resp = log_resp.mapv(f64::exp);
        let nk = resp.sum_axis(Axis(0));

        for j in 0..k {
            let nkj = nk[j].max(1e-10);
            let mut mean_j = Array1::<f64>::zeros(d);
            for i in 0..m {
                mean_j.scaled_add(resp[[i, j]], &x.row(i));
            }
            mean_j /= nkj;

            let mut var_j = Array1::<f64>::zeros(d);
            for i in 0..m {
                let diff = &x.row(i) - &mean_j;
                var_j.scaled_add(resp[[i, j]], &diff.mapv(|v| v * v));
            }
            var_j /= nkj;
            var_j.mapv_inplace(|v| v.max(MIN_VARIANCE));

            means.row_mut(j).assign(&mean_j);
            variances.row_mut(j).assign(&var_j);
            weights[j] = nkj / m as f64;
        }

        if (ll - prev_ll).abs() < EM_TOL {
            prev_ll = ll;
            break;
        }
        prev_ll = ll;
    }

    GmmFit {
        weights,
        means,
        variances,
        log_likelihood: prev_ll.max(ll),
    }
}

/// Bayesian Information Criterion for a fitted diagonal-covariance GMM (§4.3 GMM internals):
/// `-2*log_likelihood + n_params*ln(m)` with `n_params = k*(2d) + (k-1)`.
pub fn bic(fit: &GmmFit, n_samples: usize) -> f64 {
    let k = fit.n_components() as f64;
    let d = fit.means.ncols() as f64;
    let n_params = k * (2.0 * d) + (k - 1.0);
    -2.0 * fit.log_likelihood + n_params * (n_samples as f64).ln()
}

/// Sweeps k in `[lb, ub]` and returns the fit minimizing BIC. `ub` is clamped to
/// `min(max_k, n_samples)`; `lb` is clamped to `[1, ub]`. If `lb >= ub` the single-component
/// fit (k=1) is returned directly, matching the degenerate-range behavior of the original.
pub fn choose_k_by_bic(x: &Array2<f64>, min_k: usize, max_k: usize, random_state: u64) -> (usize, GmmFit) {
    let m = x.nrows();
    let ub = max_k.min(m).max(1);
    let lb = min_k.min(ub).max(1);

    if lb >= ub {
        let fit = fit_gmm(x, 1, random_state);
        return (1, fit);
    }

    let mut best_k = lb;
    let mut best_fit = fit_gmm(x, lb, random_state);
    let mut best_bic = bic(&best_fit, m);

    for k in (lb + 1)..=ub {
        let fit = fit_gmm(x, k, random_state);
        let score = bic(&fit, m);
        if score < best_bic {
            best_bic = score;
            best_k = k;
            best_fit = fit;
        }
    }

    (best_k, best_fit)
}

/// Chooses k via BIC over `[1, min(max_k, m)]` then returns, for every point, the list of
/// component indices whose posterior probability exceeds `threshold` (soft/overlapping
/// assignment), plus the chosen component count.
pub fn gmm_soft_clusters(
    x: &Array2<f64>,
    threshold: f64,
    max_k: usize,
    random_state: u64,
) -> (Vec<Vec<usize>>, usize) {
    let (n_clusters, fit) = choose_k_by_bic(x, 1, max_k, random_state);
    let resp = fit.responsibilities(x);

    let labels_per_point = resp
        .outer_iter()
        .map(|row| {
            let above_threshold: Vec<usize> = row
                .iter()
                .enumerate()
                .filter_map(|(j, &p)| if p > threshold { Some(j) } else { None })
                .collect();
            if !above_threshold.is_empty() {
                return above_threshold;
            }
            // No component clears the threshold (reachable once k grows past 1/threshold):
            // fall back to the single best component so no point is orphaned from every group.
            let argmax = row
                .iter()
                .enumerate()
                .fold((0usize, f64::NEG_INFINITY), |(best_j, best_p), (j, &p)| {
                    if p > best_p { (j, p) } else { (best_j, best_p) }
                })
                .0;
            vec![argmax]
        })
        .collect();

    (labels_per_point, n_clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, -0.1],
            [-0.1, 0.1],
            [10.0, 10.0],
            [10.1, 9.9],
            [9.9, 10.1],
        ]
    }

    #[test]
    fn fit_gmm_converges_to_finite_likelihood() {
        let x = two_blobs();
        let fit = fit_gmm(&x, 2, 224);
        assert!(fit.log_likelihood.is_finite());
        assert_eq!(fit.means.nrows(), 2);
    }

    #[test]
    fn choose_k_by_bic_degenerate_range_returns_k1() {
        let x = two_blobs();
        let (k, fit) = choose_k_by_bic(&x, 5, 1, 224);
        assert_eq!(k, 1);
        assert_eq!(fit.n_components(), 1);
    }

    #[test]
    fn soft_clusters_separate_blobs() {
        let x = two_blobs();
        let (labels, n) = gmm_soft_clusters(&x, 0.1, 10, 224);
        assert_eq!(labels.len(), 6);
        assert!(n >= 1);
        for labs in &labels {
            assert!(!labs.is_empty(), "every point must land in at least one component");
        }
    }

    #[test]
    fn soft_clusters_rescues_points_no_component_clears_threshold() {
        let x = two_blobs();
        // No posterior can exceed 1.0, so every row falls back to its argmax component.
        let (labels, _n) = gmm_soft_clusters(&x, 1.0, 10, 224);
        assert_eq!(labels.len(), 6);
        for labs in &labels {
            assert_eq!(labs.len(), 1, "orphaned points must be rescued to exactly their argmax component");
        }
    }

    #[test]
    fn responsibilities_rows_sum_to_one() {
        let x = two_blobs();
        let fit = fit_gmm(&x, 2, 224);
        let resp = fit.responsibilities(&x);
        for row in resp.outer_iter() {
            let sum: f64 = row.sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }
}
