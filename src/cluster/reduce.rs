use ndarray::{Array1, Array2, ArrayView1, Axis};
use linfa_linalg::eigh::Eigh;

/// Dimensionality reduction step ahead of GMM clustering (§4.3).
///
/// No vetted UMAP implementation exists in this crate's dependency graph, so this substitutes
/// a symmetrized k-nearest-neighbor affinity graph followed by a spectral (Laplacian eigenmap)
/// embedding. It preserves UMAP's role here (collapse a high-dimensional embedding space down
/// to `reduction_dim` before fitting the GMM) without claiming bit-for-bit equivalence; both
/// are non-deterministic across platforms regardless, so downstream tests assert structural
/// properties rather than exact coordinates.
pub fn reduce(x: &Array2<f64>, dim: usize, metric: &str, n_neighbors: Option<usize>, local: bool) -> Array2<f64> {
    let n = x.nrows();
    if n <= 2 {
        return x.clone();
    }

    let n_components = dim.min(n.saturating_sub(2)).max(1);
    let k_neighbors = if local {
        n_neighbors.unwrap_or(10).min(n - 1)
    } else {
        let guess = ((n - 1) as f64).sqrt() as usize;
        if guess == 0 { 2 } else { guess }
    };

    let dist = pairwise_distances(x, metric);
    let affinity = symmetrized_knn_affinity(&dist, k_neighbors);
    spectral_embedding(&affinity, n_components)
}

fn pairwise_distances(x: &Array2<f64>, metric: &str) -> Array2<f64> {
    let n = x.nrows();
    let mut dist = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = match metric {
                "cosine" => cosine_distance(x.row(i), x.row(j)),
                _ => euclidean_distance(x.row(i), x.row(j)),
            };
            dist[[i, j]] = d;
            dist[[j, i]] = d;
        }
    }
    dist
}

fn cosine_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(p, q)| p * q).sum();
    let na = a.dot(&a).sqrt();
    let nb = b.dot(&b).sqrt();
    if na <= 0.0 || nb <= 0.0 {
        return 1.0;
    }
    1.0 - (dot / (na * nb)).clamp(-1.0, 1.0)
}

fn euclidean_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(p, q)| (p - q).powi(2)).sum::<f64>().sqrt()
}

/// Builds a k-NN affinity matrix (Gaussian kernel over distance) and symmetrizes it by
/// taking the elementwise max with its transpose, so an edge kept by either endpoint's
/// neighbor list survives.
fn symmetrized_knn_affinity(dist: &Array2<f64>, k: usize) -> Array2<f64> {
    let n = dist.nrows();
    let mut affinity = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        let mut row: Vec<(usize, f64)> = (0..n).filter(|&j| j != i).map(|j| (j, dist[[i, j]])).collect();
        row.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let neighbors = &row[..k.min(row.len())];
        let sigma = neighbors.last().map(|&(_, d)| d).unwrap_or(1.0).max(1e-9);

        for &(j, d) in neighbors {
            let w = (-d * d / (2.0 * sigma * sigma)).exp();
            if w > affinity[[i, j]] {
                affinity[[i, j]] = w;
            }
        }
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let w = affinity[[i, j]].max(affinity[[j, i]]);
            affinity[[i, j]] = w;
            affinity[[j, i]] = w;
        }
    }

    affinity
}

/// Symmetric-normalized graph Laplacian eigenmap: `L_sym = I - D^-1/2 W D^-1/2`, embedding
/// is the eigenvectors for the `n_components` smallest nonzero eigenvalues (the very
/// smallest eigenvalue is the trivial constant eigenvector and is dropped).
fn spectral_embedding(affinity: &Array2<f64>, n_components: usize) -> Array2<f64> {
    let n = affinity.nrows();
    let degree: Array1<f64> = affinity.sum_axis(Axis(1));
    let inv_sqrt_degree = degree.mapv(|d| if d > 1e-12 { 1.0 / d.sqrt() } else { 0.0 });

    let mut laplacian = Array2::<f64>::eye(n);
    for i in 0..n {
        for j in 0..n {
            if affinity[[i, j]] > 0.0 {
                laplacian[[i, j]] -= inv_sqrt_degree[i] * affinity[[i, j]] * inv_sqrt_degree[j];
            }
        }
    }

    let (eigvals, eigvecs) = laplacian
        .eigh()
        .expect("symmetric normalized laplacian has a real eigendecomposition");

    let mut order: Vec<usize> = (0..eigvals.len()).collect();
    order.sort_by(|&a, &b| eigvals[a].partial_cmp(&eigvals[b]).unwrap_or(std::cmp::Ordering::Equal));

    let take = n_components.min(order.len().saturating_sub(1)).max(1);
    let chosen = &order[1..1 + take];

    let mut embedding = Array2::<f64>::zeros((n, chosen.len()));
    for (col, &idx) in chosen.iter().enumerate() {
        embedding.column_mut(col).assign(&eigvecs.column(idx));
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn tiny_input_passes_through_unchanged() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let reduced = reduce(&x, 10, "cosine", None, false);
        assert_eq!(reduced, x);
    }

    #[test]
    fn reduces_dimension_and_preserves_row_count() {
        let x = Array2::<f64>::from_shape_fn((8, 20), |(i, j)| ((i * 3 + j) as f64).sin());
        let reduced = reduce(&x, 5, "cosine", None, false);
        assert_eq!(reduced.nrows(), 8);
        assert!(reduced.ncols() <= 5);
        assert!(reduced.ncols() >= 1);
    }

    #[test]
    fn local_mode_respects_requested_neighbor_count() {
        let x = Array2::<f64>::from_shape_fn((6, 12), |(i, j)| ((i + j) as f64).cos());
        let reduced = reduce(&x, 4, "euclidean", Some(3), true);
        assert_eq!(reduced.nrows(), 6);
    }
}
