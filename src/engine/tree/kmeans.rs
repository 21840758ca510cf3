//! Seeded clustering for summary-tree levels: a random projection down to a
//! small dimension, then Lloyd's k-means with k-means++ initialisation.

use rand::prelude::*;

/// Project `data` to `target` dimensions with a sparse random sign matrix
/// (Achlioptas). Data already at or below `target` is returned as is.
pub fn random_projection(data: &[Vec<f32>], target: usize, seed: u64) -> Vec<Vec<f32>> {
    let dim = data.first().map_or(0, Vec::len);
    if dim <= target || target == 0 {
        return data.to_vec();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let scale = (3.0 / target as f32).sqrt();
    // entries are +scale or -scale with p = 1/6 each, zero otherwise
    let matrix: Vec<Vec<f32>> = (0..target)
        .map(|_| {
            (0..dim)
                .map(|_| match rng.random_range(0..6u8) {
                    0 => scale,
                    1 => -scale,
                    _ => 0.0,
                })
                .collect()
        })
        .collect();
    data.iter()
        .map(|v| matrix.iter().map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum()).collect())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Kmeans {
    k: usize,
    max_iter: usize,
    tol: f32,
    seed: u64,
}

impl Kmeans {
    pub fn new(k: usize, seed: u64) -> Self {
        Self { k, max_iter: 100, tol: 1e-4, seed }
    }

    /// Cluster label per point. With `k >= n` every point is its own cluster.
    pub fn fit_predict(&self, data: &[Vec<f32>]) -> Vec<usize> {
        let n = data.len();
        if n == 0 {
            return Vec::new();
        }
        if self.k >= n {
            return (0..n).collect();
        }
        let k = self.k.max(1);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = init_centroids(data, k, &mut rng);
        let mut labels = vec![0usize; n];

        for _ in 0..self.max_iter {
            for (i, label) in labels.iter_mut().enumerate() {
                *label = nearest(&data[i], &centroids);
            }

            let dim = data[0].len();
            let mut sums = vec![vec![0.0f32; dim]; k];
            let mut counts = vec![0usize; k];
            for (point, &label) in data.iter().zip(&labels) {
                for (s, x) in sums[label].iter_mut().zip(point) {
                    *s += x;
                }
                counts[label] += 1;
            }

            let mut shift = 0.0f32;
            for c in 0..k {
                // an emptied cluster keeps its old centroid
                if counts[c] == 0 {
                    continue;
                }
                let mean: Vec<f32> = sums[c].iter().map(|s| s / counts[c] as f32).collect();
                shift = shift.max(squared_distance(&mean, &centroids[c]));
                centroids[c] = mean;
            }
            if shift < self.tol {
                break;
            }
        }
        labels
    }
}

fn init_centroids(data: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = data.len();
    let mut centroids = vec![data[rng.random_range(0..n)].clone()];
    while centroids.len() < k {
        let distances: Vec<f32> = data
            .iter()
            .map(|p| centroids.iter().map(|c| squared_distance(p, c)).fold(f32::MAX, f32::min))
            .collect();
        let total: f32 = distances.iter().sum();
        if total == 0.0 {
            centroids.push(data[rng.random_range(0..n)].clone());
            continue;
        }
        let threshold = rng.random::<f32>() * total;
        let mut cumsum = 0.0;
        let mut selected = n - 1;
        for (j, &d) in distances.iter().enumerate() {
            cumsum += d;
            if cumsum >= threshold {
                selected = j;
                break;
            }
        }
        centroids.push(data[selected].clone());
    }
    centroids
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Group `data` into clusters of roughly `cluster_size` members.
///
/// Runs k-means with `k = ceil(n / cluster_size)`, drops empty clusters and
/// cuts any cluster larger than twice the target into target-sized pieces.
/// Clusters are returned in order of their first member.
pub fn cluster(data: &[Vec<f32>], cluster_size: usize, seed: u64) -> Vec<Vec<usize>> {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }
    let size = cluster_size.max(1);
    let k = n.div_ceil(size);
    let labels = Kmeans::new(k, seed).fit_predict(data);

    let mut order: Vec<usize> = Vec::new();
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); labels.iter().copied().max().map_or(0, |m| m + 1)];
    for (i, &label) in labels.iter().enumerate() {
        if groups[label].is_empty() {
            order.push(label);
        }
        groups[label].push(i);
    }

    let mut out = Vec::new();
    for label in order {
        let members = std::mem::take(&mut groups[label]);
        if members.len() > 2 * size {
            out.extend(members.chunks(size).map(<[usize]>::to_vec));
        } else {
            out.push(members);
        }
    }
    out
}
