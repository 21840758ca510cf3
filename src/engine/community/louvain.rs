//! Louvain modularity clustering (Blondel et al. 2008) over a weighted,
//! undirected entity graph.
//!
//! Phase 1 moves nodes greedily to the neighbouring community with the best
//! modularity gain; phase 2 collapses communities into single nodes and the
//! two phases repeat until modularity stops improving. Node visiting order is
//! shuffled with a seeded RNG and neighbour communities are scanned in index
//! order, so a given graph and seed always produce the same partition.

use std::collections::BTreeMap;

use petgraph::graph::UnGraph;
use petgraph::visit::EdgeRef;
use rand::prelude::*;

type Edges = Vec<(usize, usize, f64)>;

#[derive(Debug, Clone)]
pub struct Louvain {
    /// Resolution (gamma). Higher values produce smaller communities.
    resolution: f64,
    /// Local-moving sweeps per pass.
    max_iter: usize,
    /// Aggregation passes.
    max_passes: usize,
    min_modularity_gain: f64,
    seed: u64,
}

impl Louvain {
    pub fn new(seed: u64) -> Self {
        Self { resolution: 1.0, max_iter: 100, max_passes: 10, min_modularity_gain: 1e-7, seed }
    }

    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = resolution;
        self
    }

    /// Community label per node index. Labels are consecutive from 0 in
    /// order of first appearance. Nodes without edges stay alone.
    pub fn detect<N>(&self, graph: &UnGraph<N, f64>) -> Vec<usize> {
        let n = graph.node_count();
        if n == 0 {
            return Vec::new();
        }

        let mut edges: Edges = Vec::new();
        let mut self_loops = vec![0.0; n];
        for edge in graph.edge_references() {
            let (i, j) = (edge.source().index(), edge.target().index());
            let w = edge.weight().max(0.0);
            if i == j {
                self_loops[i] += w;
            } else {
                edges.push((i.min(j), i.max(j), w));
            }
        }
        if edges.is_empty() {
            return (0..n).collect();
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut membership: Vec<usize> = (0..n).collect();
        let mut current_n = n;
        let mut prev_modularity = f64::NEG_INFINITY;

        for _pass in 0..self.max_passes {
            let (partition, improved) =
                self.local_moving(current_n, &edges, &self_loops, &mut rng);
            if !improved {
                break;
            }
            let q = self.modularity(current_n, &edges, &self_loops, &partition);
            if q - prev_modularity < self.min_modularity_gain {
                break;
            }
            prev_modularity = q;

            let (new_n, new_edges, new_loops, new_index) =
                aggregate(&edges, &self_loops, &partition);
            for m in membership.iter_mut() {
                *m = new_index[*m];
            }
            if new_n == current_n {
                break;
            }
            current_n = new_n;
            edges = new_edges;
            self_loops = new_loops;
        }

        relabel(&membership)
    }

    fn modularity(&self, n: usize, edges: &[(usize, usize, f64)], self_loops: &[f64], communities: &[usize]) -> f64 {
        let m = total_weight(edges, self_loops);
        if m == 0.0 {
            return 0.0;
        }
        let degrees = degrees(n, edges, self_loops);
        let mut q = 0.0;
        for &(i, j, w) in edges {
            if communities[i] == communities[j] {
                q += w - self.resolution * degrees[i] * degrees[j] / (2.0 * m);
            }
        }
        for (i, &sl) in self_loops.iter().enumerate() {
            if sl > 0.0 {
                q += sl - self.resolution * degrees[i] * degrees[i] / (4.0 * m);
            }
        }
        q / m
    }

    fn local_moving(
        &self,
        n: usize,
        edges: &[(usize, usize, f64)],
        self_loops: &[f64],
        rng: &mut StdRng,
    ) -> (Vec<usize>, bool) {
        let mut adj: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        for &(i, j, w) in edges {
            *adj[i].entry(j).or_insert(0.0) += w;
            *adj[j].entry(i).or_insert(0.0) += w;
        }
        let m = total_weight(edges, self_loops);
        if m == 0.0 {
            return ((0..n).collect(), false);
        }
        let degrees = degrees(n, edges, self_loops);

        let mut communities: Vec<usize> = (0..n).collect();
        let mut community_degrees = degrees.clone();
        let mut any_improved = false;

        let mut order: Vec<usize> = (0..n).collect();
        for _ in 0..self.max_iter {
            let mut improved = false;
            order.shuffle(rng);

            for &node in &order {
                let current = communities[node];
                let ki = degrees[node];
                community_degrees[current] -= ki;

                let mut weights: BTreeMap<usize, f64> = BTreeMap::new();
                for (&neighbor, &w) in &adj[node] {
                    *weights.entry(communities[neighbor]).or_insert(0.0) += w;
                }

                let gain = |target: usize, ki_in: f64| {
                    ki_in / m - self.resolution * community_degrees[target] * ki / (2.0 * m * m)
                };
                let mut best = current;
                let mut best_gain = gain(current, weights.get(&current).copied().unwrap_or(0.0)).max(0.0);
                for (&target, &ki_in) in &weights {
                    let g = gain(target, ki_in);
                    if g > best_gain {
                        best_gain = g;
                        best = target;
                    }
                }

                community_degrees[best] += ki;
                if best != current {
                    communities[node] = best;
                    improved = true;
                    any_improved = true;
                }
            }

            if !improved {
                break;
            }
        }

        (communities, any_improved)
    }
}

fn total_weight(edges: &[(usize, usize, f64)], self_loops: &[f64]) -> f64 {
    edges.iter().map(|(_, _, w)| w).sum::<f64>() + self_loops.iter().sum::<f64>()
}

fn degrees(n: usize, edges: &[(usize, usize, f64)], self_loops: &[f64]) -> Vec<f64> {
    let mut d = vec![0.0; n];
    for &(i, j, w) in edges {
        d[i] += w;
        d[j] += w;
    }
    for (i, &sl) in self_loops.iter().enumerate() {
        d[i] += 2.0 * sl;
    }
    d
}

/// Collapse each community into one node. Returns the new node count, edges,
/// self-loops, and the old-node -> new-node index.
fn aggregate(
    edges: &[(usize, usize, f64)],
    self_loops: &[f64],
    communities: &[usize],
) -> (usize, Edges, Vec<f64>, Vec<usize>) {
    let new_index = relabel(communities);
    let new_n = new_index.iter().copied().max().map_or(0, |m| m + 1);

    let mut weights: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    let mut loops = vec![0.0; new_n];
    for (i, &sl) in self_loops.iter().enumerate() {
        loops[new_index[i]] += sl;
    }
    for &(i, j, w) in edges {
        let (ci, cj) = (new_index[i], new_index[j]);
        if ci == cj {
            loops[ci] += w;
        } else {
            *weights.entry((ci.min(cj), ci.max(cj))).or_insert(0.0) += w;
        }
    }
    let new_edges = weights.into_iter().map(|((i, j), w)| (i, j, w)).collect();
    (new_n, new_edges, loops, new_index)
}

/// Renumber labels to 0.. in order of first appearance.
fn relabel(labels: &[usize]) -> Vec<usize> {
    let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
    let mut next = 0;
    labels
        .iter()
        .map(|&l| {
            *seen.entry(l).or_insert_with(|| {
                next += 1;
                next - 1
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize, edges: &[(u32, u32, f64)]) -> UnGraph<(), f64> {
        let mut g = UnGraph::new_undirected();
        for _ in 0..n {
            g.add_node(());
        }
        for &(a, b, w) in edges {
            g.add_edge(a.into(), b.into(), w);
        }
        g
    }

    fn two_triangles() -> UnGraph<(), f64> {
        graph(6, &[(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (3, 5, 1.0), (2, 3, 1.0)])
    }

    #[test]
    fn triangle_is_one_community() {
        let c = Louvain::new(1).detect(&graph(3, &[(0, 1, 1.0), (1, 2, 1.0), (0, 2, 1.0)]));
        assert_eq!(c, vec![0, 0, 0]);
    }

    #[test]
    fn bridged_triangles_split() {
        let c = Louvain::new(1).detect(&two_triangles());
        assert_eq!(c[0], c[1]);
        assert_eq!(c[1], c[2]);
        assert_eq!(c[3], c[4]);
        assert_eq!(c[4], c[5]);
        assert_ne!(c[0], c[3]);
    }

    #[test]
    fn isolated_nodes_stay_alone() {
        let c = Louvain::new(1).detect(&graph(3, &[(0, 1, 1.0)]));
        assert_eq!(c[0], c[1]);
        assert_ne!(c[0], c[2]);
        assert_eq!(Louvain::new(1).detect(&graph(2, &[])), vec![0, 1]);
        assert!(Louvain::new(1).detect(&graph(0, &[])).is_empty());
    }

    #[test]
    fn same_seed_same_partition() {
        let g = two_triangles();
        for seed in [0, 7, 99] {
            assert_eq!(Louvain::new(seed).detect(&g), Louvain::new(seed).detect(&g));
        }
    }

    #[test]
    fn labels_are_consecutive_by_first_appearance() {
        assert_eq!(relabel(&[5, 5, 2, 9, 2]), vec![0, 0, 1, 2, 1]);
    }
}
