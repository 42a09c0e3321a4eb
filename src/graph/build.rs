use std::sync::{Mutex, MutexGuard, PoisonError};

use hashbrown::HashSet;
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tdigest::TDigest;
use tracing::{debug, info};

use crate::config::GraphConfig;
use crate::distance::{Distance, MAX_DISTANCE, MIN_DISTANCE};
use crate::graph::{ItemId, Metric, NeighborRow, Offer, SimilarityGraph};
use crate::stopwatch::{LapMicros, Stopwatch};

/// Summary of the pairwise distances evaluated during a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistanceStats {
    pub samples: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p90: f64,
}

impl DistanceStats {
    pub fn from_samples(samples: Vec<Distance>) -> Self {
        if samples.is_empty() {
            return DistanceStats::default();
        }

        // Welford's running mean and variance
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for (n, sample) in samples.iter().enumerate() {
            let delta = sample - mean;
            mean += delta / (n + 1) as f64;
            m2 += delta * (sample - mean);
        }
        let count = samples.len();

        let digest = TDigest::new_with_size(100).merge_unsorted(samples);
        DistanceStats {
            samples: count,
            mean,
            std_dev: (m2 / count as f64).sqrt(),
            median: digest.estimate_quantile(0.5),
            p90: digest.estimate_quantile(0.9),
        }
    }

    /// `[mean - k * std, mean + k * std]`, clamped to the distance range.
    pub fn band(&self, sigmas: f64) -> (Distance, Distance) {
        if self.samples == 0 {
            return (MIN_DISTANCE, MAX_DISTANCE);
        }
        let low = (self.mean - sigmas * self.std_dev).max(MIN_DISTANCE);
        let high = (self.mean + sigmas * self.std_dev).min(MAX_DISTANCE);
        (low, high)
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    pub items: usize,
    pub evaluations: usize,
    pub stats: DistanceStats,
    pub pruned_links: usize,
    pub total_micros: f64,
    pub laps: Vec<LapMicros>,
}

/// Row access shared by the parallel build and the single threaded insert.
pub(crate) trait RowStore {
    fn offer(&mut self, owner: ItemId, other: ItemId, distance: Distance) -> Offer;

    /// Neighbors of `id` reachable over edges no longer than `high`.
    fn neighbors_within(&mut self, id: ItemId, high: Distance) -> Vec<ItemId>;

    /// The row of `id` is full and its worst entry is below `low`.
    fn saturated(&mut self, id: ItemId, low: Distance) -> bool;
}

fn within(row: &NeighborRow, high: Distance) -> Vec<ItemId> {
    row.iter()
        .take_while(|neighbor| neighbor.distance <= high)
        .map(|neighbor| neighbor.id)
        .collect()
}

fn saturated(row: &NeighborRow, low: Distance) -> bool {
    row.is_full() && row.worst().map_or(false, |worst| worst.distance < low)
}

impl RowStore for SimilarityGraph {
    fn offer(&mut self, owner: ItemId, other: ItemId, distance: Distance) -> Offer {
        SimilarityGraph::offer(self, owner, other, distance)
    }

    fn neighbors_within(&mut self, id: ItemId, high: Distance) -> Vec<ItemId> {
        self.row(id).map(|row| within(row, high)).unwrap_or_default()
    }

    fn saturated(&mut self, id: ItemId, low: Distance) -> bool {
        self.row(id).map_or(false, |row| saturated(row, low))
    }
}

/// Rows behind one mutex each, every access locks exactly one row.
pub(crate) struct LockedRows(Vec<Mutex<NeighborRow>>);

impl LockedRows {
    fn new(rows: Vec<NeighborRow>) -> Self {
        LockedRows(rows.into_iter().map(Mutex::new).collect())
    }

    fn lock(&self, id: ItemId) -> Option<MutexGuard<'_, NeighborRow>> {
        self.0
            .get(id as usize)
            .map(|row| row.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn into_rows(self) -> Vec<NeighborRow> {
        self.0
            .into_iter()
            .map(|row| row.into_inner().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}

impl RowStore for &LockedRows {
    fn offer(&mut self, owner: ItemId, other: ItemId, distance: Distance) -> Offer {
        match self.lock(owner) {
            Some(mut row) => row.offer(owner, other, distance),
            None => Offer::Rejected,
        }
    }

    fn neighbors_within(&mut self, id: ItemId, high: Distance) -> Vec<ItemId> {
        self.lock(id).map(|row| within(&row, high)).unwrap_or_default()
    }

    fn saturated(&mut self, id: ItemId, low: Distance) -> bool {
        self.lock(id).map_or(false, |row| saturated(&row, low))
    }
}

/// Start offsets of the seed windows over `len` items.
fn window_starts(len: usize, size: usize, step: usize) -> Vec<usize> {
    if len <= size {
        return vec![0];
    }
    let mut starts: Vec<usize> = (0..len - size).step_by(step.max(1)).collect();
    // the last window always ends at the last item
    starts.push(len - size);
    starts.dedup();
    starts
}

/// Compare every pair inside each window, returning the evaluated distances.
fn seed<M: Metric>(store: &LockedRows, ids: &[ItemId], metric: &M, config: &GraphConfig) -> Vec<Distance> {
    window_starts(ids.len(), config.window_size, config.window_step)
        .par_iter()
        .flat_map_iter(|start| {
            let end = (start + config.window_size).min(ids.len());
            let mut rows = store;
            ids[*start..end]
                .iter()
                .tuple_combinations()
                .map(|(a, b)| {
                    let distance = metric.distance(*a, *b);
                    rows.offer(*a, *b, distance);
                    rows.offer(*b, *a, distance);
                    distance
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Walk the neighborhood of `root` up to `depth` hops, evaluating direct
/// distances to indirect neighbors. Returns the number of evaluations.
pub(crate) fn refine_from<S: RowStore, M: Metric>(
    store: &mut S,
    root: ItemId,
    metric: &M,
    depth: usize,
    band: (Distance, Distance),
) -> usize {
    let (low, high) = band;
    let mut evaluations = 0;
    let mut visited: HashSet<ItemId> = HashSet::new();
    visited.insert(root);

    let mut stack = vec![(root, root, 0)];
    while let Some((node, parent, level)) = stack.pop() {
        if level >= depth {
            continue;
        }
        for other in store.neighbors_within(node, high) {
            if other == parent || !visited.insert(other) {
                continue;
            }
            if level > 0 {
                let distance = metric.distance(root, other);
                evaluations += 1;
                store.offer(root, other, distance);
                store.offer(other, root, distance);
                if store.saturated(root, low) {
                    return evaluations;
                }
            }
            stack.push((other, node, level + 1));
        }
    }
    evaluations
}

/// Rebuild `graph` from scratch over `ids`, given in ingestion order.
pub fn build<M: Metric>(
    graph: &mut SimilarityGraph,
    ids: &[ItemId],
    metric: &M,
    config: &GraphConfig,
    pool: &ThreadPool,
) -> BuildReport {
    let mut stopwatch = Stopwatch::new();
    let slots = ids.iter().max().map_or(0, |max| *max as usize + 1);
    graph.reset(slots.max(graph.len()));

    let store = LockedRows::new(std::mem::take(graph.rows_mut()));

    let samples = pool.install(|| seed(&store, ids, metric, config));
    let seed_evaluations = samples.len();
    let stats = DistanceStats::from_samples(samples);
    let band = stats.band(config.band_sigmas);
    stopwatch.lap("seed");
    debug!(
        evaluations = seed_evaluations,
        mean = stats.mean,
        std_dev = stats.std_dev,
        "seed pass done"
    );

    let refine_evaluations: usize = pool.install(|| {
        ids.par_iter()
            .map(|root| {
                let mut rows = &store;
                refine_from(&mut rows, *root, metric, config.refine_depth, band)
            })
            .sum()
    });
    stopwatch.lap("refine");
    debug!(evaluations = refine_evaluations, low = band.0, high = band.1, "refinement pass done");

    *graph.rows_mut() = store.into_rows();
    let pruned_links = graph.finalize();
    stopwatch.lap("finalize");

    let report = BuildReport {
        items: ids.len(),
        evaluations: seed_evaluations + refine_evaluations,
        stats,
        pruned_links,
        total_micros: stopwatch.total_micros(),
        laps: stopwatch.into_laps(),
    };
    info!(
        items = report.items,
        evaluations = report.evaluations,
        pruned_links = report.pruned_links,
        total_micros = report.total_micros,
        edges = graph.edge_count(),
        "similarity graph rebuilt"
    );
    report
}

/// Link a newcomer against a random sample of `existing` and refine from it.
/// The caller finalizes once the whole batch is inserted.
pub fn insert<M: Metric, R: Rng>(
    graph: &mut SimilarityGraph,
    id: ItemId,
    existing: &[ItemId],
    metric: &M,
    config: &GraphConfig,
    stats: &DistanceStats,
    rng: &mut R,
) -> usize {
    graph.ensure_slot(id);
    let mut evaluations = 0;
    for other in existing.choose_multiple(rng, config.insert_sample_size) {
        if *other == id {
            continue;
        }
        let distance = metric.distance(id, *other);
        evaluations += 1;
        graph.link(id, *other, distance);
    }
    let band = stats.band(config.band_sigmas);
    evaluations + refine_from(graph, id, metric, config.refine_depth, band)
}

#[cfg(test)]
mod build_test {
    use float_cmp::approx_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    use super::*;
    use crate::config::EngineConfig;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn points(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = Pcg64::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(0.0..1.0)).collect()
    }

    #[test]
    fn should_compute_distance_statistics() {
        let stats = DistanceStats::from_samples(vec![0.2, 0.4, 0.6, 0.8]);
        assert_eq!(4, stats.samples);
        assert!(approx_eq!(f64, stats.mean, 0.5, epsilon = 1e-9));
        assert!(approx_eq!(f64, stats.std_dev, 0.05f64.sqrt(), epsilon = 1e-9));
        let (low, high) = stats.band(1.0);
        assert!(approx_eq!(f64, low, 0.5 - 0.05f64.sqrt(), epsilon = 1e-9));
        assert!(approx_eq!(f64, high, 0.5 + 0.05f64.sqrt(), epsilon = 1e-9));
        assert_eq!((0.0, 1.0), stats.band(10.0));
        assert_eq!((0.0, 1.0), DistanceStats::default().band(1.0));
    }

    #[test]
    fn should_cover_every_item_with_windows() {
        assert_eq!(vec![0], window_starts(5, 20, 10));
        assert_eq!(vec![0, 10, 20, 30, 35], window_starts(55, 20, 10));
        assert_eq!(vec![0, 10], window_starts(30, 20, 10));
    }

    #[test]
    fn should_build_a_mutual_bounded_graph() {
        let values = points(300, 3);
        let metric = |a: ItemId, b: ItemId| (values[a as usize] - values[b as usize]).abs();
        let mut config = EngineConfig::default().graph;
        config.max_neighbors = 8;

        let ids: Vec<ItemId> = (0..values.len() as ItemId).collect();
        let mut graph = SimilarityGraph::new(config.max_neighbors);
        let report = build(&mut graph, &ids, &metric, &config, &pool());

        assert_eq!(300, report.items);
        assert!(report.evaluations > 0);
        assert_eq!(vec!["seed", "refine", "finalize"], report.laps.iter().map(|l| l.0).collect::<Vec<_>>());
        assert_eq!(report.laps.iter().map(|l| l.1).sum::<f64>(), report.total_micros);
        assert!(graph.is_mutual());
        for id in ids.iter() {
            let row = graph.row(*id).unwrap();
            assert!(row.len() <= 8);
            let distances: Vec<f64> = row.iter().map(|n| n.distance).collect();
            assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
            assert!(row.iter().all(|n| n.id != *id));
        }
    }

    #[test]
    fn should_not_link_across_clusters() {
        // even ids live near 0.0, odd ids near 1.0
        let jitter = points(120, 11);
        let values: Vec<f64> = jitter
            .iter()
            .enumerate()
            .map(|(id, j)| if id % 2 == 0 { j * 0.1 } else { 0.9 + j * 0.1 })
            .collect();
        let metric = |a: ItemId, b: ItemId| (values[a as usize] - values[b as usize]).abs();
        let mut config = EngineConfig::default().graph;
        config.max_neighbors = 5;

        let ids: Vec<ItemId> = (0..values.len() as ItemId).collect();
        let mut graph = SimilarityGraph::new(config.max_neighbors);
        build(&mut graph, &ids, &metric, &config, &pool());

        assert!(graph.edge_count() > 0);
        for id in ids.iter() {
            assert!(graph.neighbors(*id).iter().all(|n| n.id % 2 == id % 2));
        }
    }

    #[test]
    fn should_insert_incrementally() {
        let values = points(60, 5);
        let metric = |a: ItemId, b: ItemId| (values[a as usize] - values[b as usize]).abs();
        let config = EngineConfig::default().graph;

        let ids: Vec<ItemId> = (0..59).collect();
        let mut graph = SimilarityGraph::new(config.max_neighbors);
        let report = build(&mut graph, &ids, &metric, &config, &pool());

        let mut rng = Pcg64::seed_from_u64(1);
        let evaluations = insert(&mut graph, 59, &ids, &metric, &config, &report.stats, &mut rng);
        graph.finalize();
        assert!(evaluations >= ids.len());
        assert!(!graph.neighbors(59).is_empty());
        assert!(graph.is_mutual());
    }
}
