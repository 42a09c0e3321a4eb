use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::graph::{ItemId, Metric, Neighbor, SimilarityGraph};

/// The first `limit` items met by a breadth first walk from `start`, in the
/// order they were met. `start` and the excluded items are never returned,
/// but the walk still passes through excluded items.
pub fn breadth_first(
    graph: &SimilarityGraph,
    start: ItemId,
    limit: usize,
    exclude: &HashSet<ItemId>,
) -> Vec<ItemId> {
    let mut found = Vec::with_capacity(limit);
    if limit == 0 {
        return found;
    }

    let mut visited: HashSet<ItemId> = HashSet::new();
    visited.insert(start);
    let mut queue = VecDeque::new();
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        for neighbor in graph.neighbors(node) {
            if !visited.insert(neighbor.id) {
                continue;
            }
            if !exclude.contains(&neighbor.id) {
                found.push(neighbor.id);
                if found.len() == limit {
                    return found;
                }
            }
            queue.push_back(neighbor.id);
        }
    }
    found
}

/// Attach the distance from `origin` to each item and sort ascending, ties by id.
/// Direct neighbors reuse the distance stored in the graph.
pub fn rank_by_distance<M: Metric>(
    graph: &SimilarityGraph,
    origin: ItemId,
    ids: &[ItemId],
    metric: &M,
) -> Vec<Neighbor> {
    let row = graph.row(origin);
    let mut ranked: Vec<Neighbor> = ids
        .iter()
        .map(|id| {
            let distance = row
                .and_then(|row| row.distance_to(*id))
                .unwrap_or_else(|| metric.distance(origin, *id));
            Neighbor::new(*id, distance)
        })
        .collect();
    ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
    ranked
}

/// Breadth first neighborhood of `seed`, closest first.
pub fn traverse<M: Metric>(
    graph: &SimilarityGraph,
    seed: ItemId,
    limit: usize,
    exclude: &HashSet<ItemId>,
    metric: &M,
) -> Vec<Neighbor> {
    let ids = breadth_first(graph, seed, limit, exclude);
    rank_by_distance(graph, seed, &ids, metric)
}
