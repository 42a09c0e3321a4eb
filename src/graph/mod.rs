use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::distance::{AttributeMask, Distance, Item};

pub mod build;
pub mod row;
pub mod traversal;

pub use build::{BuildReport, DistanceStats};
pub use row::{Neighbor, NeighborRow, Offer};

/// Dense internal identifier of an item.
pub type ItemId = u32;

/// Distance between two dense identifiers.
pub trait Metric: Sync {
    fn distance(&self, left: ItemId, right: ItemId) -> Distance;
}

impl<F> Metric for F
where
    F: Fn(ItemId, ItemId) -> Distance + Sync,
{
    fn distance(&self, left: ItemId, right: ItemId) -> Distance {
        self(left, right)
    }
}

/// Metric over a slice of (possibly vacated) item slots.
pub struct ItemMetric<'a> {
    pub mask: &'a AttributeMask,
    pub items: &'a [Option<Item>],
}

impl<'a> Metric for ItemMetric<'a> {
    fn distance(&self, left: ItemId, right: ItemId) -> Distance {
        match (
            self.items.get(left as usize).and_then(Option::as_ref),
            self.items.get(right as usize).and_then(Option::as_ref),
        ) {
            (Some(l), Some(r)) => self.mask.distance(l, r),
            _ => crate::distance::MAX_DISTANCE,
        }
    }
}

/// Bounded degree approximate nearest neighbor graph, one row per item slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimilarityGraph {
    capacity: usize,
    rows: Vec<NeighborRow>,
}

impl SimilarityGraph {
    pub fn new(capacity: usize) -> Self {
        SimilarityGraph {
            capacity,
            rows: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ensure_slot(&mut self, id: ItemId) {
        let wanted = id as usize + 1;
        if self.rows.len() < wanted {
            let capacity = self.capacity;
            self.rows.resize_with(wanted, || NeighborRow::new(capacity));
        }
    }

    pub fn row(&self, id: ItemId) -> Option<&NeighborRow> {
        self.rows.get(id as usize)
    }

    pub fn neighbors(&self, id: ItemId) -> &[Neighbor] {
        match self.rows.get(id as usize) {
            Some(row) => row.as_slice(),
            None => &[],
        }
    }

    pub fn offer(&mut self, owner: ItemId, other: ItemId, distance: Distance) -> Offer {
        self.ensure_slot(owner);
        self.rows[owner as usize].offer(owner, other, distance)
    }

    /// Offer a pair in both directions.
    pub fn link(&mut self, left: ItemId, right: ItemId, distance: Distance) -> bool {
        let forward = self.offer(left, right, distance);
        let backward = self.offer(right, left, distance);
        forward.accepted() || backward.accepted()
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<NeighborRow> {
        &mut self.rows
    }

    /// Remove every link the other side does not confirm, returns how many were dropped.
    pub fn finalize(&mut self) -> usize {
        let rows = &self.rows;
        let one_way: Vec<(ItemId, ItemId)> = rows
            .par_iter()
            .enumerate()
            .flat_map_iter(|(owner, row)| {
                let owner = owner as ItemId;
                row.ids()
                    .filter(move |other| {
                        rows.get(*other as usize)
                            .map_or(true, |back| !back.contains(owner))
                    })
                    .map(move |other| (owner, other))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (owner, other) in one_way.iter() {
            self.rows[*owner as usize].remove(*other);
        }
        one_way.len()
    }

    /// Drop every link of `id`, returning its former neighbors.
    pub fn remove_item(&mut self, id: ItemId) -> Vec<ItemId> {
        let former: Vec<ItemId> = match self.rows.get_mut(id as usize) {
            Some(row) => {
                let ids = row.ids().collect();
                row.clear();
                ids
            }
            None => return Vec::new(),
        };
        for other in former.iter() {
            if let Some(row) = self.rows.get_mut(*other as usize) {
                row.remove(id);
            }
        }
        // One way links pointing at the removed item, left over from unfinalized inserts
        for row in self.rows.iter_mut() {
            row.remove(id);
        }
        former
    }

    /// Offer the former neighbors of a removed item to each other.
    pub fn close_hole<M: Metric>(&mut self, former: &[ItemId], metric: &M) -> usize {
        let mut linked = 0;
        for (a, b) in former.iter().tuple_combinations() {
            let distance = metric.distance(*a, *b);
            if self.link(*a, *b, distance) {
                linked += 1;
            }
        }
        linked
    }

    pub fn is_mutual(&self) -> bool {
        self.rows.iter().enumerate().all(|(owner, row)| {
            row.ids().all(|other| {
                self.rows
                    .get(other as usize)
                    .map_or(false, |back| back.contains(owner as ItemId))
            })
        })
    }

    pub fn edge_count(&self) -> usize {
        self.rows.iter().map(NeighborRow::len).sum()
    }

    /// Clear every row and resize to `slots` rows.
    pub fn reset(&mut self, slots: usize) {
        let capacity = self.capacity;
        self.rows.clear();
        self.rows.resize_with(slots, || NeighborRow::new(capacity));
    }
}
