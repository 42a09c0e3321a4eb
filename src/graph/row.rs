use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::distance::Distance;
use crate::graph::ItemId;

#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: ItemId,
    pub distance: Distance,
}

impl Neighbor {
    pub fn new(id: ItemId, distance: Distance) -> Self {
        Neighbor { id, distance }
    }

    fn order(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// What an offer did to a row.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Offer {
    Rejected,
    Inserted,
    Improved,
    Replaced { evicted: ItemId },
}

impl Offer {
    pub fn accepted(&self) -> bool {
        !matches!(self, Offer::Rejected)
    }
}

/// Bounded neighbor list of one item.
///
/// Entries are kept twice: ordered by (distance, id) for the worst entry and
/// traversal, and ordered by id for membership lookups. Both lookups are binary
/// searches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NeighborRow {
    capacity: usize,
    by_distance: Vec<Neighbor>,
    by_id: Vec<Neighbor>,
}

impl NeighborRow {
    pub fn new(capacity: usize) -> Self {
        NeighborRow {
            capacity,
            by_distance: Vec::with_capacity(capacity),
            by_id: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.by_distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_distance.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.by_distance.len() >= self.capacity
    }

    /// Neighbors, closest first.
    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.by_distance.iter()
    }

    pub fn as_slice(&self) -> &[Neighbor] {
        &self.by_distance
    }

    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.by_distance.iter().map(|neighbor| neighbor.id)
    }

    pub fn worst(&self) -> Option<&Neighbor> {
        self.by_distance.last()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.position_by_id(id).is_ok()
    }

    pub fn distance_to(&self, id: ItemId) -> Option<Distance> {
        self.position_by_id(id)
            .ok()
            .map(|position| self.by_id[position].distance)
    }

    /// Offer `other` at distance `distance` to the row owned by `owner`.
    pub fn offer(&mut self, owner: ItemId, other: ItemId, distance: Distance) -> Offer {
        if owner == other || distance.is_nan() || self.capacity == 0 {
            return Offer::Rejected;
        }

        if let Ok(position) = self.position_by_id(other) {
            let current = self.by_id[position].distance;
            if distance >= current {
                return Offer::Rejected;
            }
            self.remove_sorted(Neighbor::new(other, current));
            self.by_id[position].distance = distance;
            self.insert_sorted(Neighbor::new(other, distance));
            return Offer::Improved;
        }

        if !self.is_full() {
            self.insert(Neighbor::new(other, distance));
            return Offer::Inserted;
        }

        // Ties go to the incumbent
        let worst = match self.by_distance.last() {
            Some(worst) if distance < worst.distance => *worst,
            _ => return Offer::Rejected,
        };
        self.remove(worst.id);
        self.insert(Neighbor::new(other, distance));
        Offer::Replaced { evicted: worst.id }
    }

    pub fn remove(&mut self, id: ItemId) -> Option<Neighbor> {
        let position = self.position_by_id(id).ok()?;
        let removed = self.by_id.remove(position);
        self.remove_sorted(removed);
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.by_distance.clear();
        self.by_id.clear();
    }

    fn insert(&mut self, neighbor: Neighbor) {
        let position = match self.position_by_id(neighbor.id) {
            Ok(position) | Err(position) => position,
        };
        self.by_id.insert(position, neighbor);
        self.insert_sorted(neighbor);
    }

    fn insert_sorted(&mut self, neighbor: Neighbor) {
        let position = match self
            .by_distance
            .binary_search_by(|entry| entry.order(&neighbor))
        {
            Ok(position) | Err(position) => position,
        };
        self.by_distance.insert(position, neighbor);
    }

    fn remove_sorted(&mut self, neighbor: Neighbor) {
        if let Ok(position) = self
            .by_distance
            .binary_search_by(|entry| entry.order(&neighbor))
        {
            self.by_distance.remove(position);
        }
    }

    fn position_by_id(&self, id: ItemId) -> Result<usize, usize> {
        self.by_id.binary_search_by(|entry| entry.id.cmp(&id))
    }
}
