use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::distance::Item;
use crate::error::ItemKey;
use crate::graph::ItemId;

/// Item slots addressed by dense id. Vacated ids are handed out again, lowest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ItemStore {
    slots: Vec<Option<Item>>,
    free: Vec<ItemId>,
}

impl ItemStore {
    pub fn allocate(&mut self) -> ItemId {
        if !self.free.is_empty() {
            self.free.sort_unstable_by(|a, b| b.cmp(a));
            if let Some(id) = self.free.pop() {
                return id;
            }
        }
        self.slots.push(None);
        (self.slots.len() - 1) as ItemId
    }

    pub fn put(&mut self, id: ItemId, item: Item) {
        let index = id as usize;
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(item);
    }

    pub fn take(&mut self, id: ItemId) -> Option<Item> {
        let item = self.slots.get_mut(id as usize)?.take();
        if item.is_some() {
            self.free.push(id);
        }
        item
    }

    pub fn get(&self, id: ItemId) -> Option<&Item> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub fn slots(&self) -> &[Option<Item>] {
        &self.slots
    }

    pub fn live_ids(&self) -> Vec<ItemId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id as ItemId)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Two way mapping between caller keys and dense ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdMapping {
    internal: HashMap<ItemKey, ItemId>,
    external: Vec<Option<ItemKey>>,
}

impl IdMapping {
    pub fn insert(&mut self, key: ItemKey, id: ItemId) {
        let index = id as usize;
        if self.external.len() <= index {
            self.external.resize(index + 1, None);
        }
        self.external[index] = Some(key);
        self.internal.insert(key, id);
    }

    pub fn remove(&mut self, key: ItemKey) -> Option<ItemId> {
        let id = self.internal.remove(&key)?;
        if let Some(slot) = self.external.get_mut(id as usize) {
            *slot = None;
        }
        Some(id)
    }

    pub fn id(&self, key: ItemKey) -> Option<ItemId> {
        self.internal.get(&key).copied()
    }

    pub fn key(&self, id: ItemId) -> Option<ItemKey> {
        self.external.get(id as usize).copied().flatten()
    }

    pub fn contains(&self, key: ItemKey) -> bool {
        self.internal.contains_key(&key)
    }
}
