use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::HistoryConfig;
use crate::graph::ItemId;

/// Ordered record of listened items, grouped into packages.
///
/// A package closes when it holds `package_size` items or when more than
/// `package_timeout_secs` passed since the previous listen. Closed packages
/// that were mined are archived in a window of `max_packages`; archiving into
/// a full window evicts the oldest package.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenHistory {
    max_packages: usize,
    package_size: usize,
    package_timeout_secs: i64,
    open: Vec<ItemId>,
    last_listen: Option<DateTime<Utc>>,
    window: VecDeque<Vec<ItemId>>,
    playcounts: HashMap<ItemId, u32>,
}

impl ListenHistory {
    pub fn new(config: &HistoryConfig) -> Self {
        ListenHistory {
            max_packages: config.max_packages,
            package_size: config.package_size,
            package_timeout_secs: config.package_timeout_secs,
            open: Vec::with_capacity(config.package_size),
            last_listen: None,
            window: VecDeque::with_capacity(config.max_packages),
            playcounts: HashMap::new(),
        }
    }

    /// Record a listen at `at`, returning the packages this closed.
    pub fn feed(&mut self, item: ItemId, at: DateTime<Utc>) -> Vec<Vec<ItemId>> {
        let mut closed = Vec::new();

        if let Some(last) = self.last_listen {
            if at - last > Duration::seconds(self.package_timeout_secs) {
                closed.extend(self.close());
            }
        }
        self.last_listen = Some(at);

        *self.playcounts.entry(item).or_insert(0) += 1;
        self.open.push(item);
        if self.open.len() >= self.package_size {
            closed.extend(self.close());
        }
        closed
    }

    /// Close the open package, if it holds anything.
    pub fn close(&mut self) -> Option<Vec<ItemId>> {
        if self.open.is_empty() {
            None
        } else {
            Some(std::mem::replace(
                &mut self.open,
                Vec::with_capacity(self.package_size),
            ))
        }
    }

    /// Keep a mined package in the window, returning the package it displaced.
    pub fn archive(&mut self, package: Vec<ItemId>) -> Option<Vec<ItemId>> {
        let evicted = if self.window.len() >= self.max_packages {
            self.window.pop_front()
        } else {
            None
        };
        self.window.push_back(package);
        evicted
    }

    /// Forget every trace of `item`.
    pub fn purge(&mut self, item: ItemId) {
        self.open.retain(|other| *other != item);
        for package in self.window.iter_mut() {
            package.retain(|other| *other != item);
        }
        self.playcounts.remove(&item);
    }

    pub fn playcount(&self, item: ItemId) -> u32 {
        self.playcounts.get(&item).copied().unwrap_or(0)
    }

    /// Playcounts, most played first.
    pub fn playcounts(&self) -> Vec<(ItemId, u32)> {
        let mut counts: Vec<(ItemId, u32)> = self
            .playcounts
            .iter()
            .map(|(item, count)| (*item, *count))
            .collect();
        counts.sort_unstable_by(|(ia, ca), (ib, cb)| cb.cmp(ca).then_with(|| ia.cmp(ib)));
        counts
    }

    pub fn most_played(&self) -> Option<ItemId> {
        self.playcounts
            .iter()
            .max_by(|(ia, ca), (ib, cb)| ca.cmp(cb).then_with(|| ib.cmp(ia)))
            .map(|(item, _)| *item)
    }

    pub fn packages(&self) -> impl Iterator<Item = &Vec<ItemId>> {
        self.window.iter()
    }

    pub fn open_package(&self) -> &[ItemId] {
        &self.open
    }
}
