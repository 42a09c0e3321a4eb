use std::fmt;

use chrono::{DateTime, Utc};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RuleConfig;
use crate::error::{EngineError, Result};
use crate::graph::ItemId;

pub mod history;

pub use history::ListenHistory;

/// Sorted, deduplicated set of item ids.
pub type Itemset = Vec<ItemId>;

/// Unordered pair of disjoint itemsets, smaller one first.
type RuleKey = (Itemset, Itemset);

/// How a rule's rating is derived from its Kulczynski measure and imbalance ratio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RatingPolicy {
    /// `(1 - kulczynski) * imbalance`
    Documented,
    /// `kulczynski * (1 - imbalance)`: strong, balanced rules rate highest.
    Balanced,
}

impl Default for RatingPolicy {
    fn default() -> Self {
        RatingPolicy::Balanced
    }
}

impl RatingPolicy {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "documented" => Ok(RatingPolicy::Documented),
            "balanced" | "" => Ok(RatingPolicy::Balanced),
            other => Err(EngineError::Configuration(format!(
                "unknown rating policy `{}`, expected `documented` or `balanced`",
                other
            ))),
        }
    }

    pub fn rate(&self, kulczynski: f64, imbalance: f64) -> f64 {
        match self {
            RatingPolicy::Documented => (1.0 - kulczynski) * imbalance,
            RatingPolicy::Balanced => kulczynski * (1.0 - imbalance),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub antecedent: Itemset,
    pub consequent: Itemset,
    pub support: f64,
    pub confidence: f64,
    pub kulczynski: f64,
    pub imbalance: f64,
    pub rating: f64,
    pub bidirectional: bool,
    /// Transactions containing both sides.
    pub count: u32,
    pub updated: DateTime<Utc>,
    sequence: u64,
}

impl Rule {
    pub fn involves(&self, item: ItemId) -> bool {
        self.antecedent.contains(&item) || self.consequent.contains(&item)
    }

    /// Items on the other side of the rule, as seen from `item`.
    pub fn other_side(&self, item: ItemId) -> Option<&[ItemId]> {
        if self.antecedent.contains(&item) {
            Some(&self.consequent)
        } else if self.consequent.contains(&item) {
            Some(&self.antecedent)
        } else {
            None
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {:?} [support={:.3} confidence={:.3} kulczynski={:.3} imbalance={:.3} rating={:.3}]",
            self.antecedent,
            if self.bidirectional { "<->" } else { "->" },
            self.consequent,
            self.support,
            self.confidence,
            self.kulczynski,
            self.imbalance,
            self.rating
        )
    }
}

/// What happened to a closed package.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageOutcome {
    Mined { transactions: u32, rules: usize },
    /// Too few distinct items to say anything, nothing was counted.
    Degenerate { distinct: usize },
}

/// Incrementally mined association rules over a sliding window of packages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleIndex {
    #[serde(skip)]
    config: RuleConfig,
    transactions: u32,
    itemset_counts: HashMap<Itemset, u32>,
    rules: HashMap<RuleKey, Rule>,
    by_item: HashMap<ItemId, HashSet<RuleKey>>,
    sequence: u64,
}

fn distinct(package: &[ItemId]) -> Itemset {
    package.iter().copied().sorted_unstable().dedup().collect()
}

fn union(left: &[ItemId], right: &[ItemId]) -> Itemset {
    left.iter().chain(right.iter()).copied().sorted_unstable().dedup().collect()
}

fn rule_key(left: Itemset, right: Itemset) -> RuleKey {
    if left <= right {
        (left, right)
    } else {
        (right, left)
    }
}

/// Every split of `itemset` into two non empty halves, each unordered pair once.
fn splits(itemset: &[ItemId]) -> Vec<RuleKey> {
    let n = itemset.len();
    if n < 2 {
        return Vec::new();
    }
    // the first item always goes left, so every pair shows up once
    (0u32..(1 << (n - 1)) - 1)
        .map(|mask| {
            let (left, right): (Vec<(usize, ItemId)>, Vec<(usize, ItemId)>) = itemset
                .iter()
                .copied()
                .enumerate()
                .partition(|(position, _)| *position == 0 || mask & (1 << (position - 1)) != 0);
            rule_key(
                left.into_iter().map(|(_, item)| item).collect(),
                right.into_iter().map(|(_, item)| item).collect(),
            )
        })
        .collect()
}

impl RuleIndex {
    pub fn new(config: &RuleConfig) -> Self {
        RuleIndex {
            config: config.clone(),
            transactions: 0,
            itemset_counts: HashMap::new(),
            rules: HashMap::new(),
            by_item: HashMap::new(),
            sequence: 0,
        }
    }

    pub(crate) fn set_config(&mut self, config: &RuleConfig) {
        self.config = config.clone();
    }

    pub fn transactions(&self) -> u32 {
        self.transactions
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn count(&self, itemset: &[ItemId]) -> u32 {
        self.itemset_counts
            .get(&distinct(itemset))
            .copied()
            .unwrap_or(0)
    }

    /// Count a closed package and update the rules it affects.
    pub fn insert_package(&mut self, package: &[ItemId], now: DateTime<Utc>) -> PackageOutcome {
        let transaction = distinct(package);
        if transaction.len() < self.config.min_package_size {
            debug!(distinct = transaction.len(), "discarding degenerate package");
            return PackageOutcome::Degenerate {
                distinct: transaction.len(),
            };
        }

        self.transactions += 1;
        for itemset in self.subsets(&transaction) {
            *self.itemset_counts.entry(itemset).or_insert(0) += 1;
        }
        let rules = self.refresh(&transaction, now);
        PackageOutcome::Mined {
            transactions: self.transactions,
            rules,
        }
    }

    /// Undo the counts of a package that left the history window.
    pub fn forget_package(&mut self, package: &[ItemId], now: DateTime<Utc>) {
        let transaction = distinct(package);
        if transaction.is_empty() || self.transactions == 0 {
            return;
        }

        self.transactions -= 1;
        for itemset in self.subsets(&transaction) {
            let emptied = match self.itemset_counts.get_mut(&itemset) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if emptied {
                self.itemset_counts.remove(&itemset);
            }
        }
        self.refresh(&transaction, now);
    }

    /// Drop every count and rule mentioning `item`.
    pub fn purge_item(&mut self, item: ItemId) {
        self.itemset_counts.retain(|itemset, _| !itemset.contains(&item));
        if let Some(keys) = self.by_item.remove(&item) {
            for key in keys {
                self.remove_rule(&key);
            }
        }
    }

    /// `count(A ∪ B) / count(A)`, from the counts of the current window.
    pub fn confidence(&self, antecedent: &[ItemId], consequent: &[ItemId]) -> Option<f64> {
        let both = union(antecedent, consequent);
        if both.len() > self.config.max_itemset_size {
            return None;
        }
        let count_a = self.count(antecedent);
        if count_a == 0 {
            return None;
        }
        Some(self.count(&both) as f64 / count_a as f64)
    }

    /// Rules mentioning `item`, best rated first.
    pub fn lookup(&self, item: ItemId) -> Vec<&Rule> {
        let mut found: Vec<&Rule> = self
            .by_item
            .get(&item)
            .map(|keys| keys.iter().filter_map(|key| self.rules.get(key)).collect())
            .unwrap_or_default();
        found.sort_by(|a, b| Self::rank(a, b));
        found
    }

    pub fn best(&self) -> Option<&Rule> {
        self.rules.values().min_by(|a, b| Self::rank(a, b))
    }

    /// All rules, best rated first.
    pub fn iter(&self) -> Vec<&Rule> {
        let mut all: Vec<&Rule> = self.rules.values().collect();
        all.sort_by(|a, b| Self::rank(a, b));
        all
    }

    fn rank(a: &Rule, b: &Rule) -> std::cmp::Ordering {
        b.rating
            .total_cmp(&a.rating)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.antecedent.cmp(&b.antecedent))
            .then_with(|| a.consequent.cmp(&b.consequent))
    }

    fn subsets(&self, transaction: &[ItemId]) -> Vec<Itemset> {
        let largest = self.config.max_itemset_size.min(transaction.len());
        (1..=largest)
            .flat_map(|size| transaction.iter().copied().combinations(size))
            .collect()
    }

    /// Re-evaluate every rule the transaction can have touched.
    fn refresh(&mut self, transaction: &[ItemId], now: DateTime<Utc>) -> usize {
        let mut keys: HashSet<RuleKey> = HashSet::new();
        for itemset in self.subsets(transaction).into_iter().filter(|set| set.len() >= 2) {
            keys.extend(splits(&itemset));
        }
        for item in transaction {
            if let Some(existing) = self.by_item.get(item) {
                keys.extend(existing.iter().cloned());
            }
        }

        let mut kept = 0;
        for (left, right) in keys {
            if self.evaluate(left, right, now) {
                kept += 1;
            }
        }

        // the transaction count moved, so did every support
        let transactions = self.transactions.max(1) as f64;
        for rule in self.rules.values_mut() {
            rule.support = rule.count as f64 / transactions;
        }

        self.enforce_capacity();
        kept
    }

    /// Compute the measures of a split and store, update or drop its rule.
    fn evaluate(&mut self, left: Itemset, right: Itemset, now: DateTime<Utc>) -> bool {
        let both = union(&left, &right);
        let count_ab = self.itemset_counts.get(&both).copied().unwrap_or(0);
        let count_a = self.itemset_counts.get(&left).copied().unwrap_or(0);
        let count_b = self.itemset_counts.get(&right).copied().unwrap_or(0);
        let key = (left, right);

        if count_ab < self.config.min_support || count_a == 0 || count_b == 0 {
            self.remove_rule(&key);
            return false;
        }

        let (count_ab, count_a, count_b) = (count_ab as f64, count_a as f64, count_b as f64);
        let confidence_ab = count_ab / count_a;
        let confidence_ba = count_ab / count_b;
        let kulczynski = (confidence_ab + confidence_ba) / 2.0;
        let imbalance = (count_a - count_b).abs() / (count_a + count_b - count_ab);
        let rating = self.config.rating_policy.rate(kulczynski, imbalance);

        let best_confidence = confidence_ab.max(confidence_ba);
        if best_confidence < self.config.min_confidence {
            self.remove_rule(&key);
            return false;
        }
        let bidirectional = imbalance <= self.config.bidirectional_max_imbalance
            && confidence_ab.min(confidence_ba) >= self.config.min_confidence;

        let (antecedent, consequent, confidence) = if confidence_ab >= confidence_ba {
            (key.0.clone(), key.1.clone(), confidence_ab)
        } else {
            (key.1.clone(), key.0.clone(), confidence_ba)
        };

        self.sequence += 1;
        let rule = Rule {
            antecedent,
            consequent,
            support: count_ab / self.transactions.max(1) as f64,
            confidence,
            kulczynski,
            imbalance,
            rating,
            bidirectional,
            count: count_ab as u32,
            updated: now,
            sequence: self.sequence,
        };

        for item in key.0.iter().chain(key.1.iter()) {
            self.by_item.entry(*item).or_default().insert(key.clone());
        }
        self.rules.insert(key, rule);
        true
    }

    fn remove_rule(&mut self, key: &RuleKey) {
        if self.rules.remove(key).is_none() {
            return;
        }
        for item in key.0.iter().chain(key.1.iter()) {
            if let Some(keys) = self.by_item.get_mut(item) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_item.remove(item);
                }
            }
        }
    }

    /// Drop the least recently updated rules beyond `max_rules`.
    fn enforce_capacity(&mut self) {
        if self.rules.len() <= self.config.max_rules {
            return;
        }
        let excess = self.rules.len() - self.config.max_rules;
        let stale: Vec<RuleKey> = self
            .rules
            .iter()
            .sorted_by_key(|(_, rule)| rule.sequence)
            .take(excess)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale.iter() {
            self.remove_rule(key);
        }
        debug!(dropped = stale.len(), "rule index over capacity");
    }
}
