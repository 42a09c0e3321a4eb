use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::distance::{AttributeMask, Distance, Item, Value};
use crate::error::{EngineError, ItemKey, Result};
use crate::graph::{build, BuildReport, DistanceStats, ItemId, ItemMetric, SimilarityGraph};
use crate::io::read_listening_log;
use crate::retrieval::{Candidate, Retrieval};
use crate::rules::{ListenHistory, PackageOutcome, Rule, RuleIndex};

mod snapshot;
mod store;
pub mod transaction;

use store::{IdMapping, ItemStore};
pub use transaction::{CommitReport, Mutation, Transaction};

/// Incremental graph edits since the last full rebuild.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDrift {
    pub edits_since_rebuild: usize,
    pub threshold: usize,
}

impl GraphDrift {
    pub fn rebuild_recommended(&self) -> bool {
        self.edits_since_rebuild >= self.threshold
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Recommendation {
    pub key: ItemKey,
    /// Distance from the seed of the query.
    pub distance: Distance,
    /// Rule derived seed this item was reached through.
    pub via: Option<ItemKey>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recommendations {
    pub seed: Option<ItemKey>,
    pub items: Vec<Recommendation>,
}

impl Recommendations {
    pub fn keys(&self) -> Vec<ItemKey> {
        self.items.iter().map(|recommendation| recommendation.key).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Why an item was recommended for a seed.
#[derive(Clone, Debug, PartialEq)]
pub struct Explanation {
    pub distance: Distance,
    /// Partial distance per attribute, most similar first.
    pub reasons: Vec<(String, Distance)>,
}

/// A mined rule with its itemsets given as caller keys.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedRule {
    pub antecedent: Vec<ItemKey>,
    pub consequent: Vec<ItemKey>,
    pub rule: Rule,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub packages: usize,
    pub listens: usize,
    pub unknown_keys: usize,
    pub mined: usize,
    pub degenerate: usize,
}

/// The items of one collection, their similarity graph, mined rules and history.
pub struct Session {
    name: String,
    config: EngineConfig,
    mask: AttributeMask,
    store: ItemStore,
    ids: IdMapping,
    graph: SimilarityGraph,
    rules: RuleIndex,
    history: ListenHistory,
    stats: DistanceStats,
    drift: GraphDrift,
    rng: Pcg64,
    pool: ThreadPool,
}

fn rng_for(name: &str) -> Pcg64 {
    let seed = name
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
        });
    Pcg64::seed_from_u64(seed)
}

fn thread_pool(config: &EngineConfig) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.num_workers)
        .thread_name(|index| format!("munin-worker-{}", index))
        .build()
        .map_err(|e| EngineError::Configuration(format!("cannot start worker pool: {}", e)))
}

impl Session {
    pub fn new<S: Into<String>>(name: S, mask: AttributeMask, config: EngineConfig) -> Result<Session> {
        config.validate()?;
        let name = name.into();
        let pool = thread_pool(&config)?;
        info!(
            session = %name,
            attributes = mask.len(),
            num_workers = config.workers.num_workers,
            "session created"
        );
        Ok(Session {
            rng: rng_for(&name),
            graph: SimilarityGraph::new(config.graph.max_neighbors),
            rules: RuleIndex::new(&config.rules),
            history: ListenHistory::new(&config.history),
            stats: DistanceStats::default(),
            drift: GraphDrift {
                edits_since_rebuild: 0,
                threshold: config.graph.drift_rebuild_threshold,
            },
            store: ItemStore::default(),
            ids: IdMapping::default(),
            name,
            config,
            mask,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mask(&self) -> &AttributeMask {
        &self.mask
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn contains(&self, key: ItemKey) -> bool {
        self.ids.contains(key)
    }

    pub fn drift(&self) -> GraphDrift {
        self.drift
    }

    pub fn graph(&self) -> &SimilarityGraph {
        &self.graph
    }

    /// Start a batch of mutations, applied on commit.
    pub fn transaction(&mut self) -> Transaction<&mut Session> {
        Transaction::new(self)
    }

    /// Add or replace a single item.
    pub fn add<I, S>(&mut self, key: ItemKey, attributes: I) -> Result<CommitReport>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let mut transaction = self.transaction();
        transaction.add(key, attributes)?;
        Ok(transaction.commit())
    }

    pub fn remove(&mut self, key: ItemKey) -> Result<CommitReport> {
        let mut transaction = self.transaction();
        transaction.remove(key)?;
        Ok(transaction.commit())
    }

    /// Rebuild the similarity graph from scratch.
    pub fn rebuild(&mut self) -> BuildReport {
        let ids = self.store.live_ids();
        let metric = ItemMetric {
            mask: &self.mask,
            items: self.store.slots(),
        };
        let report = build::build(&mut self.graph, &ids, &metric, &self.config.graph, &self.pool);
        self.stats = report.stats;
        self.drift.edits_since_rebuild = 0;
        report
    }

    fn id(&self, key: ItemKey) -> Result<ItemId> {
        self.ids.id(key).ok_or(EngineError::InvalidIdentifier(key))
    }

    fn key(&self, id: ItemId) -> Option<ItemKey> {
        self.ids.key(id)
    }

    fn item(&self, key: ItemKey) -> Result<&Item> {
        let id = self.id(key)?;
        self.store.get(id).ok_or(EngineError::InvalidIdentifier(key))
    }

    fn retrieval(&self) -> Retrieval<'_> {
        Retrieval {
            mask: &self.mask,
            items: self.store.slots(),
            graph: &self.graph,
            rules: &self.rules,
            history: &self.history,
        }
    }

    fn keyed(&self, seed: Option<ItemId>, candidates: Vec<Candidate>) -> Recommendations {
        Recommendations {
            seed: seed.and_then(|id| self.key(id)),
            items: candidates
                .into_iter()
                .filter_map(|candidate| {
                    Some(Recommendation {
                        key: self.key(candidate.item)?,
                        distance: candidate.distance,
                        via: candidate.via.and_then(|id| self.key(id)),
                    })
                })
                .collect(),
        }
    }

    /// Up to `k` items similar to `seed`, closest first. The seed is never included.
    pub fn recommend_from_seed(&self, seed: ItemKey, k: usize) -> Result<Recommendations> {
        let id = self.id(seed)?;
        let candidates = self.retrieval().from_seed(id, k, &HashSet::new());
        Ok(self.keyed(Some(id), candidates))
    }

    /// Recommend from the best rule, the most played item or a random item.
    pub fn recommend_from_heuristic(&self, k: usize) -> Recommendations {
        let retrieval = self.retrieval();
        let mut rng = rand::thread_rng();
        match retrieval.heuristic_seed(&mut rng) {
            Some(seed) => {
                debug!(seed, "heuristic seed picked");
                self.keyed(Some(seed), retrieval.from_seed(seed, k, &HashSet::new()))
            }
            None => Recommendations::default(),
        }
    }

    /// Recommend from the item that best matches the given attribute values.
    pub fn recommend_from_attributes<I, S>(&self, attributes: I, k: usize) -> Result<Recommendations>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let subset = self.mask.resolve(attributes)?;
        let retrieval = self.retrieval();
        Ok(match retrieval.attribute_seed(&subset) {
            Some(seed) => self.keyed(Some(seed), retrieval.from_seed(seed, k, &HashSet::new())),
            None => Recommendations::default(),
        })
    }

    pub fn explain_recommendation(&self, seed: ItemKey, recommendation: ItemKey) -> Result<Explanation> {
        let seed_item = self.item(seed)?;
        let recommended = self.item(recommendation)?;
        Ok(Explanation {
            distance: self.mask.distance(seed_item, recommended),
            reasons: self.mask.explain(seed_item, recommended),
        })
    }

    /// Keys of the items whose values equal every given attribute value.
    pub fn find_matching_attributes<I, S>(&self, attributes: I) -> Result<Vec<ItemKey>>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let subset = self.mask.resolve(attributes)?;
        let mut keys: Vec<ItemKey> = self
            .store
            .live_ids()
            .into_iter()
            .filter(|id| {
                self.store.get(*id).map_or(false, |item| {
                    subset
                        .iter()
                        .all(|(slot, value)| item.values()[*slot].as_ref() == Some(value))
                })
            })
            .filter_map(|id| self.key(id))
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Current graph neighbors of an item, closest first.
    pub fn neighbors(&self, key: ItemKey) -> Result<Vec<(ItemKey, Distance)>> {
        let id = self.id(key)?;
        Ok(self
            .graph
            .neighbors(id)
            .iter()
            .filter_map(|neighbor| Some((self.key(neighbor.id)?, neighbor.distance)))
            .collect())
    }

    pub fn distance(&self, left: ItemKey, right: ItemKey) -> Result<Distance> {
        Ok(self.mask.distance(self.item(left)?, self.item(right)?))
    }

    fn keyed_rule(&self, rule: &Rule) -> KeyedRule {
        let keys = |ids: &[ItemId]| -> Vec<ItemKey> { ids.iter().filter_map(|id| self.key(*id)).collect() };
        KeyedRule {
            antecedent: keys(&rule.antecedent),
            consequent: keys(&rule.consequent),
            rule: rule.clone(),
        }
    }

    /// All mined rules, best rated first.
    pub fn rules(&self) -> Vec<KeyedRule> {
        self.rules
            .iter()
            .into_iter()
            .map(|rule| self.keyed_rule(rule))
            .collect()
    }

    pub fn rules_for(&self, key: ItemKey) -> Result<Vec<KeyedRule>> {
        let id = self.id(key)?;
        Ok(self
            .rules
            .lookup(id)
            .into_iter()
            .map(|rule| self.keyed_rule(rule))
            .collect())
    }

    /// Confidence of `antecedent -> consequent` over the current history window.
    pub fn confidence(&self, antecedent: &[ItemKey], consequent: &[ItemKey]) -> Result<Option<f64>> {
        let to_ids = |keys: &[ItemKey]| keys.iter().map(|key| self.id(*key)).collect::<Result<Vec<_>>>();
        Ok(self.rules.confidence(&to_ids(antecedent)?, &to_ids(consequent)?))
    }

    pub fn playcount(&self, key: ItemKey) -> Result<u32> {
        Ok(self.history.playcount(self.id(key)?))
    }

    /// Playcounts, most played first.
    pub fn playcounts(&self) -> Vec<(ItemKey, u32)> {
        self.history
            .playcounts()
            .into_iter()
            .filter_map(|(id, count)| Some((self.key(id)?, count)))
            .collect()
    }

    pub fn feed_history(&mut self, key: ItemKey) -> Result<Vec<PackageOutcome>> {
        self.feed_history_at(key, Utc::now())
    }

    /// Record a listen of `key` at `at`, mining every package this closes.
    pub fn feed_history_at(&mut self, key: ItemKey, at: DateTime<Utc>) -> Result<Vec<PackageOutcome>> {
        let id = self.id(key)?;
        let closed = self.history.feed(id, at);
        Ok(closed
            .into_iter()
            .map(|package| self.mine(package, at))
            .collect())
    }

    /// Close the open history package now instead of waiting for it to fill up.
    pub fn close_history_package(&mut self) -> Option<PackageOutcome> {
        let package = self.history.close()?;
        Some(self.mine(package, Utc::now()))
    }

    fn mine(&mut self, package: Vec<ItemId>, now: DateTime<Utc>) -> PackageOutcome {
        let outcome = self.rules.insert_package(&package, now);
        if let PackageOutcome::Mined { .. } = outcome {
            if let Some(evicted) = self.history.archive(package) {
                self.rules.forget_package(&evicted, now);
            }
        }
        outcome
    }

    /// Feed a tab separated listening log; every package of the log is closed
    /// explicitly after its last listen. Listens of unknown keys are skipped.
    pub fn import_history<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<ImportReport> {
        let packages = read_listening_log(path)?;
        let mut report = ImportReport::default();
        let mut outcomes = Vec::new();

        for (_, listens) in packages {
            report.packages += 1;
            for (key, at) in listens {
                match self.feed_history_at(key, at) {
                    Ok(closed) => {
                        report.listens += 1;
                        outcomes.extend(closed);
                    }
                    Err(EngineError::InvalidIdentifier(_)) => report.unknown_keys += 1,
                    Err(other) => return Err(other.into()),
                }
            }
            outcomes.extend(self.close_history_package());
        }

        for outcome in outcomes {
            match outcome {
                PackageOutcome::Mined { .. } => report.mined += 1,
                PackageOutcome::Degenerate { .. } => report.degenerate += 1,
            }
        }
        info!(
            session = %self.name,
            packages = report.packages,
            listens = report.listens,
            unknown_keys = report.unknown_keys,
            rules = self.rules.len(),
            "listening history imported"
        );
        Ok(report)
    }

    /// Apply validated mutations: removals first, then additions.
    pub(crate) fn apply(&mut self, mutations: Vec<Mutation>) -> CommitReport {
        let was_empty = self.store.is_empty();
        let mut removed = 0;
        let mut holes: Vec<Vec<ItemId>> = Vec::new();
        let mut additions: Vec<(ItemKey, Item)> = Vec::new();

        for mutation in mutations {
            let (key, item) = match mutation {
                Mutation::Add { key, item } => (key, Some(item)),
                Mutation::Remove { key } => (key, None),
            };
            additions.retain(|(staged, _)| *staged != key);
            if let Some(id) = self.ids.remove(key) {
                self.store.take(id);
                holes.push(self.graph.remove_item(id));
                self.rules.purge_item(id);
                self.history.purge(id);
                removed += 1;
            }
            if let Some(item) = item {
                additions.push((key, item));
            }
        }

        let mut added = Vec::with_capacity(additions.len());
        for (key, item) in additions {
            let id = self.store.allocate();
            self.store.put(id, item);
            self.ids.insert(key, id);
            added.push(id);
        }

        let full_rebuild = was_empty || added.len() >= self.config.graph.rebuild_batch_size;
        let rebuilt = if full_rebuild {
            if added.is_empty() && self.store.is_empty() {
                self.graph.reset(0);
                None
            } else {
                Some(self.rebuild())
            }
        } else {
            self.repair(&holes, &added);
            None
        };

        let report = CommitReport {
            added: added.len(),
            removed,
            rebuilt,
            drift: self.drift,
        };
        if self.drift.rebuild_recommended() {
            warn!(
                session = %self.name,
                edits_since_rebuild = self.drift.edits_since_rebuild,
                threshold = self.drift.threshold,
                "similarity graph drifted, a rebuild is recommended"
            );
        }
        report
    }

    /// Close the holes left by removals and link the new items incrementally.
    fn repair(&mut self, holes: &[Vec<ItemId>], added: &[ItemId]) {
        let metric = ItemMetric {
            mask: &self.mask,
            items: self.store.slots(),
        };

        let added_set: HashSet<ItemId> = added.iter().copied().collect();
        for former in holes {
            let live: Vec<ItemId> = former
                .iter()
                .copied()
                .filter(|id| self.store.get(*id).is_some() && !added_set.contains(id))
                .collect();
            self.graph.close_hole(&live, &metric);
        }

        let existing: Vec<ItemId> = self
            .store
            .live_ids()
            .into_iter()
            .filter(|id| !added_set.contains(id))
            .collect();
        let mut evaluations = 0;
        for id in added {
            evaluations += build::insert(
                &mut self.graph,
                *id,
                &existing,
                &metric,
                &self.config.graph,
                &self.stats,
                &mut self.rng,
            );
        }
        let pruned_links = self.graph.finalize();

        self.drift.edits_since_rebuild += added.len() + holes.len();
        debug!(
            session = %self.name,
            added = added.len(),
            removed = holes.len(),
            evaluations,
            pruned_links,
            "similarity graph repaired"
        );
    }
}

/// A session shared between threads: queries take the read lock, a
/// transaction holds the write lock until it is committed or dropped.
///
/// A transaction that panics while applying its mutations poisons the session,
/// every later `read` or `transaction` fails with `EngineError::Poisoned`.
#[derive(Clone)]
pub struct SharedSession {
    name: Arc<str>,
    inner: Arc<RwLock<Session>>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        SharedSession {
            name: Arc::from(session.name()),
            inner: Arc::new(RwLock::new(session)),
        }
    }

    fn poisoned(&self) -> EngineError {
        EngineError::Poisoned(self.name.to_string())
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Session>> {
        self.inner.read().map_err(|_| self.poisoned())
    }

    pub fn transaction(&self) -> Result<Transaction<RwLockWriteGuard<'_, Session>>> {
        let guard = self.inner.write().map_err(|_| self.poisoned())?;
        Ok(Transaction::new(guard))
    }
}

#[cfg(test)]
mod session_test {
    use std::io::Write;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::distance::{Attribute, DistanceFunction};

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workers.num_workers = 2;
        config.graph.max_neighbors = 5;
        config.history.package_size = 2;
        config
    }

    fn genre_mask() -> AttributeMask {
        AttributeMask::builder()
            .attribute("genre", Attribute::new(1.0).with_distance(DistanceFunction::Exact))
            .attribute("title", Attribute::new(0.0).with_distance(DistanceFunction::Levenshtein))
            .build()
            .unwrap()
    }

    fn year_mask() -> AttributeMask {
        AttributeMask::builder()
            .attribute(
                "year",
                Attribute::new(1.0).with_distance(DistanceFunction::Numeric {
                    min: 1950.0,
                    max: 2000.0,
                }),
            )
            .build()
            .unwrap()
    }

    fn year_session(items: u64) -> Session {
        year_session_with(config(), items)
    }

    fn year_session_with(config: EngineConfig, items: u64) -> Session {
        let mut session = Session::new("years", year_mask(), config).unwrap();
        let mut transaction = session.transaction();
        for key in 0..items {
            transaction
                .add(key, vec![("year", Value::Number(1950.0 + key as f64))])
                .unwrap();
        }
        transaction.commit();
        session
    }

    fn genre(name: &str) -> Vec<(&'static str, Value)> {
        vec![("genre", Value::from(name)), ("title", Value::from(name))]
    }

    #[test]
    fn should_recommend_the_same_genre_first() {
        let mut session = Session::new("genres", genre_mask(), config()).unwrap();
        let mut transaction = session.transaction();
        transaction.add(1, genre("folk metal")).unwrap();
        transaction.add(2, genre("folk metal")).unwrap();
        transaction.add(3, genre("brutal death")).unwrap();
        transaction.add(4, genre("brutal death")).unwrap();
        let report = transaction.commit();
        assert_eq!(4, report.added);
        assert!(report.rebuilt.is_some());

        let recommendations = session.recommend_from_seed(1, 1).unwrap();
        assert_eq!(Some(1), recommendations.seed);
        assert_eq!(vec![2], recommendations.keys());
        assert_eq!(0.0, recommendations.items[0].distance);

        let explanation = session.explain_recommendation(1, 3).unwrap();
        assert_eq!(1.0, explanation.distance);
        assert_eq!(1.0, session.distance(3, 1).unwrap());
    }

    #[test]
    fn should_return_sorted_unique_recommendations_without_the_seed() {
        let session = year_session(50);
        assert_eq!(50, session.len());
        assert!(session.graph().is_mutual());

        for seed in [0, 17, 25, 49] {
            let recommendations = session.recommend_from_seed(seed, 10).unwrap();
            assert!(!recommendations.is_empty());
            assert!(recommendations.len() <= 10);
            let keys = recommendations.keys();
            assert!(!keys.contains(&seed));
            let mut unique = keys.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(keys.len(), unique.len());
            assert!(recommendations
                .items
                .windows(2)
                .all(|pair| pair[0].distance <= pair[1].distance));
        }
    }

    #[test]
    fn should_keep_neighbors_stable_when_an_item_is_removed_and_added_again() {
        let mut session = year_session(50);
        let before = session.neighbors(25).unwrap();
        assert!((before[0].1 - 0.02).abs() < 1e-9);

        let removal = session.remove(25).unwrap();
        assert_eq!(1, removal.removed);
        assert!(removal.rebuilt.is_none());
        assert!(!session.contains(25));
        assert!(session.graph().is_mutual());
        assert!(session.recommend_from_seed(25, 5).is_err());

        session
            .add(25, vec![("year", Value::Number(1975.0))])
            .unwrap();
        let after = session.neighbors(25).unwrap();
        assert!(!after.is_empty());
        assert!((after[0].1 - before[0].1).abs() < 1e-9);
        assert!(session.graph().is_mutual());
        assert_eq!(2, session.drift().edits_since_rebuild);
    }

    #[test]
    fn should_replace_an_existing_key() {
        let mut session = year_session(10);
        session
            .add(3, vec![("year", Value::Number(1959.0))])
            .unwrap();
        assert_eq!(10, session.len());
        assert!((session.distance(3, 9).unwrap() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn should_reject_invalid_identifiers_and_attributes() {
        let mut session = year_session(5);
        assert!(matches!(session.remove(42), Err(EngineError::InvalidIdentifier(42))));
        assert!(matches!(
            session.add(6, vec![("tempo", Value::Number(120.0))]),
            Err(EngineError::UnknownAttribute(_))
        ));
        assert!(matches!(session.neighbors(42), Err(EngineError::InvalidIdentifier(42))));
        assert_eq!(5, session.len());
    }

    #[test]
    fn should_find_items_by_attributes() {
        let mut session = Session::new("genres", genre_mask(), config()).unwrap();
        let mut transaction = session.transaction();
        transaction.add(10, genre("folk metal")).unwrap();
        transaction.add(11, genre("brutal death")).unwrap();
        transaction.add(12, genre("folk metal")).unwrap();
        transaction.commit();

        let matching = session
            .find_matching_attributes(vec![("genre", Value::from("folk metal"))])
            .unwrap();
        assert_eq!(vec![10, 12], matching);

        let recommendations = session
            .recommend_from_attributes(vec![("genre", Value::from("brutal death"))], 2)
            .unwrap();
        assert_eq!(Some(11), recommendations.seed);
        assert!(!recommendations.keys().contains(&11));
    }

    #[test]
    fn should_mine_rules_from_the_listening_history() {
        let mut session = year_session(5);
        let start = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        for round in 0..3 {
            let at = start + Duration::seconds(round * 100);
            assert!(session.feed_history_at(1, at).unwrap().is_empty());
            let outcomes = session
                .feed_history_at(2, at + Duration::seconds(10))
                .unwrap();
            assert_eq!(1, outcomes.len());
        }

        assert_eq!(Some(1.0), session.confidence(&[1], &[2]).unwrap());
        assert_eq!(3, session.playcount(1).unwrap());
        assert!(!session.rules().is_empty());
        assert!(session.rules_for(2).unwrap().iter().all(|rule| {
            rule.antecedent.contains(&2) || rule.consequent.contains(&2)
        }));

        let recommendations = session.recommend_from_heuristic(3);
        let seed = recommendations.seed.unwrap();
        assert!(seed == 1 || seed == 2);
        assert!(!recommendations.keys().contains(&seed));

        session.remove(2).unwrap();
        assert!(session.rules().is_empty());
        assert!(session.playcounts().iter().all(|(key, _)| *key != 2));
    }

    #[test]
    fn should_import_a_listening_log() {
        let mut session = year_session(5);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "package_id\titem_key\ttime").unwrap();
        for package in 0..3 {
            let at = 1_600_000_000 + package * 1000;
            writeln!(file, "{}\t1\t{}", package, at).unwrap();
            writeln!(file, "{}\t2\t{}", package, at + 10).unwrap();
        }
        writeln!(file, "2\t999\t1600002100").unwrap();
        file.flush().unwrap();

        let report = session.import_history(file.path()).unwrap();
        assert_eq!(3, report.packages);
        assert_eq!(6, report.listens);
        assert_eq!(1, report.unknown_keys);
        assert_eq!(3, report.mined);
        assert_eq!(0, report.degenerate);
        assert_eq!(Some(1.0), session.confidence(&[2], &[1]).unwrap());
    }

    #[test]
    fn should_share_a_session_between_threads() {
        let shared = SharedSession::new(year_session(20));
        let writer = shared.clone();
        std::thread::spawn(move || {
            let mut transaction = writer.transaction().unwrap();
            transaction
                .add(100, vec![("year", Value::Number(1960.5))])
                .unwrap();
            transaction.commit();
        })
        .join()
        .unwrap();

        let session = shared.read().unwrap();
        assert_eq!(21, session.len());
        assert!(!session.neighbors(100).unwrap().is_empty());
    }

    #[test]
    fn should_refuse_access_after_a_panicking_commit() {
        let fragile = DistanceFunction::custom(|left: &Value, right: &Value| -> Distance {
            match (left, right) {
                (Value::Number(l), Value::Number(r)) => {
                    if *l < 0.0 || *r < 0.0 {
                        panic!("negative year");
                    }
                    (l - r).abs() / 50.0
                }
                _ => 1.0,
            }
        });
        let mask = AttributeMask::builder()
            .attribute("year", Attribute::new(1.0).with_distance(fragile))
            .build()
            .unwrap();
        let mut session = Session::new("fragile", mask, config()).unwrap();
        let mut transaction = session.transaction();
        for key in 0..10 {
            transaction
                .add(key, vec![("year", Value::Number(key as f64))])
                .unwrap();
        }
        transaction.commit();

        let shared = SharedSession::new(session);
        let writer = shared.clone();
        let outcome = std::thread::spawn(move || {
            let mut transaction = writer.transaction().unwrap();
            transaction
                .add(100, vec![("year", Value::Number(-1.0))])
                .unwrap();
            transaction.commit();
        })
        .join();

        assert!(outcome.is_err());
        assert!(matches!(shared.read(), Err(EngineError::Poisoned(name)) if name == "fragile"));
        assert!(matches!(shared.transaction(), Err(EngineError::Poisoned(_))));
    }

    #[test]
    fn should_recommend_a_rebuild_once_drift_reaches_the_threshold() {
        let mut config = config();
        config.graph.drift_rebuild_threshold = 2;
        let mut session = year_session_with(config, 20);
        assert_eq!(0, session.drift().edits_since_rebuild);

        let first = session
            .add(100, vec![("year", Value::Number(1960.5))])
            .unwrap();
        assert!(first.rebuilt.is_none());
        assert_eq!(1, first.drift.edits_since_rebuild);
        assert!(!first.drift.rebuild_recommended());

        let second = session.remove(5).unwrap();
        assert_eq!(2, second.drift.edits_since_rebuild);
        assert!(second.drift.rebuild_recommended());
        assert!(session.drift().rebuild_recommended());

        session.rebuild();
        assert_eq!(0, session.drift().edits_since_rebuild);
        assert!(!session.drift().rebuild_recommended());
    }

    #[test]
    fn should_rebuild_on_large_batches() {
        let mut config = config();
        config.graph.rebuild_batch_size = 4;
        let mut session = year_session_with(config, 20);

        let mut transaction = session.transaction();
        for key in 100..103 {
            transaction
                .add(key, vec![("year", Value::Number(1900.0 + key as f64 / 2.0))])
                .unwrap();
        }
        let small = transaction.commit();
        assert!(small.rebuilt.is_none());
        assert_eq!(3, small.drift.edits_since_rebuild);

        let mut transaction = session.transaction();
        for key in 200..204 {
            transaction
                .add(key, vec![("year", Value::Number(1890.0 + key as f64 / 2.0))])
                .unwrap();
        }
        let large = transaction.commit();
        assert_eq!(4, large.added);
        assert!(large.rebuilt.is_some());
        assert_eq!(0, large.drift.edits_since_rebuild);
        assert_eq!(27, session.len());
        assert!(session.graph().is_mutual());
    }

    #[test]
    fn should_keep_identical_empty_values_at_zero_distance() {
        let mask = AttributeMask::builder()
            .attribute("genre", Attribute::new(1.0).with_distance(DistanceFunction::GenrePath))
            .attribute("keywords", Attribute::new(1.0).with_distance(DistanceFunction::Keywords))
            .build()
            .unwrap();
        let mut session = Session::new("untagged", mask, config()).unwrap();
        let mut transaction = session.transaction();
        for key in 1..=2 {
            transaction
                .add(
                    key,
                    vec![("genre", Value::Paths(vec![])), ("keywords", Value::Keywords(vec![]))],
                )
                .unwrap();
        }
        transaction
            .add(3, vec![("genre", Value::Paths(vec![vec![190, 1]]))])
            .unwrap();
        transaction.commit();

        assert_eq!(0.0, session.distance(1, 1).unwrap());
        assert_eq!(0.0, session.distance(1, 2).unwrap());
        assert_eq!(1.0, session.distance(1, 3).unwrap());
        assert_eq!(vec![2], session.recommend_from_seed(1, 1).unwrap().keys());
    }
}
