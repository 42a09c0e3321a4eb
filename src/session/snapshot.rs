use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::distance::AttributeMask;
use crate::error::{EngineError, Result};
use crate::graph::{DistanceStats, SimilarityGraph};
use crate::rules::{ListenHistory, RuleIndex};
use crate::session::store::{IdMapping, ItemStore};
use crate::session::Session;

const SNAPSHOT_VERSION: u32 = 1;

// Both structs must keep the same field order, bincode is positional.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    attributes: Vec<&'a str>,
    store: &'a ItemStore,
    ids: &'a IdMapping,
    graph: &'a SimilarityGraph,
    rules: &'a RuleIndex,
    history: &'a ListenHistory,
    stats: &'a DistanceStats,
    edits_since_rebuild: usize,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    attributes: Vec<String>,
    store: ItemStore,
    ids: IdMapping,
    graph: SimilarityGraph,
    rules: RuleIndex,
    history: ListenHistory,
    stats: DistanceStats,
    edits_since_rebuild: usize,
}

impl Session {
    /// Serialize items, id mapping, graph, rules and history.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            attributes: self.mask.keys().iter().map(String::as_str).collect(),
            store: &self.store,
            ids: &self.ids,
            graph: &self.graph,
            rules: &self.rules,
            history: &self.history,
            stats: &self.stats,
            edits_since_rebuild: self.drift.edits_since_rebuild,
        };
        let bytes = bincode::serialize(&snapshot)?;
        info!(session = %self.name, items = self.len(), bytes = bytes.len(), "session snapshot taken");
        Ok(bytes)
    }

    /// Recreate a session from `snapshot`. The mask must declare the same
    /// attribute keys the snapshot was taken with.
    pub fn restore<S: Into<String>>(
        name: S,
        mask: AttributeMask,
        config: EngineConfig,
        bytes: &[u8],
    ) -> Result<Session> {
        let snapshot: Snapshot = bincode::deserialize(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Configuration(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.attributes.as_slice() != mask.keys() {
            return Err(EngineError::Configuration(format!(
                "snapshot attributes {:?} do not match the mask {:?}",
                snapshot.attributes,
                mask.keys()
            )));
        }

        let mut session = Session::new(name, mask, config)?;
        session.store = snapshot.store;
        session.ids = snapshot.ids;
        session.graph = snapshot.graph;
        session.rules = snapshot.rules;
        session.rules.set_config(&session.config.rules);
        session.history = snapshot.history;
        session.stats = snapshot.stats;
        session.drift.edits_since_rebuild = snapshot.edits_since_rebuild;

        if session.graph.capacity() != session.config.graph.max_neighbors {
            warn!(
                session = %session.name,
                stored = session.graph.capacity(),
                configured = session.config.graph.max_neighbors,
                "neighbor capacity changed, rebuilding the similarity graph"
            );
            session.graph = SimilarityGraph::new(session.config.graph.max_neighbors);
            if !session.store.is_empty() {
                session.rebuild();
            }
        }
        info!(session = %session.name, items = session.len(), rules = session.rules.len(), "session restored");
        Ok(session)
    }
}

#[cfg(test)]
mod snapshot_test {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::distance::{Attribute, DistanceFunction, Value};

    fn mask(name: &str) -> AttributeMask {
        AttributeMask::builder()
            .attribute(
                name,
                Attribute::new(1.0).with_distance(DistanceFunction::Numeric { min: 0.0, max: 100.0 }),
            )
            .build()
            .unwrap()
    }

    fn config(max_neighbors: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workers.num_workers = 2;
        config.graph.max_neighbors = max_neighbors;
        config.history.package_size = 2;
        config
    }

    fn session() -> Session {
        let mut session = Session::new("snapshots", mask("bpm"), config(4)).unwrap();
        let mut transaction = session.transaction();
        for key in 0..30 {
            transaction
                .add(key, vec![("bpm", Value::Number(key as f64 * 3.0))])
                .unwrap();
        }
        transaction.commit();

        let start = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        for round in 0..3 {
            let at = start + Duration::seconds(round * 60);
            session.feed_history_at(4, at).unwrap();
            session.feed_history_at(5, at + Duration::seconds(5)).unwrap();
        }
        session
    }

    #[test]
    fn should_restore_a_session_from_its_snapshot() {
        let original = session();
        let bytes = original.snapshot().unwrap();

        let restored = Session::restore("restored", mask("bpm"), config(4), &bytes).unwrap();
        assert_eq!(original.len(), restored.len());
        for key in 0..30 {
            assert_eq!(original.neighbors(key).unwrap(), restored.neighbors(key).unwrap());
        }
        assert_eq!(original.rules(), restored.rules());
        assert_eq!(3, restored.playcount(4).unwrap());
        assert_eq!(
            original.recommend_from_seed(10, 5).unwrap(),
            restored.recommend_from_seed(10, 5).unwrap()
        );
    }

    #[test]
    fn should_rebuild_when_the_neighbor_capacity_changed() {
        let bytes = session().snapshot().unwrap();
        let restored = Session::restore("wider", mask("bpm"), config(8), &bytes).unwrap();
        assert_eq!(8, restored.graph().capacity());
        assert!(restored.graph().is_mutual());
        assert_eq!(0, restored.drift().edits_since_rebuild);
    }

    #[test]
    fn should_refuse_a_mismatching_mask() {
        let bytes = session().snapshot().unwrap();
        assert!(matches!(
            Session::restore("tempo", mask("tempo"), config(4), &bytes),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn should_report_corrupt_snapshots() {
        assert!(matches!(
            Session::restore("corrupt", mask("bpm"), config(4), &[1, 2, 3]),
            Err(EngineError::Snapshot(_))
        ));
    }
}
