use std::ops::DerefMut;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info};

use crate::distance::{Item, Value};
use crate::error::{EngineError, ItemKey, Result};
use crate::graph::BuildReport;
use crate::session::{GraphDrift, Session};

/// A validated, not yet applied change.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Add { key: ItemKey, item: Item },
    Remove { key: ItemKey },
}

#[derive(Clone, Debug)]
pub struct CommitReport {
    pub added: usize,
    pub removed: usize,
    /// Present when the commit rebuilt the graph from scratch.
    pub rebuilt: Option<BuildReport>,
    pub drift: GraphDrift,
}

/// Batch of mutations against a session.
///
/// Every mutation is validated when it is staged; nothing touches the session
/// until `commit`. Aborting or dropping the transaction discards the batch.
pub struct Transaction<S: DerefMut<Target = Session>> {
    session: S,
    staged: Vec<Mutation>,
    /// Whether a key exists once the staged mutations are applied.
    pending: HashMap<ItemKey, bool>,
    /// Keys added by this transaction and not removed again.
    added: HashSet<ItemKey>,
    finished: bool,
}

impl<S: DerefMut<Target = Session>> Transaction<S> {
    pub(crate) fn new(session: S) -> Self {
        Transaction {
            session,
            staged: Vec::new(),
            pending: HashMap::new(),
            added: HashSet::new(),
            finished: false,
        }
    }

    fn exists(&self, key: ItemKey) -> bool {
        self.pending
            .get(&key)
            .copied()
            .unwrap_or_else(|| self.session.contains(key))
    }

    /// Stage an item. An existing key is replaced on commit.
    pub fn add<I, N>(&mut self, key: ItemKey, attributes: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (N, Value)>,
        N: AsRef<str>,
    {
        if self.added.contains(&key) {
            return Err(EngineError::DuplicateIdentifier(key));
        }
        let item = self.session.mask().prepare(attributes)?;
        self.added.insert(key);
        self.pending.insert(key, true);
        self.staged.push(Mutation::Add { key, item });
        Ok(self)
    }

    pub fn remove(&mut self, key: ItemKey) -> Result<&mut Self> {
        if !self.exists(key) {
            return Err(EngineError::InvalidIdentifier(key));
        }
        self.added.remove(&key);
        self.pending.insert(key, false);
        self.staged.push(Mutation::Remove { key });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Apply every staged mutation and repair or rebuild the graph.
    pub fn commit(mut self) -> CommitReport {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let mutations = staged.len();
        let report = self.session.apply(staged);
        info!(
            session = self.session.name(),
            mutations,
            added = report.added,
            removed = report.removed,
            rebuilt = report.rebuilt.is_some(),
            "transaction committed"
        );
        report
    }

    /// Discard every staged mutation.
    pub fn abort(mut self) {
        self.finished = true;
        debug!(
            session = self.session.name(),
            discarded = self.staged.len(),
            "transaction aborted"
        );
    }
}

impl<S: DerefMut<Target = Session>> Drop for Transaction<S> {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            info!(
                session = self.session.name(),
                discarded = self.staged.len(),
                "transaction dropped without commit, rolled back"
            );
        }
    }
}
