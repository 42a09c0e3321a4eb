//! Content based music similarity.
//!
//! Items are described by attributes declared in an [`AttributeMask`]. A
//! [`Session`] keeps a bounded, mutual nearest neighbor graph over its items and
//! answers similarity queries from it, optionally steered by association rules
//! mined from the listening history.

pub mod config;
mod config_processors;
pub mod distance;
pub mod error;
pub mod graph;
pub mod io;
pub mod retrieval;
pub mod rules;
pub mod session;
pub mod stopwatch;

pub use config::EngineConfig;
pub use distance::{Attribute, AttributeMask, Distance, DistanceFunction, Value};
pub use error::{EngineError, ItemKey, Result};
pub use rules::{PackageOutcome, RatingPolicy, Rule};
pub use session::{
    CommitReport, Explanation, GraphDrift, ImportReport, KeyedRule, Recommendation,
    Recommendations, Session, SharedSession, Transaction,
};
