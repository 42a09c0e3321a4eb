use float_cmp::approx_eq;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub mod functions;
pub mod mask;

pub use functions::{Comparator, DistanceFunction};
pub use mask::{Attribute, AttributeMask, AttributeMaskBuilder, Identity, Item, Normalizer};

/// Dissimilarity in `[0.0, 1.0]`, 0.0 meaning identical.
pub type Distance = f64;

pub const MIN_DISTANCE: Distance = 0.0;
pub const MAX_DISTANCE: Distance = 1.0;

/// Contribution of an attribute that only one of the two items defines.
pub const MISSING_PENALTY: Distance = 1.0;

/// An already normalized attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
    /// A set of words, kept sorted and deduplicated.
    Words(Vec<String>),
    /// Taxonomy paths, one per plausible reading (e.g. ambiguous genres).
    Paths(Vec<Vec<u16>>),
    /// Clusters of keywords, each one a word set.
    Keywords(Vec<Vec<String>>),
    /// Numeric feature vector with components in `[0, 1]`.
    Vector(Vec<f64>),
}

impl Value {
    pub fn words<I, S>(words: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Words(sorted_set(words))
    }

    pub fn keywords<I, C, S>(clusters: I) -> Value
    where
        I: IntoIterator<Item = C>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Keywords(clusters.into_iter().map(sorted_set).collect())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

fn sorted_set<I, S>(words: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    words.into_iter().map(Into::into).sorted().dedup().collect()
}

pub fn clamp(distance: Distance) -> Distance {
    if distance.is_nan() {
        MAX_DISTANCE
    } else {
        distance.max(MIN_DISTANCE).min(MAX_DISTANCE)
    }
}

/// Resolve two multi-valued attributes to one distance: the minimum over the
/// cross product of both sides. One empty side is maximally dissimilar, two
/// empty sides are identical.
pub fn single_linkage<T, F>(lefts: &[T], rights: &[T], mut distance: F) -> Distance
where
    F: FnMut(&T, &T) -> Distance,
{
    if lefts.is_empty() && rights.is_empty() {
        return MIN_DISTANCE;
    }
    let mut best = MAX_DISTANCE;
    for (left, right) in lefts.iter().cartesian_product(rights.iter()) {
        best = best.min(clamp(distance(left, right)));
        // Nothing beats an exact match
        if approx_eq!(f64, best, MIN_DISTANCE, ulps = 2) {
            return MIN_DISTANCE;
        }
    }
    best
}

#[cfg(test)]
mod distance_test {
    use super::*;

    #[test]
    fn should_pick_the_closest_pair() {
        let lefts = vec![0.1, 0.9];
        let rights = vec![0.5, 0.85];
        let d = single_linkage(&lefts, &rights, |a: &f64, b: &f64| (a - b).abs());
        assert!(approx_eq!(f64, d, 0.05, epsilon = 1e-9));
    }

    #[test]
    fn should_handle_empty_sides() {
        let empty: Vec<f64> = Vec::new();
        assert_eq!(MAX_DISTANCE, single_linkage(&empty, &[0.3], |a: &f64, b: &f64| (a - b).abs()));
        assert_eq!(MIN_DISTANCE, single_linkage(&empty, &empty, |a: &f64, b: &f64| (a - b).abs()));
    }

    #[test]
    fn should_clamp_out_of_range_values() {
        assert_eq!(MAX_DISTANCE, clamp(421.0));
        assert_eq!(MIN_DISTANCE, clamp(-0.5));
        assert_eq!(MAX_DISTANCE, clamp(f64::NAN));
    }

    #[test]
    fn should_sort_and_dedup_word_sets() {
        assert_eq!(
            Value::Words(vec!["folk".to_string(), "metal".to_string()]),
            Value::words(vec!["metal", "folk", "metal"])
        );
    }
}
