use std::fmt;
use std::sync::Arc;

use crate::distance::{clamp, single_linkage, Distance, Value, MAX_DISTANCE, MIN_DISTANCE};

/// Caller supplied distance capability.
///
/// Implementations must be symmetric and return 0.0 for equal inputs.
pub trait Comparator: Send + Sync {
    fn compare(&self, left: &Value, right: &Value) -> Distance;
}

impl<F> Comparator for F
where
    F: Fn(&Value, &Value) -> Distance + Send + Sync,
{
    fn compare(&self, left: &Value, right: &Value) -> Distance {
        self(left, right)
    }
}

/// Distance function of one attribute, resolved once when the mask is built.
#[derive(Clone)]
pub enum DistanceFunction {
    /// 0.0 on equality, 1.0 otherwise.
    Exact,
    /// Absolute difference scaled by the value range (years, ratings, bpm).
    Numeric { min: f64, max: f64 },
    /// Taxonomy paths compared by their common prefix.
    GenrePath,
    /// Overlap of two word sets.
    WordSet,
    /// Best matching pair of keyword clusters.
    Keywords,
    /// Normalized edit distance of two texts.
    Levenshtein,
    /// Root mean square difference of two feature vectors.
    Vector,
    Custom(Arc<dyn Comparator>),
}

impl fmt::Debug for DistanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceFunction::Exact => write!(f, "Exact"),
            DistanceFunction::Numeric { min, max } => write!(f, "Numeric({}..{})", min, max),
            DistanceFunction::GenrePath => write!(f, "GenrePath"),
            DistanceFunction::WordSet => write!(f, "WordSet"),
            DistanceFunction::Keywords => write!(f, "Keywords"),
            DistanceFunction::Levenshtein => write!(f, "Levenshtein"),
            DistanceFunction::Vector => write!(f, "Vector"),
            DistanceFunction::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl DistanceFunction {
    pub fn custom<C: Comparator + 'static>(comparator: C) -> Self {
        DistanceFunction::Custom(Arc::new(comparator))
    }

    pub fn compare(&self, left: &Value, right: &Value) -> Distance {
        if left == right {
            return MIN_DISTANCE;
        }
        let distance = match self {
            DistanceFunction::Exact => exact(left, right),
            DistanceFunction::Numeric { min, max } => match (left, right) {
                (Value::Number(l), Value::Number(r)) => numeric(*l, *r, *min, *max),
                _ => MAX_DISTANCE,
            },
            DistanceFunction::GenrePath => match (left, right) {
                (Value::Paths(l), Value::Paths(r)) => {
                    single_linkage(l, r, |a, b| compare_single_path(a, b))
                }
                _ => MAX_DISTANCE,
            },
            DistanceFunction::WordSet => match (left, right) {
                (Value::Words(l), Value::Words(r)) => word_overlap(l, r),
                _ => MAX_DISTANCE,
            },
            DistanceFunction::Keywords => match (left, right) {
                (Value::Keywords(l), Value::Keywords(r)) => {
                    single_linkage(l, r, |a, b| word_overlap(a, b))
                }
                _ => MAX_DISTANCE,
            },
            DistanceFunction::Levenshtein => match (left, right) {
                (Value::Text(l), Value::Text(r)) => normalized_levenshtein(l, r),
                (Value::Words(l), Value::Words(r)) => {
                    single_linkage(l, r, |a, b| normalized_levenshtein(a, b))
                }
                _ => MAX_DISTANCE,
            },
            DistanceFunction::Vector => match (left, right) {
                (Value::Vector(l), Value::Vector(r)) => root_mean_square(l, r),
                _ => MAX_DISTANCE,
            },
            DistanceFunction::Custom(comparator) => comparator.compare(left, right),
        };
        clamp(distance)
    }
}

fn exact(left: &Value, right: &Value) -> Distance {
    if left == right {
        MIN_DISTANCE
    } else {
        MAX_DISTANCE
    }
}

fn numeric(left: f64, right: f64, min: f64, max: f64) -> Distance {
    let range = max - min;
    if range <= 0.0 {
        return exact(&Value::Number(left), &Value::Number(right));
    }
    let left = left.max(min).min(max);
    let right = right.max(min).min(max);
    (left - right).abs() / range
}

/// Ratio of the common path prefix to the longer path, inverted.
pub fn compare_single_path(left: &[u16], right: &[u16]) -> Distance {
    let common = left
        .iter()
        .zip(right.iter())
        .take_while(|(l, r)| l == r)
        .count();
    let longest = left.len().max(right.len());
    if longest == 0 {
        return MIN_DISTANCE;
    }
    1.0 - common as f64 / longest as f64
}

pub fn word_overlap(left: &[String], right: &[String]) -> Distance {
    let longest = left.len().max(right.len());
    if longest == 0 {
        return MIN_DISTANCE;
    }
    // both sides are sorted sets
    let mut common = 0;
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        match left[i].cmp(&right[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                common += 1;
                i += 1;
                j += 1;
            }
        }
    }
    1.0 - common as f64 / longest as f64
}

/// Edit distance scaled by the longer text, counted in chars.
pub fn normalized_levenshtein(left: &str, right: &str) -> Distance {
    1.0 - strsim::normalized_levenshtein(left, right)
}

fn root_mean_square(left: &[f64], right: &[f64]) -> Distance {
    if left.len() != right.len() {
        return MAX_DISTANCE;
    }
    if left.is_empty() {
        return MIN_DISTANCE;
    }
    let sum: f64 = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| (l - r) * (l - r))
        .sum();
    (sum / left.len() as f64).sqrt()
}
