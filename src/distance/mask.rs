use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::distance::{Distance, DistanceFunction, Value, MISSING_PENALTY};
use crate::error::{EngineError, Result};

/// Turns a raw attribute value into the normalized form its distance function expects.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: Value) -> Value;
}

impl<F> Normalizer for F
where
    F: Fn(Value) -> Value + Send + Sync,
{
    fn normalize(&self, raw: Value) -> Value {
        self(raw)
    }
}

/// Passes values through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Normalizer for Identity {
    fn normalize(&self, raw: Value) -> Value {
        raw
    }
}

/// Declaration of a single attribute: normalizer, distance function and weight.
#[derive(Clone)]
pub struct Attribute {
    normalizer: Option<Arc<dyn Normalizer>>,
    distance: Option<DistanceFunction>,
    weight: f64,
}

impl Attribute {
    pub fn new(weight: f64) -> Self {
        Attribute {
            normalizer: None,
            distance: None,
            weight,
        }
    }

    pub fn with_distance(mut self, distance: DistanceFunction) -> Self {
        self.distance = Some(distance);
        self
    }

    pub fn with_normalizer<N: Normalizer + 'static>(mut self, normalizer: N) -> Self {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }
}

#[derive(Default)]
pub struct AttributeMaskBuilder {
    attributes: Vec<(String, Attribute)>,
}

impl AttributeMaskBuilder {
    pub fn attribute<S: Into<String>>(mut self, name: S, attribute: Attribute) -> Self {
        self.attributes.push((name.into(), attribute));
        self
    }

    /// Validate the declarations and resolve them into dense slots.
    pub fn build(self) -> Result<AttributeMask> {
        if self.attributes.is_empty() {
            return Err(EngineError::Configuration(
                "the attribute mask declares no attributes".to_string(),
            ));
        }

        let mut attributes = self.attributes;
        attributes.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut index = HashMap::with_capacity(attributes.len());
        let mut keys = Vec::with_capacity(attributes.len());
        let mut slots = Vec::with_capacity(attributes.len());
        for (name, attribute) in attributes.into_iter() {
            if index.contains_key(&name) {
                return Err(EngineError::Configuration(format!(
                    "attribute `{}` is declared twice",
                    name
                )));
            }
            if !attribute.weight.is_finite() || attribute.weight < 0.0 {
                return Err(EngineError::Configuration(format!(
                    "attribute `{}` has an invalid weight {}",
                    name, attribute.weight
                )));
            }
            let distance = attribute.distance.ok_or_else(|| {
                EngineError::Configuration(format!("attribute `{}` has no distance function", name))
            })?;
            let normalizer = attribute
                .normalizer
                .unwrap_or_else(|| Arc::new(Identity) as Arc<dyn Normalizer>);

            index.insert(name.clone(), slots.len());
            keys.push(name);
            slots.push(Slot {
                normalizer,
                distance,
                weight: attribute.weight,
            });
        }

        if slots.iter().all(|slot| slot.weight == 0.0) {
            return Err(EngineError::Configuration(
                "all attribute weights are zero".to_string(),
            ));
        }

        Ok(AttributeMask { keys, index, slots })
    }
}

struct Slot {
    normalizer: Arc<dyn Normalizer>,
    distance: DistanceFunction,
    weight: f64,
}

/// The validated attribute declarations of a session, sorted by name.
pub struct AttributeMask {
    keys: Vec<String>,
    index: HashMap<String, usize>,
    slots: Vec<Slot>,
}

impl fmt::Debug for AttributeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.keys
                    .iter()
                    .zip(self.slots.iter())
                    .map(|(key, slot)| (key, (&slot.distance, slot.weight))),
            )
            .finish()
    }
}

/// Attribute values of an item, one optional value per mask slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    values: Vec<Option<Value>>,
}

impl Item {
    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    pub(crate) fn from_values(values: Vec<Option<Value>>) -> Self {
        Item { values }
    }
}

impl AttributeMask {
    pub fn builder() -> AttributeMaskBuilder {
        AttributeMaskBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn slot(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn weight(&self, key: &str) -> Option<f64> {
        self.slot(key).map(|slot| self.slots[slot].weight)
    }

    /// Normalize a raw attribute assignment into an item.
    pub fn prepare<I, S>(&self, attributes: I) -> Result<Item>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        let mut values = vec![None; self.slots.len()];
        for (slot, value) in self.resolve(attributes)? {
            values[slot] = Some(value);
        }
        Ok(Item { values })
    }

    /// Map attribute names to slots and normalize their values.
    pub fn resolve<I, S>(&self, attributes: I) -> Result<Vec<(usize, Value)>>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        attributes
            .into_iter()
            .map(|(name, raw)| {
                let name = name.as_ref();
                let slot = self
                    .slot(name)
                    .ok_or_else(|| EngineError::UnknownAttribute(name.to_string()))?;
                Ok((slot, self.slots[slot].normalizer.normalize(raw)))
            })
            .collect()
    }

    /// Weighted distance of two items. Attributes defined by only one side
    /// contribute the full penalty, attributes defined by neither are skipped.
    pub fn distance(&self, left: &Item, right: &Item) -> Distance {
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for (slot, (l, r)) in self
            .slots
            .iter()
            .zip(left.values.iter().zip(right.values.iter()))
        {
            let partial = match (l, r) {
                (Some(l), Some(r)) => slot.distance.compare(l, r),
                (Some(_), None) | (None, Some(_)) => MISSING_PENALTY,
                (None, None) => continue,
            };
            weighted_sum += slot.weight * partial;
            weight_sum += slot.weight;
        }

        if weight_sum > 0.0 {
            crate::distance::clamp(weighted_sum / weight_sum)
        } else {
            0.0
        }
    }

    /// Per attribute partial distances of two items, best first.
    pub fn explain(&self, left: &Item, right: &Item) -> Vec<(String, Distance)> {
        let mut reasons: Vec<(String, Distance)> = self
            .keys
            .iter()
            .zip(self.slots.iter())
            .zip(left.values.iter().zip(right.values.iter()))
            .filter_map(|((key, slot), (l, r))| match (l, r) {
                (Some(l), Some(r)) => Some((key.clone(), slot.distance.compare(l, r))),
                (Some(_), None) | (None, Some(_)) => Some((key.clone(), MISSING_PENALTY)),
                (None, None) => None,
            })
            .collect();
        reasons.sort_by(|(ka, a), (kb, b)| a.total_cmp(b).then_with(|| ka.cmp(kb)));
        reasons
    }

    /// Distance over the given slots only; slots the item does not define are ignored.
    pub(crate) fn partial_distance(&self, item: &Item, subset: &[(usize, Value)]) -> Option<Distance> {
        let mut sum = 0.0;
        let mut defined = false;
        for (slot, value) in subset {
            if let Some(own) = &item.values[*slot] {
                sum += self.slots[*slot].weight * self.slots[*slot].distance.compare(own, value);
                defined = true;
            }
        }
        if defined {
            Some(sum)
        } else {
            None
        }
    }
}
