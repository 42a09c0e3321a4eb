use std::cmp::Ordering;

use dary_heap::OctonaryHeap;
use hashbrown::HashSet;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use crate::distance::{AttributeMask, Distance, Item, Value};
use crate::graph::traversal::{breadth_first, rank_by_distance, traverse};
use crate::graph::{ItemId, ItemMetric, Neighbor, SimilarityGraph};
use crate::rules::{ListenHistory, RuleIndex};

/// A recommended item, with its distance from the primary seed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub item: ItemId,
    pub distance: Distance,
    /// The rule derived seed that surfaced this item, if any.
    pub via: Option<ItemId>,
}

/// Read only view of a session's structures needed to answer queries.
pub struct Retrieval<'a> {
    pub mask: &'a AttributeMask,
    pub items: &'a [Option<Item>],
    pub graph: &'a SimilarityGraph,
    pub rules: &'a RuleIndex,
    pub history: &'a ListenHistory,
}

#[derive(PartialEq, Debug)]
struct StreamHead {
    distance: Distance,
    item: ItemId,
    stream: usize,
    position: usize,
}

impl Eq for StreamHead {}

impl Ord for StreamHead {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse order by distance, the heap pops the closest head first
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.item.cmp(&self.item))
            .then_with(|| other.stream.cmp(&self.stream))
    }
}

impl PartialOrd for StreamHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Stream {
    via: Option<ItemId>,
    quota: usize,
    candidates: Vec<Neighbor>,
}

/// Split `total` slots over seeds ordered by rating: one each, the rest in
/// proportion to the ratings, leftovers to the best rated.
fn secondary_quotas(ratings: &[f64], total: usize) -> Vec<usize> {
    let n = ratings.len().min(total);
    if n == 0 {
        return Vec::new();
    }
    let mut quotas = vec![1; n];
    let remaining = total - n;
    let rating_sum: f64 = ratings[..n].iter().map(|r| r.max(0.0)).sum();

    let mut assigned = 0;
    if rating_sum > 0.0 {
        for (quota, rating) in quotas.iter_mut().zip(ratings.iter()) {
            let share = (remaining as f64 * rating.max(0.0) / rating_sum).floor() as usize;
            *quota += share;
            assigned += share;
        }
    }
    for index in (0..n).cycle().take(remaining.saturating_sub(assigned)) {
        quotas[index] += 1;
    }
    quotas
}

impl<'a> Retrieval<'a> {
    fn metric(&self) -> ItemMetric<'_> {
        ItemMetric {
            mask: self.mask,
            items: self.items,
        }
    }

    fn is_live(&self, id: ItemId) -> bool {
        matches!(self.items.get(id as usize), Some(Some(_)))
    }

    fn live_ids(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_some())
            .map(|(id, _)| id as ItemId)
            .collect()
    }

    /// Items on the other side of every rule mentioning `seed`, best rated first.
    pub fn secondary_seeds(&self, seed: ItemId, exclude: &HashSet<ItemId>) -> Vec<(ItemId, f64)> {
        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut seeds = Vec::new();
        for rule in self.rules.lookup(seed) {
            for other in rule.other_side(seed).unwrap_or_default() {
                if *other != seed
                    && !exclude.contains(other)
                    && self.is_live(*other)
                    && seen.insert(*other)
                {
                    seeds.push((*other, rule.rating));
                }
            }
        }
        seeds
    }

    /// Up to `k` items close to `seed`, blending graph neighbors of the seed with
    /// neighbors of rule derived seeds. Sorted by distance from `seed`.
    pub fn from_seed(&self, seed: ItemId, k: usize, exclude: &HashSet<ItemId>) -> Vec<Candidate> {
        if k == 0 || !self.is_live(seed) {
            return Vec::new();
        }
        let metric = self.metric();
        let mut exclude = exclude.clone();
        exclude.insert(seed);

        let secondary = self.secondary_seeds(seed, &exclude);
        let ratings: Vec<f64> = secondary.iter().map(|(_, rating)| *rating).collect();
        let quotas = secondary_quotas(&ratings, k / 2);
        let primary_quota = k - quotas.iter().sum::<usize>();

        let mut streams = vec![Stream {
            via: None,
            quota: primary_quota,
            candidates: traverse(self.graph, seed, k, &exclude, &metric),
        }];
        for ((secondary_seed, _), quota) in secondary.iter().zip(quotas.into_iter()) {
            let mut reachable = exclude.clone();
            reachable.insert(*secondary_seed);
            let mut ids = vec![*secondary_seed];
            ids.extend(breadth_first(self.graph, *secondary_seed, k, &reachable));
            streams.push(Stream {
                via: Some(*secondary_seed),
                quota,
                candidates: rank_by_distance(self.graph, seed, &ids, &metric),
            });
        }

        merge(streams, k)
    }

    /// Seed from the best rule, the most played item or a random item, in that order.
    pub fn heuristic_seed<R: Rng>(&self, rng: &mut R) -> Option<ItemId> {
        if let Some(rule) = self.rules.best() {
            if let Some(first) = rule.antecedent.iter().find(|id| self.is_live(**id)) {
                return Some(*first);
            }
        }
        if let Some(most_played) = self.history.most_played().filter(|id| self.is_live(*id)) {
            return Some(most_played);
        }
        self.live_ids().choose(rng).copied()
    }

    /// The item matching most of the given attribute values exactly, ties by the
    /// lowest aggregate distance and then by the lowest id.
    pub fn attribute_seed(&self, subset: &[(usize, Value)]) -> Option<ItemId> {
        self.items
            .par_iter()
            .enumerate()
            .filter_map(|(id, item)| {
                let item = item.as_ref()?;
                let aggregate = self.mask.partial_distance(item, subset)?;
                let matches = subset
                    .iter()
                    .filter(|(slot, value)| item.values()[*slot].as_ref() == Some(value))
                    .count();
                Some((matches, aggregate, id as ItemId))
            })
            .min_by(|(ma, da, ia), (mb, db, ib)| {
                mb.cmp(ma).then_with(|| da.total_cmp(db)).then_with(|| ia.cmp(ib))
            })
            .map(|(_, _, id)| id)
    }
}

/// k-way merge of the streams honoring quotas, topped up by distance.
fn merge(streams: Vec<Stream>, k: usize) -> Vec<Candidate> {
    let mut heap = OctonaryHeap::with_capacity(streams.len());
    for (index, stream) in streams.iter().enumerate() {
        if let Some(head) = stream.candidates.first() {
            heap.push(StreamHead {
                distance: head.distance,
                item: head.id,
                stream: index,
                position: 0,
            });
        }
    }

    let mut remaining: Vec<usize> = streams.iter().map(|stream| stream.quota).collect();
    let mut taken: HashSet<ItemId> = HashSet::with_capacity(k);
    let mut result: Vec<Candidate> = Vec::with_capacity(k);
    let mut spill: Vec<Candidate> = Vec::new();

    while let Some(head) = heap.pop() {
        if result.len() == k {
            break;
        }
        let stream = &streams[head.stream];
        let candidate = Candidate {
            item: head.item,
            distance: head.distance,
            via: stream.via,
        };
        if !taken.contains(&candidate.item) {
            if remaining[head.stream] > 0 {
                remaining[head.stream] -= 1;
                taken.insert(candidate.item);
                result.push(candidate);
            } else {
                spill.push(candidate);
            }
        }

        if let Some(next) = stream.candidates.get(head.position + 1) {
            heap.push(StreamHead {
                distance: next.distance,
                item: next.id,
                stream: head.stream,
                position: head.position + 1,
            });
        }
    }

    // spill is already in distance order
    for candidate in spill {
        if result.len() == k {
            break;
        }
        if taken.insert(candidate.item) {
            result.push(candidate);
        }
    }

    result.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.item.cmp(&b.item)));
    result
}

#[cfg(test)]
mod retrieval_test {
    use chrono::Utc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::distance::{Attribute, DistanceFunction};

    fn neighbor(id: ItemId, distance: Distance) -> Neighbor {
        Neighbor::new(id, distance)
    }

    #[test]
    fn should_split_secondary_quotas_by_rating() {
        assert_eq!(vec![3, 2], secondary_quotas(&[0.9, 0.6], 5));
        assert_eq!(vec![1, 1], secondary_quotas(&[0.9, 0.1], 2));
        assert_eq!(vec![1, 1], secondary_quotas(&[0.9, 0.8, 0.7], 2));
        assert_eq!(vec![2, 1], secondary_quotas(&[0.0, 0.0], 3));
        assert!(secondary_quotas(&[0.5], 0).is_empty());
        assert_eq!(10, secondary_quotas(&[0.7, 0.2, 0.1], 10).iter().sum::<usize>());
    }

    #[test]
    fn should_merge_streams_with_quotas() {
        let streams = vec![
            Stream {
                via: None,
                quota: 2,
                candidates: vec![neighbor(1, 0.1), neighbor(2, 0.2), neighbor(3, 0.3)],
            },
            Stream {
                via: Some(9),
                quota: 1,
                candidates: vec![neighbor(2, 0.2), neighbor(9, 0.5), neighbor(4, 0.6)],
            },
        ];
        let merged = merge(streams, 4);
        let items: Vec<ItemId> = merged.iter().map(|c| c.item).collect();
        assert_eq!(vec![1, 2, 3, 9], items);
        assert!(merged.windows(2).all(|pair| pair[0].distance <= pair[1].distance));
        assert_eq!(Some(9), merged[3].via);
    }

    #[test]
    fn should_top_up_from_exhausted_quotas() {
        let streams = vec![Stream {
            via: None,
            quota: 1,
            candidates: vec![neighbor(1, 0.1), neighbor(2, 0.2), neighbor(3, 0.3)],
        }];
        let items: Vec<ItemId> = merge(streams, 3).iter().map(|c| c.item).collect();
        assert_eq!(vec![1, 2, 3], items);
    }

    fn mask() -> AttributeMask {
        AttributeMask::builder()
            .attribute("genre", Attribute::new(1.0).with_distance(DistanceFunction::Exact))
            .attribute(
                "rating",
                Attribute::new(0.5).with_distance(DistanceFunction::Numeric { min: 0.0, max: 5.0 }),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn should_pick_seeds() {
        let mask = mask();
        let items: Vec<Option<Item>> = vec![
            Some(mask.prepare(vec![("genre", Value::from("rock")), ("rating", Value::Number(2.0))]).unwrap()),
            None,
            Some(mask.prepare(vec![("genre", Value::from("rock")), ("rating", Value::Number(4.0))]).unwrap()),
            Some(mask.prepare(vec![("genre", Value::from("jazz")), ("rating", Value::Number(5.0))]).unwrap()),
        ];
        let config = EngineConfig::default();
        let graph = SimilarityGraph::new(config.graph.max_neighbors);
        let mut rules = RuleIndex::new(&config.rules);
        let mut history = ListenHistory::new(&config.history);
        let retrieval = Retrieval {
            mask: &mask,
            items: &items,
            graph: &graph,
            rules: &rules,
            history: &history,
        };

        let subset = mask
            .resolve(vec![("genre", Value::from("rock")), ("rating", Value::Number(3.9))])
            .unwrap();
        assert_eq!(Some(2), retrieval.attribute_seed(&subset));
        let nothing = mask.resolve(vec![("genre", Value::from("pop"))]).unwrap();
        assert_eq!(Some(0), retrieval.attribute_seed(&nothing));

        let mut rng = rand::thread_rng();
        let random = retrieval.heuristic_seed(&mut rng).unwrap();
        assert_ne!(1, random);

        history.feed(3, Utc::now());
        history.feed(3, Utc::now());
        history.feed(0, Utc::now());
        let retrieval = Retrieval {
            mask: &mask,
            items: &items,
            graph: &graph,
            rules: &rules,
            history: &history,
        };
        assert_eq!(Some(3), retrieval.heuristic_seed(&mut rng));

        rules.insert_package(&[2, 0], Utc::now());
        rules.insert_package(&[2, 0], Utc::now());
        let retrieval = Retrieval {
            mask: &mask,
            items: &items,
            graph: &graph,
            rules: &rules,
            history: &history,
        };
        assert_eq!(Some(0), retrieval.heuristic_seed(&mut rng));
    }
}
