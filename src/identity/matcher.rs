use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

use super::clusterer::species_key;
use crate::config::MatcherConfig;
use crate::vectors::{EntityKind, VectorIndexManager};

/// Identity currently attached to a neighbor detection.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborIdentity {
    pub identity_id: i64,
    pub locked: bool,
    /// Species of the identity, pets only.
    pub species: Option<String>,
}

pub trait NeighborLookup {
    /// Identity of a detection, or `None` if it has none.
    fn neighbor_identity(&self, kind: EntityKind, detection_id: i64) -> Result<Option<NeighborIdentity>>;
}

/// Winning identity for a fresh embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub identity_id: i64,
    /// `match_count * mean_similarity`
    pub score: f32,
    pub match_count: usize,
    pub mean_similarity: f32,
}

/// What is being matched.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    pub kind: EntityKind,
    pub embedding: &'a [f32],
    /// Detection the embedding belongs to, excluded from its own neighbors.
    pub detection_id: Option<i64>,
    /// Pets only; neighbors of another species are ignored.
    pub species: Option<&'a str>,
}

/// Assigns a single new embedding to a known identity by nearest-neighbor
/// vote, without a clustering pass.
pub struct OnlineMatcher<'a> {
    config: &'a MatcherConfig,
}

impl<'a> OnlineMatcher<'a> {
    pub fn new(config: &'a MatcherConfig) -> Self {
        Self { config }
    }

    /// Best identity for `query`, or `None` when no neighbor clears the
    /// similarity threshold.
    pub fn match_identity(
        &self,
        index: &VectorIndexManager,
        lookup: &dyn NeighborLookup,
        query: MatchQuery<'_>,
    ) -> Result<Option<MatchOutcome>> {
        let k = self.config.k + usize::from(query.detection_id.is_some());
        let hits = index.search(query.kind, query.embedding, k)?;

        // identity -> (matches, similarity sum)
        let mut votes: HashMap<i64, (usize, f32)> = HashMap::new();
        for hit in hits {
            if Some(hit.entity_id) == query.detection_id {
                continue;
            }
            if hit.similarity < self.config.similarity_threshold {
                continue;
            }
            let Some(neighbor) = lookup.neighbor_identity(query.kind, hit.entity_id)? else {
                continue;
            };
            if neighbor.locked && !self.config.use_locked_neighbors {
                continue;
            }
            // Same buckets as clustering: trimmed, lowercased, unknown when unset.
            if query.kind == EntityKind::Pet
                && species_key(query.species) != species_key(neighbor.species.as_deref())
            {
                continue;
            }

            let entry = votes.entry(neighbor.identity_id).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += hit.similarity;
        }

        let best = votes
            .into_iter()
            .filter(|(_, (count, _))| *count >= self.config.min_matches.max(1))
            .map(|(identity_id, (count, sum))| {
                let mean = sum / count as f32;
                MatchOutcome {
                    identity_id,
                    score: count as f32 * mean,
                    match_count: count,
                    mean_similarity: mean,
                }
            })
            .max_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then(a.match_count.cmp(&b.match_count))
                    .then(b.identity_id.cmp(&a.identity_id))
            });

        match &best {
            Some(m) => debug!(
                "Matched {} {:?} to identity {} ({} matches, mean {:.3})",
                query.kind, query.detection_id, m.identity_id, m.match_count, m.mean_similarity
            ),
            None => debug!("No identity match for {} {:?}", query.kind, query.detection_id),
        }

        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::vectors::Metric;

    struct Lookup(HashMap<i64, NeighborIdentity>);

    impl NeighborLookup for Lookup {
        fn neighbor_identity(&self, _kind: EntityKind, detection_id: i64) -> Result<Option<NeighborIdentity>> {
            Ok(self.0.get(&detection_id).cloned())
        }
    }

    fn identity(identity_id: i64) -> NeighborIdentity {
        NeighborIdentity {
            identity_id,
            locked: false,
            species: None,
        }
    }

    /// Unit vector whose cosine with [1, 0] is `similarity`.
    fn at(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).sqrt()]
    }

    fn index(entries: &[(i64, Vec<f32>)]) -> (tempfile::TempDir, VectorIndexManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = VectorIndexManager::new(IndexConfig {
            directory: dir.path().to_path_buf(),
            face_dimension: 2,
            pet_dimension: 2,
            image_dimension: 2,
            ..IndexConfig::default()
        });
        manager.create(EntityKind::Face, 2, Metric::Cosine);
        manager.create(EntityKind::Pet, 2, Metric::Cosine);
        let ids: Vec<i64> = entries.iter().map(|(id, _)| *id).collect();
        let vectors: Vec<Vec<f32>> = entries.iter().map(|(_, v)| v.clone()).collect();
        manager.add(EntityKind::Face, &vectors, &ids).unwrap();
        manager.add(EntityKind::Pet, &vectors, &ids).unwrap();
        (dir, manager)
    }

    fn query(kind: EntityKind, embedding: &[f32]) -> MatchQuery<'_> {
        MatchQuery {
            kind,
            embedding,
            detection_id: None,
            species: None,
        }
    }

    #[test]
    fn test_majority_identity_wins() {
        let (_dir, manager) = index(&[
            (1, at(0.82)),
            (2, at(0.82)),
            (3, at(0.82)),
            (4, at(0.71)),
        ]);
        let lookup = Lookup(
            [(1, identity(10)), (2, identity(10)), (3, identity(10)), (4, identity(20))]
                .into_iter()
                .collect(),
        );
        let config = MatcherConfig::default();

        let outcome = OnlineMatcher::new(&config)
            .match_identity(&manager, &lookup, query(EntityKind::Face, &[1.0, 0.0]))
            .unwrap()
            .unwrap();

        assert_eq!(outcome.identity_id, 10);
        assert_eq!(outcome.match_count, 3);
        assert!((outcome.mean_similarity - 0.82).abs() < 1e-3);
    }

    #[test]
    fn test_below_threshold_is_no_match() {
        let (_dir, manager) = index(&[(1, at(0.6)), (2, at(0.5))]);
        let lookup = Lookup([(1, identity(10)), (2, identity(10))].into_iter().collect());
        let config = MatcherConfig::default();

        let outcome = OnlineMatcher::new(&config)
            .match_identity(&manager, &lookup, query(EntityKind::Face, &[1.0, 0.0]))
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_unassigned_neighbors_and_self_are_ignored() {
        let (_dir, manager) = index(&[(1, at(1.0)), (2, at(0.9)), (3, at(0.8))]);
        let lookup = Lookup([(1, identity(10)), (3, identity(30))].into_iter().collect());
        let config = MatcherConfig::default();

        let outcome = OnlineMatcher::new(&config)
            .match_identity(
                &manager,
                &lookup,
                MatchQuery {
                    detection_id: Some(1),
                    ..query(EntityKind::Face, &[1.0, 0.0])
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(outcome.identity_id, 30);
    }

    #[test]
    fn test_min_matches_and_locked_neighbors() {
        let (_dir, manager) = index(&[(1, at(0.9)), (2, at(0.88))]);
        let mut locked = identity(10);
        locked.locked = true;
        let lookup = Lookup([(1, locked.clone()), (2, locked)].into_iter().collect());

        let config = MatcherConfig::default();
        assert!(OnlineMatcher::new(&config)
            .match_identity(&manager, &lookup, query(EntityKind::Face, &[1.0, 0.0]))
            .unwrap()
            .is_some());

        let strict = MatcherConfig {
            use_locked_neighbors: false,
            ..MatcherConfig::default()
        };
        assert!(OnlineMatcher::new(&strict)
            .match_identity(&manager, &lookup, query(EntityKind::Face, &[1.0, 0.0]))
            .unwrap()
            .is_none());

        let needs_three = MatcherConfig {
            min_matches: 3,
            ..MatcherConfig::default()
        };
        assert!(OnlineMatcher::new(&needs_three)
            .match_identity(&manager, &lookup, query(EntityKind::Face, &[1.0, 0.0]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_pet_species_must_agree() {
        let (_dir, manager) = index(&[(1, at(0.95)), (2, at(0.75))]);
        let lookup = Lookup(
            [
                (
                    1,
                    NeighborIdentity {
                        identity_id: 10,
                        locked: false,
                        species: Some("cat".into()),
                    },
                ),
                (
                    2,
                    NeighborIdentity {
                        identity_id: 20,
                        locked: false,
                        species: Some("dog".into()),
                    },
                ),
            ]
            .into_iter()
            .collect(),
        );
        let config = MatcherConfig::default();

        let outcome = OnlineMatcher::new(&config)
            .match_identity(
                &manager,
                &lookup,
                MatchQuery {
                    species: Some("Dog"),
                    ..query(EntityKind::Pet, &[1.0, 0.0])
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(outcome.identity_id, 20);
    }

    #[test]
    fn test_pet_species_buckets_match_clustering() {
        let (_dir, manager) = index(&[(1, at(0.95)), (2, at(0.9)), (3, at(0.85))]);
        let pet = |identity_id, species: Option<&str>| NeighborIdentity {
            identity_id,
            locked: false,
            species: species.map(String::from),
        };
        let lookup = Lookup(
            [
                (1, pet(10, Some(" Dog "))),
                (2, pet(20, Some("unknown"))),
                (3, pet(30, None)),
            ]
            .into_iter()
            .collect(),
        );
        let config = MatcherConfig::default();
        let matcher = OnlineMatcher::new(&config);

        let dog = matcher
            .match_identity(
                &manager,
                &lookup,
                MatchQuery {
                    species: Some("dog"),
                    ..query(EntityKind::Pet, &[1.0, 0.0])
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(dog.identity_id, 10);
        assert_eq!(dog.match_count, 1);

        let unknown = matcher
            .match_identity(&manager, &lookup, query(EntityKind::Pet, &[1.0, 0.0]))
            .unwrap()
            .unwrap();
        assert_eq!(unknown.identity_id, 20);

        let cat = matcher
            .match_identity(
                &manager,
                &lookup,
                MatchQuery {
                    species: Some("cat"),
                    ..query(EntityKind::Pet, &[1.0, 0.0])
                },
            )
            .unwrap();
        assert!(cat.is_none());
    }
}
