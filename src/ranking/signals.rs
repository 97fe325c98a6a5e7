//! Gathers per-photo evidence from the record store and the image index.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::intent::{LOCATION_INDICATORS, STOP_WORDS};
use super::{MatchType, ParsedQuery, SignalBundle, Source};
use crate::config::SearchConfig;
use crate::db::{Database, PlaceName};
use crate::vectors::{EntityKind, VectorIndexManager};

const LOCATION_EXACT_STRENGTH: f32 = 1.0;
const LOCATION_PARTIAL_STRENGTH: f32 = 0.7;

fn user_tag_strength(match_type: MatchType) -> f32 {
    match match_type {
        MatchType::Exact => 1.0,
        MatchType::Partial => 0.8,
        _ => 0.6,
    }
}

/// Best place-name field of `place` for `terms`.
fn location_match<'p>(place: &'p PlaceName, terms: &[&str], normalized: &str) -> Option<(&'p str, f32, MatchType)> {
    let exact = place.fields().find(|field| {
        let field = field.to_lowercase();
        field == normalized || terms.iter().any(|t| *t == field)
    });
    if let Some(field) = exact {
        return Some((field, LOCATION_EXACT_STRENGTH, MatchType::Exact));
    }
    place
        .fields()
        .find(|field| {
            let field = field.to_lowercase();
            terms.iter().any(|t| field.contains(t))
        })
        .map(|field| (field, LOCATION_PARTIAL_STRENGTH, MatchType::Partial))
}

pub struct SignalCollector<'a> {
    db: &'a Database,
    index: &'a VectorIndexManager,
    config: &'a SearchConfig,
    generic: HashSet<String>,
}

impl<'a> SignalCollector<'a> {
    pub fn new(db: &'a Database, index: &'a VectorIndexManager, config: &'a SearchConfig) -> Self {
        let generic = config.generic_tags.iter().map(|t| t.to_lowercase()).collect();
        Self {
            db,
            index,
            config,
            generic,
        }
    }

    /// One bundle per candidate photo that still exists, with its date set.
    /// `query_embedding` is the query text embedded into the image space.
    pub fn collect(&self, query: &ParsedQuery, query_embedding: Option<&[f32]>) -> Result<Vec<SignalBundle>> {
        let mut bundles: BTreeMap<i64, SignalBundle> = BTreeMap::new();
        let mut add = |photo_id: i64, source: Source, label: &str, strength: f32, match_type: MatchType| {
            bundles
                .entry(photo_id)
                .or_insert_with(|| SignalBundle::new(photo_id))
                .push(source, label, strength, match_type);
        };

        if !query.is_empty() {
            let terms = query.meaningful_terms(&self.generic);

            let tags = self.db.user_tags_matching(&terms)?;
            debug!("User tag matches: {}", tags.len());
            for tag in tags {
                let match_type = query.classify(&tag.label);
                add(tag.photo_id, Source::UserTag, &tag.label, user_tag_strength(match_type), match_type);
            }

            let people = self.db.person_names_matching(&terms)?;
            debug!("Person matches: {}", people.len());
            for person in people {
                add(person.photo_id, Source::Person, &person.label, 1.0, query.classify(&person.label));
            }

            let scenes = self
                .db
                .scene_tags_matching(&terms, self.config.rich_tag_min_confidence)?;
            debug!("Rich tag matches: {}", scenes.len());
            for scene in scenes {
                add(
                    scene.photo_id,
                    Source::RichTag,
                    &scene.label,
                    scene.confidence,
                    query.classify(&scene.label),
                );
            }

            let place_terms: Vec<&str> = query
                .terms
                .iter()
                .map(String::as_str)
                .filter(|t| t.len() >= 3 && !STOP_WORDS.contains(t) && !LOCATION_INDICATORS.contains(t))
                .collect();
            let places = self.db.locations_matching(&place_terms)?;
            debug!("Location matches: {}", places.len());
            for place in &places {
                if let Some((field, strength, match_type)) = location_match(place, &place_terms, &query.normalized) {
                    add(place.photo_id, Source::Location, field, strength, match_type);
                }
            }

            let objects = self
                .db
                .objects_in_categories(&query.object_categories(), self.config.object_min_confidence)?;
            debug!("Object matches: {}", objects.len());
            for object in objects {
                add(object.photo_id, Source::Object, &object.label, object.confidence, MatchType::Direct);
            }

            let species = query.pet_species();
            if !species.is_empty() {
                let pets = self.db.pets_of_species(&species, self.config.pet_min_confidence)?;
                debug!("Pet matches: {}", pets.len());
                for pet in pets {
                    add(pet.photo_id, Source::Pet, &pet.label, pet.confidence, MatchType::Direct);
                }
            }
        }

        if let Some(embedding) = query_embedding {
            match self.index.search(EntityKind::Image, embedding, self.config.semantic_k) {
                Ok(hits) => {
                    let hits: Vec<_> = hits
                        .into_iter()
                        .filter(|h| h.similarity >= self.config.semantic_min_similarity)
                        .collect();
                    debug!("Semantic matches: {}", hits.len());
                    for hit in hits {
                        add(hit.entity_id, Source::Semantic, "", hit.similarity, MatchType::Direct);
                    }
                }
                Err(e) => warn!("Semantic search unavailable: {}", e),
            }
        }

        self.drop_unsupported_semantic_only(query, &mut bundles)?;

        let ids: Vec<i64> = bundles.keys().copied().collect();
        let dates = self.db.photo_dates(&ids)?;
        let collected: Vec<SignalBundle> = bundles
            .into_values()
            .filter_map(|mut bundle| {
                let taken_at = dates.get(&bundle.photo_id)?;
                bundle.taken_at = *taken_at;
                Some(bundle)
            })
            .collect();

        if collected.len() < ids.len() {
            debug!("Dropped {} candidates missing from the store", ids.len() - collected.len());
        }
        Ok(collected)
    }

    /// Photos only the semantic source found must clear a stricter floor or
    /// carry a scene tag sharing a word with the query.
    fn drop_unsupported_semantic_only(
        &self,
        query: &ParsedQuery,
        bundles: &mut BTreeMap<i64, SignalBundle>,
    ) -> Result<()> {
        let mut dropped = Vec::new();
        for (photo_id, bundle) in bundles.iter() {
            if bundle.has_textual_match() {
                continue;
            }
            let best = bundle
                .matches
                .iter()
                .map(|m| m.strength)
                .fold(f32::MIN, f32::max);
            if best >= self.config.semantic_only_min_similarity {
                continue;
            }
            let labels = self.db.scene_labels(*photo_id)?;
            if !query.is_empty() && query.overlaps(&labels, &self.generic) {
                continue;
            }
            dropped.push(*photo_id);
        }

        if !dropped.is_empty() {
            debug!("Filtered {} semantic-only candidates without tag overlap", dropped.len());
        }
        for photo_id in dropped {
            bundles.remove(&photo_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::db::tests::test_db;
    use crate::vectors::Metric;
    use std::path::Path;

    fn image_index(dir: &Path) -> VectorIndexManager {
        let manager = VectorIndexManager::new(IndexConfig {
            directory: dir.to_path_buf(),
            image_dimension: 2,
            ..IndexConfig::default()
        });
        manager.create(EntityKind::Image, 2, Metric::Cosine);
        manager
    }

    /// Unit vector whose cosine with [1, 0] is `similarity`.
    fn at(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).sqrt()]
    }

    #[test]
    fn test_collects_textual_sources() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let index = image_index(dir.path());
        let config = SearchConfig::default();

        let photo = db.add_photo(Path::new("/p/goa.jpg"), None).unwrap();
        db.add_user_tag(photo, "beach").unwrap();
        db.add_scene_tag(photo, "sunset over the beach", 0.8).unwrap();
        db.set_location(&PlaceName {
            photo_id: photo,
            city: Some("Panaji".into()),
            region: Some("Goa".into()),
            country: Some("India".into()),
        })
        .unwrap();
        db.add_object(photo, "boat", 0.4).unwrap();

        let collector = SignalCollector::new(&db, &index, &config);
        let bundles = collector
            .collect(&ParsedQuery::new("beach in Goa with a boat"), None)
            .unwrap();

        assert_eq!(bundles.len(), 1);
        let bundle = &bundles[0];
        assert!(bundle.has_source(Source::UserTag));
        assert!(bundle.has_source(Source::RichTag));
        assert!(bundle.has_source(Source::Location));
        // below the object confidence floor
        assert!(!bundle.has_source(Source::Object));

        let location = bundle
            .matches
            .iter()
            .find(|m| m.source == Source::Location)
            .unwrap();
        assert_eq!(location.label, "Goa");
        assert_eq!(location.match_type, MatchType::Exact);
    }

    #[test]
    fn test_semantic_only_candidates_need_support() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let index = image_index(dir.path());
        let config = SearchConfig::default();

        let strong = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let weak_tagged = db.add_photo(Path::new("/p/2.jpg"), None).unwrap();
        let weak = db.add_photo(Path::new("/p/3.jpg"), None).unwrap();
        let gone = 99;
        db.add_scene_tag(weak_tagged, "lighthouse at dusk", 0.2).unwrap();

        index
            .add(
                EntityKind::Image,
                &[at(0.5), at(0.3), at(0.3), at(0.9)],
                &[strong, weak_tagged, weak, gone],
            )
            .unwrap();

        let collector = SignalCollector::new(&db, &index, &config);
        let bundles = collector
            .collect(&ParsedQuery::new("lighthouse"), Some(&[1.0, 0.0]))
            .unwrap();
        let ids: Vec<i64> = bundles.iter().map(|b| b.photo_id).collect();

        assert_eq!(ids, vec![strong, weak_tagged]);
        assert!(bundles.iter().all(|b| !b.has_textual_match()));
    }

    #[test]
    fn test_pets_only_looked_up_for_animal_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db();
        let index = image_index(dir.path());
        let config = SearchConfig::default();

        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        db.add_detection(
            EntityKind::Pet,
            &crate::db::NewDetection::pet(photo, "dog", 0.8, vec![1.0, 0.0]),
        )
        .unwrap();

        let collector = SignalCollector::new(&db, &index, &config);
        let dogs = collector.collect(&ParsedQuery::new("puppies"), None).unwrap();
        assert_eq!(dogs.len(), 1);
        assert!(dogs[0].has_source(Source::Pet));

        assert!(collector
            .collect(&ParsedQuery::new("doge coin"), None)
            .unwrap()
            .is_empty());
    }
}
