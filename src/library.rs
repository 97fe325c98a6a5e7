//! Coordinates the record store and the vector indices.
//!
//! Every write commits to the record store first and touches the index
//! second. A crash in between leaves the store ahead of the index, which the
//! count check in [`VectorIndexManager::auto_rebuild_if_corrupted`] picks up
//! on the next open.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{Database, Identity, NewDetection};
use crate::identity::{
    dbscan, Assignment, ClusterInput, ClusterReport, ClusterStatus, IdentityClusterer, IdentityStore,
    MatchOutcome, MatchQuery, NewIdentity, OnlineMatcher, NOISE,
};
use crate::ranking::{ParsedQuery, RankedPhoto, Ranker, SignalCollector, TieBreak};
use crate::vectors::{EntityKind, RebuildAction, RebuildOutcome, SearchHit, VectorIndexManager};

/// Result of storing one new detection.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub detection_id: i64,
    /// Whether the embedding reached the index.
    pub indexed: bool,
    /// Identity assigned by the online matcher, if any.
    pub matched: Option<MatchOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletionReport {
    pub detection_id: i64,
    pub removed_from_index: bool,
    /// Identities this deletion left without detections.
    pub orphaned_identities: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhotoDeletionReport {
    pub photo_id: i64,
    pub vectors_removed: usize,
    pub orphaned_people: Vec<i64>,
    pub orphaned_pets: Vec<i64>,
}

/// One duplicate group folded into its oldest identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMerge {
    pub target: i64,
    pub merged: Vec<i64>,
    pub detections_moved: usize,
}

/// Outcome of re-clustering the detections of a single identity.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitReport {
    pub identity_id: i64,
    pub status: ClusterStatus,
    /// Unlocked embedded detections that took part.
    pub considered: usize,
    /// Of those, how many stayed with the identity.
    pub kept: usize,
    pub new_identities: Vec<i64>,
    /// Detections that fit no group and were detached.
    pub unassigned: usize,
}

/// Post-filters and ordering for [`Library::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub tie_break: TieBreak,
    /// Only photos containing this person.
    pub person_id: Option<i64>,
    /// Only photos with a detected object of this category.
    pub object_category: Option<String>,
    /// Date range on `taken_at`; undated photos always pass.
    pub taken_after: Option<DateTime<Utc>>,
    pub taken_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Difference between what the store says is embedded and what the index holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    pub kind: EntityKind,
    pub store_count: usize,
    pub index_count: usize,
    /// Embedded in the store but absent from the index.
    pub missing_from_index: Vec<i64>,
    /// In the index with no embedded record behind it.
    pub orphaned_in_index: Vec<i64>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_from_index.is_empty() && self.orphaned_in_index.is_empty()
    }
}

pub struct Library {
    db: Database,
    index: Arc<VectorIndexManager>,
    config: Config,
    /// Kinds whose index missed a write after the store committed.
    repairs: Mutex<BTreeSet<EntityKind>>,
}

impl Library {
    /// Open the store at `config.db_path` and load or rebuild every index.
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        db.initialize()?;
        let index = Arc::new(VectorIndexManager::new(config.index.clone()));

        let library = Self::from_parts(db, index, config);
        library.prepare_indices()?;
        Ok(library)
    }

    /// Assemble a library from an already initialized store and manager.
    pub fn from_parts(db: Database, index: Arc<VectorIndexManager>, config: Config) -> Self {
        Self {
            db,
            index,
            config,
            repairs: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn index(&self) -> &Arc<VectorIndexManager> {
        &self.index
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load every index, rebuilding any that is missing, corrupt or out of
    /// step with the store.
    pub fn prepare_indices(&self) -> Result<Vec<(EntityKind, RebuildOutcome)>> {
        let mut outcomes = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let outcome = self
                .index
                .auto_rebuild_if_corrupted(kind, &self.db)
                .with_context(|| format!("Failed to prepare {} index", kind))?;
            info!(
                "{} index: {:?} ({} vectors){}",
                kind,
                outcome.action,
                outcome.count,
                outcome
                    .reason
                    .as_deref()
                    .map(|r| format!(", {}", r))
                    .unwrap_or_default()
            );
            outcomes.push((kind, outcome));
        }
        Ok(outcomes)
    }

    fn check_dimension(&self, kind: EntityKind, embedding: &[f32]) -> Result<()> {
        let expected = self.index.dimension(kind);
        if embedding.len() != expected {
            bail!(
                "{} embedding has {} dimensions, expected {}",
                kind,
                embedding.len(),
                expected
            );
        }
        Ok(())
    }

    // ========================================================================
    // Ingest and deletion
    // ========================================================================

    /// Store a face or pet detection, index its embedding and try to attach
    /// it to a known identity.
    pub fn add_detection(&self, kind: EntityKind, detection: &NewDetection) -> Result<IngestReport> {
        if !kind.has_identities() {
            bail!("{} is not a detection kind", kind);
        }
        if let Some(embedding) = &detection.embedding {
            self.check_dimension(kind, embedding)?;
        }

        let detection_id = self.db.add_detection(kind, detection)?;

        let Some(embedding) = &detection.embedding else {
            return Ok(IngestReport {
                detection_id,
                indexed: false,
                matched: None,
            });
        };

        if let Err(e) = self.index.add(kind, std::slice::from_ref(embedding), &[detection_id]) {
            warn!(
                "{} {} stored but not indexed, marked for repair: {}",
                kind, detection_id, e
            );
            self.mark_for_repair(kind);
            return Ok(IngestReport {
                detection_id,
                indexed: false,
                matched: None,
            });
        }

        let matched = OnlineMatcher::new(&self.config.matcher).match_identity(
            &self.index,
            &self.db,
            MatchQuery {
                kind,
                embedding,
                detection_id: Some(detection_id),
                species: detection.species.as_deref(),
            },
        )?;
        if let Some(outcome) = &matched {
            self.db
                .set_detection_identity(kind, detection_id, Some(outcome.identity_id))?;
        }

        Ok(IngestReport {
            detection_id,
            indexed: true,
            matched,
        })
    }

    /// Store and index the whole-image embedding of a photo, replacing any
    /// previous one.
    pub fn set_image_embedding(&self, photo_id: i64, embedding: &[f32], model_name: Option<&str>) -> Result<()> {
        self.check_dimension(EntityKind::Image, embedding)?;
        self.db.set_image_embedding(photo_id, embedding, model_name)?;
        if let Err(e) = self.index.add(EntityKind::Image, &[embedding.to_vec()], &[photo_id]) {
            warn!(
                "Image embedding for photo {} stored but not indexed, marked for repair: {}",
                photo_id, e
            );
            self.mark_for_repair(EntityKind::Image);
        }
        Ok(())
    }

    pub fn delete_detection(&self, kind: EntityKind, detection_id: i64) -> Result<Option<DeletionReport>> {
        let Some(deleted) = self.db.delete_detection(kind, detection_id)? else {
            return Ok(None);
        };

        let removed = if deleted.had_embedding {
            self.unindex(kind, &[detection_id])
        } else {
            0
        };

        if !deleted.orphaned_identities.is_empty() {
            debug!(
                "Deleting {} {} orphaned identities {:?}",
                kind, detection_id, deleted.orphaned_identities
            );
        }

        Ok(Some(DeletionReport {
            detection_id,
            removed_from_index: removed > 0,
            orphaned_identities: deleted.orphaned_identities,
        }))
    }

    pub fn delete_photo(&self, photo_id: i64) -> Result<Option<PhotoDeletionReport>> {
        let Some(deleted) = self.db.delete_photo(photo_id)? else {
            return Ok(None);
        };

        let mut vectors_removed = 0;
        if !deleted.face_ids.is_empty() {
            vectors_removed += self.unindex(EntityKind::Face, &deleted.face_ids);
        }
        if !deleted.pet_ids.is_empty() {
            vectors_removed += self.unindex(EntityKind::Pet, &deleted.pet_ids);
        }
        if deleted.had_image_embedding {
            vectors_removed += self.unindex(EntityKind::Image, &[photo_id]);
        }

        Ok(Some(PhotoDeletionReport {
            photo_id,
            vectors_removed,
            orphaned_people: deleted.orphaned_people,
            orphaned_pets: deleted.orphaned_pets,
        }))
    }

    /// Drop already deleted records from the index. A failure is queued for
    /// [`Library::repair`] instead of failing the committed delete.
    fn unindex(&self, kind: EntityKind, ids: &[i64]) -> usize {
        match self.index.remove(kind, ids) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(
                    "{} {:?} deleted but still indexed, marked for repair: {}",
                    kind, ids, e
                );
                self.mark_for_repair(kind);
                0
            }
        }
    }

    fn mark_for_repair(&self, kind: EntityKind) {
        self.repairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
    }

    // ========================================================================
    // Identities
    // ========================================================================

    /// Full clustering pass over every embedded detection of `kind`.
    pub fn cluster(&self, kind: EntityKind) -> Result<ClusterReport> {
        run_clustering(&self.db, &self.config, kind)
    }

    pub fn should_auto_recluster(&self, kind: EntityKind) -> Result<bool> {
        let config = self.config.clustering(kind);
        if config.auto_recluster_threshold == 0 {
            return Ok(false);
        }
        let pending = self.db.count_unclustered(kind, config.min_confidence)?;
        debug!(
            "{} unclustered {} detections (threshold {})",
            pending, kind, config.auto_recluster_threshold
        );
        Ok(pending >= config.auto_recluster_threshold)
    }

    /// Best known identity for an embedding that is not stored.
    pub fn match_identity(
        &self,
        kind: EntityKind,
        embedding: &[f32],
        species: Option<&str>,
    ) -> Result<Option<MatchOutcome>> {
        OnlineMatcher::new(&self.config.matcher).match_identity(
            &self.index,
            &self.db,
            MatchQuery {
                kind,
                embedding,
                detection_id: None,
                species,
            },
        )
    }

    /// Nearest stored detections to `detection_id`, itself excluded.
    pub fn similar_detections(&self, kind: EntityKind, detection_id: i64, k: usize) -> Result<Vec<SearchHit>> {
        let embedding = match self.index.vector_for(kind, detection_id) {
            Some(v) => v,
            None => match self.db.detection_embedding(kind, detection_id)? {
                Some(v) => v,
                None => return Ok(Vec::new()),
            },
        };
        let mut hits = self.index.search(kind, &embedding, k + 1)?;
        hits.retain(|h| h.entity_id != detection_id);
        hits.truncate(k);
        Ok(hits)
    }

    pub fn list_identities(&self, kind: EntityKind) -> Result<Vec<Identity>> {
        self.db.list_identities(kind)
    }

    pub fn rename_identity(&self, kind: EntityKind, identity_id: i64, name: &str) -> Result<bool> {
        self.db.rename_identity(kind, identity_id, name)
    }

    pub fn merge_identities(&self, kind: EntityKind, source: i64, target: i64) -> Result<usize> {
        let moved = self.db.merge_identities(kind, source, target)?;
        info!("Merged {} {} into {} ({} detections)", kind, source, target, moved);
        Ok(moved)
    }

    pub fn delete_identity(&self, kind: EntityKind, identity_id: i64) -> Result<Option<usize>> {
        self.db.delete_identity(kind, identity_id)
    }

    pub fn lock_detection(&self, kind: EntityKind, detection_id: i64, identity_id: i64) -> Result<bool> {
        if self.db.get_identity(kind, identity_id)?.is_none() {
            bail!("No {} identity {}", kind, identity_id);
        }
        self.db.lock_detection(kind, detection_id, identity_id)
    }

    pub fn unlock_detection(&self, kind: EntityKind, detection_id: i64) -> Result<bool> {
        self.db.unlock_detection(kind, detection_id)
    }

    pub fn suppress_detection(&self, kind: EntityKind, detection_id: i64, suppressed: bool) -> Result<bool> {
        self.db.set_suppressed(kind, detection_id, suppressed)
    }

    /// Identities sharing a cluster label (and species, for pets), oldest
    /// first within each group.
    pub fn find_duplicate_identities(&self, kind: EntityKind) -> Result<Vec<Vec<Identity>>> {
        self.db.duplicate_identities(kind)
    }

    /// Fold every duplicate group into its oldest identity. An unnamed
    /// target takes the first name found among the identities merged in.
    pub fn merge_duplicate_identities(&self, kind: EntityKind) -> Result<Vec<DuplicateMerge>> {
        let mut merges = Vec::new();
        for group in self.db.duplicate_identities(kind)? {
            let Some((target, rest)) = group.split_first() else {
                continue;
            };
            let mut merge = DuplicateMerge {
                target: target.id,
                merged: Vec::with_capacity(rest.len()),
                detections_moved: 0,
            };
            for source in rest {
                merge.detections_moved += self.db.merge_identities(kind, source.id, target.id)?;
                merge.merged.push(source.id);
            }
            info!(
                "Merged duplicate {} identities {:?} into {} ({} detections)",
                kind, merge.merged, merge.target, merge.detections_moved
            );
            merges.push(merge);
        }
        Ok(merges)
    }

    /// Re-cluster the unlocked detections of one identity. The largest group
    /// stays, every other group becomes a new identity and detections that
    /// fit no group are detached.
    pub fn split_identity(&self, kind: EntityKind, identity_id: i64) -> Result<SplitReport> {
        if !kind.has_identities() {
            bail!("{} records are not clustered", kind);
        }
        let Some(identity) = self.db.get_identity(kind, identity_id)? else {
            bail!("No {} identity {}", kind, identity_id);
        };
        let config = self.config.clustering(kind);
        let min_samples = config.min_samples.max(1);

        let members: Vec<ClusterInput> = self
            .db
            .identity_cluster_inputs(kind, identity_id)?
            .into_iter()
            .filter(|m| !m.locked && !m.suppressed)
            .collect();
        let mut report = SplitReport {
            identity_id,
            status: ClusterStatus::InsufficientData,
            considered: members.len(),
            kept: members.len(),
            new_identities: Vec::new(),
            unassigned: 0,
        };
        if members.len() < min_samples.max(2) {
            info!(
                "Not enough {} detections to split identity {}: {}",
                kind,
                identity_id,
                members.len()
            );
            return Ok(report);
        }

        let embeddings: Vec<Vec<f32>> = members.iter().map(|m| m.embedding.clone()).collect();
        let labels = dbscan(&embeddings, config.eps, min_samples);

        let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        let mut detached = Vec::new();
        for (member, label) in members.iter().zip(&labels) {
            if *label == NOISE {
                detached.push(Assignment {
                    detection_id: member.detection_id,
                    cluster_label: Some(NOISE),
                    identity_id: None,
                });
            } else {
                groups.entry(*label).or_default().push(member.detection_id);
            }
        }

        // Ties go to the group found first.
        let main = groups
            .iter()
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.0.cmp(a.0)))
            .map(|(label, _)| *label);
        report.kept = main.and_then(|l| groups.get(&l)).map_or(0, Vec::len);

        let created: Vec<NewIdentity> = groups
            .into_iter()
            .filter(|(label, _)| Some(*label) != main)
            .map(|(_, detection_ids)| NewIdentity {
                label: None,
                species: identity.species.clone(),
                detection_ids,
            })
            .collect();

        report.new_identities = self.db.apply_pass(kind, &created, &detached)?;
        report.unassigned = detached.len();
        report.status = ClusterStatus::Success;
        info!(
            "Split {} identity {}: kept {}, {} new identities, {} detached",
            kind,
            identity_id,
            report.kept,
            report.new_identities.len(),
            report.unassigned
        );
        Ok(report)
    }

    /// Delete identities that no longer have any detection.
    pub fn cleanup_orphaned(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let removed = self.db.delete_orphaned_identities(kind)?;
        if !removed.is_empty() {
            info!("Removed {} orphaned {} identities", removed.len(), kind);
        }
        Ok(removed)
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Rank photos for a free-text query. `query_embedding` is the query
    /// embedded into the whole-image space, when the caller has one.
    pub fn search(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &SearchOptions,
    ) -> Result<Vec<RankedPhoto>> {
        let parsed = ParsedQuery::new(query);
        let mut bundles = SignalCollector::new(&self.db, &self.index, &self.config.search)
            .collect(&parsed, query_embedding)?;

        if let Some(person_id) = options.person_id {
            let photos = self.db.photos_with_identity(EntityKind::Face, person_id)?;
            bundles.retain(|b| photos.contains(&b.photo_id));
        }
        if let Some(category) = &options.object_category {
            let photos = self.db.photos_with_object(category)?;
            bundles.retain(|b| photos.contains(&b.photo_id));
        }
        bundles.retain(|b| match b.taken_at {
            Some(t) => {
                options.taken_after.map_or(true, |after| t >= after)
                    && options.taken_before.map_or(true, |before| t <= before)
            }
            None => true,
        });

        let mut ranked = Ranker::new(&self.config.search).rank(&parsed, &bundles, options.tie_break);
        if let Some(limit) = options.limit {
            ranked.truncate(limit);
        }
        info!("Search {:?}: {} results", query, ranked.len());
        Ok(ranked)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Compare the ids the store marks as embedded with the ids in the index.
    pub fn verify(&self, kind: EntityKind) -> Result<ConsistencyReport> {
        let stored: BTreeSet<i64> = self.db.embedded_ids(kind)?.into_iter().collect();
        let indexed: BTreeSet<i64> = self.index.ids(kind).into_iter().collect();

        Ok(ConsistencyReport {
            kind,
            store_count: stored.len(),
            index_count: indexed.len(),
            missing_from_index: stored.difference(&indexed).copied().collect(),
            orphaned_in_index: indexed.difference(&stored).copied().collect(),
        })
    }

    pub fn rebuild(&self, kind: EntityKind) -> Result<RebuildOutcome> {
        let outcome = self
            .index
            .rebuild(kind, &self.db)
            .with_context(|| format!("Failed to rebuild {} index", kind))?;
        Ok(outcome)
    }

    /// Kinds whose index missed a write since the last repair.
    pub fn pending_repairs(&self) -> Vec<EntityKind> {
        self.repairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Rebuild every index marked for repair from the store.
    pub fn repair(&self) -> Result<Vec<(EntityKind, RebuildOutcome)>> {
        let mut outcomes = Vec::new();
        for kind in self.pending_repairs() {
            let outcome = self.rebuild(kind)?;
            if outcome.action == RebuildAction::Rebuilt {
                self.repairs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&kind);
                info!("Repaired {} index ({} vectors)", kind, outcome.count);
            }
            outcomes.push((kind, outcome));
        }
        Ok(outcomes)
    }

    /// Persist every index changed since it was last written.
    pub fn save(&self) -> Result<usize> {
        let saved = self.index.save_all_dirty()?;
        Ok(saved)
    }
}

/// Clustering pass against any store connection; background jobs call this
/// with a connection of their own.
pub(crate) fn run_clustering(db: &Database, config: &Config, kind: EntityKind) -> Result<ClusterReport> {
    if !kind.has_identities() {
        bail!("{} records are not clustered", kind);
    }
    let inputs = db.cluster_inputs(kind)?;
    IdentityClusterer::new(kind, config.clustering(kind)).run(inputs, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::db::BoundingBox;
    use crate::identity::ClusterStatus;
    use chrono::TimeZone;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        Config {
            db_path: dir.join("clepho.db"),
            index: IndexConfig {
                directory: dir.join("indices"),
                face_dimension: 2,
                pet_dimension: 2,
                image_dimension: 2,
                ..IndexConfig::default()
            },
            ..Config::default()
        }
    }

    fn face(photo_id: i64, embedding: [f32; 2]) -> NewDetection {
        NewDetection {
            bbox: BoundingBox {
                x: 10,
                y: 10,
                width: 40,
                height: 40,
            },
            ..NewDetection::face(photo_id, 0.9, embedding.to_vec())
        }
    }

    fn assert_consistent(library: &Library) {
        for kind in EntityKind::ALL {
            let report = library.verify(kind).unwrap();
            assert!(report.is_consistent(), "{:?}", report);
        }
    }

    #[test]
    fn test_open_creates_empty_indices() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        for kind in EntityKind::ALL {
            assert!(library.index().is_loaded(kind));
            assert_eq!(library.index().len(kind), 0);
        }
        assert_consistent(&library);
    }

    #[test]
    fn test_store_and_index_stay_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let other = library.db().add_photo(Path::new("/p/2.jpg"), None).unwrap();

        let a = library.add_detection(EntityKind::Face, &face(photo, [1.0, 0.0])).unwrap();
        let b = library.add_detection(EntityKind::Face, &face(other, [0.0, 1.0])).unwrap();
        library
            .add_detection(
                EntityKind::Face,
                &NewDetection {
                    embedding: None,
                    ..face(photo, [0.0, 0.0])
                },
            )
            .unwrap();
        library
            .add_detection(EntityKind::Pet, &NewDetection::pet(photo, "dog", 0.9, vec![0.6, 0.8]))
            .unwrap();
        library.set_image_embedding(photo, &[0.5, 0.5], None).unwrap();
        library.set_image_embedding(other, &[0.1, 0.9], None).unwrap();
        assert!(a.indexed);
        assert_consistent(&library);

        library.delete_detection(EntityKind::Face, a.detection_id).unwrap();
        assert!(!library.index().contains(EntityKind::Face, a.detection_id));
        assert_consistent(&library);

        let deleted = library.delete_photo(other).unwrap().unwrap();
        assert_eq!(deleted.vectors_removed, 2);
        assert!(!library.index().contains(EntityKind::Face, b.detection_id));
        assert_consistent(&library);

        library.rebuild(EntityKind::Face).unwrap();
        assert_consistent(&library);
    }

    #[test]
    fn test_wrong_dimension_is_rejected_before_store_write() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();

        let bad = NewDetection::face(photo, 0.9, vec![1.0, 0.0, 0.0]);
        assert!(library.add_detection(EntityKind::Face, &bad).is_err());
        assert!(library.db().embedded_ids(EntityKind::Face).unwrap().is_empty());
    }

    #[test]
    fn test_deleting_last_detection_orphans_identity() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let only = library.add_detection(EntityKind::Face, &face(photo, [1.0, 0.0])).unwrap();

        let person = library.db().create_identity(EntityKind::Face, 0, None).unwrap();
        library.lock_detection(EntityKind::Face, only.detection_id, person).unwrap();

        let report = library
            .delete_detection(EntityKind::Face, only.detection_id)
            .unwrap()
            .unwrap();
        assert!(report.removed_from_index);
        assert_eq!(report.orphaned_identities, vec![person]);

        assert_eq!(library.cleanup_orphaned(EntityKind::Face).unwrap(), vec![person]);
        assert!(library.list_identities(EntityKind::Face).unwrap().is_empty());
    }

    #[test]
    fn test_new_face_joins_known_identity() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();

        let known: Vec<i64> = [[1.0, 0.0], [0.98, 0.2], [0.97, 0.24]]
            .iter()
            .map(|e| library.add_detection(EntityKind::Face, &face(photo, *e)).unwrap().detection_id)
            .collect();
        let report = library.cluster(EntityKind::Face).unwrap();
        assert_eq!(report.status, ClusterStatus::Success);
        assert_eq!(report.identities_created, 1);
        let alice = library.list_identities(EntityKind::Face).unwrap()[0].id;
        library.rename_identity(EntityKind::Face, alice, "Alice").unwrap();

        let fresh = library.add_detection(EntityKind::Face, &face(photo, [0.99, 0.1])).unwrap();
        let matched = fresh.matched.unwrap();
        assert_eq!(matched.identity_id, alice);
        assert_eq!(matched.match_count, known.len());

        let stranger = library.add_detection(EntityKind::Face, &face(photo, [0.0, 1.0])).unwrap();
        assert!(stranger.matched.is_none());

        let similar = library
            .similar_detections(EntityKind::Face, fresh.detection_id, 2)
            .unwrap();
        assert_eq!(similar.len(), 2);
        assert!(similar.iter().all(|h| h.entity_id != fresh.detection_id));
    }

    #[test]
    fn test_reclustering_reuses_identities() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();

        for e in [[1.0, 0.0], [0.99, 0.1], [0.0, 1.0], [0.1, 0.99]] {
            library.add_detection(EntityKind::Face, &face(photo, e)).unwrap();
        }
        let first = library.cluster(EntityKind::Face).unwrap();
        assert_eq!(first.groups, 2);
        assert_eq!(first.identities_created, 2);
        let before: Vec<i64> = library
            .list_identities(EntityKind::Face)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();

        library.add_detection(EntityKind::Face, &face(photo, [0.98, 0.15])).unwrap();
        let second = library.cluster(EntityKind::Face).unwrap();
        assert_eq!(second.identities_created, 0);
        assert_eq!(second.identities_reused, 2);
        let after: Vec<i64> = library
            .list_identities(EntityKind::Face)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_auto_recluster_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.face_clustering.auto_recluster_threshold = 2;
        let library = Library::open(config).unwrap();
        let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();

        library.add_detection(EntityKind::Face, &face(photo, [1.0, 0.0])).unwrap();
        assert!(!library.should_auto_recluster(EntityKind::Face).unwrap());
        library.add_detection(EntityKind::Face, &face(photo, [0.0, 1.0])).unwrap();
        assert!(library.should_auto_recluster(EntityKind::Face).unwrap());

        library.cluster(EntityKind::Face).unwrap();
        assert!(!library.should_auto_recluster(EntityKind::Face).unwrap());
    }

    #[test]
    fn test_reopen_loads_saved_indices_and_repairs_stale_ones() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let library = Library::open(config.clone()).unwrap();
            let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();
            library.add_detection(EntityKind::Face, &face(photo, [1.0, 0.0])).unwrap();
            library.save().unwrap();
            // written to the store only, as if the process died before indexing
            library
                .db()
                .add_detection(EntityKind::Face, &face(photo, [0.0, 1.0]))
                .unwrap();
        }

        let library = Library::from_parts(
            Database::open(&config.db_path).unwrap(),
            Arc::new(VectorIndexManager::new(config.index.clone())),
            config,
        );
        let outcomes = library.prepare_indices().unwrap();
        let face_outcome = &outcomes
            .iter()
            .find(|(kind, _)| *kind == EntityKind::Face)
            .unwrap()
            .1;
        assert_eq!(face_outcome.action, RebuildAction::Rebuilt);
        assert_eq!(face_outcome.count, 2);
        assert_consistent(&library);
    }

    #[test]
    fn test_search_filters() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let db = library.db();
        let old = db
            .add_photo(Path::new("/p/old.jpg"), Some(Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        let new = db
            .add_photo(Path::new("/p/new.jpg"), Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        let undated = db.add_photo(Path::new("/p/undated.jpg"), None).unwrap();
        for photo in [old, new, undated] {
            db.add_scene_tag(photo, "lighthouse", 0.9).unwrap();
        }

        let all = library.search("lighthouse", None, &SearchOptions::default()).unwrap();
        let ids: Vec<i64> = all.iter().map(|r| r.photo_id).collect();
        assert_eq!(ids, vec![new, old, undated]);

        let recent = library
            .search(
                "lighthouse",
                None,
                &SearchOptions {
                    taken_after: Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
                    ..SearchOptions::default()
                },
            )
            .unwrap();
        let ids: Vec<i64> = recent.iter().map(|r| r.photo_id).collect();
        assert_eq!(ids, vec![new, undated]);

        let face_id = library
            .add_detection(EntityKind::Face, &face(old, [1.0, 0.0]))
            .unwrap()
            .detection_id;
        let person = db.create_identity(EntityKind::Face, 0, None).unwrap();
        library.lock_detection(EntityKind::Face, face_id, person).unwrap();
        let with_person = library
            .search(
                "lighthouse",
                None,
                &SearchOptions {
                    person_id: Some(person),
                    limit: Some(5),
                    ..SearchOptions::default()
                },
            )
            .unwrap();
        assert_eq!(with_person.len(), 1);
        assert_eq!(with_person[0].photo_id, old);
    }

    #[test]
    fn test_search_object_category_filter() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let db = library.db();
        let harbor = db.add_photo(Path::new("/p/harbor.jpg"), None).unwrap();
        let cliff = db.add_photo(Path::new("/p/cliff.jpg"), None).unwrap();
        for photo in [harbor, cliff] {
            db.add_scene_tag(photo, "lighthouse", 0.9).unwrap();
        }
        db.add_object(harbor, "boat", 0.8).unwrap();

        let boats = library
            .search(
                "lighthouse",
                None,
                &SearchOptions {
                    object_category: Some("Boat ".to_string()),
                    ..SearchOptions::default()
                },
            )
            .unwrap();
        assert_eq!(boats.iter().map(|r| r.photo_id).collect::<Vec<_>>(), vec![harbor]);

        let none = library
            .search(
                "lighthouse",
                None,
                &SearchOptions {
                    object_category: Some("car".to_string()),
                    ..SearchOptions::default()
                },
            )
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_failed_unindex_is_queued_for_repair() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let db = Database::open(&config.db_path).unwrap();
        db.initialize().unwrap();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let other = db.add_photo(Path::new("/p/2.jpg"), None).unwrap();
        let detection = db.add_detection(EntityKind::Face, &face(photo, [1.0, 0.0])).unwrap();
        db.add_detection(EntityKind::Face, &face(other, [0.0, 1.0])).unwrap();
        db.set_image_embedding(other, &[0.5, 0.5], None).unwrap();

        // No index is loaded, so every index write fails after the store commit.
        let library = Library::from_parts(
            db,
            Arc::new(VectorIndexManager::new(config.index.clone())),
            config,
        );

        let report = library
            .delete_detection(EntityKind::Face, detection)
            .unwrap()
            .unwrap();
        assert!(!report.removed_from_index);
        assert!(library.db().get_detection(EntityKind::Face, detection).unwrap().is_none());
        assert_eq!(library.pending_repairs(), vec![EntityKind::Face]);

        let deleted = library.delete_photo(other).unwrap().unwrap();
        assert_eq!(deleted.vectors_removed, 0);
        assert!(!library.db().photo_exists(other).unwrap());
        assert_eq!(library.pending_repairs(), vec![EntityKind::Face, EntityKind::Image]);

        let repaired = library.repair().unwrap();
        assert_eq!(repaired.len(), 2);
        assert!(library.pending_repairs().is_empty());
        assert_consistent(&library);
    }

    #[test]
    fn test_wrong_dimension_rows_do_not_trigger_rebuild_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let library = Library::open(config.clone()).unwrap();
            let photo = library.db().add_photo(Path::new("/p/1.jpg"), None).unwrap();
            library.add_detection(EntityKind::Face, &face(photo, [1.0, 0.0])).unwrap();
            // left over from an older model
            library
                .db()
                .add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0, 0.0]))
                .unwrap();
            library.save().unwrap();
        }

        for _ in 0..2 {
            let library = Library::from_parts(
                Database::open(&config.db_path).unwrap(),
                Arc::new(VectorIndexManager::new(config.index.clone())),
                config.clone(),
            );
            let outcomes = library.prepare_indices().unwrap();
            let (_, face_outcome) = outcomes
                .iter()
                .find(|(kind, _)| *kind == EntityKind::Face)
                .unwrap();
            assert_eq!(face_outcome.action, RebuildAction::Loaded);
            assert_eq!(face_outcome.count, 1);
        }
    }

    #[test]
    fn test_merge_duplicate_identities() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(test_config(dir.path())).unwrap();
        let db = library.db();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();

        let oldest = db.create_identity(EntityKind::Face, 7, None).unwrap();
        let named = db.create_identity(EntityKind::Face, 7, None).unwrap();
        let third = db.create_identity(EntityKind::Face, 7, None).unwrap();
        let unrelated = db.create_identity(EntityKind::Face, 8, None).unwrap();
        library.rename_identity(EntityKind::Face, named, "Bob").unwrap();
        let members = [
            (oldest, [1.0, 0.0]),
            (named, [0.99, 0.1]),
            (third, [0.98, 0.2]),
            (unrelated, [0.0, 1.0]),
        ];
        for (identity, e) in members {
            let id = library.add_detection(EntityKind::Face, &face(photo, e)).unwrap().detection_id;
            db.set_detection_identity(EntityKind::Face, id, Some(identity)).unwrap();
        }

        assert_eq!(library.find_duplicate_identities(EntityKind::Face).unwrap().len(), 1);
        let merges = library.merge_duplicate_identities(EntityKind::Face).unwrap();
        assert_eq!(
            merges,
            vec![DuplicateMerge {
                target: oldest,
                merged: vec![named, third],
                detections_moved: 2,
            }]
        );

        let identities = library.list_identities(EntityKind::Face).unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].id, oldest);
        assert_eq!(identities[0].name.as_deref(), Some("Bob"));
        assert_eq!(identities[0].detection_count, 3);
        assert!(library.find_duplicate_identities(EntityKind::Face).unwrap().is_empty());
    }

    #[test]
    fn test_split_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.face_clustering.eps = 0.1;
        let library = Library::open(config).unwrap();
        let db = library.db();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let person = db.create_identity(EntityKind::Face, 0, None).unwrap();
        library.rename_identity(EntityKind::Face, person, "Carol").unwrap();

        let add = |e: [f32; 2]| {
            let id = library.add_detection(EntityKind::Face, &face(photo, e)).unwrap().detection_id;
            db.set_detection_identity(EntityKind::Face, id, Some(person)).unwrap();
            id
        };
        let main: Vec<i64> = [[1.0, 0.0], [0.99, 0.1], [0.98, 0.15]].into_iter().map(&add).collect();
        let other: Vec<i64> = [[0.0, 1.0], [0.1, 0.99]].into_iter().map(&add).collect();
        let stray = add([-1.0, 0.0]);
        let confirmed = add([0.05, 1.0]);
        library.lock_detection(EntityKind::Face, confirmed, person).unwrap();

        let report = library.split_identity(EntityKind::Face, person).unwrap();
        assert_eq!(report.status, ClusterStatus::Success);
        assert_eq!(report.considered, 6);
        assert_eq!(report.kept, 3);
        assert_eq!(report.unassigned, 1);
        assert_eq!(report.new_identities.len(), 1);
        let split_off = report.new_identities[0];

        for id in &main {
            assert_eq!(db.get_detection(EntityKind::Face, *id).unwrap().unwrap().identity_id, Some(person));
        }
        for id in &other {
            assert_eq!(db.get_detection(EntityKind::Face, *id).unwrap().unwrap().identity_id, Some(split_off));
        }
        let detached = db.get_detection(EntityKind::Face, stray).unwrap().unwrap();
        assert_eq!(detached.identity_id, None);
        assert_eq!(detached.cluster_label, Some(NOISE));
        assert_eq!(
            db.get_detection(EntityKind::Face, confirmed).unwrap().unwrap().identity_id,
            Some(person)
        );
        assert_eq!(
            library.db().get_identity(EntityKind::Face, person).unwrap().unwrap().name.as_deref(),
            Some("Carol")
        );

        let lone = db.create_identity(EntityKind::Face, 1, None).unwrap();
        db.set_detection_identity(EntityKind::Face, main[0], Some(lone)).unwrap();
        let report = library.split_identity(EntityKind::Face, lone).unwrap();
        assert_eq!(report.status, ClusterStatus::InsufficientData);
        assert!(report.new_identities.is_empty());
        assert!(library.split_identity(EntityKind::Face, 9999).is_err());
    }
}
