use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, TryLockError};
use std::thread;
use std::time::Duration;

use mini_moka::sync::Cache;
use tracing::{debug, error, info, warn};

use super::store::{self, IntegrityReport};
use super::{EntityKind, FlatIndex, Metric, SearchHit};
use crate::config::IndexConfig;
use crate::error::{CorruptionReason, IndexError, IndexResult};

/// Upper bound for a single backoff sleep while waiting for a write lock.
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Authoritative store of embeddings that an index can be rebuilt from.
pub trait EmbeddingSource {
    /// Number of records of `kind` holding an embedding of `dimension`.
    fn count_embeddings(&self, kind: EntityKind, dimension: usize) -> anyhow::Result<usize>;

    /// Every `(entity id, embedding)` of `kind`.
    fn load_embeddings(&self, kind: EntityKind) -> anyhow::Result<Vec<(i64, Vec<f32>)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildAction {
    /// Files on disk were valid and agreed with the record store.
    Loaded,
    /// Nothing on disk and nothing in the store; started empty.
    Created,
    /// Rebuilt from the record store and persisted.
    Rebuilt,
    /// The record store could not be read; running on an empty index.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    pub action: RebuildAction,
    pub reason: Option<String>,
    /// Vectors held after the operation.
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub kind: EntityKind,
    pub dimension: usize,
    pub metric: Metric,
    pub size: usize,
    pub dirty: bool,
}

/// Cached searches are keyed by index generation, query bits and `k`.
type SearchKey = (u64, Vec<u32>, usize);

/// One named index. Writers serialize on `write`; readers only take the
/// `index` read lock, which writers hold briefly to swap contents.
struct Slot {
    write: Mutex<()>,
    index: RwLock<FlatIndex>,
    dirty: AtomicBool,
    /// Bumped under the `index` write lock on every change to the vectors.
    generation: AtomicU64,
    searches: Cache<SearchKey, Vec<SearchHit>>,
}

impl Slot {
    fn new(index: FlatIndex, cache_size: usize) -> Self {
        Self {
            write: Mutex::new(()),
            index: RwLock::new(index),
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            searches: Cache::new(cache_size as u64),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FlatIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<R>(&self, f: impl FnOnce(&FlatIndex) -> R) -> R {
        let guard = self.read();
        f(&guard)
    }

    fn replace(&self, index: FlatIndex) {
        let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);
        *guard = index;
        self.changed();
    }

    /// Must be called with the `index` write lock held.
    fn changed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.searches.invalidate_all();
    }
}

/// Owns the per-kind indices and their files.
pub struct VectorIndexManager {
    dir: PathBuf,
    config: IndexConfig,
    slots: RwLock<HashMap<EntityKind, Arc<Slot>>>,
}

impl VectorIndexManager {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            dir: config.directory.clone(),
            config,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.dir
    }

    /// Configured dimension for `kind`.
    pub fn dimension(&self, kind: EntityKind) -> usize {
        self.config.dimension(kind)
    }

    fn slot(&self, kind: EntityKind) -> IndexResult<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or(IndexError::Missing(kind))
    }

    fn slot_or_insert(&self, kind: EntityKind, metric: Metric) -> Arc<Slot> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(kind)
            .or_insert_with(|| {
                Arc::new(Slot::new(
                    FlatIndex::new(self.dimension(kind), metric),
                    self.config.search_cache_size,
                ))
            })
            .clone()
    }

    /// Take the write lock of a slot, retrying with exponential backoff
    /// before falling back to a blocking acquire.
    fn lock_for_write<'a>(&self, kind: EntityKind, slot: &'a Slot) -> MutexGuard<'a, ()> {
        let mut delay = Duration::from_millis(self.config.write_backoff_ms);
        for attempt in 1..=self.config.write_retries {
            match slot.write.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("Write lock for {} index was poisoned; recovering", kind);
                    return poisoned.into_inner();
                }
                Err(TryLockError::WouldBlock) => {
                    debug!(
                        "Write lock for {} index busy (attempt {}), retrying in {:?}",
                        kind, attempt, delay
                    );
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
        slot.write.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an empty index for `kind`, discarding any live contents.
    pub fn create(&self, kind: EntityKind, dimension: usize, metric: Metric) {
        let slot = self.slot_or_insert(kind, metric);
        let _guard = self.lock_for_write(kind, &slot);
        slot.replace(FlatIndex::new(dimension, metric));
        slot.dirty.store(false, Ordering::SeqCst);
        debug!("Created {} index ({} dims, {:?})", kind, dimension, metric);
    }

    pub fn is_loaded(&self, kind: EntityKind) -> bool {
        self.slot(kind).is_ok()
    }

    pub fn add(&self, kind: EntityKind, vectors: &[Vec<f32>], entity_ids: &[i64]) -> IndexResult<()> {
        let slot = self.slot(kind)?;
        let _guard = self.lock_for_write(kind, &slot);

        {
            let mut index = slot.index.write().unwrap_or_else(PoisonError::into_inner);
            index.add(vectors, entity_ids)?;
            slot.changed();
        }
        if !entity_ids.is_empty() {
            slot.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Nearest `k` entities to `query`. Results are cached per index until
    /// its next change.
    pub fn search(&self, kind: EntityKind, query: &[f32], k: usize) -> IndexResult<Vec<SearchHit>> {
        let slot = self.slot(kind)?;
        let index = slot.read();
        if self.config.search_cache_size == 0 {
            return index.search(query, k);
        }

        let key = (
            slot.generation.load(Ordering::SeqCst),
            query.iter().map(|v| v.to_bits()).collect(),
            k,
        );
        if let Some(hits) = slot.searches.get(&key) {
            return Ok(hits);
        }
        let hits = index.search(query, k)?;
        slot.searches.insert(key, hits.clone());
        Ok(hits)
    }

    /// Drop `entity_ids` from the index by rebuilding it from the retained
    /// vectors. Returns how many vectors were removed.
    pub fn remove(&self, kind: EntityKind, entity_ids: &[i64]) -> IndexResult<usize> {
        let slot = self.slot(kind)?;
        let _guard = self.lock_for_write(kind, &slot);

        let remove: HashSet<i64> = entity_ids.iter().copied().collect();
        let (rebuilt, removed) = {
            let current = slot.read();
            let present = remove.iter().filter(|id| current.contains(**id)).count();
            if present == 0 {
                return Ok(0);
            }
            (current.without(&remove), present)
        };

        slot.replace(rebuilt);
        slot.dirty.store(true, Ordering::SeqCst);
        debug!("Removed {} vectors from {} index", removed, kind);
        Ok(removed)
    }

    /// Persist the index, whether or not it changed.
    pub fn save(&self, kind: EntityKind) -> IndexResult<()> {
        let slot = self.slot(kind)?;
        let _guard = self.lock_for_write(kind, &slot);
        self.persist(kind, &slot)
    }

    fn persist(&self, kind: EntityKind, slot: &Slot) -> IndexResult<()> {
        let index = slot.read();
        store::save_pair(&self.dir, kind, &index)?;
        slot.dirty.store(false, Ordering::SeqCst);
        debug!("Saved {} index with {} vectors", kind, index.len());
        Ok(())
    }

    /// Persist the index only if it changed since the last save.
    pub fn save_if_dirty(&self, kind: EntityKind) -> IndexResult<bool> {
        let slot = self.slot(kind)?;
        let _guard = self.lock_for_write(kind, &slot);
        if !slot.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.persist(kind, &slot)?;
        Ok(true)
    }

    /// Persist every dirty index. Returns how many were written.
    pub fn save_all_dirty(&self) -> IndexResult<usize> {
        let mut saved = 0;
        for kind in self.loaded_kinds() {
            if self.save_if_dirty(kind)? {
                saved += 1;
            }
        }
        Ok(saved)
    }

    fn loaded_kinds(&self) -> Vec<EntityKind> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<EntityKind> = slots.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Load the pair of files for `kind` into the live slot.
    ///
    /// `Ok(false)` means no files exist yet. A half-written or mismatched
    /// pair is an `IndexError::Corrupt`, never a partial load.
    pub fn load(&self, kind: EntityKind) -> IndexResult<bool> {
        let Some(index) = store::load_pair(&self.dir, kind, self.dimension(kind))? else {
            return Ok(false);
        };
        let size = index.len();
        self.install(kind, index, false);
        info!("Loaded {} index with {} vectors", kind, size);
        Ok(true)
    }

    fn install(&self, kind: EntityKind, index: FlatIndex, dirty: bool) {
        let slot = self.slot_or_insert(kind, index.metric());
        let _guard = self.lock_for_write(kind, &slot);
        slot.replace(index);
        slot.dirty.store(dirty, Ordering::SeqCst);
    }

    /// Load `kind`, falling back to a rebuild from `source` when the files are
    /// corrupt, missing while the store has embeddings, or disagree with the
    /// store's count.
    pub fn auto_rebuild_if_corrupted(
        &self,
        kind: EntityKind,
        source: &dyn EmbeddingSource,
    ) -> IndexResult<RebuildOutcome> {
        let expected = source.count_embeddings(kind, self.dimension(kind));

        let reason = match self.load(kind) {
            Ok(true) => {
                let size = self.len(kind);
                match expected {
                    Ok(expected) if expected == size => {
                        return Ok(RebuildOutcome {
                            action: RebuildAction::Loaded,
                            reason: None,
                            count: size,
                        });
                    }
                    Ok(expected) => CorruptionReason::CountMismatch {
                        index: size,
                        expected,
                    },
                    Err(e) => {
                        warn!(
                            "Could not count {} embeddings, keeping loaded index: {:#}",
                            kind, e
                        );
                        return Ok(RebuildOutcome {
                            action: RebuildAction::Loaded,
                            reason: Some(format!("record store unavailable: {:#}", e)),
                            count: size,
                        });
                    }
                }
            }
            Ok(false) => match expected {
                Ok(0) => {
                    self.create(kind, self.dimension(kind), Metric::Cosine);
                    self.save(kind)?;
                    info!("Created empty {} index", kind);
                    return Ok(RebuildOutcome {
                        action: RebuildAction::Created,
                        reason: None,
                        count: 0,
                    });
                }
                _ => CorruptionReason::VectorFileMissing,
            },
            Err(IndexError::Corrupt { reason, .. }) => reason,
            Err(e) => return Err(e),
        };

        warn!("{} index is corrupted: {}", kind, reason);
        store::backup(&self.dir, kind);
        let mut outcome = self.rebuild(kind, source)?;
        if outcome.action == RebuildAction::Rebuilt {
            outcome.reason = Some(reason.to_string());
        }
        Ok(outcome)
    }

    /// Rebuild `kind` from scratch out of `source` and persist it.
    ///
    /// The write lock is held from reading `source` until the files are
    /// written, so an `add` racing the rebuild lands in the new index.
    ///
    /// If the source cannot be read the index starts empty and the outcome is
    /// `Degraded`; existing files are left alone. Failing to write the
    /// rebuilt index is the only error returned, and the rebuilt index stays
    /// live and dirty.
    pub fn rebuild(&self, kind: EntityKind, source: &dyn EmbeddingSource) -> IndexResult<RebuildOutcome> {
        let dimension = self.dimension(kind);
        let slot = self.slot_or_insert(kind, Metric::Cosine);
        let _guard = self.lock_for_write(kind, &slot);

        let rows = match source.load_embeddings(kind) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Cannot rebuild {} index, record store unavailable: {:#}", kind, e);
                slot.replace(FlatIndex::new(dimension, Metric::Cosine));
                slot.dirty.store(false, Ordering::SeqCst);
                return Ok(RebuildOutcome {
                    action: RebuildAction::Degraded,
                    reason: Some(
                        IndexError::SourceUnavailable {
                            kind,
                            message: format!("{:#}", e),
                        }
                        .to_string(),
                    ),
                    count: 0,
                });
            }
        };

        let mut ids = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        for (id, vector) in rows {
            if vector.len() != dimension {
                warn!(
                    "Skipping {} {}: embedding has {} dims, expected {}",
                    kind,
                    id,
                    vector.len(),
                    dimension
                );
                continue;
            }
            ids.push(id);
            vectors.push(vector);
        }

        let mut index = FlatIndex::new(dimension, Metric::Cosine);
        index.add(&vectors, &ids)?;
        let count = index.len();

        slot.replace(index);
        slot.dirty.store(true, Ordering::SeqCst);
        self.persist(kind, &slot)?;

        info!("Rebuilt {} index with {} vectors", kind, count);
        Ok(RebuildOutcome {
            action: RebuildAction::Rebuilt,
            reason: None,
            count,
        })
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.slot(kind)
            .map(|slot| slot.with(FlatIndex::len))
            .unwrap_or(0)
    }

    pub fn contains(&self, kind: EntityKind, entity_id: i64) -> bool {
        self.slot(kind)
            .map(|slot| slot.with(|index| index.contains(entity_id)))
            .unwrap_or(false)
    }

    pub fn ids(&self, kind: EntityKind) -> Vec<i64> {
        self.slot(kind)
            .map(|slot| slot.with(|index| index.ids().to_vec()))
            .unwrap_or_default()
    }

    /// Stored (normalized) vector of an entity.
    pub fn vector_for(&self, kind: EntityKind, entity_id: i64) -> Option<Vec<f32>> {
        self.slot(kind)
            .ok()?
            .with(|index| index.vector_for(entity_id))
    }

    /// Inspect the on-disk files of `kind` without touching the live index.
    pub fn check_integrity(&self, kind: EntityKind) -> IntegrityReport {
        store::check_integrity(&self.dir, kind, self.dimension(kind))
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        self.loaded_kinds()
            .into_iter()
            .filter_map(|kind| {
                let slot = self.slot(kind).ok()?;
                let index = slot.read();
                Some(IndexStats {
                    kind,
                    dimension: index.dimension(),
                    metric: index.metric(),
                    size: index.len(),
                    dirty: slot.dirty.load(Ordering::SeqCst),
                })
            })
            .collect()
    }
}
