//! On-disk format of an index.
//!
//! Each kind is stored as two files in the index directory:
//! `<kind>.npy` holds the vector matrix and `<kind>.ids.json` holds the
//! position -> entity id map together with a SHA-256 of the vector file.
//! Both are written to a temporary file and renamed into place, vectors
//! first. A crash between the two renames leaves a checksum mismatch that
//! the loader reports as corruption.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::Array2;
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::{EntityKind, FlatIndex, Metric};
use crate::error::{CorruptionReason, IndexError, IndexResult};

/// Contents of `<kind>.ids.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdMapFile {
    pub kind: EntityKind,
    pub dimension: usize,
    pub metric: Metric,
    /// Entity id at each row position of the vector file.
    pub ids: Vec<i64>,
    pub vector_count: usize,
    /// Hex SHA-256 of the vector file this map was written with.
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
}

/// Result of inspecting the files of one index without loading them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub reason: Option<CorruptionReason>,
    pub vector_count: usize,
    pub id_count: usize,
}

pub fn vector_path(dir: &Path, kind: EntityKind) -> PathBuf {
    dir.join(format!("{}.npy", kind))
}

pub fn id_map_path(dir: &Path, kind: EntityKind) -> PathBuf {
    dir.join(format!("{}.ids.json", kind))
}

fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write `contents` to `path` through a sibling temp file and a rename.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Persist an index. Any I/O failure is surfaced as `IndexError::Persist`.
pub fn save_pair(dir: &Path, kind: EntityKind, index: &FlatIndex) -> IndexResult<()> {
    let persist = |path: &Path, source: std::io::Error| IndexError::Persist {
        kind,
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(|e| persist(dir, e))?;

    let mut blob = Vec::new();
    index.vectors().write_npy(&mut blob)?;

    let id_map = IdMapFile {
        kind,
        dimension: index.dimension(),
        metric: index.metric(),
        ids: index.ids().to_vec(),
        vector_count: index.len(),
        checksum: checksum(&blob),
        saved_at: Utc::now(),
    };
    let json = serde_json::to_vec_pretty(&id_map)?;

    let vectors = vector_path(dir, kind);
    write_atomic(&vectors, &blob).map_err(|e| persist(&vectors, e))?;

    let ids = id_map_path(dir, kind);
    write_atomic(&ids, &json).map_err(|e| persist(&ids, e))?;

    Ok(())
}

/// Read both files and validate them against each other and against the
/// configured dimension. `Ok(None)` means the pair has never been written.
fn read_pair(
    dir: &Path,
    kind: EntityKind,
    expected_dimension: usize,
) -> Result<Option<(FlatIndex, IdMapFile)>, (CorruptionReason, usize, usize)> {
    let vectors = vector_path(dir, kind);
    let ids = id_map_path(dir, kind);

    match (vectors.exists(), ids.exists()) {
        (false, false) => return Ok(None),
        (false, true) => return Err((CorruptionReason::VectorFileMissing, 0, 0)),
        (true, false) => return Err((CorruptionReason::IdMapMissing, 0, 0)),
        (true, true) => {}
    }

    let blob = fs::read(&vectors)
        .map_err(|e| (CorruptionReason::VectorFileUnreadable(e.to_string()), 0, 0))?;
    let matrix = Array2::<f32>::read_npy(blob.as_slice())
        .map_err(|e| (CorruptionReason::VectorFileUnreadable(e.to_string()), 0, 0))?;
    let vector_count = matrix.nrows();

    let id_map: IdMapFile = fs::read(&ids)
        .map_err(|e| e.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
        .map_err(|e| (CorruptionReason::IdMapUnreadable(e), vector_count, 0))?;
    let id_count = id_map.ids.len();

    if id_map.checksum != checksum(&blob) {
        return Err((CorruptionReason::ChecksumMismatch, vector_count, id_count));
    }
    if matrix.ncols() != expected_dimension {
        return Err((
            CorruptionReason::DimensionMismatch {
                expected: expected_dimension,
                found: matrix.ncols(),
            },
            vector_count,
            id_count,
        ));
    }
    if vector_count != id_count {
        return Err((
            CorruptionReason::SizeMismatch {
                vectors: vector_count,
                ids: id_count,
            },
            vector_count,
            id_count,
        ));
    }

    let index = FlatIndex::from_parts(id_map.metric, matrix, id_map.ids.clone())
        .map_err(|_| (CorruptionReason::DuplicateIds, vector_count, id_count))?;

    Ok(Some((index, id_map)))
}

/// Load an index pair from disk.
pub fn load_pair(
    dir: &Path,
    kind: EntityKind,
    expected_dimension: usize,
) -> IndexResult<Option<FlatIndex>> {
    match read_pair(dir, kind, expected_dimension) {
        Ok(Some((index, _))) => Ok(Some(index)),
        Ok(None) => Ok(None),
        Err((reason, _, _)) => Err(IndexError::Corrupt { kind, reason }),
    }
}

/// Inspect the files of an index. Missing files count as invalid.
pub fn check_integrity(dir: &Path, kind: EntityKind, expected_dimension: usize) -> IntegrityReport {
    match read_pair(dir, kind, expected_dimension) {
        Ok(Some((index, id_map))) => IntegrityReport {
            valid: true,
            reason: None,
            vector_count: index.len(),
            id_count: id_map.ids.len(),
        },
        Ok(None) => IntegrityReport {
            valid: false,
            reason: Some(CorruptionReason::VectorFileMissing),
            vector_count: 0,
            id_count: 0,
        },
        Err((reason, vector_count, id_count)) => IntegrityReport {
            valid: false,
            reason: Some(reason),
            vector_count,
            id_count,
        },
    }
}

/// Copy whatever files of `kind` exist into a timestamped backup directory.
/// Returns `None` when there was nothing to copy or the copy failed.
pub fn backup(dir: &Path, kind: EntityKind) -> Option<PathBuf> {
    let sources: Vec<PathBuf> = [vector_path(dir, kind), id_map_path(dir, kind)]
        .into_iter()
        .filter(|p| p.exists())
        .collect();
    if sources.is_empty() {
        return None;
    }

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let target = dir.join("backups").join(format!("{}_{}", kind, stamp));
    if let Err(e) = fs::create_dir_all(&target) {
        warn!("Could not create backup directory {:?}: {}", target, e);
        return None;
    }

    for source in &sources {
        let Some(name) = source.file_name() else {
            continue;
        };
        if let Err(e) = fs::copy(source, target.join(name)) {
            warn!("Could not back up {:?}: {}", source, e);
        }
    }

    info!("Backed up {} index to {:?}", kind, target);
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> FlatIndex {
        let mut index = FlatIndex::new(2, Metric::Cosine);
        index
            .add(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[7, 9])
            .unwrap();
        index
    }

    #[test]
    fn test_save_and_load_pair() {
        let dir = tempdir().unwrap();
        save_pair(dir.path(), EntityKind::Face, &sample()).unwrap();

        let loaded = load_pair(dir.path(), EntityKind::Face, 2).unwrap().unwrap();
        assert_eq!(loaded.ids(), &[7, 9]);
        assert_eq!(loaded.vector_for(9).unwrap(), vec![0.0, 1.0]);

        let report = check_integrity(dir.path(), EntityKind::Face, 2);
        assert!(report.valid);
        assert_eq!(report.vector_count, 2);
        assert_eq!(report.id_count, 2);
    }

    #[test]
    fn test_missing_pair_is_not_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_pair(dir.path(), EntityKind::Pet, 2).unwrap().is_none());
        assert!(!check_integrity(dir.path(), EntityKind::Pet, 2).valid);
    }

    #[test]
    fn test_detects_missing_id_map() {
        let dir = tempdir().unwrap();
        save_pair(dir.path(), EntityKind::Face, &sample()).unwrap();
        fs::remove_file(id_map_path(dir.path(), EntityKind::Face)).unwrap();

        let report = check_integrity(dir.path(), EntityKind::Face, 2);
        assert_eq!(report.reason, Some(CorruptionReason::IdMapMissing));
        assert!(matches!(
            load_pair(dir.path(), EntityKind::Face, 2),
            Err(IndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_detects_foreign_vector_file() {
        let dir = tempdir().unwrap();
        save_pair(dir.path(), EntityKind::Face, &sample()).unwrap();

        let mut other = FlatIndex::new(2, Metric::Cosine);
        other.add(&[vec![1.0, 1.0]], &[1]).unwrap();
        let mut blob = Vec::new();
        other.vectors().write_npy(&mut blob).unwrap();
        fs::write(vector_path(dir.path(), EntityKind::Face), blob).unwrap();

        let report = check_integrity(dir.path(), EntityKind::Face, 2);
        assert_eq!(report.reason, Some(CorruptionReason::ChecksumMismatch));
    }

    #[test]
    fn test_detects_dimension_change() {
        let dir = tempdir().unwrap();
        save_pair(dir.path(), EntityKind::Image, &sample()).unwrap();

        let report = check_integrity(dir.path(), EntityKind::Image, 768);
        assert_eq!(
            report.reason,
            Some(CorruptionReason::DimensionMismatch {
                expected: 768,
                found: 2
            })
        );
    }

    #[test]
    fn test_garbage_vector_file() {
        let dir = tempdir().unwrap();
        save_pair(dir.path(), EntityKind::Face, &sample()).unwrap();
        fs::write(vector_path(dir.path(), EntityKind::Face), b"not numpy").unwrap();

        let report = check_integrity(dir.path(), EntityKind::Face, 2);
        assert!(matches!(
            report.reason,
            Some(CorruptionReason::VectorFileUnreadable(_))
        ));
    }

    #[test]
    fn test_backup_copies_existing_files() {
        let dir = tempdir().unwrap();
        assert!(backup(dir.path(), EntityKind::Face).is_none());

        save_pair(dir.path(), EntityKind::Face, &sample()).unwrap();
        let target = backup(dir.path(), EntityKind::Face).unwrap();
        assert!(target.join("face.npy").exists());
        assert!(target.join("face.ids.json").exists());
    }
}
