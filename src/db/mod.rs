//! SQLite record store.
//!
//! This is the durable source of truth for every embedding the vector
//! indices hold and for the identities built from them. Index files can be
//! thrown away and rebuilt from here at any time.

mod detections;
mod identities;
mod schema;
mod search;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

use crate::vectors::{EmbeddingSource, EntityKind};
use schema::SCHEMA;

pub use detections::{BoundingBox, DeletedDetection, Detection, NewDetection};
pub use identities::Identity;
pub use search::{ObjectHit, PlaceName, ScoredLabel};

/// Table layout of one detection kind.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KindTables {
    pub detections: &'static str,
    pub identities: &'static str,
    /// Column of `detections` referencing `identities`.
    pub identity_column: &'static str,
}

pub(crate) fn tables(kind: EntityKind) -> Result<KindTables> {
    match kind {
        EntityKind::Face => Ok(KindTables {
            detections: "faces",
            identities: "people",
            identity_column: "person_id",
        }),
        EntityKind::Pet => Ok(KindTables {
            detections: "pet_detections",
            identities: "pets",
            identity_column: "pet_id",
        }),
        EntityKind::Image => anyhow::bail!("{} records have no detections or identities", kind),
    }
}

/// What a photo deletion removed from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletedPhoto {
    pub photo_id: i64,
    pub face_ids: Vec<i64>,
    pub pet_ids: Vec<i64>,
    pub had_image_embedding: bool,
    /// Identities left with no detections, per kind.
    pub orphaned_people: Vec<i64>,
    pub orphaned_pets: Vec<i64>,
}

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ========================================================================
    // Photos
    // ========================================================================

    /// Insert a photo or refresh the date of an existing one; returns its id.
    pub fn add_photo(&self, path: &Path, taken_at: Option<DateTime<Utc>>) -> Result<i64> {
        let path_str = path.to_string_lossy();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path_str.to_string());
        let taken_at = taken_at.map(|t| t.to_rfc3339());

        self.conn.execute(
            r#"
            INSERT INTO photos (path, filename, taken_at)
            VALUES (?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET taken_at = excluded.taken_at
            "#,
            params![path_str, filename, taken_at],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM photos WHERE path = ?",
            [path_str],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn photo_exists(&self, photo_id: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM photos WHERE id = ?",
            [photo_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a photo with its detections and whole-image embedding in one
    /// transaction. Returns `None` if the photo did not exist.
    pub fn delete_photo(&self, photo_id: i64) -> Result<Option<DeletedPhoto>> {
        if !self.photo_exists(photo_id)? {
            return Ok(None);
        }

        let tx = self.conn.unchecked_transaction()?;

        let (face_ids, people) = self.detections_and_identities(EntityKind::Face, photo_id)?;
        let (pet_ids, pets) = self.detections_and_identities(EntityKind::Pet, photo_id)?;
        let had_image_embedding: i64 = tx.query_row(
            "SELECT COUNT(*) FROM image_embeddings WHERE photo_id = ?",
            [photo_id],
            |row| row.get(0),
        )?;

        tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM pet_detections WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM image_embeddings WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM user_tags WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM scene_tags WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM objects WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM locations WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM photos WHERE id = ?", [photo_id])?;
        tx.commit()?;

        Ok(Some(DeletedPhoto {
            photo_id,
            face_ids,
            pet_ids,
            had_image_embedding: had_image_embedding > 0,
            orphaned_people: self.orphaned_among(EntityKind::Face, &people)?,
            orphaned_pets: self.orphaned_among(EntityKind::Pet, &pets)?,
        }))
    }

    // ========================================================================
    // Whole-image embeddings
    // ========================================================================

    pub fn set_image_embedding(&self, photo_id: i64, embedding: &[f32], model_name: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO image_embeddings (photo_id, embedding, embedding_dim, model_name)
            VALUES (?, ?, ?, ?)
            "#,
            params![
                photo_id,
                embedding_to_bytes(embedding),
                embedding.len() as i64,
                model_name
            ],
        )?;
        Ok(())
    }

    pub fn get_image_embedding(&self, photo_id: i64) -> Result<Option<Vec<f32>>> {
        let result = self.conn.query_row(
            "SELECT embedding FROM image_embeddings WHERE photo_id = ?",
            [photo_id],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(bytes) => Ok(Some(bytes_to_embedding(&bytes))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids flagged as having an embedding of `kind`: detection ids for faces
    /// and pets, photo ids for whole images.
    pub fn embedded_ids(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let sql = match kind {
            EntityKind::Image => "SELECT photo_id FROM image_embeddings ORDER BY photo_id".to_string(),
            _ => format!(
                "SELECT id FROM {} WHERE embedding IS NOT NULL ORDER BY id",
                tables(kind)?.detections
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}

impl EmbeddingSource for Database {
    fn count_embeddings(&self, kind: EntityKind, dimension: usize) -> Result<usize> {
        let sql = match kind {
            EntityKind::Image => {
                "SELECT COUNT(*) FROM image_embeddings WHERE embedding_dim = ?".to_string()
            }
            _ => format!(
                "SELECT COUNT(*) FROM {} WHERE embedding IS NOT NULL AND embedding_dim = ?",
                tables(kind)?.detections
            ),
        };
        let count: i64 = self.conn.query_row(&sql, [dimension as i64], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn load_embeddings(&self, kind: EntityKind) -> Result<Vec<(i64, Vec<f32>)>> {
        let sql = match kind {
            EntityKind::Image => {
                "SELECT photo_id, embedding FROM image_embeddings ORDER BY photo_id".to_string()
            }
            _ => format!(
                "SELECT id, embedding FROM {} WHERE embedding IS NOT NULL ORDER BY id",
                tables(kind)?.detections
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let bytes: Vec<u8> = row.get(1)?;
                Ok((id, bytes_to_embedding(&bytes)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Convert f32 embedding to little-endian bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_embedding_bytes_round_trip() {
        let embedding = vec![0.25, -1.5, 3.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&embedding)), embedding);
    }

    #[test]
    fn test_add_photo_is_idempotent_on_path() {
        let db = test_db();
        let a = db.add_photo(Path::new("/photos/a.jpg"), None).unwrap();
        let again = db.add_photo(Path::new("/photos/a.jpg"), None).unwrap();
        let b = db.add_photo(Path::new("/photos/b.jpg"), None).unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert!(db.photo_exists(a).unwrap());
    }

    #[test]
    fn test_embedding_source_counts_only_embedded_records() {
        let db = test_db();
        let photo = db.add_photo(Path::new("/photos/a.jpg"), None).unwrap();
        db.add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0]))
            .unwrap();
        db.add_detection(
            EntityKind::Face,
            &NewDetection {
                embedding: None,
                ..NewDetection::face(photo, 0.9, vec![])
            },
        )
        .unwrap();
        db.set_image_embedding(photo, &[0.5, 0.5], Some("clip")).unwrap();

        assert_eq!(db.count_embeddings(EntityKind::Face, 2).unwrap(), 1);
        assert_eq!(db.count_embeddings(EntityKind::Face, 3).unwrap(), 0);
        assert_eq!(db.count_embeddings(EntityKind::Pet, 2).unwrap(), 0);
        assert_eq!(db.count_embeddings(EntityKind::Image, 2).unwrap(), 1);

        let faces = db.load_embeddings(EntityKind::Face).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].1, vec![1.0, 0.0]);
        assert_eq!(db.embedded_ids(EntityKind::Image).unwrap(), vec![photo]);
    }

    #[test]
    fn test_delete_photo_reports_removed_records() {
        let db = test_db();
        let photo = db.add_photo(Path::new("/photos/a.jpg"), None).unwrap();
        let face = db
            .add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0]))
            .unwrap();
        let person = db.create_identity(EntityKind::Face, 0, None).unwrap();
        db.lock_detection(EntityKind::Face, face, person).unwrap();
        db.set_image_embedding(photo, &[0.5, 0.5], None).unwrap();

        let deleted = db.delete_photo(photo).unwrap().unwrap();
        assert_eq!(deleted.face_ids, vec![face]);
        assert!(deleted.had_image_embedding);
        assert_eq!(deleted.orphaned_people, vec![person]);
        assert!(!db.photo_exists(photo).unwrap());
        assert!(db.delete_photo(photo).unwrap().is_none());
    }
}
