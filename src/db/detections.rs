//! Face and pet detections.

use anyhow::Result;
use rusqlite::{params, Row};

use super::{bytes_to_embedding, embedding_to_bytes, tables, Database};
use crate::identity::{ClusterInput, NeighborIdentity, NeighborLookup};
use crate::vectors::EntityKind;

/// Bounding box of a detection in photo pixel coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A detection as produced by the detection pipeline
#[derive(Debug, Clone, Default)]
pub struct NewDetection {
    pub photo_id: i64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Pets only.
    pub species: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl NewDetection {
    pub fn face(photo_id: i64, confidence: f32, embedding: Vec<f32>) -> Self {
        Self {
            photo_id,
            confidence,
            embedding: Some(embedding),
            ..Default::default()
        }
    }

    pub fn pet(photo_id: i64, species: &str, confidence: f32, embedding: Vec<f32>) -> Self {
        Self {
            photo_id,
            confidence,
            species: Some(species.to_string()),
            embedding: Some(embedding),
            ..Default::default()
        }
    }
}

/// A stored face or pet detection
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: i64,
    pub kind: EntityKind,
    pub photo_id: i64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub species: Option<String>,
    pub has_embedding: bool,
    pub cluster_label: Option<i64>,
    pub identity_id: Option<i64>,
    pub locked: bool,
    pub suppressed: bool,
}

/// What deleting one detection changed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedDetection {
    pub detection_id: i64,
    pub photo_id: i64,
    pub had_embedding: bool,
    pub identity_id: Option<i64>,
    /// The former identity, if this was its last detection.
    pub orphaned_identities: Vec<i64>,
}

fn detection_columns(kind: EntityKind) -> Result<String> {
    let t = tables(kind)?;
    let species = if kind == EntityKind::Pet { "species" } else { "NULL" };
    Ok(format!(
        "id, photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, {species}, \
         embedding IS NOT NULL, cluster_label, {}, locked, suppressed",
        t.identity_column
    ))
}

fn row_to_detection(kind: EntityKind, row: &Row<'_>) -> rusqlite::Result<Detection> {
    Ok(Detection {
        id: row.get(0)?,
        kind,
        photo_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        confidence: row.get::<_, f64>(6)? as f32,
        species: row.get(7)?,
        has_embedding: row.get(8)?,
        cluster_label: row.get(9)?,
        identity_id: row.get(10)?,
        locked: row.get(11)?,
        suppressed: row.get(12)?,
    })
}

impl Database {
    // ========================================================================
    // Detection records
    // ========================================================================

    pub fn add_detection(&self, kind: EntityKind, detection: &NewDetection) -> Result<i64> {
        let t = tables(kind)?;
        let embedding = detection.embedding.as_deref().map(embedding_to_bytes);
        let dim = detection.embedding.as_ref().map(|e| e.len() as i64);
        let b = detection.bbox;

        if kind == EntityKind::Pet {
            self.conn.execute(
                r#"
                INSERT INTO pet_detections
                    (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, species, confidence, embedding, embedding_dim)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    detection.photo_id,
                    b.x,
                    b.y,
                    b.width,
                    b.height,
                    detection.species,
                    detection.confidence as f64,
                    embedding,
                    dim
                ],
            )?;
        } else {
            self.conn.execute(
                &format!(
                    r#"
                    INSERT INTO {}
                        (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, embedding, embedding_dim)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                    t.detections
                ),
                params![
                    detection.photo_id,
                    b.x,
                    b.y,
                    b.width,
                    b.height,
                    detection.confidence as f64,
                    embedding,
                    dim
                ],
            )?;
        }
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_detection(&self, kind: EntityKind, detection_id: i64) -> Result<Option<Detection>> {
        let t = tables(kind)?;
        let result = self.conn.query_row(
            &format!("SELECT {} FROM {} WHERE id = ?", detection_columns(kind)?, t.detections),
            [detection_id],
            |row| row_to_detection(kind, row),
        );
        match result {
            Ok(detection) => Ok(Some(detection)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn detection_embedding(&self, kind: EntityKind, detection_id: i64) -> Result<Option<Vec<f32>>> {
        let t = tables(kind)?;
        let result = self.conn.query_row(
            &format!("SELECT embedding FROM {} WHERE id = ?", t.detections),
            [detection_id],
            |row| row.get::<_, Option<Vec<u8>>>(0),
        );
        match result {
            Ok(bytes) => Ok(bytes.map(|b| bytes_to_embedding(&b))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one detection. Returns `None` if it did not exist.
    pub fn delete_detection(&self, kind: EntityKind, detection_id: i64) -> Result<Option<DeletedDetection>> {
        let t = tables(kind)?;
        let Some(detection) = self.get_detection(kind, detection_id)? else {
            return Ok(None);
        };

        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", t.detections),
            [detection_id],
        )?;

        let orphaned_identities = match detection.identity_id {
            Some(identity_id) => self.orphaned_among(kind, &[identity_id])?,
            None => Vec::new(),
        };

        Ok(Some(DeletedDetection {
            detection_id,
            photo_id: detection.photo_id,
            had_embedding: detection.has_embedding,
            identity_id: detection.identity_id,
            orphaned_identities,
        }))
    }

    pub fn detections_for_identity(&self, kind: EntityKind, identity_id: i64) -> Result<Vec<Detection>> {
        let t = tables(kind)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY id",
            detection_columns(kind)?,
            t.detections,
            t.identity_column
        ))?;
        let detections = stmt
            .query_map([identity_id], |row| row_to_detection(kind, row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(detections)
    }

    /// Detection ids of a photo and the distinct identities they belong to.
    pub(crate) fn detections_and_identities(&self, kind: EntityKind, photo_id: i64) -> Result<(Vec<i64>, Vec<i64>)> {
        let t = tables(kind)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, {} FROM {} WHERE photo_id = ? ORDER BY id",
            t.identity_column, t.detections
        ))?;
        let rows: Vec<(i64, Option<i64>)> = stmt
            .query_map([photo_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let ids = rows.iter().map(|(id, _)| *id).collect();
        let mut identities: Vec<i64> = rows.iter().filter_map(|(_, identity)| *identity).collect();
        identities.sort_unstable();
        identities.dedup();
        Ok((ids, identities))
    }

    // ========================================================================
    // Clustering inputs
    // ========================================================================

    /// Snapshot of every embedded detection of `kind`, ascending by id.
    pub fn cluster_inputs(&self, kind: EntityKind) -> Result<Vec<ClusterInput>> {
        self.query_cluster_inputs(kind, None)
    }

    /// Embedded detections currently attached to `identity_id`.
    pub fn identity_cluster_inputs(&self, kind: EntityKind, identity_id: i64) -> Result<Vec<ClusterInput>> {
        self.query_cluster_inputs(kind, Some(identity_id))
    }

    fn query_cluster_inputs(&self, kind: EntityKind, identity_id: Option<i64>) -> Result<Vec<ClusterInput>> {
        let t = tables(kind)?;
        let species = if kind == EntityKind::Pet { "species" } else { "NULL" };
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT id, embedding, confidence, {species}, locked, suppressed
            FROM {det}
            WHERE embedding IS NOT NULL AND (?1 IS NULL OR {col} = ?1)
            ORDER BY id
            "#,
            det = t.detections,
            col = t.identity_column,
        ))?;
        let inputs = stmt
            .query_map([identity_id], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok(ClusterInput {
                    detection_id: row.get(0)?,
                    embedding: bytes_to_embedding(&bytes),
                    confidence: row.get::<_, f64>(2)? as f32,
                    species: row.get(3)?,
                    locked: row.get(4)?,
                    suppressed: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(inputs)
    }

    /// Embedded detections no clustering pass has labeled yet and that the
    /// next pass would consider.
    pub fn count_unclustered(&self, kind: EntityKind, min_confidence: f32) -> Result<usize> {
        let t = tables(kind)?;
        let count: i64 = self.conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*) FROM {}
                WHERE embedding IS NOT NULL
                  AND cluster_label IS NULL
                  AND locked = 0
                  AND suppressed = 0
                  AND confidence >= ?
                "#,
                t.detections
            ),
            [min_confidence as f64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Manual corrections
    // ========================================================================

    /// Attach a detection to an identity without touching its cluster label.
    pub fn set_detection_identity(&self, kind: EntityKind, detection_id: i64, identity_id: Option<i64>) -> Result<()> {
        let t = tables(kind)?;
        self.conn.execute(
            &format!("UPDATE {} SET {} = ? WHERE id = ?", t.detections, t.identity_column),
            params![identity_id, detection_id],
        )?;
        Ok(())
    }

    /// Confirm a detection as `identity_id`; clustering passes skip it from now on.
    pub fn lock_detection(&self, kind: EntityKind, detection_id: i64, identity_id: i64) -> Result<bool> {
        let t = tables(kind)?;
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET {} = ?, locked = 1 WHERE id = ?",
                t.detections, t.identity_column
            ),
            params![identity_id, detection_id],
        )?;
        Ok(changed > 0)
    }

    pub fn unlock_detection(&self, kind: EntityKind, detection_id: i64) -> Result<bool> {
        let t = tables(kind)?;
        let changed = self.conn.execute(
            &format!("UPDATE {} SET locked = 0 WHERE id = ?", t.detections),
            [detection_id],
        )?;
        Ok(changed > 0)
    }

    /// Suppressed detections lose their identity and are ignored by clustering.
    pub fn set_suppressed(&self, kind: EntityKind, detection_id: i64, suppressed: bool) -> Result<bool> {
        let t = tables(kind)?;
        let sql = if suppressed {
            format!(
                "UPDATE {} SET suppressed = 1, {} = NULL, cluster_label = NULL, locked = 0 WHERE id = ?",
                t.detections, t.identity_column
            )
        } else {
            format!("UPDATE {} SET suppressed = 0 WHERE id = ?", t.detections)
        };
        let changed = self.conn.execute(&sql, [detection_id])?;
        Ok(changed > 0)
    }
}

impl NeighborLookup for Database {
    fn neighbor_identity(&self, kind: EntityKind, detection_id: i64) -> Result<Option<NeighborIdentity>> {
        let t = tables(kind)?;
        let species = if kind == EntityKind::Pet { "i.species" } else { "NULL" };
        let result = self.conn.query_row(
            &format!(
                r#"
                SELECT d.{col}, d.locked, {species}
                FROM {det} d
                JOIN {ids} i ON i.id = d.{col}
                WHERE d.id = ?
                "#,
                col = t.identity_column,
                det = t.detections,
                ids = t.identities,
            ),
            [detection_id],
            |row| {
                Ok(NeighborIdentity {
                    identity_id: row.get(0)?,
                    locked: row.get(1)?,
                    species: row.get(2)?,
                })
            },
        );
        match result {
            Ok(neighbor) => Ok(Some(neighbor)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use std::path::Path;

    #[test]
    fn test_add_and_get_detection() {
        let db = test_db();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let id = db
            .add_detection(EntityKind::Pet, &NewDetection::pet(photo, "dog", 0.8, vec![0.0, 1.0]))
            .unwrap();

        let detection = db.get_detection(EntityKind::Pet, id).unwrap().unwrap();
        assert_eq!(detection.photo_id, photo);
        assert_eq!(detection.species.as_deref(), Some("dog"));
        assert!(detection.has_embedding);
        assert_eq!(detection.identity_id, None);
        assert_eq!(
            db.detection_embedding(EntityKind::Pet, id).unwrap(),
            Some(vec![0.0, 1.0])
        );
        assert!(db.get_detection(EntityKind::Face, id).unwrap().is_none());
        assert!(db.get_detection(EntityKind::Image, id).is_err());
    }

    #[test]
    fn test_deleting_last_detection_orphans_identity() {
        let db = test_db();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let a = db
            .add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0]))
            .unwrap();
        let b = db
            .add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0]))
            .unwrap();
        let person = db.create_identity(EntityKind::Face, 0, None).unwrap();
        db.set_detection_identity(EntityKind::Face, a, Some(person)).unwrap();
        db.set_detection_identity(EntityKind::Face, b, Some(person)).unwrap();

        let first = db.delete_detection(EntityKind::Face, a).unwrap().unwrap();
        assert!(first.orphaned_identities.is_empty());
        assert!(first.had_embedding);

        let last = db.delete_detection(EntityKind::Face, b).unwrap().unwrap();
        assert_eq!(last.orphaned_identities, vec![person]);
        assert!(db.delete_detection(EntityKind::Face, b).unwrap().is_none());
    }

    #[test]
    fn test_unclustered_count_respects_flags() {
        let db = test_db();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let strong = db
            .add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0]))
            .unwrap();
        db.add_detection(EntityKind::Face, &NewDetection::face(photo, 0.3, vec![1.0, 0.0]))
            .unwrap();
        let hidden = db
            .add_detection(EntityKind::Face, &NewDetection::face(photo, 0.9, vec![1.0, 0.0]))
            .unwrap();
        db.set_suppressed(EntityKind::Face, hidden, true).unwrap();

        assert_eq!(db.count_unclustered(EntityKind::Face, 0.6).unwrap(), 1);

        let person = db.create_identity(EntityKind::Face, 0, None).unwrap();
        db.lock_detection(EntityKind::Face, strong, person).unwrap();
        assert_eq!(db.count_unclustered(EntityKind::Face, 0.6).unwrap(), 0);

        let inputs = db.cluster_inputs(EntityKind::Face).unwrap();
        assert_eq!(inputs.len(), 3);
        assert!(inputs[0].locked);
        assert!(inputs[2].suppressed);
    }

    #[test]
    fn test_neighbor_identity_lookup() {
        let db = test_db();
        let photo = db.add_photo(Path::new("/p/1.jpg"), None).unwrap();
        let pet = db
            .add_detection(EntityKind::Pet, &NewDetection::pet(photo, "cat", 0.9, vec![1.0, 0.0]))
            .unwrap();
        assert!(db.neighbor_identity(EntityKind::Pet, pet).unwrap().is_none());

        let identity = db.create_identity(EntityKind::Pet, 3, Some("cat")).unwrap();
        db.lock_detection(EntityKind::Pet, pet, identity).unwrap();

        let neighbor = db.neighbor_identity(EntityKind::Pet, pet).unwrap().unwrap();
        assert_eq!(neighbor.identity_id, identity);
        assert!(neighbor.locked);
        assert_eq!(neighbor.species.as_deref(), Some("cat"));
    }
}
