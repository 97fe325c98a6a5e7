//! Lookups behind the search signal sources.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Row, ToSql};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{tables, Database};
use crate::vectors::EntityKind;

/// A label attached to a photo with a confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLabel {
    pub photo_id: i64,
    pub label: String,
    pub confidence: f32,
}

/// Detector output matched by category or species.
pub type ObjectHit = ScoredLabel;

/// Reverse-geocoded place names of one photo.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceName {
    pub photo_id: i64,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

impl PlaceName {
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        [&self.city, &self.region, &self.country]
            .into_iter()
            .filter_map(|f| f.as_deref())
    }
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn row_to_label(row: &Row<'_>) -> rusqlite::Result<ScoredLabel> {
    Ok(ScoredLabel {
        photo_id: row.get(0)?,
        label: row.get(1)?,
        confidence: row.get::<_, f64>(2)? as f32,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn parse_taken_at(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

impl Database {
    // ========================================================================
    // Descriptive data written by the import pipeline
    // ========================================================================

    pub fn add_user_tag(&self, photo_id: i64, tag: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO user_tags (photo_id, tag) VALUES (?, ?)",
            params![photo_id, tag.trim()],
        )?;
        Ok(())
    }

    pub fn add_scene_tag(&self, photo_id: i64, label: &str, confidence: f32) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scene_tags (photo_id, label, confidence) VALUES (?, ?, ?)",
            params![photo_id, label.trim(), confidence as f64],
        )?;
        Ok(())
    }

    pub fn add_object(&self, photo_id: i64, category: &str, confidence: f32) -> Result<()> {
        self.conn.execute(
            "INSERT INTO objects (photo_id, category, confidence) VALUES (?, ?, ?)",
            params![photo_id, category.trim().to_lowercase(), confidence as f64],
        )?;
        Ok(())
    }

    pub fn set_location(&self, place: &PlaceName) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO locations (photo_id, city, region, country) VALUES (?, ?, ?, ?)",
            params![place.photo_id, place.city, place.region, place.country],
        )?;
        Ok(())
    }

    // ========================================================================
    // Signal source queries
    // ========================================================================

    /// Run `sql` with one LIKE pattern per term and merge the rows.
    fn query_labels_like(&self, sql: &str, terms: &[&str], min_confidence: Option<f32>) -> Result<Vec<ScoredLabel>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut seen: BTreeMap<(i64, String), f32> = BTreeMap::new();
        let min = min_confidence.map(|m| m as f64);
        for term in terms {
            let pattern = like_pattern(term);
            let args: Vec<&dyn ToSql> = match &min {
                Some(m) => vec![&pattern as &dyn ToSql, m as &dyn ToSql],
                None => vec![&pattern as &dyn ToSql],
            };
            let rows: Vec<ScoredLabel> = stmt
                .query_map(args.as_slice(), row_to_label)?
                .filter_map(|r| r.ok())
                .collect();

            for row in rows {
                let entry = seen.entry((row.photo_id, row.label)).or_insert(0.0);
                *entry = entry.max(row.confidence);
            }
        }
        Ok(seen
            .into_iter()
            .map(|((photo_id, label), confidence)| ScoredLabel {
                photo_id,
                label,
                confidence,
            })
            .collect())
    }

    /// User tags containing any of `terms`.
    pub fn user_tags_matching(&self, terms: &[&str]) -> Result<Vec<ScoredLabel>> {
        self.query_labels_like(
            "SELECT photo_id, tag, 1.0 FROM user_tags WHERE LOWER(tag) LIKE LOWER(?) ESCAPE '\\'",
            terms,
            None,
        )
    }

    /// Scene tags containing any of `terms` with at least `min_confidence`.
    pub fn scene_tags_matching(&self, terms: &[&str], min_confidence: f32) -> Result<Vec<ScoredLabel>> {
        self.query_labels_like(
            r#"
            SELECT photo_id, label, confidence FROM scene_tags
            WHERE LOWER(label) LIKE LOWER(?) ESCAPE '\' AND confidence >= ?
            "#,
            terms,
            Some(min_confidence),
        )
    }

    /// Photos showing a named person whose name contains any of `terms`.
    pub fn person_names_matching(&self, terms: &[&str]) -> Result<Vec<ScoredLabel>> {
        self.query_labels_like(
            r#"
            SELECT DISTINCT f.photo_id, p.name, 1.0
            FROM faces f
            JOIN people p ON p.id = f.person_id
            WHERE p.name IS NOT NULL AND LOWER(p.name) LIKE LOWER(?) ESCAPE '\'
            "#,
            terms,
            None,
        )
    }

    /// Photos whose city, region or country contains any of `terms`.
    pub fn locations_matching(&self, terms: &[&str]) -> Result<Vec<PlaceName>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT photo_id, city, region, country FROM locations
            WHERE LOWER(city) LIKE LOWER(?1) ESCAPE '\'
               OR LOWER(region) LIKE LOWER(?1) ESCAPE '\'
               OR LOWER(country) LIKE LOWER(?1) ESCAPE '\'
            "#,
        )?;
        let mut places: BTreeMap<i64, PlaceName> = BTreeMap::new();
        for term in terms {
            let rows: Vec<PlaceName> = stmt
                .query_map([like_pattern(term)], |row| {
                    Ok(PlaceName {
                        photo_id: row.get(0)?,
                        city: row.get(1)?,
                        region: row.get(2)?,
                        country: row.get(3)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            for place in rows {
                places.entry(place.photo_id).or_insert(place);
            }
        }
        Ok(places.into_values().collect())
    }

    /// Objects detected with one of `categories`, best confidence per photo
    /// and category.
    pub fn objects_in_categories(&self, categories: &[String], min_confidence: f32) -> Result<Vec<ObjectHit>> {
        if categories.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT photo_id, category, MAX(confidence) FROM objects
            WHERE category IN ({}) AND confidence >= ?
            GROUP BY photo_id, category
            ORDER BY photo_id, category
            "#,
            placeholders(categories.len())
        );
        let mut values: Vec<rusqlite::types::Value> = categories
            .iter()
            .map(|c| rusqlite::types::Value::Text(c.to_lowercase()))
            .collect();
        values.push(rusqlite::types::Value::Real(min_confidence as f64));

        let mut stmt = self.conn.prepare(&sql)?;
        let hits = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(ObjectHit {
                    photo_id: row.get(0)?,
                    label: row.get(1)?,
                    confidence: row.get::<_, f64>(2)? as f32,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hits)
    }

    /// Pet detections of one of `species`, best confidence per photo.
    pub fn pets_of_species(&self, species: &[&str], min_confidence: f32) -> Result<Vec<ObjectHit>> {
        if species.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT photo_id, LOWER(species), MAX(confidence) FROM pet_detections
            WHERE LOWER(species) IN ({}) AND confidence >= ? AND suppressed = 0
            GROUP BY photo_id, LOWER(species)
            ORDER BY photo_id
            "#,
            placeholders(species.len())
        );
        let mut values: Vec<rusqlite::types::Value> = species
            .iter()
            .map(|s| rusqlite::types::Value::Text(s.to_lowercase()))
            .collect();
        values.push(rusqlite::types::Value::Real(min_confidence as f64));

        let mut stmt = self.conn.prepare(&sql)?;
        let hits = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(ObjectHit {
                    photo_id: row.get(0)?,
                    label: row.get(1)?,
                    confidence: row.get::<_, f64>(2)? as f32,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hits)
    }

    /// Every scene tag of a photo.
    pub fn scene_labels(&self, photo_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM scene_tags WHERE photo_id = ? ORDER BY confidence DESC")?;
        let labels = stmt
            .query_map([photo_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(labels)
    }

    /// `taken_at` of each photo in `photo_ids` that still exists.
    pub fn photo_dates(&self, photo_ids: &[i64]) -> Result<HashMap<i64, Option<DateTime<Utc>>>> {
        let mut stmt = self.conn.prepare("SELECT taken_at FROM photos WHERE id = ?")?;
        let mut dates = HashMap::with_capacity(photo_ids.len());
        for &id in photo_ids {
            let result = stmt.query_row([id], |row| row.get::<_, Option<String>>(0));
            match result {
                Ok(taken_at) => {
                    dates.insert(id, parse_taken_at(taken_at));
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(dates)
    }

    /// Photos with at least one detected object of `category`.
    pub fn photos_with_object(&self, category: &str) -> Result<HashSet<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT photo_id FROM objects WHERE category = ?")?;
        let photos = stmt
            .query_map([category.trim().to_lowercase()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(photos)
    }

    /// Photos containing at least one detection of `identity_id`.
    pub fn photos_with_identity(&self, kind: EntityKind, identity_id: i64) -> Result<HashSet<i64>> {
        let t = tables(kind)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT photo_id FROM {} WHERE {} = ?",
            t.detections, t.identity_column
        ))?;
        let photos = stmt
            .query_map([identity_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(photos)
    }
}
