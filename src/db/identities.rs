//! People and pet identities.

use anyhow::{bail, Result};
use rusqlite::params;
use std::collections::BTreeMap;

use super::{tables, Database, KindTables};
use crate::identity::clusterer::UNKNOWN_SPECIES;
use crate::identity::{species_key, Assignment, IdentityStore, NewIdentity, NOISE};
use crate::vectors::EntityKind;

/// A person or pet
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: i64,
    pub kind: EntityKind,
    pub cluster_label: Option<i64>,
    pub name: Option<String>,
    /// Pets only.
    pub species: Option<String>,
    pub detection_count: i64,
}

impl Identity {
    /// Name for display, falling back to a generated one.
    pub fn display_name(&self) -> String {
        match (&self.name, &self.species) {
            (Some(name), _) => name.clone(),
            (None, Some(species)) => format!("Unnamed {} {}", species, self.id),
            (None, None) => format!("Person {}", self.id),
        }
    }
}

impl Database {
    // ========================================================================
    // Identity queries
    // ========================================================================

    fn identity_select(kind: EntityKind) -> Result<String> {
        let t = tables(kind)?;
        let species = if kind == EntityKind::Pet { "i.species" } else { "NULL" };
        Ok(format!(
            r#"
            SELECT i.id, i.cluster_label, i.name, {species}, COUNT(d.id)
            FROM {ids} i
            LEFT JOIN {det} d ON d.{col} = i.id
            "#,
            ids = t.identities,
            det = t.detections,
            col = t.identity_column,
        ))
    }

    pub fn list_identities(&self, kind: EntityKind) -> Result<Vec<Identity>> {
        let sql = format!("{} GROUP BY i.id ORDER BY i.id", Self::identity_select(kind)?);
        let mut stmt = self.conn.prepare(&sql)?;
        let identities = stmt
            .query_map([], |row| {
                Ok(Identity {
                    id: row.get(0)?,
                    kind,
                    cluster_label: row.get(1)?,
                    name: row.get(2)?,
                    species: row.get(3)?,
                    detection_count: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(identities)
    }

    pub fn get_identity(&self, kind: EntityKind, identity_id: i64) -> Result<Option<Identity>> {
        let sql = format!("{} WHERE i.id = ? GROUP BY i.id", Self::identity_select(kind)?);
        let result = self.conn.query_row(&sql, [identity_id], |row| {
            Ok(Identity {
                id: row.get(0)?,
                kind,
                cluster_label: row.get(1)?,
                name: row.get(2)?,
                species: row.get(3)?,
                detection_count: row.get(4)?,
            })
        });
        match result {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Identities sharing a cluster label, and for pets a species, grouped
    /// oldest first. Only groups of two or more are returned.
    pub fn duplicate_identities(&self, kind: EntityKind) -> Result<Vec<Vec<Identity>>> {
        let mut groups: BTreeMap<(i64, String), Vec<Identity>> = BTreeMap::new();
        for identity in self.list_identities(kind)? {
            let Some(label) = identity.cluster_label.filter(|l| *l != NOISE) else {
                continue;
            };
            let species = match kind {
                EntityKind::Pet => species_key(identity.species.as_deref()),
                _ => String::new(),
            };
            groups.entry((label, species)).or_default().push(identity);
        }
        Ok(groups.into_values().filter(|g| g.len() > 1).collect())
    }

    /// The subset of `identity_ids` that no detection references any more.
    pub(crate) fn orphaned_among(&self, kind: EntityKind, identity_ids: &[i64]) -> Result<Vec<i64>> {
        let t = tables(kind)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?",
            t.detections, t.identity_column
        );
        let mut orphaned = Vec::new();
        for &id in identity_ids {
            let count: i64 = self.conn.query_row(&sql, [id], |row| row.get(0))?;
            if count == 0 {
                orphaned.push(id);
            }
        }
        Ok(orphaned)
    }

    // ========================================================================
    // Identity maintenance
    // ========================================================================

    pub fn create_identity(&self, kind: EntityKind, label: i64, species: Option<&str>) -> Result<i64> {
        self.insert_identity(kind, Some(label), species)
    }

    fn insert_identity(&self, kind: EntityKind, label: Option<i64>, species: Option<&str>) -> Result<i64> {
        let t = tables(kind)?;
        if kind == EntityKind::Pet {
            self.conn.execute(
                "INSERT INTO pets (cluster_label, species) VALUES (?, ?)",
                params![label, species.unwrap_or(UNKNOWN_SPECIES)],
            )?;
        } else {
            self.conn.execute(
                &format!("INSERT INTO {} (cluster_label) VALUES (?)", t.identities),
                [label],
            )?;
        }
        Ok(self.conn.last_insert_rowid())
    }

    /// Runs inside the caller's transaction.
    fn write_assignments(&self, t: &KindTables, assignments: &[Assignment]) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!(
            "UPDATE {} SET cluster_label = ?, {} = ? WHERE id = ?",
            t.detections, t.identity_column
        ))?;
        for a in assignments {
            stmt.execute(params![a.cluster_label, a.identity_id, a.detection_id])?;
        }
        Ok(())
    }

    pub fn rename_identity(&self, kind: EntityKind, identity_id: i64, name: &str) -> Result<bool> {
        let t = tables(kind)?;
        let name = name.trim();
        let name = (!name.is_empty()).then_some(name);
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET name = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                t.identities
            ),
            params![name, identity_id],
        )?;
        Ok(changed > 0)
    }

    /// Move every detection of `source` to `target` and delete `source`.
    /// Returns the number of detections moved.
    pub fn merge_identities(&self, kind: EntityKind, source: i64, target: i64) -> Result<usize> {
        if source == target {
            bail!("Cannot merge identity {} into itself", source);
        }
        let t = tables(kind)?;
        let (Some(from), Some(into)) = (self.get_identity(kind, source)?, self.get_identity(kind, target)?) else {
            bail!("Both identities must exist to merge {} into {}", source, target);
        };
        if kind == EntityKind::Pet
            && species_key(from.species.as_deref()) != species_key(into.species.as_deref())
        {
            bail!(
                "Cannot merge a {} into a {}",
                from.species.as_deref().unwrap_or(UNKNOWN_SPECIES),
                into.species.as_deref().unwrap_or(UNKNOWN_SPECIES)
            );
        }

        let tx = self.conn.unchecked_transaction()?;
        let moved = tx.execute(
            &format!(
                "UPDATE {det} SET {col} = ?, cluster_label = ? WHERE {col} = ?",
                det = t.detections,
                col = t.identity_column
            ),
            params![target, into.cluster_label, source],
        )?;
        if into.name.is_none() && from.name.is_some() {
            tx.execute(
                &format!("UPDATE {} SET name = ? WHERE id = ?", t.identities),
                params![from.name, target],
            )?;
        }
        tx.execute(
            &format!("UPDATE {} SET updated_at = CURRENT_TIMESTAMP WHERE id = ?", t.identities),
            [target],
        )?;
        tx.execute(&format!("DELETE FROM {} WHERE id = ?", t.identities), [source])?;
        tx.commit()?;

        Ok(moved)
    }

    /// Delete an identity. Its detections become unassigned and unlocked so
    /// the next clustering pass picks them up again.
    pub fn delete_identity(&self, kind: EntityKind, identity_id: i64) -> Result<Option<usize>> {
        let t = tables(kind)?;
        if self.get_identity(kind, identity_id)?.is_none() {
            return Ok(None);
        }

        let tx = self.conn.unchecked_transaction()?;
        let released = tx.execute(
            &format!(
                "UPDATE {det} SET {col} = NULL, cluster_label = NULL, locked = 0 WHERE {col} = ?",
                det = t.detections,
                col = t.identity_column
            ),
            [identity_id],
        )?;
        tx.execute(&format!("DELETE FROM {} WHERE id = ?", t.identities), [identity_id])?;
        tx.commit()?;

        Ok(Some(released))
    }

    /// Delete every identity with zero detections; returns their ids.
    pub fn delete_orphaned_identities(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let orphaned = self.orphaned_identities(kind)?;
        if orphaned.is_empty() {
            return Ok(orphaned);
        }
        let t = tables(kind)?;
        let tx = self.conn.unchecked_transaction()?;
        for id in &orphaned {
            tx.execute(&format!("DELETE FROM {} WHERE id = ?", t.identities), [id])?;
        }
        tx.commit()?;
        Ok(orphaned)
    }
}

impl IdentityStore for Database {
    fn find_identity_by_label(&self, kind: EntityKind, label: i64, species: Option<&str>) -> Result<Option<i64>> {
        let t = tables(kind)?;
        let result = if kind == EntityKind::Pet {
            self.conn.query_row(
                &format!(
                    "SELECT id FROM {} WHERE cluster_label = ? AND LOWER(species) = LOWER(?) ORDER BY id LIMIT 1",
                    t.identities
                ),
                params![label, species.unwrap_or(UNKNOWN_SPECIES)],
                |row| row.get(0),
            )
        } else {
            self.conn.query_row(
                &format!(
                    "SELECT id FROM {} WHERE cluster_label = ? ORDER BY id LIMIT 1",
                    t.identities
                ),
                [label],
                |row| row.get(0),
            )
        };
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_pass(&self, kind: EntityKind, created: &[NewIdentity], assignments: &[Assignment]) -> Result<Vec<i64>> {
        let t = tables(kind)?;
        // Dropping the transaction on an early return rolls everything back.
        let tx = self.conn.unchecked_transaction()?;

        let mut ids = Vec::with_capacity(created.len());
        for new in created {
            let id = self.insert_identity(kind, new.label, new.species.as_deref())?;
            let members: Vec<Assignment> = new
                .detection_ids
                .iter()
                .map(|&detection_id| Assignment {
                    detection_id,
                    cluster_label: new.label,
                    identity_id: Some(id),
                })
                .collect();
            self.write_assignments(&t, &members)?;
            ids.push(id);
        }
        self.write_assignments(&t, assignments)?;

        tx.commit()?;
        Ok(ids)
    }

    fn orphaned_identities(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let t = tables(kind)?;
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT i.id FROM {ids} i
            WHERE NOT EXISTS (SELECT 1 FROM {det} d WHERE d.{col} = i.id)
            ORDER BY i.id
            "#,
            ids = t.identities,
            det = t.detections,
            col = t.identity_column,
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}
