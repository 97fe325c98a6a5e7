use anyhow::Result;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::dbscan::{dbscan, NOISE};
use crate::config::ClusteringConfig;
use crate::vectors::EntityKind;

/// Species bucket for pets whose species was not recorded.
pub const UNKNOWN_SPECIES: &str = "unknown";

/// One detection handed to a clustering pass.
#[derive(Debug, Clone)]
pub struct ClusterInput {
    pub detection_id: i64,
    pub embedding: Vec<f32>,
    pub confidence: f32,
    /// Pets only.
    pub species: Option<String>,
    /// Manually confirmed to its identity.
    pub locked: bool,
    pub suppressed: bool,
}

/// New cluster label and identity of one detection. `None` clears the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub detection_id: i64,
    pub cluster_label: Option<i64>,
    pub identity_id: Option<i64>,
}

impl Assignment {
    fn clear(detection_id: i64) -> Self {
        Self {
            detection_id,
            cluster_label: None,
            identity_id: None,
        }
    }

    fn noise(detection_id: i64) -> Self {
        Self {
            detection_id,
            cluster_label: Some(NOISE),
            identity_id: None,
        }
    }
}

/// Identity a pass creates for a group with no earlier identity, together
/// with the detections that make up the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIdentity {
    /// `None` leaves the identity without a cluster label.
    pub label: Option<i64>,
    pub species: Option<String>,
    pub detection_ids: Vec<i64>,
}

/// Identity records a clustering pass reads and writes.
pub trait IdentityStore {
    /// Identity previously created for `label`. Pets also match on species.
    fn find_identity_by_label(
        &self,
        kind: EntityKind,
        label: i64,
        species: Option<&str>,
    ) -> Result<Option<i64>>;

    /// Create `created` and apply `assignments` as one unit: either all of
    /// it lands or none of it does. Returns the new identity ids in order.
    fn apply_pass(
        &self,
        kind: EntityKind,
        created: &[NewIdentity],
        assignments: &[Assignment],
    ) -> Result<Vec<i64>>;

    /// Identities of `kind` left with zero detections.
    fn orphaned_identities(&self, kind: EntityKind) -> Result<Vec<i64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Success,
    /// Fewer usable embeddings than `min_samples`; nothing was clustered.
    InsufficientData,
}

/// Result of a clustering pass
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterReport {
    pub status: ClusterStatus,
    /// Number of detections handed to the pass
    pub total: usize,
    /// Detections below the confidence threshold, now unassigned
    pub excluded_low_confidence: usize,
    /// Locked or suppressed detections left untouched
    pub locked_skipped: usize,
    /// Non-noise groups found by DBSCAN
    pub groups: usize,
    /// Detections that ended up in a group
    pub clustered: usize,
    /// Detections labeled as noise
    pub noise: usize,
    pub identities_created: usize,
    pub identities_reused: usize,
    /// Single-detection groups left without an identity
    pub singletons_unassigned: usize,
    /// Identities with no detections after the pass
    pub orphaned_identities: Vec<i64>,
}

impl ClusterReport {
    fn empty(status: ClusterStatus, total: usize) -> Self {
        Self {
            status,
            total,
            excluded_low_confidence: 0,
            locked_skipped: 0,
            groups: 0,
            clustered: 0,
            noise: 0,
            identities_created: 0,
            identities_reused: 0,
            singletons_unassigned: 0,
            orphaned_identities: Vec::new(),
        }
    }
}

/// Runs DBSCAN over a snapshot of detections and reconciles the resulting
/// labels with existing identities.
pub struct IdentityClusterer<'a> {
    kind: EntityKind,
    config: &'a ClusteringConfig,
}

impl<'a> IdentityClusterer<'a> {
    pub fn new(kind: EntityKind, config: &'a ClusteringConfig) -> Self {
        Self { kind, config }
    }

    pub fn run(&self, mut inputs: Vec<ClusterInput>, store: &dyn IdentityStore) -> Result<ClusterReport> {
        let total = inputs.len();
        let min_samples = self.config.min_samples.max(1);

        if total < min_samples {
            info!(
                "Not enough {} detections for clustering: {} < {}",
                self.kind, total, min_samples
            );
            return Ok(ClusterReport::empty(ClusterStatus::InsufficientData, total));
        }

        inputs.sort_by_key(|d| d.detection_id);

        let mut report = ClusterReport::empty(ClusterStatus::Success, total);
        let mut assignments = Vec::with_capacity(total);
        let mut eligible = Vec::with_capacity(total);

        for input in inputs {
            if input.locked || input.suppressed {
                report.locked_skipped += 1;
            } else if input.confidence < self.config.min_confidence {
                report.excluded_low_confidence += 1;
                assignments.push(Assignment::clear(input.detection_id));
            } else {
                eligible.push(input);
            }
        }

        if eligible.len() < min_samples {
            info!(
                "Not enough confident {} detections for clustering: {} < {}",
                self.kind,
                eligible.len(),
                min_samples
            );
            store.apply_pass(self.kind, &[], &assignments)?;
            report.status = ClusterStatus::InsufficientData;
            return Ok(report);
        }

        // Pets never cluster across species; each species gets its own pass.
        let mut partitions: BTreeMap<String, Vec<ClusterInput>> = BTreeMap::new();
        for input in eligible {
            let key = match self.kind {
                EntityKind::Pet => species_key(input.species.as_deref()),
                _ => String::new(),
            };
            partitions.entry(key).or_default().push(input);
        }

        let mut created = Vec::new();
        let mut offset = 0;
        for (species, members) in &partitions {
            let species = match self.kind {
                EntityKind::Pet => Some(species.as_str()),
                _ => None,
            };

            let embeddings: Vec<Vec<f32>> = members.iter().map(|m| m.embedding.clone()).collect();
            let labels = dbscan(&embeddings, self.config.eps, min_samples);

            let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
            for (member, label) in members.iter().zip(&labels) {
                if *label == NOISE {
                    report.noise += 1;
                    assignments.push(Assignment::noise(member.detection_id));
                } else {
                    groups.entry(label + offset).or_default().push(member.detection_id);
                }
            }

            let found = groups.len() as i64;
            debug!(
                "{} clustering{}: {} groups over {} detections",
                self.kind,
                species.map(|s| format!(" ({})", s)).unwrap_or_default(),
                found,
                members.len()
            );

            for (label, detection_ids) in groups {
                report.groups += 1;

                if detection_ids.len() == 1 && !self.config.keep_singletons {
                    report.singletons_unassigned += 1;
                    assignments.extend(detection_ids.into_iter().map(Assignment::noise));
                    continue;
                }

                report.clustered += detection_ids.len();
                match store.find_identity_by_label(self.kind, label, species)? {
                    Some(identity_id) => {
                        report.identities_reused += 1;
                        assignments.extend(detection_ids.into_iter().map(|detection_id| Assignment {
                            detection_id,
                            cluster_label: Some(label),
                            identity_id: Some(identity_id),
                        }));
                    }
                    None => {
                        report.identities_created += 1;
                        created.push(NewIdentity {
                            label: Some(label),
                            species: species.map(String::from),
                            detection_ids,
                        });
                    }
                }
            }

            offset += found;
        }

        store.apply_pass(self.kind, &created, &assignments)?;
        report.orphaned_identities = store.orphaned_identities(self.kind)?;

        info!(
            "{} clustering complete: {} groups, {} clustered, {} noise, {} low confidence, {} created, {} reused",
            self.kind,
            report.groups,
            report.clustered,
            report.noise,
            report.excluded_low_confidence,
            report.identities_created,
            report.identities_reused
        );

        Ok(report)
    }
}

/// Normalized species used to partition pets.
pub fn species_key(species: Option<&str>) -> String {
    match species.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_lowercase(),
        _ => UNKNOWN_SPECIES.to_string(),
    }
}
