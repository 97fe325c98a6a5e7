//! Named vector indices over detection embeddings.
//!
//! Every entity kind (faces, pets, whole images) gets its own flat index
//! holding L2-normalized vectors and a position -> detection id map. The
//! record store stays authoritative: an index can always be thrown away and
//! rebuilt from the embeddings stored next to each detection.

pub mod flat;
pub mod manager;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use flat::FlatIndex;
pub use manager::{
    EmbeddingSource, IndexStats, RebuildAction, RebuildOutcome, VectorIndexManager,
};
pub use store::IntegrityReport;

/// Category of vectors held by one named index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Face,
    Pet,
    Image,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Face, EntityKind::Pet, EntityKind::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Face => "face",
            EntityKind::Pet => "pet",
            EntityKind::Image => "image",
        }
    }

    /// Whether detections of this kind are grouped into identities.
    pub fn has_identities(&self) -> bool {
        matches!(self, EntityKind::Face | EntityKind::Pet)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "face" | "faces" => Ok(EntityKind::Face),
            "pet" | "pets" => Ok(EntityKind::Pet),
            "image" | "images" => Ok(EntityKind::Image),
            other => Err(anyhow::anyhow!("unknown entity kind: {}", other)),
        }
    }
}

/// Distance metric of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Plain squared L2 distance.
    Euclidean,
    /// Inner product over normalized vectors.
    Cosine,
}

/// One neighbor returned by a search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub entity_id: i64,
    /// Cosine similarity in [-1, 1] for cosine indices. Euclidean indices
    /// report the negated squared distance so that higher is always closer.
    pub similarity: f32,
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Return a unit-length copy of `vector`.
pub fn normalized(vector: &[f32]) -> Vec<f32> {
    let mut v = vector.to_vec();
    normalize(&mut v);
    v
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
