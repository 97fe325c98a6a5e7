//! Exact (brute force) vector index.
//!
//! A flat index cannot delete rows in place. Removal reconstructs every
//! retained vector into a fresh index, which is what keeps the id map and
//! the vector matrix in lockstep.

use std::collections::{HashMap, HashSet};

use ndarray::{Array1, Array2, Axis};

use super::{normalize, normalized, Metric, SearchHit};
use crate::error::{IndexError, IndexResult};

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    metric: Metric,
    /// One row per stored vector.
    vectors: Array2<f32>,
    /// Row position -> entity id.
    ids: Vec<i64>,
    /// Entity id -> row position.
    positions: HashMap<i64, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            vectors: Array2::zeros((0, dimension)),
            ids: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Assemble an index from a vector matrix and its id map, as read from disk.
    /// Vectors are taken as stored; they were prepared when first added.
    pub fn from_parts(metric: Metric, vectors: Array2<f32>, ids: Vec<i64>) -> IndexResult<Self> {
        if vectors.nrows() != ids.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.nrows(),
                ids: ids.len(),
            });
        }

        let positions = position_map(&ids);
        if positions.len() != ids.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.nrows(),
                ids: positions.len(),
            });
        }

        Ok(Self {
            dimension: vectors.ncols(),
            metric,
            vectors,
            ids,
            positions,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn vectors(&self) -> &Array2<f32> {
        &self.vectors
    }

    pub fn contains(&self, entity_id: i64) -> bool {
        self.positions.contains_key(&entity_id)
    }

    /// Append vectors, recording `entity_ids` at their new positions.
    ///
    /// An id that is already present has its old row dropped first so an
    /// entity never appears twice.
    pub fn add(&mut self, vectors: &[Vec<f32>], entity_ids: &[i64]) -> IndexResult<()> {
        if vectors.len() != entity_ids.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.len(),
                ids: entity_ids.len(),
            });
        }
        if vectors.is_empty() {
            return Ok(());
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                found: bad.len(),
            });
        }

        // Last write wins for ids repeated inside the batch itself.
        let mut latest: HashMap<i64, usize> = HashMap::with_capacity(entity_ids.len());
        for (i, id) in entity_ids.iter().enumerate() {
            latest.insert(*id, i);
        }

        let replaced: HashSet<i64> = latest
            .keys()
            .copied()
            .filter(|id| self.positions.contains_key(id))
            .collect();
        if !replaced.is_empty() {
            *self = self.without(&replaced);
        }

        let mut flat = Vec::with_capacity(latest.len() * self.dimension);
        let mut new_ids = Vec::with_capacity(latest.len());
        for (i, (vector, id)) in vectors.iter().zip(entity_ids).enumerate() {
            if latest.get(id) != Some(&i) {
                continue;
            }
            let mut row = vector.clone();
            if self.metric == Metric::Cosine {
                normalize(&mut row);
            }
            flat.extend_from_slice(&row);
            new_ids.push(*id);
        }

        let batch = Array2::from_shape_vec((new_ids.len(), self.dimension), flat).map_err(|_| {
            IndexError::DimensionMismatch {
                expected: self.dimension,
                found: 0,
            }
        })?;
        self.vectors
            .append(Axis(0), batch.view())
            .map_err(|_| IndexError::DimensionMismatch {
                expected: self.dimension,
                found: batch.ncols(),
            })?;

        let start = self.ids.len();
        for (offset, id) in new_ids.into_iter().enumerate() {
            self.positions.insert(id, start + offset);
            self.ids.push(id);
        }

        Ok(())
    }

    /// Return up to `k` neighbors ordered by descending similarity.
    /// `k` is clamped to the index size; an empty index yields no hits.
    pub fn search(&self, query: &[f32], k: usize) -> IndexResult<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            });
        }
        let k = k.min(self.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let q = match self.metric {
            Metric::Cosine => Array1::from(normalized(query)),
            Metric::Euclidean => Array1::from(query.to_vec()),
        };
        let scores: Array1<f32> = match self.metric {
            Metric::Cosine => self.vectors.dot(&q),
            Metric::Euclidean => self
                .vectors
                .rows()
                .into_iter()
                .map(|row| {
                    -row.iter()
                        .zip(q.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>()
                })
                .collect(),
        };

        let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);

        Ok(ranked
            .into_iter()
            .map(|(pos, similarity)| SearchHit {
                entity_id: self.ids[pos],
                similarity,
            })
            .collect())
    }

    /// Copy the stored vector at an internal position.
    pub fn reconstruct(&self, position: usize) -> Option<Vec<f32>> {
        if position >= self.len() {
            return None;
        }
        Some(self.vectors.row(position).to_vec())
    }

    /// Copy the stored vector of an entity.
    pub fn vector_for(&self, entity_id: i64) -> Option<Vec<f32>> {
        self.positions
            .get(&entity_id)
            .and_then(|pos| self.reconstruct(*pos))
    }

    /// Build a fresh index holding every vector except those of `remove`.
    pub fn without(&self, remove: &HashSet<i64>) -> FlatIndex {
        let mut flat = Vec::with_capacity(self.vectors.len());
        let mut kept_ids = Vec::with_capacity(self.len());

        for (position, id) in self.ids.iter().enumerate() {
            if remove.contains(id) {
                continue;
            }
            flat.extend(self.vectors.row(position).iter().copied());
            kept_ids.push(*id);
        }

        let vectors = Array2::from_shape_vec((kept_ids.len(), self.dimension), flat)
            .unwrap_or_else(|_| Array2::zeros((0, self.dimension)));
        let positions = position_map(&kept_ids);

        FlatIndex {
            dimension: self.dimension,
            metric: self.metric,
            vectors,
            ids: kept_ids,
            positions,
        }
    }
}

fn position_map(ids: &[i64]) -> HashMap<i64, usize> {
    ids.iter().enumerate().map(|(pos, id)| (*id, pos)).collect()
}
