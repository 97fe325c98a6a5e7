use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::vectors::EntityKind;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "CLEPHO_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default = "ClusteringConfig::faces")]
    pub face_clustering: ClusteringConfig,

    #[serde(default = "ClusteringConfig::pets")]
    pub pet_clustering: ClusteringConfig,

    #[serde(default)]
    pub matcher: MatcherConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clepho")
}

fn default_db_path() -> PathBuf {
    data_dir().join("clepho.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directory holding the `<kind>.npy` / `<kind>.ids.json` pairs.
    #[serde(default = "default_index_dir")]
    pub directory: PathBuf,

    #[serde(default = "default_face_dimension")]
    pub face_dimension: usize,

    #[serde(default = "default_pet_dimension")]
    pub pet_dimension: usize,

    #[serde(default = "default_image_dimension")]
    pub image_dimension: usize,

    /// Non-blocking attempts at an index write lock before blocking on it.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// First backoff delay in milliseconds; doubled after every failed attempt.
    #[serde(default = "default_write_backoff_ms")]
    pub write_backoff_ms: u64,

    /// Searches remembered per index until it next changes. 0 disables.
    #[serde(default = "default_search_cache_size")]
    pub search_cache_size: usize,
}

fn default_index_dir() -> PathBuf {
    data_dir().join("indices")
}

fn default_face_dimension() -> usize {
    512
}

fn default_pet_dimension() -> usize {
    768
}

fn default_image_dimension() -> usize {
    768
}

fn default_write_retries() -> u32 {
    5
}

fn default_write_backoff_ms() -> u64 {
    10
}

fn default_search_cache_size() -> usize {
    128
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            directory: default_index_dir(),
            face_dimension: default_face_dimension(),
            pet_dimension: default_pet_dimension(),
            image_dimension: default_image_dimension(),
            write_retries: default_write_retries(),
            write_backoff_ms: default_write_backoff_ms(),
            search_cache_size: default_search_cache_size(),
        }
    }
}

impl IndexConfig {
    pub fn dimension(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Face => self.face_dimension,
            EntityKind::Pet => self.pet_dimension,
            EntityKind::Image => self.image_dimension,
        }
    }
}

/// DBSCAN and identity reconciliation settings for one entity kind.
///
/// Faces and pets have different defaults, so a section that is present in
/// the file must spell out every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Neighborhood radius in cosine distance (1 - similarity).
    pub eps: f32,
    /// Minimum neighborhood size, the point itself included, for a core point.
    pub min_samples: usize,
    /// Detections below this confidence are never clustered.
    pub min_confidence: f32,
    /// Whether a group of exactly one detection still gets an identity.
    pub keep_singletons: bool,
    /// Unclustered detections needed before a recluster is suggested.
    pub auto_recluster_threshold: usize,
}

impl ClusteringConfig {
    pub fn faces() -> Self {
        Self {
            eps: 0.5,
            min_samples: 2,
            min_confidence: 0.6,
            keep_singletons: true,
            auto_recluster_threshold: 50,
        }
    }

    pub fn pets() -> Self {
        Self {
            eps: 0.4,
            min_samples: 2,
            min_confidence: 0.4,
            keep_singletons: false,
            auto_recluster_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default = "default_matcher_k")]
    pub k: usize,

    #[serde(default = "default_matcher_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_min_matches")]
    pub min_matches: usize,

    /// Whether detections locked to an identity count as evidence for
    /// other detections.
    #[serde(default = "default_use_locked_neighbors")]
    pub use_locked_neighbors: bool,
}

fn default_matcher_k() -> usize {
    10
}

fn default_matcher_threshold() -> f32 {
    0.70
}

fn default_min_matches() -> usize {
    1
}

fn default_use_locked_neighbors() -> bool {
    true
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            k: default_matcher_k(),
            similarity_threshold: default_matcher_threshold(),
            min_matches: default_min_matches(),
            use_locked_neighbors: default_use_locked_neighbors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceWeights {
    #[serde(default = "default_user_tag_weight")]
    pub user_tag: f32,
    #[serde(default = "default_person_weight")]
    pub person: f32,
    #[serde(default = "default_location_weight")]
    pub location: f32,
    #[serde(default = "default_rich_tag_weight")]
    pub rich_tag: f32,
    #[serde(default = "default_detection_weight")]
    pub object: f32,
    #[serde(default = "default_detection_weight")]
    pub pet: f32,
    #[serde(default = "default_semantic_weight")]
    pub semantic: f32,
}

fn default_user_tag_weight() -> f32 {
    1.2
}

fn default_person_weight() -> f32 {
    1.0
}

fn default_location_weight() -> f32 {
    0.9
}

fn default_rich_tag_weight() -> f32 {
    0.8
}

fn default_detection_weight() -> f32 {
    0.6
}

fn default_semantic_weight() -> f32 {
    0.4
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            user_tag: default_user_tag_weight(),
            person: default_person_weight(),
            location: default_location_weight(),
            rich_tag: default_rich_tag_weight(),
            object: default_detection_weight(),
            pet: default_detection_weight(),
            semantic: default_semantic_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub weights: SourceWeights,

    /// Results scoring below this are dropped.
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    #[serde(default = "default_rich_tag_min_confidence")]
    pub rich_tag_min_confidence: f32,

    #[serde(default = "default_object_min_confidence")]
    pub object_min_confidence: f32,

    #[serde(default = "default_pet_min_confidence")]
    pub pet_min_confidence: f32,

    #[serde(default = "default_semantic_k")]
    pub semantic_k: usize,

    #[serde(default = "default_semantic_min_similarity")]
    pub semantic_min_similarity: f32,

    /// Stricter floor for photos that only the semantic source found.
    #[serde(default = "default_semantic_only_min_similarity")]
    pub semantic_only_min_similarity: f32,

    /// Labels too generic to rank a photo on their own.
    #[serde(default = "default_generic_tags")]
    pub generic_tags: Vec<String>,
}

fn default_min_score() -> f32 {
    0.05
}

fn default_rich_tag_min_confidence() -> f32 {
    0.35
}

fn default_object_min_confidence() -> f32 {
    0.50
}

fn default_pet_min_confidence() -> f32 {
    0.45
}

fn default_semantic_k() -> usize {
    50
}

fn default_semantic_min_similarity() -> f32 {
    0.25
}

fn default_semantic_only_min_similarity() -> f32 {
    0.35
}

fn default_generic_tags() -> Vec<String> {
    [
        "photo", "image", "picture", "person", "people", "outdoor", "outdoors", "object",
        "thing", "nature", "scene", "view", "background", "foreground", "day", "daytime",
        "area", "place", "shot", "snapshot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            weights: SourceWeights::default(),
            min_score: default_min_score(),
            rich_tag_min_confidence: default_rich_tag_min_confidence(),
            object_min_confidence: default_object_min_confidence(),
            pet_min_confidence: default_pet_min_confidence(),
            semantic_k: default_semantic_k(),
            semantic_min_similarity: default_semantic_min_similarity(),
            semantic_only_min_similarity: default_semantic_only_min_similarity(),
            generic_tags: default_generic_tags(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            index: IndexConfig::default(),
            face_clustering: ClusteringConfig::faces(),
            pet_clustering: ClusteringConfig::pets(),
            matcher: MatcherConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, `$CLEPHO_CONFIG`, or the default location, in that
    /// order. A missing default file is created with default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {:?}", config_path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {:?}", config_path))?;
            Ok(config)
        } else if path.is_some() {
            anyhow::bail!("Config file not found: {:?}", config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    pub fn clustering(&self, kind: EntityKind) -> &ClusteringConfig {
        match kind {
            EntityKind::Pet => &self.pet_clustering,
            _ => &self.face_clustering,
        }
    }

    fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clepho")
            .join("index.toml")
    }
}
