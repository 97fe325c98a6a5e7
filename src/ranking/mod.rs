//! Multi-source relevance ranking for free-text photo search.
//!
//! Each signal source reports, per photo, the labels it matched with a
//! strength and a match type. [`Ranker`] folds those into one score per
//! photo with source weights, query intent boosts and agreement bonuses.

pub mod intent;
pub mod score;
pub mod signals;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use intent::{IntentBoosts, ParsedQuery};
pub use score::{RankedPhoto, Ranker, TieBreak};
pub use signals::SignalCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Tags the user typed in.
    UserTag,
    /// Named identities appearing in the photo.
    Person,
    /// Descriptive tags produced by the captioning model.
    RichTag,
    Location,
    Object,
    Pet,
    /// Query embedding against the whole-image index.
    Semantic,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::UserTag => "user_tag",
            Source::Person => "person",
            Source::RichTag => "rich_tag",
            Source::Location => "location",
            Source::Object => "object",
            Source::Pet => "pet",
            Source::Semantic => "semantic",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Partial,
    Word,
    Fuzzy,
    /// Detector confidence or embedding similarity taken at face value.
    Direct,
}

impl MatchType {
    pub fn multiplier(&self) -> f32 {
        match self {
            MatchType::Exact => 1.0,
            MatchType::Partial => 0.75,
            MatchType::Word => 0.5,
            MatchType::Fuzzy => 0.25,
            MatchType::Direct => 1.0,
        }
    }
}

/// One label of one photo matched by one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalMatch {
    pub source: Source,
    pub label: String,
    pub strength: f32,
    pub match_type: MatchType,
}

/// All evidence gathered for one candidate photo.
#[derive(Debug, Clone, Default)]
pub struct SignalBundle {
    pub photo_id: i64,
    pub taken_at: Option<DateTime<Utc>>,
    pub matches: Vec<SignalMatch>,
}

impl SignalBundle {
    pub fn new(photo_id: i64) -> Self {
        Self {
            photo_id,
            ..Default::default()
        }
    }

    pub fn push(&mut self, source: Source, label: impl Into<String>, strength: f32, match_type: MatchType) {
        self.matches.push(SignalMatch {
            source,
            label: label.into(),
            strength,
            match_type,
        });
    }

    pub fn has_source(&self, source: Source) -> bool {
        self.matches.iter().any(|m| m.source == source)
    }

    /// Whether any source other than semantic similarity matched.
    pub fn has_textual_match(&self) -> bool {
        self.matches.iter().any(|m| m.source != Source::Semantic)
    }
}
