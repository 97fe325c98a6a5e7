use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::{IntentBoosts, MatchType, ParsedQuery, SignalBundle, Source};
use crate::config::SearchConfig;

const MULTI_SOURCE_BONUS: f32 = 1.3;
const WIDE_AGREEMENT_BONUS: f32 = 1.5;
const EXACT_MATCH_BONUS: f32 = 1.2;
const SEMANTIC_CONFIRMATION_BONUS: f32 = 1.1;
const SEMANTIC_ONLY_PENALTY: f32 = 0.3;
const SINGLE_DETECTION_PENALTY: f32 = 0.6;
const GENERIC_ONLY_PENALTY: f32 = 0.4;

/// How to order photos whose scores are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Newest `taken_at` first, undated photos last.
    #[default]
    Recency,
    /// Lowest photo id first.
    PhotoId,
}

/// A scored search result
#[derive(Debug, Clone, Serialize)]
pub struct RankedPhoto {
    pub photo_id: i64,
    pub score: f32,
    /// Contribution of each source before bonuses and penalties.
    pub contributions: Vec<(Source, f32)>,
    pub has_exact_match: bool,
    pub generic_only: bool,
    #[serde(skip)]
    pub taken_at: Option<DateTime<Utc>>,
}

impl RankedPhoto {
    pub fn sources(&self) -> Vec<Source> {
        self.contributions.iter().map(|(s, _)| *s).collect()
    }
}

pub struct Ranker<'a> {
    config: &'a SearchConfig,
    generic: HashSet<String>,
}

impl<'a> Ranker<'a> {
    pub fn new(config: &'a SearchConfig) -> Self {
        let generic = config.generic_tags.iter().map(|t| t.to_lowercase()).collect();
        Self { config, generic }
    }

    pub fn generic_tags(&self) -> &HashSet<String> {
        &self.generic
    }

    fn weight(&self, source: Source) -> f32 {
        let w = &self.config.weights;
        match source {
            Source::UserTag => w.user_tag,
            Source::Person => w.person,
            Source::RichTag => w.rich_tag,
            Source::Location => w.location,
            Source::Object => w.object,
            Source::Pet => w.pet,
            Source::Semantic => w.semantic,
        }
    }

    fn is_generic(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        let mut words = label.split_whitespace().peekable();
        words.peek().is_some() && words.all(|w| self.generic.contains(w))
    }

    /// Score one candidate. Returns `None` when nothing matched.
    pub fn score(&self, bundle: &SignalBundle, boosts: &IntentBoosts) -> Option<RankedPhoto> {
        let mut per_source: BTreeMap<Source, f32> = BTreeMap::new();
        for m in &bundle.matches {
            if m.strength <= 0.0 {
                continue;
            }
            *per_source.entry(m.source).or_insert(0.0) += m.strength * m.match_type.multiplier();
        }
        if per_source.is_empty() {
            return None;
        }

        let contributions: Vec<(Source, f32)> = per_source
            .into_iter()
            .map(|(source, sum)| (source, sum * self.weight(source) * boosts.get(source)))
            .collect();

        let mut score: f32 = contributions.iter().map(|(_, c)| c).sum();

        let textual = contributions
            .iter()
            .filter(|(s, _)| *s != Source::Semantic)
            .count();
        let has_semantic = contributions.iter().any(|(s, _)| *s == Source::Semantic);

        if textual >= 3 {
            score *= WIDE_AGREEMENT_BONUS;
        } else if textual == 2 {
            score *= MULTI_SOURCE_BONUS;
        }

        let has_exact_match = bundle
            .matches
            .iter()
            .any(|m| m.match_type == MatchType::Exact);
        if has_exact_match {
            score *= EXACT_MATCH_BONUS;
        }

        if has_semantic && textual > 0 {
            score *= SEMANTIC_CONFIRMATION_BONUS;
        }

        if contributions.len() == 1 {
            match contributions[0].0 {
                Source::Semantic => score *= SEMANTIC_ONLY_PENALTY,
                Source::Object | Source::Pet => score *= SINGLE_DETECTION_PENALTY,
                _ => {}
            }
        }

        let mut labels = bundle
            .matches
            .iter()
            .filter(|m| m.source != Source::Semantic)
            .map(|m| m.label.as_str())
            .peekable();
        let generic_only = labels.peek().is_some() && labels.all(|l| self.is_generic(l));
        if generic_only {
            score *= GENERIC_ONLY_PENALTY;
        }

        Some(RankedPhoto {
            photo_id: bundle.photo_id,
            score,
            contributions,
            has_exact_match,
            generic_only,
            taken_at: bundle.taken_at,
        })
    }

    /// Score, filter and order every candidate.
    pub fn rank(&self, query: &ParsedQuery, bundles: &[SignalBundle], tie_break: TieBreak) -> Vec<RankedPhoto> {
        let boosts = query.intent();
        debug!("Intent boosts for {:?}: {:?}", query.normalized, boosts);

        let mut ranked: Vec<RankedPhoto> = bundles
            .iter()
            .filter_map(|bundle| self.score(bundle, &boosts))
            .filter(|photo| {
                let keep = photo.score >= self.config.min_score;
                debug!(
                    "Photo {}: score={:.3} sources={:?} exact={} generic={}{}",
                    photo.photo_id,
                    photo.score,
                    photo.sources(),
                    photo.has_exact_match,
                    photo.generic_only,
                    if keep { "" } else { " (dropped)" }
                );
                keep
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| break_tie(a, b, tie_break))
        });
        ranked
    }
}

fn break_tie(a: &RankedPhoto, b: &RankedPhoto, tie_break: TieBreak) -> Ordering {
    match tie_break {
        TieBreak::PhotoId => a.photo_id.cmp(&b.photo_id),
        TieBreak::Recency => {
            let by_date = match (a.taken_at, b.taken_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_date.then(b.photo_id.cmp(&a.photo_id))
        }
    }
}
