//! Query parsing, intent heuristics and match classification.

use std::collections::HashSet;

use super::{MatchType, Source};

pub const SCENE_KEYWORDS: &[&str] = &[
    "sunset", "sunrise", "beach", "mountain", "forest", "ocean", "sea", "lake", "river", "sky",
    "cloud", "clouds", "snow", "rain", "night", "evening", "morning", "tree", "trees", "flower",
    "flowers", "garden", "park", "city", "street", "building", "architecture", "landscape",
    "waterfall", "desert", "moon", "stars", "rainbow", "aurora",
];

pub const OBJECT_KEYWORDS: &[&str] = &[
    "car", "bicycle", "bike", "motorcycle", "bus", "truck", "boat", "plane", "chair", "table",
    "laptop", "phone", "computer", "tv", "television", "book", "bottle", "cup", "glass", "bag",
    "umbrella", "clock", "vase",
];

pub const PET_KEYWORDS: &[&str] = &[
    "dog", "cat", "bird", "horse", "puppy", "kitten", "pet", "animal", "dogs", "cats", "birds",
    "horses", "puppies", "kittens", "pets", "animals",
];

pub const LOCATION_INDICATORS: &[&str] = &["in", "at", "from", "near", "around"];

/// Words never worth a label lookup on their own.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "is", "are", "was", "were", "be", "been", "being", "have",
    "has", "had", "do", "does", "did", "will", "would", "could", "should", "may", "might", "can",
    "of", "in", "on", "at", "to", "for", "with", "by", "from", "up", "down", "out", "off", "over",
    "under", "again", "then", "once", "here", "there", "when", "where", "why", "how", "all",
    "both", "each", "few", "more", "most", "other", "some", "such", "no", "nor", "not", "only",
    "own", "same", "so", "than", "too", "very", "this", "that", "these", "those", "my", "our",
];

/// Object categories a query word may have been detected as.
pub const OBJECT_SYNONYMS: &[(&str, &[&str])] = &[
    ("plant", &["plant", "potted plant"]),
    ("plants", &["plant", "potted plant"]),
    ("tree", &["plant", "potted plant"]),
    ("trees", &["plant", "potted plant"]),
    ("flower", &["plant", "potted plant", "vase"]),
    ("flowers", &["plant", "potted plant", "vase"]),
    ("car", &["car", "vehicle"]),
    ("automobile", &["car", "vehicle"]),
    ("bike", &["bicycle", "vehicle"]),
    ("motorcycle", &["motorcycle", "vehicle"]),
    ("dog", &["dog", "animal"]),
    ("cat", &["cat", "animal"]),
    ("person", &["person"]),
    ("people", &["person"]),
    ("human", &["person"]),
    ("chair", &["chair", "furniture"]),
    ("table", &["dining table", "furniture"]),
    ("laptop", &["laptop", "electronics"]),
    ("computer", &["laptop", "electronics"]),
    ("phone", &["cell phone", "electronics"]),
    ("tv", &["tv", "electronics"]),
    ("television", &["tv", "electronics"]),
    ("book", &["book"]),
    ("bottle", &["bottle"]),
    ("cup", &["cup"]),
    ("glass", &["wine glass", "cup"]),
];

/// Pet species a query word refers to.
pub const PET_SPECIES: &[(&str, &[&str])] = &[
    ("dog", &["dog"]),
    ("dogs", &["dog"]),
    ("puppy", &["dog"]),
    ("puppies", &["dog"]),
    ("cat", &["cat"]),
    ("cats", &["cat"]),
    ("kitten", &["cat"]),
    ("kittens", &["cat"]),
    ("bird", &["bird"]),
    ("birds", &["bird"]),
    ("horse", &["horse"]),
    ("horses", &["horse"]),
    ("pet", &["dog", "cat", "bird"]),
    ("pets", &["dog", "cat", "bird"]),
    ("animal", &["dog", "cat", "bird", "horse"]),
    ("animals", &["dog", "cat", "bird", "horse"]),
];

fn contains(set: &[&str], word: &str) -> bool {
    set.contains(&word)
}

fn clean(word: &str) -> &str {
    word.trim_matches(|c: char| ".,!?;:\"'()".contains(c))
}

/// A free-text query split into the forms the ranker works with.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// Trimmed, lowercased query.
    pub normalized: String,
    /// Lowercased words without surrounding punctuation.
    pub terms: Vec<String>,
    /// Words as typed, case preserved.
    tokens: Vec<String>,
}

impl ParsedQuery {
    pub fn new(query: &str) -> Self {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(clean)
            .filter(|w| !w.is_empty())
            .map(String::from)
            .collect();
        let terms = tokens.iter().map(|t| t.to_lowercase()).collect();

        Self {
            normalized: query.trim().to_lowercase(),
            terms,
            tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn has_term_in(&self, set: &[&str]) -> bool {
        self.terms.iter().any(|t| contains(set, t))
    }

    /// Terms worth matching against descriptive labels: generic words, stop
    /// words and location prepositions removed, unless nothing would be left.
    pub fn meaningful_terms(&self, generic: &HashSet<String>) -> Vec<&str> {
        let meaningful: Vec<&str> = self
            .terms
            .iter()
            .map(String::as_str)
            .filter(|t| {
                !generic.contains(*t) && !contains(STOP_WORDS, t) && !contains(LOCATION_INDICATORS, t)
            })
            .collect();
        if meaningful.is_empty() {
            self.terms.iter().map(String::as_str).collect()
        } else {
            meaningful
        }
    }

    /// Object categories to look up for this query.
    pub fn object_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for term in &self.terms {
            if contains(STOP_WORDS, term) || contains(LOCATION_INDICATORS, term) {
                continue;
            }
            if let Some((_, synonyms)) = OBJECT_SYNONYMS.iter().find(|(k, _)| *k == term.as_str()) {
                categories.extend(synonyms.iter().map(|s| s.to_string()));
            }
            categories.push(term.clone());
        }
        categories.sort();
        categories.dedup();
        categories
    }

    /// Pet species this query asks for; empty when it names no animal.
    pub fn pet_species(&self) -> Vec<&'static str> {
        let mut species: Vec<&'static str> = self
            .terms
            .iter()
            .filter_map(|t| PET_SPECIES.iter().find(|(k, _)| *k == t.as_str()))
            .flat_map(|(_, s)| s.iter().copied())
            .collect();
        species.sort_unstable();
        species.dedup();
        species
    }

    /// Classify how a stored label matches this query.
    pub fn classify(&self, label: &str) -> MatchType {
        let label = label.trim().to_lowercase();
        if label.is_empty() {
            return MatchType::Fuzzy;
        }

        if label == self.normalized || self.terms.iter().any(|t| *t == label) {
            return MatchType::Exact;
        }
        if label.contains(&self.normalized) || (label.len() >= 3 && self.normalized.contains(&label)) {
            return MatchType::Partial;
        }
        if label
            .split_whitespace()
            .any(|w| self.terms.iter().any(|t| t.as_str() == clean(w)))
        {
            return MatchType::Word;
        }
        MatchType::Fuzzy
    }

    /// Whether any of `tags` shares a meaningful word with the query.
    pub fn overlaps(&self, tags: &[String], generic: &HashSet<String>) -> bool {
        let meaningful = self.meaningful_terms(generic);
        tags.iter().any(|tag| {
            let tag = tag.to_lowercase();
            let words: HashSet<&str> = tag.split_whitespace().map(clean).collect();
            meaningful
                .iter()
                .any(|q| words.contains(q) || (q.len() >= 3 && tag.contains(q)))
        })
    }

    /// Per-source multipliers derived from keywords in the query.
    pub fn intent(&self) -> IntentBoosts {
        let mut boosts = IntentBoosts::neutral();

        let names_someone = self.tokens.iter().any(|token| {
            let lower = token.to_lowercase();
            token.chars().count() > 1
                && token.chars().next().is_some_and(char::is_uppercase)
                && !contains(SCENE_KEYWORDS, &lower)
                && !contains(OBJECT_KEYWORDS, &lower)
                && !contains(PET_KEYWORDS, &lower)
                && !contains(LOCATION_INDICATORS, &lower)
        });
        if names_someone {
            boosts.person = 1.5;
        }

        if self.has_term_in(LOCATION_INDICATORS) {
            boosts.location = 1.3;
        }

        if self.has_term_in(SCENE_KEYWORDS) {
            boosts.rich_tag = 1.3;
            boosts.semantic = 1.2;
        }

        if self.has_term_in(OBJECT_KEYWORDS) {
            boosts.object = 1.3;
        }

        if self.has_term_in(PET_KEYWORDS) {
            boosts.pet = 1.4;
            boosts.object = 0.8;
        }

        boosts
    }
}

/// Multipliers applied to each source's contribution for one query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentBoosts {
    pub user_tag: f32,
    pub person: f32,
    pub location: f32,
    pub rich_tag: f32,
    pub object: f32,
    pub pet: f32,
    pub semantic: f32,
}

impl IntentBoosts {
    pub fn neutral() -> Self {
        Self {
            user_tag: 1.0,
            person: 1.0,
            location: 1.0,
            rich_tag: 1.0,
            object: 1.0,
            pet: 1.0,
            semantic: 1.0,
        }
    }

    pub fn get(&self, source: Source) -> f32 {
        match source {
            Source::UserTag => self.user_tag,
            Source::Person => self.person,
            Source::Location => self.location,
            Source::RichTag => self.rich_tag,
            Source::Object => self.object,
            Source::Pet => self.pet,
            Source::Semantic => self.semantic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic() -> HashSet<String> {
        ["photo", "outdoor", "nature"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify() {
        let q = ParsedQuery::new("Beach sunset");
        assert_eq!(q.classify("beach sunset"), MatchType::Exact);
        assert_eq!(q.classify("Sunset"), MatchType::Exact);
        assert_eq!(q.classify("golden beach sunset over water"), MatchType::Partial);
        assert_eq!(q.classify("sandy beach, palm trees"), MatchType::Word);
        assert_eq!(q.classify("mountain lake"), MatchType::Fuzzy);
    }

    #[test]
    fn test_intent_boosts() {
        let boosts = ParsedQuery::new("Alice at the beach").intent();
        assert_eq!(boosts.person, 1.5);
        assert_eq!(boosts.location, 1.3);
        assert_eq!(boosts.rich_tag, 1.3);
        assert_eq!(boosts.semantic, 1.2);

        let boosts = ParsedQuery::new("dog on a chair").intent();
        assert_eq!(boosts.pet, 1.4);
        assert_eq!(boosts.object, 0.8);
        assert_eq!(boosts.person, 1.0);
    }

    #[test]
    fn test_location_intent_needs_whole_word() {
        let boosts = ParsedQuery::new("mountain lake").intent();
        assert_eq!(boosts.location, 1.0);
    }

    #[test]
    fn test_overlap_ignores_generic_words() {
        let q = ParsedQuery::new("outdoor sunset");
        assert!(q.overlaps(&["sunset over the sea".to_string()], &generic()));
        assert!(!q.overlaps(&["outdoor market".to_string()], &generic()));

        let q = ParsedQuery::new("Alice at the beach");
        assert_eq!(q.meaningful_terms(&generic()), vec!["alice", "beach"]);

        let only_generic = ParsedQuery::new("outdoor");
        assert!(only_generic.overlaps(&["outdoor market".to_string()], &generic()));
    }

    #[test]
    fn test_object_and_pet_lookups() {
        let q = ParsedQuery::new("puppies and a car");
        assert_eq!(q.pet_species(), vec!["dog"]);
        let categories = q.object_categories();
        assert!(categories.contains(&"vehicle".to_string()));
        assert!(categories.contains(&"car".to_string()));

        assert_eq!(
            ParsedQuery::new("animals").pet_species(),
            vec!["bird", "cat", "dog", "horse"]
        );
        assert!(ParsedQuery::new("category").pet_species().is_empty());
    }
}
