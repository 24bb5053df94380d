use crate::schema::{fold, Field};
use std::collections::HashMap;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.5;

/// A symmetric string similarity in `[0, 1]`.
pub trait Similarity {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Sørensen–Dice coefficient over character bigrams, ignoring whitespace and
/// case. Counts characters rather than bytes so CJK headers score the same way
/// as ASCII ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceSimilarity;

impl Similarity for DiceSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect();
        let b: Vec<char> = b.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect();
        if a == b {
            return 1.0;
        }
        if a.len() < 2 || b.len() < 2 {
            return 0.0;
        }

        let mut bigrams: HashMap<(char, char), usize> = HashMap::new();
        for pair in a.windows(2) {
            *bigrams.entry((pair[0], pair[1])).or_insert(0) += 1;
        }
        let mut shared = 0usize;
        for pair in b.windows(2) {
            if let Some(count) = bigrams.get_mut(&(pair[0], pair[1])) {
                if *count > 0 {
                    *count -= 1;
                    shared += 1;
                }
            }
        }
        (2 * shared) as f64 / (a.len() + b.len() - 2) as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinSimilarity;

impl Similarity for LevenshteinSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JaroWinklerSimilarity;

impl Similarity for JaroWinklerSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        strsim::jaro_winkler(&a.to_lowercase(), &b.to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    pub field: &'a Field,
    pub score: f64,
    pub exact: bool,
}

#[derive(Debug, Clone)]
pub struct FieldResolver<S = DiceSimilarity> {
    similarity: S,
    threshold: f64,
}

impl Default for FieldResolver<DiceSimilarity> {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl FieldResolver<DiceSimilarity> {
    pub fn new(threshold: f64) -> Self {
        Self::with_similarity(DiceSimilarity, threshold)
    }
}

impl<S: Similarity> FieldResolver<S> {
    pub fn with_similarity(similarity: S, threshold: f64) -> Self {
        Self { similarity, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn resolve<'a>(&self, raw_header: &str, candidates: &'a [Field]) -> Option<&'a Field> {
        self.resolve_detailed(raw_header, candidates).map(|resolution| resolution.field)
    }

    /// Exact case-insensitive spelling wins outright; otherwise the best fuzzy
    /// score strictly above the threshold, earliest declared field on ties.
    pub fn resolve_detailed<'a>(&self, raw_header: &str, candidates: &'a [Field]) -> Option<Resolution<'a>> {
        let header = fold(raw_header);
        if header.is_empty() {
            return None;
        }

        if let Some(field) = candidates
            .iter()
            .find(|field| field.spellings().any(|spelling| fold(spelling) == header))
        {
            return Some(Resolution {
                field,
                score: 1.0,
                exact: true,
            });
        }

        let mut best: Option<(&Field, f64)> = None;
        for field in candidates {
            for spelling in field.spellings() {
                let score = self.similarity.similarity(&header, &fold(spelling));
                if best.map(|(_, current)| score > current).unwrap_or(true) {
                    best = Some((field, score));
                }
            }
        }

        best.filter(|(_, score)| *score > self.threshold)
            .map(|(field, score)| Resolution {
                field,
                score,
                exact: false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{DiceSimilarity, FieldResolver, LevenshteinSimilarity, Similarity};
    use crate::schema::{Field, FieldType};

    fn branch_fields() -> Vec<Field> {
        vec![
            Field::new("code", FieldType::String).with_aliases(&["支部编号", "编号"]),
            Field::new("name", FieldType::String).with_aliases(&["支部名称", "支部"]),
            Field::new("member_count", FieldType::Number).with_aliases(&["党员人数"]),
        ]
    }

    #[test]
    fn exact_alias_match_ignores_case_and_padding() {
        let fields = branch_fields();
        let resolver = FieldResolver::default();
        assert_eq!(resolver.resolve(" NAME ", &fields).map(|f| f.name.as_str()), Some("name"));
        assert_eq!(resolver.resolve("党员人数", &fields).map(|f| f.name.as_str()), Some("member_count"));
    }

    #[test]
    fn typo_in_header_resolves_through_alias() {
        let fields = branch_fields();
        let resolver = FieldResolver::default();
        let resolution = resolver.resolve_detailed("支部名稱", &fields).expect("fuzzy match");
        assert_eq!(resolution.field.name, "name");
        assert!(!resolution.exact);
        assert!(resolution.score > 0.5);
    }

    #[test]
    fn low_similarity_header_is_dropped() {
        let fields = branch_fields();
        let resolver = FieldResolver::default();
        assert!(resolver.resolve("备注说明", &fields).is_none());
        assert!(resolver.resolve("   ", &fields).is_none());
    }

    #[test]
    fn score_equal_to_threshold_is_rejected() {
        let fields = vec![Field::new("ab", FieldType::String)];
        let resolver = FieldResolver::default();
        // "abxy" vs "ab": one shared bigram out of 3 + 1 -> exactly 0.5
        assert_eq!(DiceSimilarity.similarity("abxy", "ab"), 0.5);
        assert!(resolver.resolve("abxy", &fields).is_none());
    }

    #[test]
    fn ties_go_to_the_earliest_declared_field() {
        let fields = vec![
            Field::new("score_a", FieldType::Number).with_aliases(&["total score"]),
            Field::new("score_b", FieldType::Number).with_aliases(&["total score"]),
        ];
        let resolver = FieldResolver::default();
        assert_eq!(resolver.resolve("total scores", &fields).map(|f| f.name.as_str()), Some("score_a"));
    }

    #[test]
    fn similarity_is_swappable() {
        let fields = branch_fields();
        let resolver = FieldResolver::with_similarity(LevenshteinSimilarity, 0.5);
        assert_eq!(resolver.resolve("支部名稱", &fields).map(|f| f.name.as_str()), Some("name"));
    }

    #[test]
    fn dice_counts_characters_not_bytes() {
        let score = DiceSimilarity.similarity("支部名稱", "支部名称");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }
}
