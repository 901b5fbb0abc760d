use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

/// Token pairs must be strictly more similar than this to count as a fuzzy match.
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.70;

/// Normalized edit-distance similarity: `1 - levenshtein(a, b) / max(len(a), len(b))`.
///
/// 1.0 = identical, 0.0 = nothing in common. Two empty strings are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

/// Average similarity over all cross pairs of tokens whose similarity
/// exceeds [`FUZZY_MATCH_THRESHOLD`]. Returns 0.0 when no pair qualifies.
pub fn fuzzy_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let mut total = 0.0;
    let mut matches = 0usize;

    for x in a {
        for y in b {
            let sim = similarity(x, y);
            if sim > FUZZY_MATCH_THRESHOLD {
                total += sim;
                matches += 1;
            }
        }
    }

    if matches == 0 {
        0.0
    } else {
        total / matches as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn identical_strings() {
        assert_eq!(similarity("hello", "hello"), 1.0);
    }

    #[test]
    fn completely_different() {
        assert!(similarity("abc", "xyz") < 0.1);
    }

    #[test]
    fn similar_strings() {
        let sim = similarity("kitten", "sitting");
        assert!(sim > 0.4 && sim < 0.8);
    }

    #[test]
    fn empty_strings() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("hello", ""), 0.0);
    }

    #[test]
    fn similarity_symmetry() {
        let ab = similarity("kitten", "sitting");
        let ba = similarity("sitting", "kitten");
        assert!((ab - ba).abs() < 1e-10);
    }

    #[test]
    fn fuzzy_overlap_counts_only_close_pairs() {
        // colour/color = 1 - 1/6 ≈ 0.833; lamp/color far apart
        let score = fuzzy_overlap(&set(&["colour", "lamp"]), &set(&["color"]));
        assert!((score - (1.0 - 1.0 / 6.0)).abs() < 1e-9);
    }

    #[test]
    fn fuzzy_overlap_exact_tokens_score_one() {
        let score = fuzzy_overlap(&set(&["desk"]), &set(&["desk", "chair"]));
        assert_eq!(score, 1.0);
    }

    #[test]
    fn fuzzy_overlap_ignores_distant_pairs() {
        // 10 chars, 4 edits = 0.6
        let score = fuzzy_overlap(&set(&["abcdefghij"]), &set(&["abcdefwxyz"]));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn fuzzy_overlap_empty_sets() {
        assert_eq!(fuzzy_overlap(&set(&[]), &set(&["desk"])), 0.0);
        assert_eq!(fuzzy_overlap(&set(&[]), &set(&[])), 0.0);
    }
}
