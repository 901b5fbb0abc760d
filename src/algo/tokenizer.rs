use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::TextOptions;

/// Suffixes stripped by [`stem`], longest first.
const SUFFIXES: [&str; 10] = [
    "ment", "ness", "tion", "ing", "est", "ed", "es", "er", "ly", "s",
];

fn markup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("markup pattern is valid"))
}

fn non_alnum_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("separator pattern is valid"))
}

/// Tokenize text into a normalized set of terms.
///
/// Markup is stripped, text lowercased, non-alphanumeric runs become
/// separators; then the length filter, stop-word filter and stemmer run in
/// that order as enabled by `options`.
pub fn tokenize(text: &str, options: &TextOptions) -> BTreeSet<String> {
    let stripped = markup_re().replace_all(text, " ");
    let lower = stripped.to_lowercase();
    let spaced = non_alnum_re().replace_all(&lower, " ");

    spaced
        .split_whitespace()
        .filter(|w| options.min_word_length == 0 || w.chars().count() >= options.min_word_length)
        .filter(|w| !options.use_stop_words || !is_stopword(w))
        .map(|w| {
            if options.use_stemming {
                stem(w).to_string()
            } else {
                w.to_string()
            }
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Strip the longest matching suffix, once.
///
/// Heuristic on purpose: "bus" becomes "bu", "tion" becomes "".
pub fn stem(word: &str) -> &str {
    for suffix in SUFFIXES {
        if let Some(base) = word.strip_suffix(suffix) {
            return base;
        }
    }
    word
}

fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "a" | "an" | "the" | "is" | "it" | "of" | "to" | "in" | "for" | "on" | "with"
        | "at" | "by" | "from" | "as" | "or" | "and" | "but" | "not" | "be" | "are"
        | "was" | "were" | "been" | "being" | "have" | "has" | "had" | "do" | "does"
        | "did" | "will" | "would" | "could" | "should" | "may" | "might" | "shall"
        | "can" | "this" | "that" | "these" | "those" | "there" | "here" | "where"
        | "when" | "what" | "which" | "who" | "whom" | "how" | "all" | "each" | "every"
        | "both" | "few" | "more" | "most" | "other" | "some" | "such" | "no" | "nor"
        | "only" | "own" | "same" | "so" | "than" | "too" | "very" | "just" | "because"
        | "about" | "into" | "through" | "during" | "before" | "after" | "above" | "below"
        | "between" | "under" | "again" | "further" | "then" | "once" | "any" | "its"
        | "your" | "our" | "their" | "his" | "her" | "my" | "if" | "up" | "out" | "also"
        | "you" | "we" | "they" | "them" | "he" | "she" | "me" | "us" | "i"
    )
}
