use crate::models::{AdvancedMetrics, RougeScore};
use serde::Serialize;
use similar::TextDiff;
use std::collections::{HashMap, HashSet};

/// Lowercase and collapse runs of whitespace.
fn preprocess(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    preprocess(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn char_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    TextDiff::from_chars(a, b).ratio() as f64
}

/// Exact match: trimmed, case-insensitive equality. Returns 0 or 100.
pub fn exact_match(response: &str, expected: &str) -> f64 {
    if response.trim().is_empty() || expected.trim().is_empty() {
        return 0.0;
    }
    if response.trim().to_lowercase() == expected.trim().to_lowercase() {
        100.0
    } else {
        0.0
    }
}

/// Fuzzy match: the most generous of the simple, token-sort, and token-set
/// edit-distance ratios, scaled to 0-100.
pub fn fuzzy_match(response: &str, expected: &str) -> f64 {
    let response = response.trim();
    let expected = expected.trim();
    if response.is_empty() || expected.is_empty() {
        return 0.0;
    }

    let simple = char_ratio(&preprocess(response), &preprocess(expected));
    let token_sort = token_sort_ratio(response, expected);
    let token_set = token_set_ratio(response, expected);

    simple.max(token_sort).max(token_set) * 100.0
}

fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let mut tokens_a = tokenize(a);
    let mut tokens_b = tokenize(b);
    tokens_a.sort_unstable();
    tokens_b.sort_unstable();
    char_ratio(&tokens_a.join(" "), &tokens_b.join(" "))
}

fn token_set_ratio(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();

    let mut intersection: Vec<&String> = set_a.intersection(&set_b).collect();
    let mut only_a: Vec<&String> = set_a.difference(&set_b).collect();
    let mut only_b: Vec<&String> = set_b.difference(&set_a).collect();
    intersection.sort_unstable();
    only_a.sort_unstable();
    only_b.sort_unstable();

    let base = intersection
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let combined_a = join_parts(&base, &only_a);
    let combined_b = join_parts(&base, &only_b);

    char_ratio(&base, &combined_a)
        .max(char_ratio(&base, &combined_b))
        .max(char_ratio(&combined_a, &combined_b))
}

fn join_parts(base: &str, rest: &[&String]) -> String {
    let tail = rest
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    match (base.is_empty(), tail.is_empty()) {
        (true, _) => tail,
        (_, true) => base.to_string(),
        _ => format!("{base} {tail}"),
    }
}

fn ngrams(tokens: &[String], n: usize) -> Vec<&[String]> {
    if tokens.len() < n || n == 0 {
        return Vec::new();
    }
    tokens.windows(n).collect()
}

fn ngram_counts<'a>(tokens: &'a [String], n: usize) -> HashMap<&'a [String], usize> {
    let mut counts = HashMap::new();
    for gram in ngrams(tokens, n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

/// BLEU with 1-4-gram clipped precisions, geometric mean, and brevity
/// penalty. Zero whenever any n-gram precision is zero.
pub fn bleu_score(reference: &str, candidate: &str) -> f64 {
    let reference_tokens = tokenize(reference);
    let candidate_tokens = tokenize(candidate);
    if reference_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }

    let max_n = 4;
    let mut log_precision_sum = 0.0;
    for n in 1..=max_n {
        let candidate_grams = ngrams(&candidate_tokens, n);
        if candidate_grams.is_empty() {
            return 0.0;
        }
        let reference_counts = ngram_counts(&reference_tokens, n);
        let candidate_counts = ngram_counts(&candidate_tokens, n);

        let mut matches = 0usize;
        for (gram, count) in &candidate_counts {
            matches += (*count).min(*reference_counts.get(gram).unwrap_or(&0));
        }
        if matches == 0 {
            return 0.0;
        }
        log_precision_sum += (matches as f64 / candidate_grams.len() as f64).ln();
    }

    let brevity_penalty = if candidate_tokens.len() < reference_tokens.len() {
        (1.0 - reference_tokens.len() as f64 / candidate_tokens.len() as f64).exp()
    } else {
        1.0
    };

    brevity_penalty * (log_precision_sum / max_n as f64).exp()
}

fn rouge_n(reference_tokens: &[String], candidate_tokens: &[String], n: usize) -> RougeScore {
    let reference_grams = ngrams(reference_tokens, n);
    let candidate_grams = ngrams(candidate_tokens, n);
    if reference_grams.is_empty() || candidate_grams.is_empty() {
        return RougeScore::default();
    }

    let reference_counts = ngram_counts(reference_tokens, n);
    let candidate_counts = ngram_counts(candidate_tokens, n);

    let mut matches = 0usize;
    for (gram, count) in &candidate_counts {
        matches += (*count).min(*reference_counts.get(gram).unwrap_or(&0));
    }

    let precision = matches as f64 / candidate_grams.len() as f64;
    let recall = matches as f64 / reference_grams.len() as f64;
    RougeScore {
        precision,
        recall,
        f1: f1(precision, recall),
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

fn lcs_length(a: &[String], b: &[String]) -> usize {
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    dp[a.len()][b.len()]
}

fn rouge_l(reference_tokens: &[String], candidate_tokens: &[String]) -> RougeScore {
    if reference_tokens.is_empty() || candidate_tokens.is_empty() {
        return RougeScore::default();
    }
    let lcs = lcs_length(reference_tokens, candidate_tokens) as f64;
    let precision = lcs / candidate_tokens.len() as f64;
    let recall = lcs / reference_tokens.len() as f64;
    RougeScore {
        precision,
        recall,
        f1: f1(precision, recall),
    }
}

/// ROUGE scores keyed the way the API reports them.
pub fn rouge_scores(reference: &str, candidate: &str) -> HashMap<String, RougeScore> {
    let reference_tokens = tokenize(reference);
    let candidate_tokens = tokenize(candidate);
    HashMap::from([
        (
            "rouge-1".to_string(),
            rouge_n(&reference_tokens, &candidate_tokens, 1),
        ),
        (
            "rouge-2".to_string(),
            rouge_n(&reference_tokens, &candidate_tokens, 2),
        ),
        (
            "rouge-l".to_string(),
            rouge_l(&reference_tokens, &candidate_tokens),
        ),
    ])
}

/// TF-IDF cosine similarity over the two texts.
pub fn tfidf_similarity(reference: &str, candidate: &str) -> f64 {
    let tokens_a = tokenize(reference);
    let tokens_b = tokenize(candidate);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let mut tf_a: HashMap<&str, f64> = HashMap::new();
    for token in &tokens_a {
        *tf_a.entry(token).or_insert(0.0) += 1.0;
    }
    let mut tf_b: HashMap<&str, f64> = HashMap::new();
    for token in &tokens_b {
        *tf_b.entry(token).or_insert(0.0) += 1.0;
    }

    let vocabulary: HashSet<&str> = tf_a.keys().chain(tf_b.keys()).copied().collect();

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for term in vocabulary {
        let in_a = tf_a.contains_key(term);
        let in_b = tf_b.contains_key(term);
        let document_frequency = usize::from(in_a) + usize::from(in_b);
        // Smoothed idf over the two-document corpus.
        let idf = (3.0 / (1.0 + document_frequency as f64)).ln() + 1.0;
        let weight_a = tf_a.get(term).copied().unwrap_or(0.0) * idf;
        let weight_b = tf_b.get(term).copied().unwrap_or(0.0) * idf;
        dot += weight_a * weight_b;
        norm_a += weight_a * weight_a;
        norm_b += weight_b * weight_b;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Jaccard similarity over token sets.
pub fn jaccard_similarity(reference: &str, candidate: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(reference).into_iter().collect();
    let set_b: HashSet<String> = tokenize(candidate).into_iter().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// Character-sequence similarity ratio.
pub fn sequence_similarity(reference: &str, candidate: &str) -> f64 {
    if reference.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    char_ratio(reference, candidate)
}

/// Compute the full advanced-metric set for one response.
pub fn advanced_metrics(reference: &str, candidate: &str) -> AdvancedMetrics {
    if reference.is_empty() || candidate.is_empty() {
        return AdvancedMetrics {
            bleu_score: 0.0,
            rouge_scores: rouge_scores("", ""),
            semantic_similarity: HashMap::from([
                ("tfidf".to_string(), 0.0),
                ("jaccard".to_string(), 0.0),
                ("sequence".to_string(), 0.0),
            ]),
        };
    }

    AdvancedMetrics {
        bleu_score: bleu_score(reference, candidate),
        rouge_scores: rouge_scores(reference, candidate),
        semantic_similarity: HashMap::from([
            ("tfidf".to_string(), tfidf_similarity(reference, candidate)),
            (
                "jaccard".to_string(),
                jaccard_similarity(reference, candidate),
            ),
            (
                "sequence".to_string(),
                sequence_similarity(reference, candidate),
            ),
        ]),
    }
}

/// Classification of one position in a token diff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenDiffKind {
    Match,
    Mismatch,
    /// Present in the response but not the expected output
    Extra,
    /// Present in the expected output but not the response
    Missing,
}

/// One position of a pairwise token comparison.
#[derive(Debug, Clone, Serialize)]
pub struct TokenDiffEntry {
    pub index: usize,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub kind: TokenDiffKind,
}

/// Linear pairwise comparison of whitespace-split tokens. Positions are
/// compared directly with no alignment; length mismatches become
/// extra/missing entries.
pub fn token_diff(expected: &str, actual: &str) -> Vec<TokenDiffEntry> {
    let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
    let actual_tokens: Vec<&str> = actual.split_whitespace().collect();
    let len = expected_tokens.len().max(actual_tokens.len());

    let mut entries = Vec::with_capacity(len);
    for index in 0..len {
        let expected_token = expected_tokens.get(index).map(|t| t.to_string());
        let actual_token = actual_tokens.get(index).map(|t| t.to_string());
        let kind = match (&expected_token, &actual_token) {
            (Some(e), Some(a)) if e == a => TokenDiffKind::Match,
            (Some(_), Some(_)) => TokenDiffKind::Mismatch,
            (None, Some(_)) => TokenDiffKind::Extra,
            (Some(_), None) => TokenDiffKind::Missing,
            (None, None) => unreachable!(),
        };
        entries.push(TokenDiffEntry {
            index,
            expected: expected_token,
            actual: actual_token,
            kind,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_case_and_whitespace_insensitive() {
        assert_eq!(exact_match("Paris", "paris"), 100.0);
        assert_eq!(exact_match("  Paris \n", "Paris"), 100.0);
        assert_eq!(exact_match("Paris", "London"), 0.0);
        assert_eq!(exact_match("", "Paris"), 0.0);
        assert_eq!(exact_match("Paris", "   "), 0.0);
    }

    #[test]
    fn test_fuzzy_match_identical() {
        assert_eq!(fuzzy_match("the quick brown fox", "the quick brown fox"), 100.0);
    }

    #[test]
    fn test_fuzzy_match_word_order() {
        // Token sort handles reordering.
        let score = fuzzy_match("brown fox quick the", "the quick brown fox");
        assert_eq!(score, 100.0);
    }

    #[test]
    fn test_fuzzy_match_subset() {
        // Token set is generous when one side is a subset of the other.
        let score = fuzzy_match("the quick brown fox", "the quick brown fox jumps over the dog");
        assert!(score > 60.0);
    }

    #[test]
    fn test_fuzzy_match_empty() {
        assert_eq!(fuzzy_match("", "anything"), 0.0);
        assert_eq!(fuzzy_match("anything", ""), 0.0);
    }

    #[test]
    fn test_fuzzy_match_disjoint_is_low() {
        let score = fuzzy_match("alpha beta gamma", "xylophone quartz");
        assert!(score < 50.0);
    }

    #[test]
    fn test_bleu_identical() {
        let text = "the quick brown fox jumps over the lazy dog";
        let score = bleu_score(text, text);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bleu_disjoint_is_zero() {
        assert_eq!(bleu_score("a b c d e", "v w x y z"), 0.0);
    }

    #[test]
    fn test_bleu_empty_is_zero() {
        assert_eq!(bleu_score("", "something"), 0.0);
        assert_eq!(bleu_score("something", ""), 0.0);
    }

    #[test]
    fn test_bleu_short_candidate_is_zero() {
        // Fewer than four tokens cannot form a 4-gram.
        assert_eq!(bleu_score("one two three four", "one two"), 0.0);
    }

    #[test]
    fn test_rouge_1_counts_unigram_overlap() {
        let scores = rouge_scores("the cat sat", "the cat ran");
        let rouge_1 = &scores["rouge-1"];
        assert!((rouge_1.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((rouge_1.recall - 2.0 / 3.0).abs() < 1e-9);
        assert!((rouge_1.f1 - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_identical() {
        let scores = rouge_scores("a b c d", "a b c d");
        for key in ["rouge-1", "rouge-2", "rouge-l"] {
            assert!((scores[key].f1 - 1.0).abs() < 1e-9, "{key} should be 1.0");
        }
    }

    #[test]
    fn test_rouge_l_subsequence() {
        // LCS of "a b c d" and "a x c d" is "a c d" (length 3).
        let scores = rouge_scores("a b c d", "a x c d");
        let rouge_l = &scores["rouge-l"];
        assert!((rouge_l.precision - 0.75).abs() < 1e-9);
        assert!((rouge_l.recall - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_empty() {
        let scores = rouge_scores("", "text");
        assert_eq!(scores["rouge-1"], RougeScore::default());
    }

    #[test]
    fn test_tfidf_similarity_bounds() {
        assert!((tfidf_similarity("a b c", "a b c") - 1.0).abs() < 1e-9);
        assert_eq!(tfidf_similarity("a b c", "x y z"), 0.0);
        assert_eq!(tfidf_similarity("", "a"), 0.0);
    }

    #[test]
    fn test_jaccard_similarity() {
        assert!((jaccard_similarity("a b c d", "a b c d") - 1.0).abs() < 1e-9);
        // {a,b} vs {b,c}: intersection 1, union 3.
        assert!((jaccard_similarity("a b", "b c") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
    }

    #[test]
    fn test_sequence_similarity() {
        assert!((sequence_similarity("paris", "paris") - 1.0).abs() < 1e-6);
        assert_eq!(sequence_similarity("", "paris"), 0.0);
        assert!(sequence_similarity("paris", "parts") > 0.5);
    }

    #[test]
    fn test_advanced_metrics_keys() {
        let metrics = advanced_metrics("the cat sat on the mat", "the cat sat on the mat");
        assert!((metrics.bleu_score - 1.0).abs() < 1e-9);
        assert_eq!(metrics.rouge_scores.len(), 3);
        assert_eq!(metrics.semantic_similarity.len(), 3);
        assert!((metrics.semantic_similarity["jaccard"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_advanced_metrics_empty_input() {
        let metrics = advanced_metrics("", "response");
        assert_eq!(metrics.bleu_score, 0.0);
        assert_eq!(metrics.semantic_similarity["tfidf"], 0.0);
    }

    #[test]
    fn test_token_diff_identical_all_match() {
        let entries = token_diff("the quick fox", "the quick fox");
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.kind == TokenDiffKind::Match));
    }

    #[test]
    fn test_token_diff_mismatch() {
        let entries = token_diff("the quick fox", "the slow fox");
        assert_eq!(entries[0].kind, TokenDiffKind::Match);
        assert_eq!(entries[1].kind, TokenDiffKind::Mismatch);
        assert_eq!(entries[2].kind, TokenDiffKind::Match);
    }

    #[test]
    fn test_token_diff_extra_and_missing() {
        let entries = token_diff("one two", "one two three");
        assert_eq!(entries[2].kind, TokenDiffKind::Extra);
        assert_eq!(entries[2].actual.as_deref(), Some("three"));

        let entries = token_diff("one two three", "one two");
        assert_eq!(entries[2].kind, TokenDiffKind::Missing);
        assert_eq!(entries[2].expected.as_deref(), Some("three"));
    }

    #[test]
    fn test_token_diff_empty_inputs() {
        assert!(token_diff("", "").is_empty());
        let entries = token_diff("", "word");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, TokenDiffKind::Extra);
    }
}
