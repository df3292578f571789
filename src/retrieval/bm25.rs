//! BM25 ranking of repository files.
//!
//! [`Bm25Okapi`] follows the classic Okapi weighting with an epsilon floor
//! for negative IDF values. [`run_bm25_retrieval`] ranks whole files against
//! a task description, optionally boosted by lint output and refined by a
//! rule-aware second stage.

use ordered_float::OrderedFloat;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::corpus::{collect_documents, compile_pattern, CorpusFilter};
use crate::error::RetrievalError;

/// Default number of files returned.
pub const DEFAULT_TOP_K: usize = 10;

/// Helper files appended after the top rule file in two-stage mode.
pub const MAX_HELPER_FILES: usize = 5;

/// Lowercase whitespace tokenization shared by documents and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Okapi BM25 index over a tokenized corpus.
#[derive(Debug, Clone)]
pub struct Bm25Okapi {
    k1: f64,
    b: f64,
    doc_freqs: Vec<HashMap<String, u32>>,
    doc_len: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Okapi {
    pub const K1: f64 = 1.5;
    pub const B: f64 = 0.75;
    pub const EPSILON: f64 = 0.25;

    pub fn new(corpus: &[Vec<String>]) -> Self {
        Self::with_params(corpus, Self::K1, Self::B, Self::EPSILON)
    }

    pub fn with_params(corpus: &[Vec<String>], k1: f64, b: f64, epsilon: f64) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_len = Vec::with_capacity(corpus.len());
        let mut nd: HashMap<String, u32> = HashMap::new();
        let mut total_len = 0usize;

        for document in corpus {
            doc_len.push(document.len());
            total_len += document.len();

            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in document {
                *frequencies.entry(token.clone()).or_insert(0) += 1;
            }
            for token in frequencies.keys() {
                *nd.entry(token.clone()).or_insert(0) += 1;
            }
            doc_freqs.push(frequencies);
        }

        let corpus_size = corpus.len() as f64;
        let avgdl = if corpus.is_empty() {
            0.0
        } else {
            total_len as f64 / corpus_size
        };

        let mut idf = HashMap::with_capacity(nd.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (token, freq) in nd {
            let freq = freq as f64;
            let value = (corpus_size - freq + 0.5).ln() - (freq + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(token.clone());
            }
            idf.insert(token, value);
        }
        if !idf.is_empty() {
            let eps = epsilon * (idf_sum / idf.len() as f64);
            for token in negative {
                idf.insert(token, eps);
            }
        }

        Self {
            k1,
            b,
            doc_freqs,
            doc_len,
            avgdl,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_len.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_len.is_empty()
    }

    /// Score every document against `query`. Repeated query tokens count
    /// once per occurrence.
    pub fn get_scores(&self, query: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.doc_len.len()];
        if self.avgdl <= 0.0 {
            return scores;
        }

        for token in query {
            let Some(idf) = self.idf.get(token) else {
                continue;
            };
            for (i, frequencies) in self.doc_freqs.iter().enumerate() {
                let freq = frequencies.get(token).copied().unwrap_or(0) as f64;
                if freq == 0.0 {
                    continue;
                }
                let norm = 1.0 - self.b + self.b * self.doc_len[i] as f64 / self.avgdl;
                scores[i] += idf * (freq * (self.k1 + 1.0)) / (freq + self.k1 * norm);
            }
        }
        scores
    }
}

/// Indices of `scores` ordered by descending score. Ties keep input order.
pub fn rank_descending(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by_key(|&i| Reverse(OrderedFloat(scores[i])));
    order
}

/// Options for [`run_bm25_retrieval`].
#[derive(Debug, Clone)]
pub struct Bm25Options {
    pub top_k: usize,
    /// Restrict the corpus to paths matching `filter_pattern`.
    pub rule_filter: bool,
    pub lint_output: Option<String>,
    pub two_stage: bool,
    pub index_all_files: bool,
    pub file_extensions: Vec<String>,
    pub source_path_prefix: Option<String>,
    pub filter_pattern: Option<String>,
    pub rule_id_pattern: Option<String>,
}

impl Default for Bm25Options {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            rule_filter: false,
            lint_output: None,
            two_stage: false,
            index_all_files: false,
            file_extensions: vec![".py".to_string()],
            source_path_prefix: None,
            filter_pattern: None,
            rule_id_pattern: None,
        }
    }
}

/// Rank repository files against `task` and return the best paths.
pub fn run_bm25_retrieval(
    task: &str,
    repo: &Path,
    options: &Bm25Options,
) -> Result<Vec<String>, RetrievalError> {
    let filter_pattern = compile_pattern(options.filter_pattern.as_deref())?;
    let rule_id_pattern = compile_pattern(options.rule_id_pattern.as_deref())?;

    let documents = collect_documents(
        repo,
        &CorpusFilter {
            index_all_files: options.index_all_files,
            file_extensions: &options.file_extensions,
            source_path_prefix: options.source_path_prefix.as_deref(),
            path_pattern: if options.rule_filter {
                filter_pattern.as_ref()
            } else {
                None
            },
        },
    )?;
    if documents.is_empty() {
        return Ok(Vec::new());
    }

    let tokenized: Vec<Vec<String>> = documents.iter().map(|d| tokenize(&d.content)).collect();
    let bm25 = Bm25Okapi::new(&tokenized);
    let mut scores = bm25.get_scores(&tokenize(task));
    let paths: Vec<String> = documents.into_iter().map(|d| d.path).collect();

    if let (Some(lint_output), Some(pattern)) = (options.lint_output.as_deref(), &rule_id_pattern) {
        apply_lint_boost(&mut scores, &paths, lint_output, pattern);
    }

    let retrieved: Vec<String> = rank_descending(&scores)
        .into_iter()
        .take(options.top_k)
        .filter(|&i| scores[i] > 0.0)
        .map(|i| paths[i].clone())
        .collect();

    if options.two_stage && !retrieved.is_empty() {
        if let Some(pattern) = options.rule_id_pattern.as_deref() {
            return second_stage(retrieved, &paths, filter_pattern.as_ref(), pattern);
        }
    }

    Ok(retrieved)
}

/// Double the score of every file whose path contains a rule id found in the
/// lint output, once per occurrence.
fn apply_lint_boost(scores: &mut [f64], paths: &[String], lint_output: &str, pattern: &Regex) {
    let rule_ids: Vec<&str> = pattern
        .captures_iter(lint_output)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| m.as_str())
        .filter(|id| !id.is_empty())
        .collect();

    for (i, path) in paths.iter().enumerate() {
        for rule_id in &rule_ids {
            if path.contains(rule_id) {
                scores[i] *= 2.0;
            }
        }
    }
}

/// Keep the top rule file and pull in helper files sharing its rule number.
fn second_stage(
    retrieved: Vec<String>,
    corpus_paths: &[String],
    filter_pattern: Option<&Regex>,
    rule_id_pattern: &str,
) -> Result<Vec<String>, RetrievalError> {
    let rule_files: Vec<&String> = match filter_pattern {
        Some(pattern) => retrieved.iter().filter(|f| pattern.is_match(f)).collect(),
        None => retrieved.iter().collect(),
    };
    let Some(top_rule) = rule_files.first() else {
        return Ok(retrieved);
    };

    let extract = rule_id_pattern.replace("\\d+", "(\\d+)");
    let Some(extract) = compile_pattern(Some(&extract))? else {
        return Ok(retrieved);
    };
    let Some(rule_num) = extract
        .captures(top_rule)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
    else {
        return Ok(retrieved);
    };

    let rule_set: HashSet<&str> = rule_files.iter().map(|f| f.as_str()).collect();
    let mut result = vec![(*top_rule).clone()];
    result.extend(
        corpus_paths
            .iter()
            .filter(|f| f.contains(&rule_num) && !rule_set.contains(f.as_str()))
            .take(MAX_HELPER_FILES)
            .cloned(),
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(docs: &[&str]) -> Vec<Vec<String>> {
        docs.iter().map(|d| tokenize(d)).collect()
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("Fix  the\tBug\nnow"), vec!["fix", "the", "bug", "now"]);
    }

    #[test]
    fn test_rare_term_scores_expected_value() {
        let bm25 = Bm25Okapi::new(&toks(&["hello world", "hello there", "goodbye world"]));
        let scores = bm25.get_scores(&tokenize("there"));
        // idf(there) = ln(2.5 / 1.5); doc length equals avgdl so the tf part is 1.
        let expected = (2.5f64 / 1.5).ln();
        assert_eq!(scores[0], 0.0);
        assert!((scores[1] - expected).abs() < 1e-12);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_negative_idf_is_floored_by_epsilon() {
        // hello/world are negative, there/goodbye positive; the mean is 0 so
        // negatives are floored to 0.
        let bm25 = Bm25Okapi::new(&toks(&["hello world", "hello there", "goodbye world"]));
        let scores = bm25.get_scores(&tokenize("hello"));
        assert!(scores.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_repeated_query_tokens_accumulate() {
        let bm25 = Bm25Okapi::new(&toks(&["alpha beta", "gamma delta", "epsilon zeta"]));
        let once = bm25.get_scores(&tokenize("alpha"));
        let twice = bm25.get_scores(&tokenize("alpha alpha"));
        assert!((twice[0] - 2.0 * once[0]).abs() < 1e-12);
    }

    #[test]
    fn test_empty_documents_score_zero() {
        let bm25 = Bm25Okapi::new(&[vec![], vec![]]);
        assert_eq!(bm25.get_scores(&tokenize("anything")), vec![0.0, 0.0]);
    }

    #[test]
    fn test_rank_descending_is_stable() {
        assert_eq!(rank_descending(&[1.0, 3.0, 1.0, 2.0]), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_lint_boost_counts_each_occurrence() {
        let mut scores = vec![1.0, 1.0];
        let paths = vec!["rules/R001_check.py".to_string(), "core.py".to_string()];
        let pattern = Regex::new(r"R\d+").unwrap();
        apply_lint_boost(&mut scores, &paths, "R001 found; R001 again", &pattern);
        assert_eq!(scores, vec![4.0, 1.0]);
    }

    #[test]
    fn test_second_stage_collects_helpers() {
        let retrieved = vec![
            "rules/rule_12.py".to_string(),
            "core/engine.py".to_string(),
        ];
        let corpus = vec![
            "core/engine.py".to_string(),
            "rules/rule_12.py".to_string(),
            "tests/test_rule_12.py".to_string(),
            "docs/rule_12_notes.py".to_string(),
            "rules/rule_7.py".to_string(),
        ];
        let filter = Regex::new("rules/").unwrap();
        let result = second_stage(retrieved, &corpus, Some(&filter), r"rule_\d+").unwrap();
        assert_eq!(
            result,
            vec![
                "rules/rule_12.py",
                "tests/test_rule_12.py",
                "docs/rule_12_notes.py"
            ]
        );
    }

    #[test]
    fn test_second_stage_without_capture_keeps_first_stage() {
        let retrieved = vec!["a.py".to_string(), "b.py".to_string()];
        let result =
            second_stage(retrieved.clone(), &retrieved, None, "no_digits_here").unwrap();
        assert_eq!(result, retrieved);
    }
}
