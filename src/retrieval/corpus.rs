//! Collecting candidate documents from a repository checkout.

use regex::Regex;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

use crate::error::RetrievalError;

/// Files with more characters than this are not indexed.
pub const MAX_FILE_SIZE: usize = 500_000;

/// A repository file considered for retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub content: String,
}

/// Which files of a checkout become documents.
#[derive(Debug, Clone, Default)]
pub struct CorpusFilter<'a> {
    /// Index every regular file, ignoring `file_extensions`.
    pub index_all_files: bool,
    /// Accepted suffixes; `"py"` and `".py"` are equivalent.
    pub file_extensions: &'a [String],
    /// Keep only files at or below this repo-relative directory.
    pub source_path_prefix: Option<&'a str>,
    /// Keep only files whose full path matches.
    pub path_pattern: Option<&'a Regex>,
}

/// Compile an optional user-supplied pattern.
pub fn compile_pattern(pattern: Option<&str>) -> Result<Option<Regex>, RetrievalError> {
    match pattern {
        Some(p) if !p.is_empty() => Regex::new(p)
            .map(Some)
            .map_err(|e| RetrievalError::InvalidPattern {
                pattern: p.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}

fn is_git_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == ".git"
}

fn normalized_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| {
            if e.starts_with('.') {
                e.clone()
            } else {
                format!(".{}", e)
            }
        })
        .collect()
}

fn within_prefix(rel_path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    rel_path == prefix || rel_path.starts_with(&format!("{}/", prefix))
}

/// Walk `repo` and load every file accepted by `filter`.
///
/// A missing repository yields an empty corpus. Unreadable files are skipped.
pub fn collect_documents(
    repo: &Path,
    filter: &CorpusFilter<'_>,
) -> Result<Vec<Document>, RetrievalError> {
    if !repo.exists() {
        return Ok(Vec::new());
    }

    let extensions = normalized_extensions(filter.file_extensions);
    let mut documents = Vec::new();

    let walker = WalkDir::new(repo)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_git_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path();
        let Ok(relative) = full_path.strip_prefix(repo) else {
            continue;
        };
        let rel_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !filter.index_all_files {
            let name = entry.file_name().to_string_lossy();
            if !extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
                continue;
            }
        }

        if let Some(prefix) = filter.source_path_prefix {
            if !within_prefix(&rel_path, prefix) {
                continue;
            }
        }

        if let Some(pattern) = filter.path_pattern {
            if !pattern.is_match(&full_path.to_string_lossy()) {
                continue;
            }
        }

        let bytes = match std::fs::read(full_path) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(path = %rel_path, error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let content = String::from_utf8_lossy(&bytes).into_owned();
        if content.len() > MAX_FILE_SIZE && content.chars().count() > MAX_FILE_SIZE {
            continue;
        }

        documents.push(Document {
            path: rel_path,
            content,
        });
    }

    Ok(documents)
}

/// Guess the main source directory of a checkout.
///
/// Tries the repository name (`owner/name` → `name`, then with `-` replaced
/// by `_`), then `src`. Returns `None` if none of them is a directory.
pub fn infer_source_prefix(repo: &Path, repo_slug: &str) -> Option<String> {
    let name = repo_slug.rsplit('/').next().unwrap_or(repo_slug);
    let mut candidates = vec![name.to_string(), name.replace('-', "_")];
    if let Some(stripped) = name.strip_prefix("python-") {
        candidates.push(stripped.replace('-', "_"));
    }
    candidates.push("src".to_string());

    candidates
        .into_iter()
        .filter(|c| !c.is_empty())
        .find(|c| repo.join(c).is_dir())
}
