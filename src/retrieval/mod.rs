//! Context retrieval over a repository checkout.
//!
//! A [`RetrievalStrategy`] decides three things: the guideline appended to
//! the agent's system prompt ([`apply_retrieval_to_config`]), which files
//! are indexed, and how they are ranked ([`retrieve`]).
//!
//! | Strategy | Corpus | Ranking |
//! |---|---|---|
//! | `none` | - | - |
//! | `bm25` | all files | BM25 over whole files |
//! | `bm25_py` | `.py` files | BM25 over whole files |
//! | `bm25_source` | `.py` files under the main source directory | BM25 over whole files |
//! | `bm25_two_stage` | `.py` files | BM25, then rule-number helper expansion |
//! | `hybrid` | all files | embeddings + BM25 over character chunks |

pub mod bm25;
pub mod corpus;
pub mod embeddings;
pub mod hybrid;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{RunSection, RunnerConfig};
use crate::error::RetrievalError;

pub use bm25::{run_bm25_retrieval, tokenize, Bm25Okapi, Bm25Options};
pub use corpus::{collect_documents, infer_source_prefix, CorpusFilter, Document, MAX_FILE_SIZE};
pub use embeddings::{Embedder, HashingEmbedder, RemoteEmbedder};
pub use hybrid::{chunk_text, run_hybrid_retrieval, HybridOptions, RetrievedChunk};

/// Retrieval modes accepted by `--retrieval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    None,
    Bm25,
    Bm25Py,
    Bm25Source,
    Bm25TwoStage,
    Hybrid,
}

impl RetrievalStrategy {
    pub const ALL: [RetrievalStrategy; 6] = [
        RetrievalStrategy::None,
        RetrievalStrategy::Bm25,
        RetrievalStrategy::Bm25Py,
        RetrievalStrategy::Bm25Source,
        RetrievalStrategy::Bm25TwoStage,
        RetrievalStrategy::Hybrid,
    ];

    /// Case-insensitive lookup. `""` and `off` mean `none`; unknown names
    /// also fall back to `none`.
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_lowercase();
        match normalized.as_str() {
            "none" | "" | "off" => Self::None,
            "bm25" => Self::Bm25,
            "bm25_py" => Self::Bm25Py,
            "bm25_source" => Self::Bm25Source,
            "bm25_two_stage" => Self::Bm25TwoStage,
            "hybrid" => Self::Hybrid,
            other => {
                warn!(strategy = %other, "Unknown retrieval strategy, retrieval disabled");
                Self::None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bm25 => "bm25",
            Self::Bm25Py => "bm25_py",
            Self::Bm25Source => "bm25_source",
            Self::Bm25TwoStage => "bm25_two_stage",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn setup(&self) -> RetrievalSetup {
        let system_guidelines = match self {
            Self::None => "",
            Self::Bm25 => {
                "Retrieval mode: BM25. Relevant files have been suggested based on the task description. \
                 Start by examining the suggested files to understand the codebase structure."
            }
            Self::Bm25Py => {
                "Retrieval mode: BM25 (Python files only). Relevant Python files have been suggested based on the task description. \
                 Start by examining the suggested files to understand the codebase structure."
            }
            Self::Bm25Source => {
                "Retrieval mode: BM25 (source code only). Relevant source files have been suggested based on the task description. \
                 Files have been filtered to focus on the main source code directory. Start by examining the suggested files to understand the codebase structure."
            }
            Self::Bm25TwoStage => {
                "Retrieval mode: BM25 two-stage. Files have been suggested using a two-stage retrieval process: \
                 initial candidate generation followed by semantic reranking. Focus on the suggested files to understand the codebase structure."
            }
            Self::Hybrid => {
                "Retrieval mode: Hybrid (embedding + BM25). Code chunks have been retrieved using a hybrid approach \
                 combining semantic embeddings and BM25 scoring. Focus on the suggested code chunks to understand the codebase structure."
            }
        };
        RetrievalSetup { system_guidelines }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt additions for a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalSetup {
    /// Appended to the system template. Empty for `none`.
    pub system_guidelines: &'static str,
}

pub fn get_retrieval_setup(strategy: &str) -> RetrievalSetup {
    RetrievalStrategy::parse(strategy).setup()
}

/// Add the strategy's guideline to the system template and set the
/// strategy's corpus options in the `run` section.
///
/// Applying the same strategy twice leaves the config unchanged.
pub fn apply_retrieval_to_config(config: &mut RunnerConfig, strategy: &str) {
    let parsed = RetrievalStrategy::parse(strategy);
    let guidelines = parsed.setup().system_guidelines;
    if !guidelines.is_empty() && !config.agent.system_template.contains(guidelines) {
        let combined = format!("{}\n\n{}", config.agent.system_template, guidelines);
        config.agent.system_template = combined.trim().to_string();
    }

    let run = &mut config.run;
    run.retrieval_strategy = strategy.to_string();
    match parsed {
        RetrievalStrategy::Bm25 | RetrievalStrategy::Hybrid => {
            run.retrieval_index_all_files = true;
        }
        RetrievalStrategy::Bm25Py | RetrievalStrategy::Bm25Source | RetrievalStrategy::Bm25TwoStage => {
            run.retrieval_index_all_files = false;
            run.retrieval_file_extensions = vec![".py".to_string()];
        }
        RetrievalStrategy::None => {}
    }
}

/// Output of one retrieval run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub strategy: RetrievalStrategy,
    /// Ranked file paths (BM25 modes).
    #[serde(default)]
    pub files: Vec<String>,
    /// Ranked chunks (hybrid mode).
    #[serde(default)]
    pub chunks: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    pub fn empty(strategy: RetrievalStrategy) -> Self {
        Self {
            strategy,
            files: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.chunks.is_empty()
    }

    /// Text block for the agent's instance prompt.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        if !self.files.is_empty() {
            out.push_str("The following files may be relevant to the task (most relevant first):\n");
            for (i, path) in self.files.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, path));
            }
        }
        if !self.chunks.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("The following code chunks may be relevant to the task (most relevant first):\n");
            for chunk in &self.chunks {
                out.push_str(&format!(
                    "\n{} (characters {}-{}):\n```\n{}\n```\n",
                    chunk.path, chunk.start, chunk.end, chunk.content
                ));
            }
        }
        out.trim_end().to_string()
    }
}

/// Inputs describing the task and checkout being searched.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalQuery<'a> {
    pub task: &'a str,
    pub repo: &'a Path,
    /// `owner/name`, used to infer the source directory.
    pub repo_slug: Option<&'a str>,
    pub lint_output: Option<&'a str>,
}

fn bm25_options(
    strategy: RetrievalStrategy,
    run: &RunSection,
    query: &RetrievalQuery<'_>,
) -> Bm25Options {
    let mut options = Bm25Options {
        top_k: run.retrieval_top_k,
        rule_filter: run.retrieval_rule_filter,
        lint_output: query.lint_output.map(str::to_string),
        two_stage: false,
        index_all_files: run.retrieval_index_all_files,
        file_extensions: run.retrieval_file_extensions.clone(),
        source_path_prefix: None,
        filter_pattern: run.retrieval_filter_pattern.clone(),
        rule_id_pattern: run.retrieval_rule_id_pattern.clone(),
    };

    match strategy {
        RetrievalStrategy::Bm25Py => {
            options.index_all_files = false;
            options.file_extensions = vec![".py".to_string()];
        }
        RetrievalStrategy::Bm25Source => {
            options.index_all_files = false;
            options.file_extensions = vec![".py".to_string()];
            options.source_path_prefix = run.retrieval_source_path_prefix.clone().or_else(|| {
                query
                    .repo_slug
                    .and_then(|slug| infer_source_prefix(query.repo, slug))
            });
        }
        RetrievalStrategy::Bm25TwoStage => {
            options.index_all_files = false;
            options.file_extensions = vec![".py".to_string()];
            options.two_stage = true;
        }
        _ => {}
    }
    options
}

fn hybrid_options(run: &RunSection) -> HybridOptions {
    HybridOptions {
        top_k: run.retrieval_top_k,
        chunk_size: run.retrieval_chunk_size,
        chunk_overlap: run.retrieval_chunk_overlap,
        embedding_weight: run.retrieval_embedding_weight,
        bm25_weight: run.retrieval_bm25_weight,
        index_all_files: run.retrieval_index_all_files,
        file_extensions: run.retrieval_file_extensions.clone(),
        source_path_prefix: run.retrieval_source_path_prefix.clone(),
        filter_pattern: run.retrieval_filter_pattern.clone(),
    }
}

/// Embedder selected by the `run` section.
pub fn build_embedder(run: &RunSection) -> Box<dyn Embedder> {
    match run.retrieval_embedding_api_base.as_deref().filter(|b| !b.is_empty()) {
        Some(base) => Box::new(RemoteEmbedder::new(
            base,
            std::env::var("LITELLM_API_KEY").ok(),
            run.retrieval_embedding_model.clone(),
        )),
        None => Box::new(HashingEmbedder::default()),
    }
}

/// Run the strategy named in `run.retrieval_strategy` against a checkout.
pub async fn retrieve(
    run: &RunSection,
    query: RetrievalQuery<'_>,
) -> Result<RetrievalResult, RetrievalError> {
    let strategy = RetrievalStrategy::parse(&run.retrieval_strategy);
    match strategy {
        RetrievalStrategy::None => Ok(RetrievalResult::empty(strategy)),
        RetrievalStrategy::Hybrid => {
            let embedder = build_embedder(run);
            let chunks =
                run_hybrid_retrieval(query.task, query.repo, embedder.as_ref(), &hybrid_options(run))
                    .await?;
            info!(strategy = %strategy, chunks = chunks.len(), "Retrieval finished");
            Ok(RetrievalResult {
                strategy,
                files: Vec::new(),
                chunks,
            })
        }
        _ => {
            let options = bm25_options(strategy, run, &query);
            let task = query.task.to_string();
            let repo = query.repo.to_path_buf();
            let files =
                tokio::task::spawn_blocking(move || run_bm25_retrieval(&task, &repo, &options)).await??;
            info!(strategy = %strategy, files = files.len(), "Retrieval finished");
            Ok(RetrievalResult {
                strategy,
                files,
                chunks: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunnerConfig {
        RunnerConfig::builtin().unwrap()
    }

    #[test]
    fn test_parse_is_lenient() {
        assert_eq!(RetrievalStrategy::parse(" BM25_Py "), RetrievalStrategy::Bm25Py);
        assert_eq!(RetrievalStrategy::parse("off"), RetrievalStrategy::None);
        assert_eq!(RetrievalStrategy::parse(""), RetrievalStrategy::None);
        assert_eq!(RetrievalStrategy::parse("dense"), RetrievalStrategy::None);
        for s in RetrievalStrategy::ALL {
            assert_eq!(RetrievalStrategy::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_none_has_no_guidelines() {
        assert!(get_retrieval_setup("none").system_guidelines.is_empty());
        assert!(get_retrieval_setup("hybrid")
            .system_guidelines
            .starts_with("Retrieval mode: Hybrid"));
    }

    #[test]
    fn test_apply_bm25_py() {
        let mut cfg = config();
        cfg.run.retrieval_index_all_files = true;
        cfg.run.retrieval_file_extensions = vec![".rs".to_string()];
        apply_retrieval_to_config(&mut cfg, "bm25_py");

        assert!(cfg
            .agent
            .system_template
            .ends_with(get_retrieval_setup("bm25_py").system_guidelines));
        assert_eq!(cfg.run.retrieval_strategy, "bm25_py");
        assert!(!cfg.run.retrieval_index_all_files);
        assert_eq!(cfg.run.retrieval_file_extensions, vec![".py"]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut cfg = config();
        apply_retrieval_to_config(&mut cfg, "bm25");
        let once = cfg.clone();
        apply_retrieval_to_config(&mut cfg, "bm25");
        assert_eq!(cfg, once);
        assert!(cfg.run.retrieval_index_all_files);
    }

    #[test]
    fn test_apply_none_only_records_strategy() {
        let mut cfg = config();
        cfg.run.retrieval_index_all_files = true;
        let template = cfg.agent.system_template.clone();
        apply_retrieval_to_config(&mut cfg, "off");
        assert_eq!(cfg.agent.system_template, template);
        assert_eq!(cfg.run.retrieval_strategy, "off");
        assert!(cfg.run.retrieval_index_all_files);
    }

    #[test]
    fn test_apply_to_empty_template_trims() {
        let mut cfg = config();
        cfg.agent.system_template = String::new();
        apply_retrieval_to_config(&mut cfg, "bm25");
        assert_eq!(
            cfg.agent.system_template,
            get_retrieval_setup("bm25").system_guidelines
        );
    }

    #[test]
    fn test_render() {
        assert_eq!(RetrievalResult::empty(RetrievalStrategy::Bm25).render(), "");

        let files = RetrievalResult {
            strategy: RetrievalStrategy::Bm25,
            files: vec!["a.py".to_string(), "b/c.py".to_string()],
            chunks: Vec::new(),
        };
        let text = files.render();
        assert!(text.contains("1. a.py\n2. b/c.py"));

        let chunks = RetrievalResult {
            strategy: RetrievalStrategy::Hybrid,
            files: Vec::new(),
            chunks: vec![RetrievedChunk {
                path: "a.py".to_string(),
                start: 0,
                end: 5,
                content: "x = 1".to_string(),
            }],
        };
        assert!(chunks.render().contains("a.py (characters 0-5):\n```\nx = 1\n```"));
    }

    #[test]
    fn test_source_options_infer_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("requests")).unwrap();
        let run = RunSection::default();
        let query = RetrievalQuery {
            task: "t",
            repo: tmp.path(),
            repo_slug: Some("psf/requests"),
            lint_output: None,
        };
        let options = bm25_options(RetrievalStrategy::Bm25Source, &run, &query);
        assert_eq!(options.source_path_prefix.as_deref(), Some("requests"));
        assert!(!options.two_stage);
        assert!(bm25_options(RetrievalStrategy::Bm25TwoStage, &run, &query).two_stage);
    }

    #[tokio::test]
    async fn test_retrieve_bm25_ranks_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("dates.py"), "def parse_date timezone offset").unwrap();
        std::fs::write(tmp.path().join("http.py"), "class response redirect").unwrap();
        std::fs::write(tmp.path().join("utils.py"), "helper function misc").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "timezone timezone").unwrap();

        let run = RunSection {
            retrieval_strategy: "bm25_py".to_string(),
            ..Default::default()
        };
        let result = retrieve(
            &run,
            RetrievalQuery {
                task: "wrong timezone offset",
                repo: tmp.path(),
                repo_slug: None,
                lint_output: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::Bm25Py);
        assert_eq!(result.files, vec!["dates.py"]);
    }

    #[tokio::test]
    async fn test_retrieve_none_is_empty() {
        let run = RunSection::default();
        let result = retrieve(
            &run,
            RetrievalQuery {
                task: "anything",
                repo: Path::new("/nonexistent"),
                repo_slug: None,
                lint_output: None,
            },
        )
        .await
        .unwrap();
        assert!(result.is_empty());
    }
}
