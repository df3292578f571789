//! Scoring predictions against SWE-bench.
//!
//! For every prediction the harness starts the instance image, applies the
//! model patch and the gold test patch, runs the affected tests and parses
//! their log. An instance is resolved when all FAIL_TO_PASS and PASS_TO_PASS
//! tests pass.

pub mod harness;
pub mod log_parsers;

pub use harness::{
    load_predictions, EvaluationConfig, EvaluationError, EvaluationHarness, EvaluationReport,
    EvaluationStatus, InstanceReport,
};
pub use log_parsers::{grade, parse_log, parse_log_django, parse_log_pytest, TestStatus, TestsStatus};
