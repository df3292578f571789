//! The default software-engineering agent.
//!
//! The agent alternates between querying the model and running the single
//! bash command found in its reply, until the model submits, a limit is
//! hit, or an unrecoverable error occurs.

pub mod config;
pub mod default;

pub use config::AgentConfig;
pub use default::{
    render_template, AgentError, AgentMessage, DefaultAgent, COMPLETE_TASK_MARKER,
    FINAL_OUTPUT_MARKER,
};
