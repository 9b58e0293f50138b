//! Typed events decoded from the generation agent's output stream.

pub mod parser;

pub use parser::StreamParser;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event in a generation session's totally ordered event sequence.
///
/// The serialized form is the SSE wire payload: `{"type": "...", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress {
        message: String,
    },
    ToolUse {
        name: String,
        input: Value,
    },
    ClaudeMessage {
        content: String,
    },
    BuildError(BuildError),
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issues: Option<usize>,
        #[serde(rename = "previewUrl", default, skip_serializing_if = "Option::is_none")]
        preview_url: Option<String>,
        #[serde(rename = "sandboxId", default, skip_serializing_if = "Option::is_none")]
        sandbox_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<Vec<String>>,
    },
    Error {
        message: String,
    },
}

/// A compiler/bundler diagnostic surfaced by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildError {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl StreamEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
