//! File operations extracted from agent output.
//!
//! The agent embeds filesystem directives in its response text as tag
//! markup. Extraction preserves document order: later renames may target
//! names produced by earlier ones, so the relative order of every operation
//! kind matters, not just order within a kind.

pub mod executor;

pub use executor::{FileOpExecutor, FileOpReport};

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOperation {
    Write { path: String, content: String },
    Delete { path: String },
    Rename { from: String, to: String },
    AddDependency { name: String },
}

impl FileOperation {
    /// Short human description, used in progress events and failure reports.
    pub fn describe(&self) -> String {
        match self {
            Self::Write { path, .. } => format!("write {}", path),
            Self::Delete { path } => format!("delete {}", path),
            Self::Rename { from, to } => format!("rename {} -> {}", from, to),
            Self::AddDependency { name } => format!("install {}", name),
        }
    }
}

static FILE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<file path="([^"]+)">\n?(.*?)</file>"#).unwrap());

static DELETE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<delete path="([^"]+)"\s*/?>"#).unwrap());

static RENAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<rename from="([^"]+)" to="([^"]+)"\s*/?>"#).unwrap());

static PACKAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<package>([^<]+)</package>").unwrap());

// Comma- or whitespace-separated list form
static PACKAGES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<packages>(.*?)</packages>").unwrap());

/// Extract every file operation from the agent's response text, in
/// declaration order across all tag kinds.
pub fn extract_operations(text: &str) -> Vec<FileOperation> {
    let mut positioned: Vec<(usize, FileOperation)> = Vec::new();

    for cap in FILE_REGEX.captures_iter(text) {
        let start = cap.get(0).map(|m| m.start()).unwrap_or(0);
        positioned.push((
            start,
            FileOperation::Write {
                path: cap[1].to_string(),
                content: cap[2].trim_end_matches('\n').to_string(),
            },
        ));
    }
    for cap in DELETE_REGEX.captures_iter(text) {
        let start = cap.get(0).map(|m| m.start()).unwrap_or(0);
        positioned.push((
            start,
            FileOperation::Delete {
                path: cap[1].to_string(),
            },
        ));
    }
    for cap in RENAME_REGEX.captures_iter(text) {
        let start = cap.get(0).map(|m| m.start()).unwrap_or(0);
        positioned.push((
            start,
            FileOperation::Rename {
                from: cap[1].to_string(),
                to: cap[2].to_string(),
            },
        ));
    }
    for cap in PACKAGE_REGEX.captures_iter(text) {
        let start = cap.get(0).map(|m| m.start()).unwrap_or(0);
        positioned.push((
            start,
            FileOperation::AddDependency {
                name: cap[1].trim().to_string(),
            },
        ));
    }
    for cap in PACKAGES_REGEX.captures_iter(text) {
        let start = cap.get(0).map(|m| m.start()).unwrap_or(0);
        for (offset, name) in cap[1]
            .split([',', '\n', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
        {
            // Preserve in-list order via a sub-offset
            positioned.push((
                start + offset,
                FileOperation::AddDependency {
                    name: name.to_string(),
                },
            ));
        }
    }

    positioned.sort_by_key(|(start, _)| *start);
    positioned.into_iter().map(|(_, op)| op).collect()
}
