use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A persisted generated-app project record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    pub sandbox_id: Option<String>,
    pub preview_url: Option<String>,
    pub status: ProjectStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Generating,
    Ready,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(Self::Generating),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Ephemeral per-request generation session, persisted for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: String,
    pub prompt: String,
    pub sandbox_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// Metered credit categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    Message,
    Project,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Project => "project",
        }
    }
}

impl FromStr for CreditType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "project" => Ok(Self::Project),
            _ => Err(format!("Invalid credit type: {}", s)),
        }
    }
}

/// What a credit was consumed for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    Generation,
    ChatContinue,
    ProjectCreate,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::ChatContinue => "chat_continue",
            Self::ProjectCreate => "project_create",
        }
    }
}

impl FromStr for UsageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(Self::Generation),
            "chat_continue" => Ok(Self::ChatContinue),
            "project_create" => Ok(Self::ProjectCreate),
            _ => Err(format!("Invalid usage type: {}", s)),
        }
    }
}

/// A consumed-credit ledger entry. The `id` doubles as the idempotency key
/// handed back to callers so a downstream failure can refund exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub usage_type: UsageType,
    pub credit_type: CreditType,
    pub amount: i64,
    pub details: Option<String>,
    pub refunded: bool,
    pub created_at: String,
}
