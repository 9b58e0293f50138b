//! Applies an ordered batch of file operations against the sandbox.
//!
//! Best-effort partial-failure semantics: each operation's failure is caught
//! and reported, the batch always runs to completion. Dependency installs
//! run strictly one at a time because concurrent installs can corrupt the
//! package manager's lockfile.

use std::sync::Arc;

use tracing::{info, warn};

use super::FileOperation;
use crate::errors::OpFailure;
use crate::sandbox::SandboxProvider;
use crate::sse::SseSender;
use crate::stream::StreamEvent;

/// Outcome of one batch.
#[derive(Debug, Default)]
pub struct FileOpReport {
    pub applied: usize,
    /// Writes skipped because content was already identical, plus deletes
    /// of files that didn't exist.
    pub skipped: usize,
    pub failures: Vec<OpFailure>,
}

pub struct FileOpExecutor {
    provider: Arc<dyn SandboxProvider>,
    sandbox_id: String,
    app_dir: String,
    package_manager: String,
}

impl FileOpExecutor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        sandbox_id: impl Into<String>,
        app_dir: impl Into<String>,
        package_manager: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            sandbox_id: sandbox_id.into(),
            app_dir: app_dir.into(),
            package_manager: package_manager.into(),
        }
    }

    /// Apply the batch in declaration order, emitting a progress event per
    /// applied operation and an informational error event per failure.
    pub async fn apply(&self, ops: &[FileOperation], events: &SseSender) -> FileOpReport {
        let mut report = FileOpReport::default();

        for op in ops {
            match self.apply_one(op).await {
                Ok(Applied::Done(message)) => {
                    report.applied += 1;
                    events.send(&StreamEvent::progress(message)).await;
                }
                Ok(Applied::Skipped) => report.skipped += 1,
                Err(e) => {
                    let failure = OpFailure {
                        operation: op.describe(),
                        message: format!("{:#}", e),
                    };
                    warn!(operation = %failure.operation, error = %failure.message, "File operation failed, continuing batch");
                    events
                        .send(&StreamEvent::error(format!(
                            "Skipped {}: {}",
                            failure.operation, failure.message
                        )))
                        .await;
                    report.failures.push(failure);
                }
            }
        }

        info!(
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failures.len(),
            "File operation batch finished"
        );
        report
    }

    async fn apply_one(&self, op: &FileOperation) -> anyhow::Result<Applied> {
        match op {
            FileOperation::Write { path, content } => {
                let full = self.resolve(path);
                // Identical content means the write would be a redundant
                // round trip and a spurious dev-server reload.
                if let Some(existing) = self.provider.read_file(&self.sandbox_id, &full).await? {
                    if existing == *content {
                        return Ok(Applied::Skipped);
                    }
                }
                self.provider
                    .write_file(&self.sandbox_id, &full, content)
                    .await?;
                Ok(Applied::Done(format!("Created {}", path)))
            }
            FileOperation::Delete { path } => {
                let full = self.resolve(path);
                let existed = self.provider.delete_file(&self.sandbox_id, &full).await?;
                if existed {
                    Ok(Applied::Done(format!("Deleted {}", path)))
                } else {
                    Ok(Applied::Skipped)
                }
            }
            FileOperation::Rename { from, to } => {
                self.provider
                    .rename_file(&self.sandbox_id, &self.resolve(from), &self.resolve(to))
                    .await?;
                Ok(Applied::Done(format!("Renamed {} to {}", from, to)))
            }
            FileOperation::AddDependency { name } => {
                let cmd = format!("{} install {}", self.package_manager, name);
                let result = self
                    .provider
                    .execute_command(&self.sandbox_id, &cmd, Some(&self.app_dir), None)
                    .await?;
                if !result.success() {
                    anyhow::bail!("install exited {}: {}", result.exit_code, result.stderr.trim());
                }
                Ok(Applied::Done(format!("Installed {}", name)))
            }
        }
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.app_dir.trim_end_matches('/'), path)
        }
    }
}

enum Applied {
    Done(String),
    Skipped,
}
