//! Client-side progressive disclosure model.
//!
//! A deterministic fold over the session's event sequence into a small set
//! of ordered phases. The phase only ever moves forward; task and file lists
//! only grow; `complete` is terminal and absorbs everything after it.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::{BuildError, StreamEvent};

/// Disclosure phases, in order. `Tasks` is the only phase allowed to
/// self-loop (repeated task events); everything else is strictly forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Thinking,
    Planning,
    Tasks,
    Building,
    Files,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Planning => "planning",
            Self::Tasks => "tasks",
            Self::Building => "building",
            Self::Files => "files",
            Self::Complete => "complete",
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thinking" => Ok(Self::Thinking),
            "planning" => Ok(Self::Planning),
            "tasks" => Ok(Self::Tasks),
            "building" => Ok(Self::Building),
            "files" => Ok(Self::Files),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: u64,
    pub name: String,
    pub status: TaskStatus,
}

/// The derived, client-owned view model for one generation session.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressiveModel {
    pub phase: Phase,
    pub thinking_started_at: DateTime<Utc>,
    pub thinking_active: bool,
    pub planning_statement: Option<String>,
    pub project_name: Option<String>,
    pub tasks: Vec<TaskItem>,
    pub files: Vec<String>,
    pub build_errors: Vec<BuildError>,
    pub stream_errors: Vec<String>,
    pub summary: Option<String>,
    pub issue_count: usize,
    next_task_id: u64,
}

impl ProgressiveModel {
    pub fn new(project_name: Option<String>) -> Self {
        Self {
            phase: Phase::Thinking,
            thinking_started_at: Utc::now(),
            thinking_active: true,
            planning_statement: None,
            project_name,
            tasks: Vec::new(),
            files: Vec::new(),
            build_errors: Vec::new(),
            stream_errors: Vec::new(),
            summary: None,
            issue_count: 0,
            next_task_id: 1,
        }
    }

    /// Fold one event into the model. Events after `complete` are ignored.
    pub fn apply(&mut self, event: &StreamEvent) {
        if self.phase == Phase::Complete {
            return;
        }

        match event {
            StreamEvent::Progress { message } => self.add_task(message.clone()),
            StreamEvent::ToolUse { name, input } => self.add_task(describe_tool_use(name, input)),
            StreamEvent::ClaudeMessage { content } => {
                // Only the first message, and only before tasks have begun,
                // ends the thinking phase. Later messages are narrative.
                if self.phase < Phase::Tasks && self.planning_statement.is_none() {
                    self.end_thinking(content.clone());
                }
            }
            StreamEvent::BuildError(err) => self.build_errors.push(err.clone()),
            StreamEvent::Complete {
                summary,
                issues,
                files,
                ..
            } => {
                if let Some(files) = files {
                    self.add_files(files.clone());
                }
                self.complete(summary.clone(), *issues);
            }
            StreamEvent::Error { message } => self.stream_errors.push(message.clone()),
        }
    }

    /// Complete the currently active task (if any) and append a new active
    /// one. Moves the phase to `tasks`; repeated calls self-loop there.
    pub fn add_task(&mut self, name: String) {
        if let Some(active) = self
            .tasks
            .iter_mut()
            .find(|t| t.status == TaskStatus::Active)
        {
            active.status = TaskStatus::Completed;
        }
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.push(TaskItem {
            id,
            name,
            status: TaskStatus::Active,
        });
        self.advance_to(Phase::Tasks);
    }

    /// Stop the thinking counter and record the planning statement.
    pub fn end_thinking(&mut self, statement: String) {
        self.thinking_active = false;
        self.planning_statement = Some(statement);
        self.advance_to(Phase::Planning);
    }

    /// Append generated files and move to the `files` phase.
    pub fn add_files(&mut self, files: Vec<String>) {
        self.files.extend(files);
        self.advance_to(Phase::Files);
    }

    /// Terminal transition. The accumulated build-error count overrides any
    /// supplied issue count whenever the list is non-empty.
    pub fn complete(&mut self, summary: Option<String>, issues: Option<usize>) {
        if let Some(active) = self
            .tasks
            .iter_mut()
            .find(|t| t.status == TaskStatus::Active)
        {
            active.status = TaskStatus::Completed;
        }
        self.thinking_active = false;
        self.summary = summary;
        self.issue_count = if self.build_errors.is_empty() {
            issues.unwrap_or(0)
        } else {
            self.build_errors.len()
        };
        self.advance_to(Phase::Complete);
    }

    /// Elapsed thinking time, frozen once thinking ends.
    pub fn thinking_elapsed(&self) -> chrono::Duration {
        Utc::now() - self.thinking_started_at
    }

    fn advance_to(&mut self, target: Phase) {
        if target > self.phase {
            self.phase = target;
        }
    }
}

/// Derive a human label for a tool invocation.
fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = input
        .get("path")
        .or_else(|| input.get("file_path"))
        .and_then(|p| p.as_str());

    let lowered = name.to_lowercase();
    match path {
        Some(path) if lowered.contains("write") || lowered.contains("create") => {
            format!("Created {}", path)
        }
        Some(path) if lowered.contains("edit") || lowered.contains("replace") => {
            format!("Updated {}", path)
        }
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_use(name: &str, path: &str) -> StreamEvent {
        StreamEvent::ToolUse {
            name: name.into(),
            input: serde_json::json!({ "path": path }),
        }
    }

    fn build_error(file: &str) -> StreamEvent {
        StreamEvent::BuildError(BuildError {
            file: file.into(),
            line: None,
            column: None,
            message: "boom".into(),
            suggestion: None,
        })
    }

    #[test]
    fn phase_order_is_total() {
        assert!(Phase::Thinking < Phase::Planning);
        assert!(Phase::Planning < Phase::Tasks);
        assert!(Phase::Tasks < Phase::Building);
        assert!(Phase::Building < Phase::Files);
        assert!(Phase::Files < Phase::Complete);
    }

    #[test]
    fn first_message_ends_thinking() {
        let mut model = ProgressiveModel::new(None);
        assert!(model.thinking_active);
        model.apply(&StreamEvent::ClaudeMessage {
            content: "I'll build a marketplace".into(),
        });
        assert_eq!(model.phase, Phase::Planning);
        assert!(!model.thinking_active);
        assert_eq!(
            model.planning_statement.as_deref(),
            Some("I'll build a marketplace")
        );
    }

    #[test]
    fn later_messages_are_narrative() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::ClaudeMessage { content: "plan".into() });
        model.apply(&StreamEvent::progress("scaffolding"));
        model.apply(&StreamEvent::ClaudeMessage {
            content: "more prose".into(),
        });
        assert_eq!(model.phase, Phase::Tasks);
        assert_eq!(model.planning_statement.as_deref(), Some("plan"));
    }

    #[test]
    fn progress_adds_tasks_and_completes_previous() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::progress("first"));
        model.apply(&StreamEvent::progress("second"));
        assert_eq!(model.tasks.len(), 2);
        assert_eq!(model.tasks[0].status, TaskStatus::Completed);
        assert_eq!(model.tasks[1].status, TaskStatus::Active);
        assert_eq!(model.phase, Phase::Tasks);
    }

    #[test]
    fn tool_use_labels() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&tool_use("write_file", "src/App.jsx"));
        model.apply(&tool_use("edit_file", "src/App.jsx"));
        model.apply(&tool_use("run_command", "ignored"));
        let names: Vec<&str> = model.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Created src/App.jsx", "Updated src/App.jsx", "run_command"]
        );
    }

    #[test]
    fn tool_use_without_path_uses_raw_name() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::ToolUse {
            name: "write_file".into(),
            input: serde_json::json!({}),
        });
        assert_eq!(model.tasks[0].name, "write_file");
    }

    #[test]
    fn task_list_only_grows() {
        let mut model = ProgressiveModel::new(None);
        let mut previous_len = 0;
        for i in 0..20 {
            model.apply(&StreamEvent::progress(format!("task {}", i)));
            assert!(model.tasks.len() > previous_len);
            previous_len = model.tasks.len();
        }
        assert_eq!(model.tasks[0].name, "task 0");
    }

    #[test]
    fn phase_is_monotonic_over_arbitrary_sequences() {
        let events = vec![
            StreamEvent::progress("a"),
            StreamEvent::ClaudeMessage { content: "late".into() },
            build_error("x.jsx"),
            StreamEvent::progress("b"),
            StreamEvent::Complete {
                summary: Some("done".into()),
                issues: None,
                preview_url: None,
                sandbox_id: None,
                files: Some(vec!["src/App.jsx".into()]),
            },
            StreamEvent::progress("after the end"),
        ];
        let mut model = ProgressiveModel::new(None);
        let mut last_phase = model.phase;
        for event in &events {
            model.apply(event);
            assert!(
                model.phase >= last_phase,
                "phase regressed from {:?} to {:?}",
                last_phase,
                model.phase
            );
            last_phase = model.phase;
        }
        assert_eq!(model.phase, Phase::Complete);
    }

    #[test]
    fn complete_is_terminal() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::Complete {
            summary: None,
            issues: None,
            preview_url: None,
            sandbox_id: None,
            files: None,
        });
        let tasks_before = model.tasks.len();
        model.apply(&StreamEvent::progress("ignored"));
        model.apply(&build_error("ignored.jsx"));
        assert_eq!(model.tasks.len(), tasks_before);
        assert!(model.build_errors.is_empty());
        assert_eq!(model.phase, Phase::Complete);
    }

    #[test]
    fn complete_with_files_passes_through_files_phase() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::Complete {
            summary: Some("built".into()),
            issues: Some(0),
            preview_url: None,
            sandbox_id: None,
            files: Some(vec!["a.jsx".into(), "b.jsx".into()]),
        });
        assert_eq!(model.files, vec!["a.jsx", "b.jsx"]);
        assert_eq!(model.phase, Phase::Complete);
    }

    #[test]
    fn build_errors_accumulate_without_phase_change() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::progress("building"));
        let phase = model.phase;
        model.apply(&build_error("a.jsx"));
        model.apply(&build_error("b.jsx"));
        assert_eq!(model.phase, phase);
        assert_eq!(model.build_errors.len(), 2);
    }

    #[test]
    fn override_supplied_issue_count() {
        // Accumulated build errors win over whatever the agent claims.
        let mut model = ProgressiveModel::new(None);
        model.apply(&build_error("a.jsx"));
        model.apply(&build_error("b.jsx"));
        model.complete(Some("done".into()), Some(99));
        assert_eq!(model.issue_count, 2);
    }

    #[test]
    fn supplied_issue_count_used_when_no_build_errors() {
        let mut model = ProgressiveModel::new(None);
        model.complete(None, Some(5));
        assert_eq!(model.issue_count, 5);

        let mut model = ProgressiveModel::new(None);
        model.complete(None, None);
        assert_eq!(model.issue_count, 0);
    }

    #[test]
    fn complete_finishes_active_task() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::progress("last task"));
        model.complete(None, None);
        assert_eq!(model.tasks[0].status, TaskStatus::Completed);
    }

    #[test]
    fn stream_errors_recorded_without_phase_change() {
        let mut model = ProgressiveModel::new(None);
        model.apply(&StreamEvent::progress("working"));
        model.apply(&StreamEvent::error("sandbox hiccup"));
        assert_eq!(model.phase, Phase::Tasks);
        assert_eq!(model.stream_errors, vec!["sandbox hiccup"]);
        // Prior history is untouched
        assert_eq!(model.tasks.len(), 1);
    }
}
