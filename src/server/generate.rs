//! Generation orchestration: credit gate, sandbox lifecycle, engine
//! launch, stream translation, file application, terminal events.

use std::collections::HashMap;

use axum::{
    extract::{Json, State},
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::GenerateError;
use crate::fileops::{FileOpExecutor, FileOperation, extract_operations};
use crate::models::{CreditType, ProjectStatus, SessionStatus, UsageType};
use crate::sandbox::RunningSandbox;
use crate::server::{ApiError, SharedState, require_user};
use crate::sse::{self, SseSender};
use crate::stream::{StreamEvent, StreamParser};

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(rename = "sandboxId", default)]
    pub sandbox_id: Option<String>,
    #[serde(rename = "projectName", default)]
    pub project_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatContinueRequest {
    #[serde(rename = "sandboxId")]
    pub sandbox_id: String,
    pub message: String,
    #[serde(rename = "conversationHistory", default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Everything the background pump needs about one generation run.
struct GenerationJob {
    user_id: String,
    prompt: String,
    sandbox_id: Option<String>,
    project_id: Option<i64>,
    session_id: String,
    usage_id: String,
    usage_type: UsageType,
}

// ── Handlers ──────────────────────────────────────────────────────────

/// POST /api/generate. Gate checks run before any stream bytes go out;
/// everything after that is reported in-band.
pub async fn generate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;

    if let Some(id) = &req.sandbox_id {
        ensure_sandbox_exists(&state, id).await?;
    } else {
        state.credits.check_project_limit(&user_id).await?;
    }

    let usage = state
        .credits
        .track_and_consume(
            &user_id,
            UsageType::Generation,
            CreditType::Message,
            1,
            Some(preview_of(&req.prompt)),
        )
        .await?;

    let project_id = if req.sandbox_id.is_none() {
        let name = req
            .project_name
            .clone()
            .unwrap_or_else(|| preview_of(&req.prompt));
        let (user, prompt) = (user_id.clone(), req.prompt.clone());
        let project = state
            .db
            .call(move |db| db.create_project(&user, &name, &prompt))
            .await
            .map_err(GenerateError::Database)?;
        Some(project.id)
    } else {
        None
    };

    let job = GenerationJob {
        user_id,
        prompt: req.prompt,
        sandbox_id: req.sandbox_id,
        project_id,
        session_id: Uuid::new_v4().to_string(),
        usage_id: usage.id,
        usage_type: UsageType::Generation,
    };
    Ok(start_stream(state, job).await)
}

/// POST /api/chat-continue. Same pipeline against an existing sandbox;
/// the conversation history is folded into the engine prompt.
pub async fn chat_continue(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ChatContinueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user(&headers)?;
    ensure_sandbox_exists(&state, &req.sandbox_id).await?;

    let usage = state
        .credits
        .track_and_consume(
            &user_id,
            UsageType::ChatContinue,
            CreditType::Message,
            1,
            Some(preview_of(&req.message)),
        )
        .await?;

    let mut prompt = String::new();
    for turn in &req.history {
        prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
    }
    prompt.push_str(&format!("user: {}", req.message));

    let job = GenerationJob {
        user_id,
        prompt,
        sandbox_id: Some(req.sandbox_id),
        project_id: None,
        session_id: Uuid::new_v4().to_string(),
        usage_id: usage.id,
        usage_type: UsageType::ChatContinue,
    };
    Ok(start_stream(state, job).await)
}

async fn ensure_sandbox_exists(state: &SharedState, id: &str) -> Result<(), ApiError> {
    let found = state
        .provider
        .get(id)
        .await
        .map_err(GenerateError::Other)?
        .is_some();
    if found {
        Ok(())
    } else {
        Err(ApiError(GenerateError::SandboxNotFound { id: id.to_string() }))
    }
}

async fn start_stream(state: SharedState, job: GenerationJob) -> impl IntoResponse {
    let (session, prompt, sandbox) = (
        job.session_id.clone(),
        job.prompt.clone(),
        job.sandbox_id.clone(),
    );
    if let Err(e) = state
        .db
        .call(move |db| db.create_session(&session, &prompt, sandbox.as_deref()))
        .await
    {
        warn!(error = %e, "Failed to record generation session");
    }

    let (events, rx) = sse::channel();
    tokio::spawn(run_generation(state, job, events));
    sse::into_response_stream(rx)
}

// ── The pump ──────────────────────────────────────────────────────────

async fn run_generation(state: SharedState, job: GenerationJob, events: SseSender) {
    info!(session = %job.session_id, user = %job.user_id, "Generation started");
    events
        .send(&StreamEvent::progress("Starting generation"))
        .await;

    // Serialize on the sandbox lease before touching lifecycle state. A
    // freshly created sandbox gets its lease as soon as it has an id.
    let mut guard = match &job.sandbox_id {
        Some(id) => Some(state.sandbox_lease(id).lock_owned().await),
        None => None,
    };
    let sandbox = match resolve_sandbox(&state, &job, &events).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            fail(&state, &job, &events, e.to_string()).await;
            return;
        }
    };
    if guard.is_none() {
        guard = Some(state.sandbox_lease(&sandbox.id).lock_owned().await);
    }
    let _guard = guard;

    events.send(&StreamEvent::progress("Sandbox ready")).await;

    let mut extra_env = HashMap::new();
    extra_env.insert("PREFAB_SANDBOX_ID".to_string(), sandbox.id.clone());
    extra_env.insert(
        "PREFAB_APP_DIR".to_string(),
        state.config.engine.app_dir.clone(),
    );

    let mut process = match state.launcher.launch(&job.prompt, &extra_env) {
        Ok(process) => process,
        Err(e) => {
            fail(&state, &job, &events, e.to_string()).await;
            return;
        }
    };

    let mut parser = StreamParser::new();
    let mut transcript = String::new();
    let mut last_message: Option<String> = None;
    let mut build_errors = 0usize;

    while let Some(chunk) = process.output.recv().await {
        for event in parser.feed(&chunk) {
            track(&event, &mut transcript, &mut last_message, &mut build_errors);
            events.send(&event).await;
        }
        if events.is_closed() {
            // Client went away: stop paying for tokens nobody is reading.
            debug!(session = %job.session_id, "Client disconnected, killing engine");
            process.kill();
        }
    }
    for event in parser.finish() {
        track(&event, &mut transcript, &mut last_message, &mut build_errors);
        events.send(&event).await;
    }

    let status = process.exit.await;
    if events.is_closed() {
        finish_records(&state, &job, SessionStatus::Failed, None, None).await;
        return;
    }
    match status {
        Ok(Ok(status)) if status.success() => {}
        Ok(Ok(status)) => {
            fail(
                &state,
                &job,
                &events,
                format!("Generation engine exited with {}", status),
            )
            .await;
            return;
        }
        Ok(Err(e)) => {
            fail(&state, &job, &events, format!("Generation engine failed: {}", e)).await;
            return;
        }
        Err(e) => {
            fail(&state, &job, &events, format!("Generation task failed: {}", e)).await;
            return;
        }
    }

    let ops = extract_operations(&transcript);
    if ops.is_empty() && job.usage_type == UsageType::Generation {
        fail(
            &state,
            &job,
            &events,
            GenerateError::MalformedModelOutput.to_string(),
        )
        .await;
        return;
    }

    let executor = FileOpExecutor::new(
        state.provider.clone(),
        &sandbox.id,
        &state.config.engine.app_dir,
        &state.config.engine.package_manager,
    );
    let report = executor.apply(&ops, &events).await;
    info!(
        session = %job.session_id,
        applied = report.applied,
        skipped = report.skipped,
        failed = report.failures.len(),
        "File operations applied"
    );

    let failed_ops: Vec<&str> = report.failures.iter().map(|f| f.operation.as_str()).collect();
    let files: Vec<String> = ops
        .iter()
        .filter_map(|op| match op {
            FileOperation::Write { path, .. } if !failed_ops.contains(&op.describe().as_str()) => {
                Some(path.clone())
            }
            _ => None,
        })
        .collect();

    let preview_url = parser
        .preview_url()
        .map(str::to_string)
        .unwrap_or_else(|| sandbox.endpoint.clone());
    let sandbox_id = parser
        .sandbox_id()
        .map(str::to_string)
        .unwrap_or_else(|| sandbox.id.clone());

    finish_records(
        &state,
        &job,
        SessionStatus::Completed,
        Some(sandbox_id.clone()),
        Some(preview_url.clone()),
    )
    .await;

    events
        .send(&StreamEvent::Complete {
            summary: last_message.map(|m| preview_of(&m)),
            issues: Some(build_errors + report.failures.len()),
            preview_url: Some(preview_url),
            sandbox_id: Some(sandbox_id),
            files: (!files.is_empty()).then_some(files),
        })
        .await;
    events.done().await;
    info!(session = %job.session_id, "Generation complete");
}

async fn resolve_sandbox(
    state: &SharedState,
    job: &GenerationJob,
    events: &SseSender,
) -> Result<RunningSandbox, GenerateError> {
    match &job.sandbox_id {
        Some(id) => {
            events
                .send(&StreamEvent::progress("Waking up your sandbox"))
                .await;
            match state.lifecycle.ensure_running(id).await {
                Ok(sandbox) => Ok(sandbox),
                Err(GenerateError::SandboxUnavailable { .. }) => {
                    events
                        .send(&StreamEvent::progress("Sandbox is stuck, forcing a restart"))
                        .await;
                    state.lifecycle.force_start(id).await
                }
                Err(e) => Err(e),
            }
        }
        None => {
            events
                .send(&StreamEvent::progress("Creating a fresh sandbox"))
                .await;
            let handle = state.provider.create().await.map_err(GenerateError::Other)?;
            state.lifecycle.ensure_running(&handle.id).await
        }
    }
}

fn track(
    event: &StreamEvent,
    transcript: &mut String,
    last_message: &mut Option<String>,
    build_errors: &mut usize,
) {
    match event {
        StreamEvent::ClaudeMessage { content } => {
            transcript.push_str(content);
            transcript.push('\n');
            *last_message = Some(content.clone());
        }
        StreamEvent::BuildError(_) => *build_errors += 1,
        _ => {}
    }
}

/// Terminal failure path: refund the usage, persist the failure, tell the
/// client in-band, close the stream.
async fn fail(state: &SharedState, job: &GenerationJob, events: &SseSender, message: String) {
    warn!(session = %job.session_id, error = %message, "Generation failed");
    match state.credits.refund(&job.usage_id).await {
        Ok(refunded) => debug!(usage = %job.usage_id, refunded, "Refund processed"),
        Err(e) => warn!(error = %e, "Failed to refund usage"),
    }
    finish_records(state, job, SessionStatus::Failed, None, None).await;
    events.send(&StreamEvent::error(message)).await;
    events.done().await;
}

async fn finish_records(
    state: &SharedState,
    job: &GenerationJob,
    status: SessionStatus,
    sandbox_id: Option<String>,
    preview_url: Option<String>,
) {
    let session = job.session_id.clone();
    let project_id = job.project_id;
    let result = state
        .db
        .call(move |db| {
            db.finish_session(&session, status)?;
            if let Some(id) = project_id {
                let project_status = match status {
                    SessionStatus::Completed => ProjectStatus::Ready,
                    _ => ProjectStatus::Failed,
                };
                db.update_project_result(
                    id,
                    sandbox_id.as_deref(),
                    preview_url.as_deref(),
                    project_status,
                )?;
            }
            Ok(())
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "Failed to persist generation result");
    }
}

/// First line of a blob, clamped, for names, summaries and usage details.
fn preview_of(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let mut out: String = line.chars().take(80).collect();
    if line.chars().count() > 80 {
        out.push('…');
    }
    out
}
