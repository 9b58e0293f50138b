//! Abstraction over the sandbox provider for testability.
//! Real implementation: `HttpSandboxProvider`. Test double: `MockSandboxProvider`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashMap;
use serde::Deserialize;

use super::{ExecResult, SandboxHandle, SandboxState};

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self) -> Result<SandboxHandle>;

    async fn get(&self, id: &str) -> Result<Option<SandboxHandle>>;

    async fn list(&self) -> Result<Vec<SandboxHandle>>;

    /// Issue a start command. Must be an idempotent no-op on a running sandbox.
    async fn start(&self, id: &str) -> Result<()>;

    async fn restart(&self, id: &str) -> Result<()>;

    async fn wake(&self, id: &str) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn execute_command(
        &self,
        id: &str,
        cmd: &str,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ExecResult>;

    async fn get_preview_link(&self, id: &str, port: u16) -> Result<Option<String>>;

    // Filesystem helpers. The HTTP implementation routes these through
    // `execute_command` (each one is a remote round trip); the mock keeps an
    // in-memory tree so file-operation tests don't need a shell.

    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<()>;

    async fn read_file(&self, id: &str, path: &str) -> Result<Option<String>>;

    async fn delete_file(&self, id: &str, path: &str) -> Result<bool>;

    async fn rename_file(&self, id: &str, from: &str, to: &str) -> Result<()>;
}

// ── HTTP implementation ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SandboxDto {
    id: String,
    state: String,
    #[serde(default)]
    preview_url: Option<String>,
}

impl SandboxDto {
    fn into_handle(self) -> SandboxHandle {
        SandboxHandle {
            state: self.state.parse().unwrap_or(SandboxState::Error),
            id: self.id,
            preview_url: self.preview_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecDto {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

/// Sandbox provider reached over its HTTP management API.
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_action(&self, id: &str, action: &str) -> Result<()> {
        self.client
            .post(self.url(&format!("/sandboxes/{}/{}", id, action)))
            .send()
            .await
            .with_context(|| format!("Failed to {} sandbox {}", action, id))?
            .error_for_status()
            .with_context(|| format!("Sandbox {} rejected {}", id, action))?;
        Ok(())
    }

    /// Single-quote a string for POSIX sh.
    fn shell_quote(s: &str) -> String {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self) -> Result<SandboxHandle> {
        let dto: SandboxDto = self
            .client
            .post(self.url("/sandboxes"))
            .send()
            .await
            .context("Failed to create sandbox")?
            .error_for_status()
            .context("Sandbox creation rejected")?
            .json()
            .await
            .context("Invalid sandbox creation response")?;
        Ok(dto.into_handle())
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxHandle>> {
        let resp = self
            .client
            .get(self.url(&format!("/sandboxes/{}", id)))
            .send()
            .await
            .with_context(|| format!("Failed to fetch sandbox {}", id))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let dto: SandboxDto = resp
            .error_for_status()
            .with_context(|| format!("Sandbox {} lookup rejected", id))?
            .json()
            .await
            .context("Invalid sandbox response")?;
        Ok(Some(dto.into_handle()))
    }

    async fn list(&self) -> Result<Vec<SandboxHandle>> {
        let dtos: Vec<SandboxDto> = self
            .client
            .get(self.url("/sandboxes"))
            .send()
            .await
            .context("Failed to list sandboxes")?
            .error_for_status()
            .context("Sandbox list rejected")?
            .json()
            .await
            .context("Invalid sandbox list response")?;
        Ok(dtos.into_iter().map(SandboxDto::into_handle).collect())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.post_action(id, "start").await
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.post_action(id, "restart").await
    }

    async fn wake(&self, id: &str) -> Result<()> {
        self.post_action(id, "wake").await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(self.url(&format!("/sandboxes/{}", id)))
            .send()
            .await
            .with_context(|| format!("Failed to delete sandbox {}", id))?
            .error_for_status()
            .with_context(|| format!("Sandbox {} deletion rejected", id))?;
        Ok(())
    }

    async fn execute_command(
        &self,
        id: &str,
        cmd: &str,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ExecResult> {
        let dto: ExecDto = self
            .client
            .post(self.url(&format!("/sandboxes/{}/exec", id)))
            .json(&serde_json::json!({ "cmd": cmd, "cwd": cwd, "env": env }))
            .send()
            .await
            .with_context(|| format!("Failed to execute command in sandbox {}", id))?
            .error_for_status()
            .with_context(|| format!("Sandbox {} rejected command", id))?
            .json()
            .await
            .context("Invalid exec response")?;
        Ok(ExecResult {
            stdout: dto.stdout,
            stderr: dto.stderr,
            exit_code: dto.exit_code,
        })
    }

    async fn get_preview_link(&self, id: &str, port: u16) -> Result<Option<String>> {
        let resp = self
            .client
            .get(self.url(&format!("/sandboxes/{}/preview/{}", id, port)))
            .send()
            .await
            .with_context(|| format!("Failed to fetch preview link for {}", id))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: serde_json::Value = resp
            .error_for_status()
            .context("Preview link rejected")?
            .json()
            .await
            .context("Invalid preview link response")?;
        Ok(body.get("url").and_then(|u| u.as_str()).map(String::from))
    }

    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<()> {
        // Base64 round trip avoids shell-quoting the file body.
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let parent = std::path::Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty());
        let cmd = match parent {
            Some(parent) => format!(
                "mkdir -p {} && printf '%s' {} | base64 -d > {}",
                Self::shell_quote(&parent),
                Self::shell_quote(&encoded),
                Self::shell_quote(path)
            ),
            None => format!(
                "printf '%s' {} | base64 -d > {}",
                Self::shell_quote(&encoded),
                Self::shell_quote(path)
            ),
        };
        let result = self.execute_command(id, &cmd, None, None).await?;
        if !result.success() {
            anyhow::bail!("write {} failed: {}", path, result.stderr.trim());
        }
        Ok(())
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Option<String>> {
        let cmd = format!("cat {} 2>/dev/null", Self::shell_quote(path));
        let result = self.execute_command(id, &cmd, None, None).await?;
        if result.success() {
            Ok(Some(result.stdout))
        } else {
            Ok(None)
        }
    }

    async fn delete_file(&self, id: &str, path: &str) -> Result<bool> {
        let probe = self
            .execute_command(id, &format!("test -e {}", Self::shell_quote(path)), None, None)
            .await?;
        if !probe.success() {
            return Ok(false);
        }
        let result = self
            .execute_command(id, &format!("rm -f {}", Self::shell_quote(path)), None, None)
            .await?;
        if !result.success() {
            anyhow::bail!("delete {} failed: {}", path, result.stderr.trim());
        }
        Ok(true)
    }

    async fn rename_file(&self, id: &str, from: &str, to: &str) -> Result<()> {
        let cmd = format!(
            "mv {} {}",
            Self::shell_quote(from),
            Self::shell_quote(to)
        );
        let result = self.execute_command(id, &cmd, None, None).await?;
        if !result.success() {
            anyhow::bail!("rename {} -> {} failed: {}", from, to, result.stderr.trim());
        }
        Ok(())
    }
}

// ── Test double ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MockSandbox {
    state: SandboxState,
    files: HashMap<String, String>,
    /// Number of status polls remaining before a started sandbox reports
    /// `running`. Models the boot lag.
    polls_until_running: u32,
    /// Number of preview-link fetches remaining before the endpoint is
    /// ready. Models endpoint readiness lagging process readiness.
    polls_until_endpoint: u32,
    /// When set, start/restart do nothing; only `wake` moves the sandbox.
    wake_only: bool,
    /// When set, the sandbox never leaves `stopped` no matter what.
    stuck: bool,
}

/// In-memory sandbox provider used by unit and integration tests.
pub struct MockSandboxProvider {
    sandboxes: DashMap<String, MockSandbox>,
    pub start_calls: AtomicU32,
    pub restart_calls: AtomicU32,
    pub wake_calls: AtomicU32,
    pub exec_log: std::sync::Mutex<Vec<String>>,
    next_id: AtomicU32,
}

impl MockSandboxProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sandboxes: DashMap::new(),
            start_calls: AtomicU32::new(0),
            restart_calls: AtomicU32::new(0),
            wake_calls: AtomicU32::new(0),
            exec_log: std::sync::Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn insert_running(&self, id: &str) {
        self.insert(id, SandboxState::Running, 0, 0, false, false);
    }

    pub fn insert_stopped(&self, id: &str, polls_until_running: u32) {
        self.insert(id, SandboxState::Stopped, polls_until_running, 0, false, false);
    }

    /// A sandbox that never starts (retry-budget exhaustion scenarios).
    pub fn insert_stuck(&self, id: &str) {
        self.insert(id, SandboxState::Stopped, 0, 0, false, true);
    }

    /// A sandbox that only responds to `wake` (force-start fallback path).
    pub fn insert_asleep(&self, id: &str) {
        self.insert(id, SandboxState::Stopped, 0, 0, true, false);
    }

    pub fn set_endpoint_lag(&self, id: &str, polls: u32) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(id) {
            sandbox.polls_until_endpoint = polls;
        }
    }

    pub fn file_content(&self, id: &str, path: &str) -> Option<String> {
        self.sandboxes
            .get(id)
            .and_then(|s| s.files.get(path).cloned())
    }

    fn insert(
        &self,
        id: &str,
        state: SandboxState,
        polls_until_running: u32,
        polls_until_endpoint: u32,
        wake_only: bool,
        stuck: bool,
    ) {
        self.sandboxes.insert(
            id.to_string(),
            MockSandbox {
                state,
                files: HashMap::new(),
                polls_until_running,
                polls_until_endpoint,
                wake_only,
                stuck,
            },
        );
    }

    fn begin_boot(&self, id: &str) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(id) {
            if sandbox.stuck {
                return;
            }
            if sandbox.state != SandboxState::Running {
                sandbox.state = SandboxState::Creating;
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn create(&self) -> Result<SandboxHandle> {
        let id = format!("sbx-mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.insert(&id, SandboxState::Running, 0, 0, false, false);
        Ok(SandboxHandle {
            id,
            state: SandboxState::Running,
            preview_url: None,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxHandle>> {
        let Some(mut sandbox) = self.sandboxes.get_mut(id) else {
            return Ok(None);
        };
        // Polling a booting sandbox advances the boot countdown.
        if sandbox.state == SandboxState::Creating {
            if sandbox.polls_until_running == 0 {
                sandbox.state = SandboxState::Running;
            } else {
                sandbox.polls_until_running -= 1;
            }
        }
        Ok(Some(SandboxHandle {
            id: id.to_string(),
            state: sandbox.state,
            preview_url: None,
        }))
    }

    async fn list(&self) -> Result<Vec<SandboxHandle>> {
        Ok(self
            .sandboxes
            .iter()
            .map(|entry| SandboxHandle {
                id: entry.key().clone(),
                state: entry.value().state,
                preview_url: None,
            })
            .collect())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let wake_only = self
            .sandboxes
            .get(id)
            .map(|s| s.wake_only)
            .unwrap_or(false);
        if !wake_only {
            self.begin_boot(id);
        }
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        let wake_only = self
            .sandboxes
            .get(id)
            .map(|s| s.wake_only)
            .unwrap_or(false);
        if !wake_only {
            self.begin_boot(id);
        }
        Ok(())
    }

    async fn wake(&self, id: &str) -> Result<()> {
        self.wake_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_boot(id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sandboxes.remove(id);
        Ok(())
    }

    async fn execute_command(
        &self,
        id: &str,
        cmd: &str,
        _cwd: Option<&str>,
        _env: Option<&HashMap<String, String>>,
    ) -> Result<ExecResult> {
        if !self.sandboxes.contains_key(id) {
            anyhow::bail!("sandbox {} not found", id);
        }
        self.exec_log.lock().unwrap().push(cmd.to_string());
        Ok(ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn get_preview_link(&self, id: &str, port: u16) -> Result<Option<String>> {
        let Some(mut sandbox) = self.sandboxes.get_mut(id) else {
            return Ok(None);
        };
        if sandbox.state != SandboxState::Running {
            return Ok(None);
        }
        if sandbox.polls_until_endpoint > 0 {
            sandbox.polls_until_endpoint -= 1;
            return Ok(None);
        }
        Ok(Some(format!("https://{}-{}.preview.example.com", id, port)))
    }

    async fn write_file(&self, id: &str, path: &str, content: &str) -> Result<()> {
        let mut sandbox = self
            .sandboxes
            .get_mut(id)
            .with_context(|| format!("sandbox {} not found", id))?;
        sandbox.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .sandboxes
            .get(id)
            .and_then(|s| s.files.get(path).cloned()))
    }

    async fn delete_file(&self, id: &str, path: &str) -> Result<bool> {
        let mut sandbox = self
            .sandboxes
            .get_mut(id)
            .with_context(|| format!("sandbox {} not found", id))?;
        Ok(sandbox.files.remove(path).is_some())
    }

    async fn rename_file(&self, id: &str, from: &str, to: &str) -> Result<()> {
        let mut sandbox = self
            .sandboxes
            .get_mut(id)
            .with_context(|| format!("sandbox {} not found", id))?;
        let content = sandbox
            .files
            .remove(from)
            .with_context(|| format!("rename source {} missing", from))?;
        sandbox.files.insert(to.to_string(), content);
        Ok(())
    }
}
