//! Generation agent process launcher.
//!
//! Spawns the code-generation CLI and exposes its combined stdout/stderr as
//! an ordered chunk stream plus a deferred exit status. The caller never
//! blocks on the process: `launch` returns as soon as the child is spawned.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::GenerateError;

/// Environment variables forwarded into the agent process. API keys the
/// engine needs, plus the minimum for a shell to function. Nothing else
/// from the server's environment leaks through, and key values are never
/// logged.
pub const ENV_ALLOWLIST: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GROQ_API_KEY",
    "PATH",
    "HOME",
];

const CHUNK_BUF_SIZE: usize = 4096;
const CHANNEL_CAPACITY: usize = 64;

/// A spawned agent process: its live output and its eventual exit status.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// Raw output chunks, stdout and stderr interleaved in arrival order.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Resolves once the process exits. `Err` means the wait itself failed.
    pub exit: JoinHandle<std::io::Result<ExitStatus>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl LaunchedProcess {
    /// Request termination of the agent process. Output already delivered
    /// stays delivered; the exit future still resolves.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Filter an environment down to the allowlist.
pub fn allowed_env(source: &HashMap<String, String>) -> HashMap<String, String> {
    source
        .iter()
        .filter(|(key, _)| ENV_ALLOWLIST.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Clone)]
pub struct EngineLauncher {
    config: EngineConfig,
}

impl EngineLauncher {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Spawn the agent with the given prompt. Returns immediately; chunks
    /// arrive on the output channel as the process produces them.
    pub fn launch(
        &self,
        prompt: &str,
        extra_env: &HashMap<String, String>,
    ) -> Result<LaunchedProcess, GenerateError> {
        let process_env: HashMap<String, String> = std::env::vars().collect();
        let mut env = allowed_env(&process_env);
        env.extend(extra_env.clone());

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg("-p")
            .arg(prompt)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GenerateError::GenerationEngineError(format!(
                "failed to spawn {}: {}",
                self.config.command, e
            ))
        })?;
        debug!(command = %self.config.command, "Spawned generation engine");

        let (tx, rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = stdout.map(|pipe| spawn_pump(pipe, tx.clone()));
        let stderr_task = stderr.map(|pipe| spawn_pump(pipe, tx.clone()));
        // Drop the original sender so the channel closes once both pumps end.
        drop(tx);

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exit = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "Failed to kill generation engine");
                    }
                    child.wait().await
                }
            };
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            status
        });

        Ok(LaunchedProcess {
            output: rx,
            exit,
            kill_tx: Some(kill_tx),
        })
    }
}

fn spawn_pump<R>(mut pipe: R, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; CHUNK_BUF_SIZE];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        // Consumer hung up; keep draining so the child
                        // doesn't block on a full pipe.
                        continue;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Engine output read failed");
                    break;
                }
            }
        }
    })
}
