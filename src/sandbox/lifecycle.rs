//! Sandbox lifecycle policy: ensure a sandbox is running and reachable.
//!
//! Starting is cheap and idempotent; what takes time is the boot. Status is
//! polled on a fixed interval up to a fixed attempt count, and the preview
//! endpoint is acquired in its own bounded retry loop because endpoint
//! readiness lags process readiness.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};

use super::{SandboxProvider, SandboxState};
use crate::errors::GenerateError;

/// Upper bound on a single start/restart/wake call.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed interval between status polls while a sandbox boots.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum status polls before giving up on a boot.
pub const MAX_POLL_ATTEMPTS: u32 = 30;

/// Maximum preview-endpoint fetches once the sandbox reports running.
pub const MAX_ENDPOINT_ATTEMPTS: u32 = 5;

/// Pause between preview-endpoint fetches.
pub const ENDPOINT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A sandbox confirmed running, with its preview endpoint resolved.
#[derive(Debug, Clone)]
pub struct RunningSandbox {
    pub id: String,
    pub state: SandboxState,
    pub endpoint: String,
}

/// Ordered force-start strategies. None of them delete or recreate.
const STRATEGIES: &[Strategy] = &[Strategy::Start, Strategy::Restart, Strategy::Wake];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Strategy {
    Start,
    Restart,
    Wake,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Wake => "wake",
        }
    }
}

pub struct LifecycleManager {
    provider: Arc<dyn SandboxProvider>,
    preview_port: u16,
}

impl LifecycleManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, preview_port: u16) -> Self {
        Self {
            provider,
            preview_port,
        }
    }

    /// Ensure the sandbox is running and return its preview endpoint.
    ///
    /// Already-running sandboxes are refreshed without issuing a start
    /// command, so calling this twice in a row is side-effect free.
    pub async fn ensure_running(&self, sandbox_id: &str) -> Result<RunningSandbox, GenerateError> {
        let handle = self
            .provider
            .get(sandbox_id)
            .await
            .map_err(GenerateError::Other)?
            .ok_or_else(|| GenerateError::SandboxNotFound {
                id: sandbox_id.to_string(),
            })?;

        if handle.state == SandboxState::Running {
            let endpoint = self.acquire_endpoint(sandbox_id, 0, 0, "none").await?;
            return Ok(RunningSandbox {
                id: sandbox_id.to_string(),
                state: SandboxState::Running,
                endpoint,
            });
        }

        let started = Instant::now();
        self.issue(Strategy::Start, sandbox_id).await;
        self.poll_until_running(sandbox_id, started, "start").await
    }

    /// Try an ordered list of start strategies until one brings the sandbox
    /// up, then run the same polling loop. Never deletes or recreates.
    pub async fn force_start(&self, sandbox_id: &str) -> Result<RunningSandbox, GenerateError> {
        if self
            .provider
            .get(sandbox_id)
            .await
            .map_err(GenerateError::Other)?
            .is_none()
        {
            return Err(GenerateError::SandboxNotFound {
                id: sandbox_id.to_string(),
            });
        }

        let started = Instant::now();
        let mut attempted = Vec::new();
        let mut total_attempts = 0;

        for strategy in STRATEGIES {
            attempted.push(strategy.name());
            self.issue(*strategy, sandbox_id).await;

            match self
                .poll_until_running(sandbox_id, started, &attempted.join(", "))
                .await
            {
                Ok(running) => {
                    info!(
                        sandbox_id,
                        strategy = strategy.name(),
                        "Force-start succeeded"
                    );
                    return Ok(running);
                }
                Err(GenerateError::SandboxUnavailable { attempts, .. }) => {
                    total_attempts += attempts;
                    warn!(
                        sandbox_id,
                        strategy = strategy.name(),
                        "Start strategy exhausted its poll budget, trying next"
                    );
                }
                Err(other) => return Err(other),
            }
        }

        Err(GenerateError::SandboxUnavailable {
            id: sandbox_id.to_string(),
            attempts: total_attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            strategies: attempted.join(", "),
        })
    }

    /// Issue one start-family command, bounded by `START_TIMEOUT`. Command
    /// failure is not terminal: the polling loop is the arbiter.
    async fn issue(&self, strategy: Strategy, sandbox_id: &str) {
        let call = async {
            match strategy {
                Strategy::Start => self.provider.start(sandbox_id).await,
                Strategy::Restart => self.provider.restart(sandbox_id).await,
                Strategy::Wake => self.provider.wake(sandbox_id).await,
            }
        };
        match timeout(START_TIMEOUT, call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(sandbox_id, strategy = strategy.name(), error = %e, "Start command failed")
            }
            Err(_) => {
                warn!(sandbox_id, strategy = strategy.name(), "Start command timed out")
            }
        }
    }

    async fn poll_until_running(
        &self,
        sandbox_id: &str,
        started: Instant,
        strategies: &str,
    ) -> Result<RunningSandbox, GenerateError> {
        for attempt in 1..=MAX_POLL_ATTEMPTS {
            let handle = self
                .provider
                .get(sandbox_id)
                .await
                .map_err(GenerateError::Other)?
                .ok_or_else(|| GenerateError::SandboxNotFound {
                    id: sandbox_id.to_string(),
                })?;

            if handle.state == SandboxState::Running {
                info!(sandbox_id, attempt, "Sandbox is running");
                let endpoint = self
                    .acquire_endpoint(
                        sandbox_id,
                        attempt,
                        started.elapsed().as_millis() as u64,
                        strategies,
                    )
                    .await?;
                return Ok(RunningSandbox {
                    id: sandbox_id.to_string(),
                    state: SandboxState::Running,
                    endpoint,
                });
            }

            sleep(POLL_INTERVAL).await;
        }

        Err(GenerateError::SandboxUnavailable {
            id: sandbox_id.to_string(),
            attempts: MAX_POLL_ATTEMPTS,
            elapsed_ms: started.elapsed().as_millis() as u64,
            strategies: strategies.to_string(),
        })
    }

    /// Endpoint acquisition is retried on its own small budget: the dev
    /// server inside the sandbox comes up after the sandbox process does.
    async fn acquire_endpoint(
        &self,
        sandbox_id: &str,
        prior_attempts: u32,
        elapsed_ms: u64,
        strategies: &str,
    ) -> Result<String, GenerateError> {
        for attempt in 1..=MAX_ENDPOINT_ATTEMPTS {
            if let Some(url) = self
                .provider
                .get_preview_link(sandbox_id, self.preview_port)
                .await
                .map_err(GenerateError::Other)?
            {
                return Ok(url);
            }
            if attempt < MAX_ENDPOINT_ATTEMPTS {
                sleep(ENDPOINT_RETRY_DELAY).await;
            }
        }
        Err(GenerateError::SandboxUnavailable {
            id: sandbox_id.to_string(),
            attempts: prior_attempts + MAX_ENDPOINT_ATTEMPTS,
            elapsed_ms,
            strategies: format!("{} + endpoint", strategies),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MockSandboxProvider;
    use std::sync::atomic::Ordering;

    fn manager(provider: Arc<MockSandboxProvider>) -> LifecycleManager {
        LifecycleManager::new(provider, 5173)
    }

    #[tokio::test(start_paused = true)]
    async fn running_sandbox_is_returned_without_start() {
        let provider = MockSandboxProvider::new();
        provider.insert_running("sbx-1");
        let mgr = manager(provider.clone());

        let running = mgr.ensure_running("sbx-1").await.unwrap();
        assert_eq!(running.state, SandboxState::Running);
        assert!(running.endpoint.contains("sbx-1"));
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_running_is_idempotent() {
        let provider = MockSandboxProvider::new();
        provider.insert_running("sbx-1");
        let mgr = manager(provider.clone());

        let first = mgr.ensure_running("sbx-1").await.unwrap();
        let second = mgr.ensure_running("sbx-1").await.unwrap();
        assert_eq!(first.endpoint, second.endpoint);
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_sandbox_is_started_and_polled() {
        let provider = MockSandboxProvider::new();
        provider.insert_stopped("sbx-1", 3);
        let mgr = manager(provider.clone());

        let running = mgr.ensure_running("sbx-1").await.unwrap();
        assert_eq!(running.state, SandboxState::Running);
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_sandbox_is_not_found() {
        let provider = MockSandboxProvider::new();
        let mgr = manager(provider);
        let err = mgr.ensure_running("ghost").await.unwrap_err();
        assert!(matches!(err, GenerateError::SandboxNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_sandbox_exhausts_budget_without_panicking() {
        let provider = MockSandboxProvider::new();
        provider.insert_stuck("sbx-1");
        let mgr = manager(provider);

        let err = mgr.ensure_running("sbx-1").await.unwrap_err();
        match err {
            GenerateError::SandboxUnavailable { attempts, strategies, .. } => {
                assert_eq!(attempts, MAX_POLL_ATTEMPTS);
                assert_eq!(strategies, "start");
            }
            other => panic!("Expected SandboxUnavailable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_lag_is_retried() {
        let provider = MockSandboxProvider::new();
        provider.insert_running("sbx-1");
        provider.set_endpoint_lag("sbx-1", 3);
        let mgr = manager(provider);

        let running = mgr.ensure_running("sbx-1").await.unwrap();
        assert!(running.endpoint.contains("preview.example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_budget_exhaustion_is_unavailable() {
        let provider = MockSandboxProvider::new();
        provider.insert_running("sbx-1");
        provider.set_endpoint_lag("sbx-1", MAX_ENDPOINT_ATTEMPTS + 1);
        let mgr = manager(provider);

        let err = mgr.ensure_running("sbx-1").await.unwrap_err();
        assert!(matches!(err, GenerateError::SandboxUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn force_start_falls_through_to_wake() {
        let provider = MockSandboxProvider::new();
        provider.insert_asleep("sbx-1");
        let mgr = manager(provider.clone());

        let running = mgr.force_start("sbx-1").await.unwrap();
        assert_eq!(running.state, SandboxState::Running);
        assert_eq!(provider.wake_calls.load(Ordering::SeqCst), 1);
        // Earlier strategies were attempted first
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.restart_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_start_reports_all_attempted_strategies() {
        let provider = MockSandboxProvider::new();
        provider.insert_stuck("sbx-1");
        let mgr = manager(provider.clone());

        let err = mgr.force_start("sbx-1").await.unwrap_err();
        match err {
            GenerateError::SandboxUnavailable { strategies, attempts, .. } => {
                assert_eq!(strategies, "start, restart, wake");
                assert_eq!(attempts, MAX_POLL_ATTEMPTS * 3);
            }
            other => panic!("Expected SandboxUnavailable, got {:?}", other),
        }
        // The sandbox was never deleted
        assert!(provider.get("sbx-1").await.unwrap().is_some());
    }
}
