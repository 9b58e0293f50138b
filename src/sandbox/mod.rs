//! Remote compute sandbox: identity, provider contract, lifecycle policy.

pub mod lifecycle;
pub mod provider;

pub use lifecycle::{LifecycleManager, RunningSandbox};
pub use provider::{MockSandboxProvider, SandboxProvider};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Creating,
    Running,
    Stopped,
    Error,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid sandbox state: {}", s)),
        }
    }
}

/// Identity of a remote sandbox. Outlives a single generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub state: SandboxState,
    /// Null until the preview endpoint is ready; readiness lags the process.
    pub preview_url: Option<String>,
}

/// Result of a command executed inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips() {
        for state in [
            SandboxState::Creating,
            SandboxState::Running,
            SandboxState::Stopped,
            SandboxState::Error,
        ] {
            assert_eq!(SandboxState::from_str(state.as_str()).unwrap(), state);
        }
    }

    #[test]
    fn exec_result_success_follows_exit_code() {
        let ok = ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        };
        let bad = ExecResult {
            stdout: String::new(),
            stderr: "boom".into(),
            exit_code: 1,
        };
        assert!(ok.success());
        assert!(!bad.success());
    }
}
