use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration for the prefab server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    /// Base URL of the sandbox provider API.
    pub provider_url: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            db_path: PathBuf::from(".prefab/prefab.db"),
            dev_mode: false,
            provider_url: "http://localhost:49982".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

/// How the code-generation agent process is invoked.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Port the generated app's dev server listens on inside the sandbox.
    pub preview_port: u16,
    /// Package manager used for `AddDependency` operations.
    pub package_manager: String,
    /// Working directory of the generated app inside the sandbox.
    pub app_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            preview_port: 5173,
            package_manager: "npm".to_string(),
            app_dir: "/app".to_string(),
        }
    }
}

/// Raw TOML structure for `.prefab/config.toml`
#[derive(Debug, Deserialize)]
struct ConfigToml {
    server: Option<ServerSection>,
    engine: Option<EngineSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    db_path: Option<PathBuf>,
    provider_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EngineSection {
    command: Option<String>,
    args: Option<Vec<String>>,
    preview_port: Option<u16>,
    package_manager: Option<String>,
    app_dir: Option<String>,
}

impl ServerConfig {
    /// Load config from `.prefab/config.toml` under the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let config_path = base_dir.join(".prefab").join("config.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let toml: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.server {
            if let Some(port) = section.port {
                config.port = port;
            }
            if let Some(db_path) = section.db_path {
                config.db_path = db_path;
            }
            if let Some(provider_url) = section.provider_url {
                config.provider_url = provider_url;
            }
        }
        if let Some(section) = toml.engine {
            if let Some(command) = section.command {
                config.engine.command = command;
            }
            if let Some(args) = section.args {
                config.engine.args = args;
            }
            if let Some(preview_port) = section.preview_port {
                config.engine.preview_port = preview_port;
            }
            if let Some(package_manager) = section.package_manager {
                config.engine.package_manager = package_manager;
            }
            if let Some(app_dir) = section.app_dir {
                config.engine.app_dir = app_dir;
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3030);
        assert_eq!(config.db_path, PathBuf::from(".prefab/prefab.db"));
        assert!(!config.dev_mode);
        assert_eq!(config.engine.command, "claude");
        assert_eq!(config.engine.preview_port, 5173);
        assert_eq!(config.engine.package_manager, "npm");
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.port, 3030);
    }

    #[test]
    fn test_config_load_full() {
        let dir = tempfile::tempdir().unwrap();
        let prefab_dir = dir.path().join(".prefab");
        fs::create_dir_all(&prefab_dir).unwrap();
        fs::write(
            prefab_dir.join("config.toml"),
            r#"
[server]
port = 8080
provider_url = "https://sandbox.example.com"

[engine]
command = "opencode"
args = ["run", "--json"]
preview_port = 3000
package_manager = "pnpm"
app_dir = "/workspace/app"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.provider_url, "https://sandbox.example.com");
        assert_eq!(config.engine.command, "opencode");
        assert_eq!(config.engine.args, vec!["run", "--json"]);
        assert_eq!(config.engine.preview_port, 3000);
        assert_eq!(config.engine.package_manager, "pnpm");
        assert_eq!(config.engine.app_dir, "/workspace/app");
    }

    #[test]
    fn test_config_load_partial_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefab_dir = dir.path().join(".prefab");
        fs::create_dir_all(&prefab_dir).unwrap();
        fs::write(prefab_dir.join("config.toml"), "[server]\nport = 9000\n").unwrap();

        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.engine.command, "claude");
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let prefab_dir = dir.path().join(".prefab");
        fs::create_dir_all(&prefab_dir).unwrap();
        fs::write(prefab_dir.join("config.toml"), "not valid toml {{{{").unwrap();

        assert!(ServerConfig::load(dir.path()).is_err());
    }
}
