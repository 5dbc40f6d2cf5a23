// ABOUTME: Host configuration parsed from corral.toml with environment variable overrides.
// ABOUTME: Covers container limits, backend selection per group, data paths, and the health server.

use crate::paths;
use anyhow::{Context, Result};
use corral_agent::{BackendKind, BACKEND_ENV_VAR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV_VAR: &str = "CORRAL_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Per-group overrides keyed by group folder name
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container runtime binary
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// Absolute ceiling without output, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Quiet period after the last output record before the session is closed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// How long a closing container may take to exit on its own
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Longest single stdout line decoded, and stderr kept for the run log
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "corral-agent:latest".to_string()
}

fn default_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_close_grace_ms() -> u64 {
    30 * 1000
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            timeout_ms: default_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl ContainerConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Global backend: "claude" or "opencode"
    #[serde(rename = "type", default = "default_backend_type")]
    pub backend_type: BackendKind,
}

fn default_backend_type() -> BackendKind {
    BackendKind::Claude
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: default_backend_type(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Backend override for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    /// The main group may see other groups' state
    #[serde(default)]
    pub is_main: bool,
    /// Extra host directories made visible inside the container
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountConfig {
    pub host_path: String,
    pub container_path: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Defaults to `<data_dir>/groups`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups_dir: Option<String>,
}

fn default_data_dir() -> String {
    paths::data_dir().to_string_lossy().to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            groups_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// Required in `X-API-Key` for the prompt intake route when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_health_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_port() -> u16 {
    8787
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: default_health_host(),
            port: default_health_port(),
            api_key: None,
        }
    }
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    let rest = match path {
        "~" => "",
        p => match p.strip_prefix("~/") {
            Some(stripped) => stripped,
            None => return path.to_string(),
        },
    };

    match directories::BaseDirs::new() {
        Some(base_dirs) => base_dirs.home_dir().join(rest).to_string_lossy().to_string(),
        None => {
            tracing::warn!(path = %path, "Failed to expand tilde: could not determine home directory");
            path.to_string()
        }
    }
}

/// Reject group folder names that could escape the groups directory
pub fn validate_group_folder(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Group folder name must not be empty");
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) || name.contains("..") {
        anyhow::bail!("Invalid group folder name '{}'", name);
    }
    if name.chars().any(|c| c.is_control()) {
        anyhow::bail!("Group folder name contains control characters");
    }
    Ok(())
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. CORRAL_CONFIG_PATH env var (if set)
    /// 2. ./corral.toml (current directory - for development)
    /// 3. ~/.config/corral/corral.toml (XDG config dir)
    fn find_config_file<F>(lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env_path) = lookup(CONFIG_PATH_ENV_VAR) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "{} points at a missing file", CONFIG_PATH_ENV_VAR);
        }

        paths::config_candidates().into_iter().find(|p| p.exists())
    }

    /// Load configuration from corral.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup (used by tests)
    pub fn load_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = match Self::find_config_file(&lookup) {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                Self::from_file(&config_path)?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };

        config.finish(lookup)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment overrides, expand paths, and validate
    pub fn finish<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("CORRAL_CONTAINER_TIMEOUT_MS") {
            self.container.timeout_ms = val.parse().with_context(|| {
                format!("CORRAL_CONTAINER_TIMEOUT_MS must be a number of milliseconds, got: {}", val)
            })?;
        }
        if let Some(val) = lookup("CORRAL_IDLE_TIMEOUT_MS") {
            self.container.idle_timeout_ms = val.parse().with_context(|| {
                format!("CORRAL_IDLE_TIMEOUT_MS must be a number of milliseconds, got: {}", val)
            })?;
        }
        if let Some(val) = lookup("CORRAL_MAX_CONCURRENT") {
            self.container.max_concurrent = val.parse().with_context(|| {
                format!("CORRAL_MAX_CONCURRENT must be a positive number, got: {}", val)
            })?;
        }
        if let Some(val) = lookup("CORRAL_CONTAINER_IMAGE") {
            self.container.image = val;
        }
        if let Some(val) = lookup(BACKEND_ENV_VAR) {
            // An unknown backend name is fatal, never a silent fallback
            self.backend.backend_type = val.parse()?;
        }
        if let Some(val) = lookup("CORRAL_HEALTH_PORT") {
            self.health.port = val.parse().with_context(|| {
                format!("CORRAL_HEALTH_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Some(val) = lookup("CORRAL_DATA_DIR") {
            self.paths.data_dir = val;
        }

        self.paths.data_dir = expand_tilde(&self.paths.data_dir);
        self.paths.groups_dir = self.paths.groups_dir.as_deref().map(expand_tilde);

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.container.runtime.trim().is_empty() {
            anyhow::bail!("container.runtime must not be empty");
        }
        if self.container.image.trim().is_empty() {
            anyhow::bail!("container.image must not be empty");
        }
        if self.container.timeout_ms == 0 || self.container.idle_timeout_ms == 0 {
            anyhow::bail!("container timeouts must be greater than zero");
        }
        if self.container.max_concurrent == 0 {
            anyhow::bail!("container.max_concurrent must be at least 1");
        }
        for (folder, group) in &self.groups {
            validate_group_folder(folder)
                .with_context(|| format!("Invalid [groups.{}] section", folder))?;
            for mount in &group.mounts {
                if !mount.container_path.starts_with('/') {
                    anyhow::bail!(
                        "groups.{}: container_path '{}' must be absolute",
                        folder,
                        mount.container_path
                    );
                }
            }
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.data_dir)
    }

    pub fn groups_dir(&self) -> PathBuf {
        match &self.paths.groups_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.data_dir().join("groups"),
        }
    }

    /// Host directory holding a group's mailbox (mounted at /workspace/ipc)
    pub fn ipc_dir(&self, group: &str) -> PathBuf {
        self.data_dir().join("ipc").join(group)
    }

    pub fn group(&self, folder: &str) -> Option<&GroupConfig> {
        self.groups.get(folder)
    }

    /// Backend in effect for a group: its override, else the global selection
    pub fn backend_for(&self, folder: &str) -> BackendKind {
        self.group(folder)
            .and_then(|g| g.backend)
            .unwrap_or(self.backend.backend_type)
    }

    pub fn is_main_group(&self, folder: &str) -> bool {
        self.group(folder).map(|g| g.is_main).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = Config::default().finish(no_env).unwrap();
        assert_eq!(config.container.runtime, "docker");
        assert_eq!(config.container.hard_timeout(), Duration::from_secs(1800));
        assert_eq!(config.container.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.container.close_grace(), Duration::from_secs(30));
        assert_eq!(config.container.max_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.container.max_concurrent, 5);
        assert_eq!(config.backend.backend_type, BackendKind::Claude);
        assert_eq!(config.health.port, 8787);
    }

    #[test]
    fn test_group_backend_override() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            type = "claude"

            [groups.research]
            backend = "opencode"

            [groups.family]
            is_main = true
            "#,
        )
        .unwrap();

        assert_eq!(config.backend_for("research"), BackendKind::OpenCode);
        assert_eq!(config.backend_for("family"), BackendKind::Claude);
        assert_eq!(config.backend_for("unknown"), BackendKind::Claude);
        assert!(config.is_main_group("family"));
        assert!(!config.is_main_group("research"));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .finish(|key| match key {
                "CORRAL_CONTAINER_TIMEOUT_MS" => Some("5000".to_string()),
                "CORRAL_MAX_CONCURRENT" => Some("2".to_string()),
                "AGENT_BACKEND" => Some("opencode".to_string()),
                "CORRAL_DATA_DIR" => Some("/srv/corral".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.container.timeout_ms, 5000);
        assert_eq!(config.container.max_concurrent, 2);
        assert_eq!(config.backend.backend_type, BackendKind::OpenCode);
        assert_eq!(config.groups_dir(), PathBuf::from("/srv/corral/groups"));
        assert_eq!(config.ipc_dir("main"), PathBuf::from("/srv/corral/ipc/main"));
    }

    #[test]
    fn test_invalid_backend_env_is_fatal() {
        let err = Config::default()
            .finish(|key| (key == "AGENT_BACKEND").then(|| "gemini".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("gemini"));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let result = Config::default()
            .finish(|key| (key == "CORRAL_IDLE_TIMEOUT_MS").then(|| "soon".to_string()));
        assert!(result.is_err());

        let result =
            Config::default().finish(|key| (key == "CORRAL_MAX_CONCURRENT").then(|| "0".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_group_folder_validation() {
        assert!(validate_group_folder("family-chat").is_ok());
        assert!(validate_group_folder("").is_err());
        assert!(validate_group_folder("../etc").is_err());
        assert!(validate_group_folder("a/b").is_err());
    }

    #[test]
    fn test_bad_group_section_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [groups."x..y"]
            "#,
        )
        .unwrap();
        assert!(config.finish(no_env).is_err());
    }

    #[test]
    fn test_relative_mount_target_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[groups.main.mounts]]
            host_path = "/srv/notes"
            container_path = "notes"
            "#,
        )
        .unwrap();
        assert!(config.finish(no_env).is_err());
    }

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/var/lib/corral"), "/var/lib/corral");
        assert!(!expand_tilde("~/corral").starts_with('~'));
    }
}
