//! Application configuration for kbforge.
//!
//! User config lives at `~/.kbforge/kbforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{KbForgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kbforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kbforge";

// ---------------------------------------------------------------------------
// Config structs (matching kbforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Heading classification service.
    #[serde(default = "default_llm_service")]
    pub llm: ServiceConfig,

    /// Image description service.
    #[serde(default = "default_vision_service")]
    pub vision: ServiceConfig,

    /// Heading reconciliation settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            llm: default_llm_service(),
            vision: default_vision_service(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default knowledge base output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Title prefix template (`%parent`, `%parent_N`, `%file`).
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,

    /// Maximum number of files processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Optional file of regex patterns for paths to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_ignore: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            title_prefix: default_title_prefix(),
            concurrency: default_concurrency(),
            path_ignore: None,
        }
    }
}

fn default_output_dir() -> String {
    "./kb".into()
}
fn default_title_prefix() -> String {
    "%parent".into()
}
fn default_concurrency() -> u32 {
    4
}

/// `[llm]` / `[vision]` section: an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Whether the service may be called at all.
    #[serde(default)]
    pub enabled: bool,

    /// API base URL (the `/chat/completions` path is appended).
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    pub api_key_env: String,

    /// Model identifier sent with each request.
    pub model: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts after the first failure before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Ceiling on in-flight requests to this service.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
}

impl ServiceConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parse and validate `base_url`.
    pub fn parsed_base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            KbForgeError::config(format!("invalid base_url '{}': {e}", self.base_url))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(KbForgeError::config(format!(
                "unsupported base_url scheme '{other}' (expected http or https)"
            ))),
        }
    }

    /// Read the API key from the configured env var.
    pub fn api_key(&self) -> Result<String> {
        let var_name = &self.api_key_env;
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Err(KbForgeError::config(format!(
                "API key not found. Set the {var_name} environment variable."
            ))),
        }
    }
}

fn default_llm_service() -> ServiceConfig {
    ServiceConfig {
        enabled: false,
        base_url: "https://api.openai.com/v1".into(),
        api_key_env: "KBFORGE_LLM_API_KEY".into(),
        model: "gpt-4o-mini".into(),
        timeout_secs: default_timeout_secs(),
        max_retries: default_max_retries(),
        max_concurrent_requests: default_max_concurrent_requests(),
    }
}
fn default_vision_service() -> ServiceConfig {
    ServiceConfig {
        enabled: false,
        base_url: "https://api.openai.com/v1".into(),
        api_key_env: "KBFORGE_VISION_API_KEY".into(),
        model: "gpt-4o".into(),
        timeout_secs: default_timeout_secs(),
        max_retries: default_max_retries(),
        max_concurrent_requests: default_max_concurrent_requests(),
    }
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_concurrent_requests() -> u32 {
    2
}

/// Which classifier resolves unreliable heading levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Offline: reference outline match, then heading numbering.
    #[default]
    Outline,
    /// The `[llm]` service.
    Llm,
}

/// `[reconcile]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub classifier: ClassifierKind,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kbforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| KbForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kbforge/kbforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KbForgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| KbForgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KbForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| KbForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KbForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
