use crate::error::{MentoraError, Result};
use crate::model::ProgressSnapshot;
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentoraConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub coaching: CoachingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Custom path for SQLite database. Defaults to `~/.config/mentora/mentora.db`.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            env_var: None,
            max_tokens: default_llm_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_host")]
    pub host: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            host: default_web_host(),
        }
    }
}

/// Daily allowance for one subscription tier. A tier without `daily_limit`
/// is unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// `utc` or `fixed_offset`.
    #[serde(default = "default_day_boundary")]
    pub day_boundary: String,
    /// Only read when `day_boundary = "fixed_offset"`.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Tier assumed for users without an assignment, and the limit applied
    /// when the subscription lookup itself fails.
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierConfig>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            day_boundary: default_day_boundary(),
            utc_offset_minutes: 0,
            default_tier: default_tier_name(),
            tiers: default_tiers(),
        }
    }
}

impl QuotaConfig {
    /// Daily limit for a tier name, falling back to the default tier.
    pub fn limit_for_tier(&self, tier: &str) -> Option<u32> {
        self.tiers
            .get(tier)
            .or_else(|| self.tiers.get(&self.default_tier))
            .and_then(|t| t.daily_limit)
    }

    pub fn default_limit(&self) -> Option<u32> {
        self.limit_for_tier(&self.default_tier)
    }
}

/// A learner known to the static directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryUser {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub progress: ProgressSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// `static` (tiers and progress from this file) or `http`.
    #[serde(default = "default_directory_mode")]
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_directory_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts for transient lookup failures (HTTP mode).
    #[serde(default = "default_directory_retries")]
    pub retries: u32,
    #[serde(default)]
    pub users: BTreeMap<String, DirectoryUser>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            mode: default_directory_mode(),
            base_url: None,
            api_key: None,
            timeout_secs: default_directory_timeout_secs(),
            retries: default_directory_retries(),
            users: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachingConfig {
    /// Upper bound on every remote generation call.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Turns returned by `load_session`.
    #[serde(default = "default_history_max_turns")]
    pub history_max_turns: usize,
    /// Turns passed to the generator as conversational context.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
}

impl Default for CoachingConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: default_generation_timeout_secs(),
            history_max_turns: default_history_max_turns(),
            context_turns: default_context_turns(),
        }
    }
}

/// Valid storage backend names.
pub const VALID_STORAGE_BACKENDS: &[&str] = &["sqlite", "memory"];

/// Valid LLM provider names.
pub const VALID_LLM_PROVIDERS: &[&str] = &["ollama", "openai", "gemini", "anthropic", "claude"];

/// Valid directory modes.
pub const VALID_DIRECTORY_MODES: &[&str] = &["static", "http"];

/// Valid day-boundary policies.
pub const VALID_DAY_BOUNDARIES: &[&str] = &["utc", "fixed_offset"];

// -- Defaults --

fn default_storage_backend() -> String {
    "sqlite".to_string()
}
fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "llama3.2".to_string()
}
fn default_llm_max_tokens() -> usize {
    512
}
fn default_web_port() -> u16 {
    37740
}
fn default_web_host() -> String {
    "127.0.0.1".to_string()
}
fn default_day_boundary() -> String {
    "utc".to_string()
}
fn default_tier_name() -> String {
    "free".to_string()
}
fn default_tiers() -> BTreeMap<String, TierConfig> {
    BTreeMap::from([
        (
            "free".to_string(),
            TierConfig {
                daily_limit: Some(5),
            },
        ),
        (
            "plus".to_string(),
            TierConfig {
                daily_limit: Some(50),
            },
        ),
        ("pro".to_string(), TierConfig { daily_limit: None }),
    ])
}
fn default_directory_mode() -> String {
    "static".to_string()
}
fn default_directory_timeout_secs() -> u64 {
    5
}
fn default_directory_retries() -> u32 {
    2
}
fn default_generation_timeout_secs() -> u64 {
    8
}
fn default_history_max_turns() -> usize {
    50
}
fn default_context_turns() -> usize {
    12
}

impl MentoraConfig {
    /// Load configuration with three-layer TOML merge:
    /// 1. ~/.config/mentora/config.toml (global)
    /// 2. .mentora/config.toml (project)
    /// 3. .mentora/config.local.toml (local, gitignored)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                builder = builder.add_source(File::from(global_path).required(false));
            }
        }

        if let Some(dir) = project_dir {
            let project_config = dir.join(".mentora").join("config.toml");
            if project_config.exists() {
                builder = builder.add_source(File::from(project_config).required(false));
            }

            let local_config = dir.join(".mentora").join("config.local.toml");
            if local_config.exists() {
                builder = builder.add_source(File::from(local_config).required(false));
            }
        }

        let config = builder
            .build()
            .map_err(|e| MentoraError::Config(e.to_string()))?;

        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| MentoraError::Config(e.to_string()))?;

        cfg.validate();
        Ok(cfg)
    }

    /// Load with defaults only (no files).
    pub fn default_config() -> Self {
        Self {
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
            web: WebConfig::default(),
            quota: QuotaConfig::default(),
            directory: DirectoryConfig::default(),
            coaching: CoachingConfig::default(),
        }
    }

    /// Render as TOML, for `mentora init`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MentoraError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate config values, clamping out-of-range values and logging warnings.
    /// Lenient: fixes values rather than rejecting the config.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !VALID_STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            warnings.push(format!(
                "unknown storage backend '{}', valid: {}",
                self.storage.backend,
                VALID_STORAGE_BACKENDS.join(", ")
            ));
        }

        if self.llm.enabled && !VALID_LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            warnings.push(format!(
                "unknown LLM provider '{}', valid: {}",
                self.llm.provider,
                VALID_LLM_PROVIDERS.join(", ")
            ));
        }
        if self.llm.max_tokens == 0 {
            warnings.push("llm.max_tokens = 0, setting to 256".to_string());
            self.llm.max_tokens = 256;
        }

        if !VALID_DIRECTORY_MODES.contains(&self.directory.mode.as_str()) {
            warnings.push(format!(
                "unknown directory mode '{}', valid: {}",
                self.directory.mode,
                VALID_DIRECTORY_MODES.join(", ")
            ));
        }
        if self.directory.mode == "http" && self.directory.base_url.is_none() {
            warnings.push("directory.mode = http but directory.base_url is unset".to_string());
        }
        if self.directory.timeout_secs == 0 {
            warnings.push("directory.timeout_secs = 0, setting to 1".to_string());
            self.directory.timeout_secs = 1;
        }
        if self.directory.retries > 5 {
            warnings.push(format!(
                "directory.retries = {} too high, clamping to 5",
                self.directory.retries
            ));
            self.directory.retries = 5;
        }

        if !VALID_DAY_BOUNDARIES.contains(&self.quota.day_boundary.as_str()) {
            warnings.push(format!(
                "unknown quota.day_boundary '{}', falling back to utc",
                self.quota.day_boundary
            ));
            self.quota.day_boundary = default_day_boundary();
        }
        if self.quota.utc_offset_minutes.unsigned_abs() >= 24 * 60 {
            let clamped = self.quota.utc_offset_minutes.clamp(-(23 * 60 + 59), 23 * 60 + 59);
            warnings.push(format!(
                "quota.utc_offset_minutes = {} out of range, clamping to {clamped}",
                self.quota.utc_offset_minutes
            ));
            self.quota.utc_offset_minutes = clamped;
        }
        if !self.quota.tiers.contains_key(&self.quota.default_tier) {
            warnings.push(format!(
                "quota.default_tier '{}' has no [quota.tiers] entry, adding it with the free-tier limit",
                self.quota.default_tier
            ));
            let free = default_tiers().remove("free").unwrap_or_default();
            self.quota
                .tiers
                .insert(self.quota.default_tier.clone(), free);
        }

        if self.coaching.generation_timeout_secs == 0 {
            warnings.push("coaching.generation_timeout_secs = 0, setting to 1".to_string());
            self.coaching.generation_timeout_secs = 1;
        }
        if self.coaching.history_max_turns == 0 {
            warnings.push("coaching.history_max_turns = 0, setting to 1".to_string());
            self.coaching.history_max_turns = 1;
        }
        if self.coaching.context_turns > self.coaching.history_max_turns {
            warnings.push(format!(
                "coaching.context_turns ({}) > history_max_turns ({}), clamping",
                self.coaching.context_turns, self.coaching.history_max_turns
            ));
            self.coaching.context_turns = self.coaching.history_max_turns;
        }

        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }
}

/// `~/.config/mentora/config.toml`
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mentora").join("config.toml"))
}
