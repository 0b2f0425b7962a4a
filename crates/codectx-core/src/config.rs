//! Configuration loading and validation.
//!
//! Configuration is resolved with the following precedence (highest wins):
//!
//! 1. Environment variables (`CODECTX_*`)
//! 2. Project config (`.codectx/config.toml`)
//! 3. User config (`~/.config/codectx/config.toml`)
//! 4. Compiled-in defaults
//!
//! Invalid values fail fast with [`CtxError::Config`] before any work
//! is done; a request never starts under a half-validated config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CtxError, CtxResult};

/// Top-level configuration for codectx.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Repository root path this engine serves.
    pub repo_path: PathBuf,

    /// Storage configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Traversal configuration.
    #[serde(default)]
    pub traversal: TraversalConfig,

    /// Assembly configuration.
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Learner configuration.
    #[serde(default)]
    pub learner: LearnerConfig,

    /// Tokenizer configuration.
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of pooled reader connections. Defaults to the core count.
    #[serde(default = "StoreConfig::default_reader_pool_size")]
    pub reader_pool_size: usize,

    /// Explicit data directory. When unset, a per-repo directory under
    /// the platform data dir is used.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reader_pool_size: Self::default_reader_pool_size(),
            data_dir: None,
        }
    }
}

impl StoreConfig {
    fn default_reader_pool_size() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4)
    }
}

/// Retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of results to return.
    #[serde(default = "RetrievalConfig::default_limit")]
    pub default_limit: usize,

    /// Hard cap on requested result counts.
    #[serde(default = "RetrievalConfig::default_max_limit")]
    pub max_limit: usize,

    /// RRF constant (k parameter).
    #[serde(default = "RetrievalConfig::default_rrf_k")]
    pub rrf_k: u32,

    /// Maximum retry attempts for retryable rerank failures.
    #[serde(default = "RetrievalConfig::default_rerank_attempts")]
    pub rerank_attempts: u32,

    /// Base backoff delay between rerank retries, in milliseconds.
    #[serde(default = "RetrievalConfig::default_rerank_backoff_ms")]
    pub rerank_backoff_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: Self::default_limit(),
            max_limit: Self::default_max_limit(),
            rrf_k: Self::default_rrf_k(),
            rerank_attempts: Self::default_rerank_attempts(),
            rerank_backoff_ms: Self::default_rerank_backoff_ms(),
        }
    }
}

impl RetrievalConfig {
    fn default_limit() -> usize {
        10
    }
    fn default_max_limit() -> usize {
        100
    }
    fn default_rrf_k() -> u32 {
        60
    }
    fn default_rerank_attempts() -> u32 {
        3
    }
    fn default_rerank_backoff_ms() -> u64 {
        100
    }
}

/// Traversal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Fraction of the request budget spent on graph expansion.
    #[serde(default = "TraversalConfig::default_budget_fraction")]
    pub budget_fraction: f64,

    /// Absolute ceiling on traversal tokens regardless of budget.
    #[serde(default = "TraversalConfig::default_budget_ceiling")]
    pub budget_ceiling: u32,

    /// Result cache time-to-live in seconds.
    #[serde(default = "TraversalConfig::default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Result cache entry bound.
    #[serde(default = "TraversalConfig::default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            budget_fraction: Self::default_budget_fraction(),
            budget_ceiling: Self::default_budget_ceiling(),
            cache_ttl_secs: Self::default_cache_ttl_secs(),
            cache_capacity: Self::default_cache_capacity(),
        }
    }
}

impl TraversalConfig {
    fn default_budget_fraction() -> f64 {
        0.3
    }
    fn default_budget_ceiling() -> u32 {
        4000
    }
    fn default_cache_ttl_secs() -> u64 {
        300
    }
    fn default_cache_capacity() -> usize {
        1000
    }
}

/// Assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Default token budget when the request does not carry one.
    #[serde(default = "AssemblyConfig::default_token_budget")]
    pub token_budget: u32,

    /// Fraction of budget at which a warning stop reason fires.
    #[serde(default = "AssemblyConfig::default_warning_fraction")]
    pub warning_fraction: f64,

    /// Per-request deadline in milliseconds.
    #[serde(default = "AssemblyConfig::default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            token_budget: Self::default_token_budget(),
            warning_fraction: Self::default_warning_fraction(),
            deadline_ms: Self::default_deadline_ms(),
        }
    }
}

impl AssemblyConfig {
    fn default_token_budget() -> u32 {
        4000
    }
    fn default_warning_fraction() -> f64 {
        0.9
    }
    fn default_deadline_ms() -> u64 {
        10_000
    }
}

/// Learner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// How many days of interactions a batch consumes.
    #[serde(default = "LearnerConfig::default_window_days")]
    pub window_days: u32,

    /// Weight of the satisfied flag in the extracted signal.
    #[serde(default = "LearnerConfig::default_sat_weight")]
    pub sat_weight: f64,

    /// Weight of the engagement term in the extracted signal.
    #[serde(default = "LearnerConfig::default_engagement_weight")]
    pub engagement_weight: f64,

    /// Gradient descent learning rate.
    #[serde(default = "LearnerConfig::default_learning_rate")]
    pub learning_rate: f64,

    /// Iteration cap for one optimization batch.
    #[serde(default = "LearnerConfig::default_max_iterations")]
    pub max_iterations: u32,

    /// Convergence threshold on the infinity norm of the weight delta.
    #[serde(default = "LearnerConfig::default_epsilon")]
    pub epsilon: f64,

    /// Signature cache entry bound.
    #[serde(default = "LearnerConfig::default_signature_cache_size")]
    pub signature_cache_size: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            window_days: Self::default_window_days(),
            sat_weight: Self::default_sat_weight(),
            engagement_weight: Self::default_engagement_weight(),
            learning_rate: Self::default_learning_rate(),
            max_iterations: Self::default_max_iterations(),
            epsilon: Self::default_epsilon(),
            signature_cache_size: Self::default_signature_cache_size(),
        }
    }
}

impl LearnerConfig {
    fn default_window_days() -> u32 {
        14
    }
    fn default_sat_weight() -> f64 {
        0.7
    }
    fn default_engagement_weight() -> f64 {
        0.3
    }
    fn default_learning_rate() -> f64 {
        0.1
    }
    fn default_max_iterations() -> u32 {
        50
    }
    fn default_epsilon() -> f64 {
        1e-3
    }
    fn default_signature_cache_size() -> usize {
        1000
    }
}

/// Tokenizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Model name reported in token accounting.
    #[serde(default = "TokenizerConfig::default_model")]
    pub model: String,

    /// Path to a `tokenizer.json` file. When absent or unloadable the
    /// deterministic byte estimator is used instead.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            tokenizer_path: None,
        }
    }
}

impl TokenizerConfig {
    fn default_model() -> String {
        "estimator".into()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Whether to output logs as JSON.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }
}

impl Config {
    /// Load configuration from defaults, then overlay user config, then
    /// project config, then environment overrides.
    pub fn load(repo_path: &Path) -> CtxResult<Self> {
        let mut config = Self::defaults(repo_path);

        if let Some(user_config_dir) = dirs::config_dir() {
            let user_config_path = user_config_dir.join("codectx").join("config.toml");
            if user_config_path.exists() {
                config.merge_from_file(&user_config_path)?;
            }
        }

        let project_config_path = repo_path.join(".codectx").join("config.toml");
        if project_config_path.exists() {
            config.merge_from_file(&project_config_path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Create a default configuration for the given repo path.
    pub fn defaults(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            store: StoreConfig::default(),
            retrieval: RetrievalConfig::default(),
            traversal: TraversalConfig::default(),
            assembly: AssemblyConfig::default(),
            learner: LearnerConfig::default(),
            tokenizer: TokenizerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Returns the data directory for this repo's store files.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.store.data_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("codectx")
            .join("repos")
            .join(self.repo_hash())
    }

    /// Reject out-of-range values before any subsystem consumes them.
    pub fn validate(&self) -> CtxResult<()> {
        if !(0.0..=1.0).contains(&self.traversal.budget_fraction) {
            return Err(CtxError::Config {
                details: format!(
                    "traversal.budget_fraction must be in [0, 1], got {}",
                    self.traversal.budget_fraction
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.assembly.warning_fraction) {
            return Err(CtxError::Config {
                details: format!(
                    "assembly.warning_fraction must be in [0, 1], got {}",
                    self.assembly.warning_fraction
                ),
            });
        }
        if self.assembly.token_budget == 0 {
            return Err(CtxError::Config {
                details: "assembly.token_budget must be positive".into(),
            });
        }
        if self.retrieval.max_limit == 0 || self.retrieval.default_limit > self.retrieval.max_limit
        {
            return Err(CtxError::Config {
                details: format!(
                    "retrieval limits invalid: default {} vs max {}",
                    self.retrieval.default_limit, self.retrieval.max_limit
                ),
            });
        }
        if self.learner.learning_rate <= 0.0 || self.learner.epsilon <= 0.0 {
            return Err(CtxError::Config {
                details: "learner.learning_rate and learner.epsilon must be positive".into(),
            });
        }
        Ok(())
    }

    /// Merge values from a TOML config file (non-destructive overlay).
    fn merge_from_file(&mut self, path: &Path) -> CtxResult<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content).map_err(|e| CtxError::Config {
            details: format!("invalid TOML in {}: {e}", path.display()),
        })?;

        if let Some(store) = overlay.get("store") {
            if let Ok(parsed) = store.clone().try_into::<StoreConfig>() {
                self.store = parsed;
            }
        }
        if let Some(retrieval) = overlay.get("retrieval") {
            if let Ok(parsed) = retrieval.clone().try_into::<RetrievalConfig>() {
                self.retrieval = parsed;
            }
        }
        if let Some(traversal) = overlay.get("traversal") {
            if let Ok(parsed) = traversal.clone().try_into::<TraversalConfig>() {
                self.traversal = parsed;
            }
        }
        if let Some(assembly) = overlay.get("assembly") {
            if let Ok(parsed) = assembly.clone().try_into::<AssemblyConfig>() {
                self.assembly = parsed;
            }
        }
        if let Some(learner) = overlay.get("learner") {
            if let Ok(parsed) = learner.clone().try_into::<LearnerConfig>() {
                self.learner = parsed;
            }
        }
        if let Some(tokenizer) = overlay.get("tokenizer") {
            if let Ok(parsed) = tokenizer.clone().try_into::<TokenizerConfig>() {
                self.tokenizer = parsed;
            }
        }
        if let Some(logging) = overlay.get("logging") {
            if let Ok(parsed) = logging.clone().try_into::<LoggingConfig>() {
                self.logging = parsed;
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides (CODECTX_* prefix).
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CODECTX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(path) = std::env::var("CODECTX_TOKENIZER_PATH") {
            self.tokenizer.tokenizer_path = Some(PathBuf::from(path));
        }
        if let Ok(model) = std::env::var("CODECTX_TOKENIZER_MODEL") {
            self.tokenizer.model = model;
        }
    }

    /// Compute a short hash of the repo path for the data directory name.
    ///
    /// Normalizes the path to avoid Windows `\\?\` extended path prefix
    /// causing different hashes for the same physical directory.
    fn repo_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let path_str = self.repo_path.to_string_lossy();
        let normalized = path_str.strip_prefix(r"\\?\").unwrap_or(&path_str);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..4])
    }
}
