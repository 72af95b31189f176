use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub prompt: PromptConfig,
    pub agent: AgentConfig,
    pub quota: QuotaConfig,
    /// Warehouse profiles keyed by profile name. Profile names are opaque
    /// routing keys; none is mandatory beyond `agent.default_profile`.
    pub warehouses: HashMap<String, WarehouseProfileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expires_in: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// LLM provider reachable over the OpenAI-compatible chat completions API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

/// Embedding provider reachable over the OpenAI-compatible embeddings API.
/// When no api_base is configured the vector indices stay empty and the
/// agent falls back to the full schema bundle.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub api_base: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// "memory", "sqlite", or "disabled"
    pub backend: String,
    pub full_schema_ttl_secs: u64,
    pub examples_ttl_secs: u64,
    pub validation_ok_ttl_secs: u64,
    pub validation_err_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Directory holding resources/, client-configs/ and templates/
    pub root: String,
    pub component: String,
    pub client: Option<String>,
    pub env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Total attempt budget per request (first call + repairs)
    pub max_attempts: u32,
    pub default_profile: String,
    /// Dialect assumed when a driver identifier is not recognized
    pub default_dialect: String,
    /// Requests stuck in_progress longer than this are failed by the monitor
    pub stale_after_secs: i64,
    pub monitor_interval_secs: u64,
    pub worker_count: usize,
    /// Relevance lookups
    pub top_k_tables: usize,
    pub top_k_examples: usize,
    pub table_score_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Daily request allowance for guest identities; 0 disables the check
    pub guest_daily_requests: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseProfileConfig {
    pub host: String,
    #[serde(default = "default_warehouse_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Driver identifier fed to the dialect detector (clickhouse, mysql, ...)
    pub driver: String,
    #[serde(default)]
    pub database: Option<String>,
    /// Path to the human-authored YAML schema descriptor for this profile
    #[serde(default)]
    pub descriptor_path: Option<String>,
    /// Tables always included in relevance results
    #[serde(default)]
    pub pinned_tables: Vec<String>,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_warehouse_port() -> u16 {
    9030
}

fn default_query_timeout() -> u64 {
    30
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "vega")]
#[command(version, about = "Vega - natural-language-to-SQL orchestration engine")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Operational store URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// JWT secret key (overrides config file)
    #[arg(long, value_name = "SECRET")]
    pub jwt_secret: Option<String>,

    /// Logging level (overrides config file, e.g. "info,vega=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Prompt pack root directory (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub prompt_root: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(cli_args)
    }

    /// Same as [`Config::load`] but with explicit args (used in tests)
    pub fn load_with_args(cli_args: CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST / APP_SERVER_PORT
    /// - APP_DATABASE_URL: operational store URL
    /// - APP_JWT_SECRET / APP_JWT_EXPIRES_IN
    /// - APP_LOG_LEVEL
    /// - APP_LLM_API_BASE / APP_LLM_MODEL / APP_LLM_API_KEY
    /// - APP_EMBEDDING_API_BASE / APP_EMBEDDING_MODEL / APP_EMBEDDING_API_KEY
    /// - APP_CACHE_BACKEND: memory | sqlite | disabled
    /// - APP_PROMPT_ROOT / APP_PROMPT_CLIENT / APP_PROMPT_ENV
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.url = db_url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(secret) = std::env::var("APP_JWT_SECRET") {
            self.auth.jwt_secret = secret;
            tracing::info!("Override auth.jwt_secret from env");
        }

        if let Ok(expires) = std::env::var("APP_JWT_EXPIRES_IN") {
            self.auth.jwt_expires_in = expires;
            tracing::info!("Override auth.jwt_expires_in from env: {}", self.auth.jwt_expires_in);
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(base) = std::env::var("APP_LLM_API_BASE") {
            self.llm.api_base = base;
            tracing::info!("Override llm.api_base from env: {}", self.llm.api_base);
        }

        if let Ok(model) = std::env::var("APP_LLM_MODEL") {
            self.llm.model = model;
            tracing::info!("Override llm.model from env: {}", self.llm.model);
        }

        if let Ok(key) = std::env::var("APP_LLM_API_KEY") {
            self.llm.api_key = Some(key);
            tracing::info!("Override llm.api_key from env");
        }

        if let Ok(base) = std::env::var("APP_EMBEDDING_API_BASE") {
            self.embedding.api_base = Some(base);
            tracing::info!("Override embedding.api_base from env");
        }

        if let Ok(model) = std::env::var("APP_EMBEDDING_MODEL") {
            self.embedding.model = model;
            tracing::info!("Override embedding.model from env: {}", self.embedding.model);
        }

        if let Ok(key) = std::env::var("APP_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key);
            tracing::info!("Override embedding.api_key from env");
        }

        if let Ok(backend) = std::env::var("APP_CACHE_BACKEND") {
            self.cache.backend = backend;
            tracing::info!("Override cache.backend from env: {}", self.cache.backend);
        }

        if let Ok(root) = std::env::var("APP_PROMPT_ROOT") {
            self.prompt.root = root;
            tracing::info!("Override prompt.root from env: {}", self.prompt.root);
        }

        if let Ok(client) = std::env::var("APP_PROMPT_CLIENT") {
            self.prompt.client = crate::utils::clean_optional_string(Some(&client));
            tracing::info!("Override prompt.client from env");
        }

        if let Ok(env) = std::env::var("APP_PROMPT_ENV") {
            self.prompt.env = crate::utils::clean_optional_string(Some(&env));
            tracing::info!("Override prompt.env from env");
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(secret) = &args.jwt_secret {
            self.auth.jwt_secret = secret.clone();
            tracing::info!("Override auth.jwt_secret from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(root) = &args.prompt_root {
            self.prompt.root = root.clone();
            tracing::info!("Override prompt.root from CLI: {}", self.prompt.root);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.auth.jwt_secret == "dev-secret-key-change-in-production" {
            tracing::warn!("Using default JWT secret; set APP_JWT_SECRET for production use");
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.agent.max_attempts == 0 {
            anyhow::bail!("agent.max_attempts must be > 0");
        }

        if self.agent.worker_count == 0 {
            anyhow::bail!("agent.worker_count must be > 0");
        }

        match self.cache.backend.as_str() {
            "memory" | "sqlite" | "disabled" => {},
            other => anyhow::bail!("Unknown cache backend: {}", other),
        }

        if !self.warehouses.is_empty() && !self.warehouses.contains_key(&self.agent.default_profile)
        {
            anyhow::bail!(
                "agent.default_profile '{}' has no [warehouses.{}] section",
                self.agent.default_profile,
                self.agent.default_profile
            );
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/vega.db?mode=rwc".to_string() }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-key-change-in-production".to_string(),
            jwt_expires_in: "24h".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,vega=debug".to_string(), file: Some("logs/vega.log".to_string()) }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            timeout_secs: 120,
            max_tokens: 4096,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            full_schema_ttl_secs: 3600,
            examples_ttl_secs: 1800,
            validation_ok_ttl_secs: 600,
            validation_err_ttl_secs: 60,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self { root: ".".to_string(), component: "agent".to_string(), client: None, env: None }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_profile: "default".to_string(),
            default_dialect: "trino".to_string(),
            stale_after_secs: 600,
            monitor_interval_secs: 60,
            worker_count: 2,
            top_k_tables: 8,
            top_k_examples: 5,
            table_score_threshold: 0.35,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { guest_daily_requests: 50 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.max_attempts, 3);
        assert_eq!(config.cache.backend, "memory");
    }

    #[test]
    fn test_unknown_cache_backend_rejected() {
        let mut config = Config::default();
        config.cache.backend = "memcached".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_profile_must_exist_when_warehouses_defined() {
        let mut config = Config::default();
        config.warehouses.insert(
            "analytics".to_string(),
            WarehouseProfileConfig {
                host: "localhost".to_string(),
                port: 9030,
                username: "vega".to_string(),
                password: None,
                driver: "clickhouse".to_string(),
                database: None,
                descriptor_path: None,
                pinned_tables: vec![],
                query_timeout_secs: 30,
            },
        );
        config.agent.default_profile = "missing".to_string();
        assert!(config.validate().is_err());

        config.agent.default_profile = "analytics".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_profile_parsing() {
        let toml_src = r#"
            [server]
            port = 9000

            [agent]
            default_profile = "analytics"
            max_attempts = 4

            [warehouses.analytics]
            host = "ch.internal"
            port = 9030
            username = "reader"
            driver = "clickhouse"
            pinned_tables = ["sales.core_metrics"]
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.agent.max_attempts, 4);
        let profile = config.warehouses.get("analytics").unwrap();
        assert_eq!(profile.driver, "clickhouse");
        assert_eq!(profile.pinned_tables, vec!["sales.core_metrics"]);
        assert!(config.validate().is_ok());
    }
}
