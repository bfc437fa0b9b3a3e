use std::env;
use std::fmt;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

/// Main configuration for the wallet memory service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    pub encryption: EncryptionConfig,
    pub oracle: OracleConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Cache (Redis) configuration
#[derive(Clone, Deserialize)]
pub struct CacheConfig {
    pub url: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_memory_pressure_threshold")]
    pub memory_pressure_threshold: f64,
}

/// Custom Debug that redacts the cache password.
impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("url", &self.url)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("pool_min", &self.pool_min)
            .field("pool_max", &self.pool_max)
            .field("default_ttl_secs", &self.default_ttl_secs)
            .field(
                "memory_pressure_threshold",
                &self.memory_pressure_threshold,
            )
            .finish()
    }
}

/// Upstream indexer stream configuration
#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    pub ws_url: String,
    pub api_key: String,
}

/// Custom Debug that redacts the API key to prevent accidental log leakage.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("ws_url", &self.ws_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Privacy-row encryption configuration
#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    pub salt: String,
    #[serde(default)]
    pub privacy_master_key: Option<String>,
}

/// Custom Debug that redacts the salt and master key.
impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("salt", &"<redacted>")
            .field(
                "privacy_master_key",
                &self.privacy_master_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Price oracle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub price_url: Option<String>,
}

/// Auto-registration configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub auto_register: bool,
    /// Comma-separated wallet list from AUTO_REGISTER_WALLETS.
    #[serde(default)]
    pub wallets: Vec<String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Default functions
fn default_pool_min() -> usize {
    10
}

fn default_pool_max() -> usize {
    50
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_memory_pressure_threshold() -> f64 {
    0.80
}

fn default_api_port() -> u16 {
    9090
}

fn default_environment() -> String {
    "development".to_string()
}

/// Salt/master-key literals that ship in examples and must never reach
/// production.
const INSECURE_LITERALS: &[&str] = &[
    "changeme",
    "change-me",
    "default",
    "default-salt",
    "default_salt",
    "secret",
    "insecure",
    "test",
];

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let cache = CacheConfig {
            url: env::var("REDIS_URL")
                .map_err(|_| eyre!("REDIS_URL environment variable is required"))?,
            password: env::var("REDIS_PASSWORD").ok(),
            pool_min: env::var("CACHE_POOL_MIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_pool_min()),
            pool_max: env::var("CACHE_POOL_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_pool_max()),
            default_ttl_secs: env::var("CACHE_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_cache_ttl_secs()),
            memory_pressure_threshold: env::var("CACHE_MEMORY_PRESSURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_memory_pressure_threshold()),
        };

        let upstream = UpstreamConfig {
            ws_url: env::var("UPSTREAM_WS_URL")
                .map_err(|_| eyre!("UPSTREAM_WS_URL environment variable is required"))?,
            api_key: env::var("UPSTREAM_API_KEY")
                .map_err(|_| eyre!("UPSTREAM_API_KEY environment variable is required"))?,
        };

        let encryption = EncryptionConfig {
            salt: env::var("ENCRYPTION_SALT")
                .map_err(|_| eyre!("ENCRYPTION_SALT environment variable is required"))?,
            privacy_master_key: env::var("PRIVACY_MASTER_KEY").ok(),
        };

        let oracle = OracleConfig {
            price_url: env::var("PRICE_ORACLE_URL").ok(),
        };

        let registry = RegistryConfig {
            auto_register: env::var("AUTO_REGISTER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            wallets: parse_wallet_list(&env::var("AUTO_REGISTER_WALLETS").unwrap_or_default()),
        };

        let server = ServerConfig {
            api_port: env::var("API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_api_port()),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| default_environment()),
        };

        let config = Config {
            database,
            cache,
            upstream,
            encryption,
            oracle,
            registry,
            server,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.cache.url.is_empty() {
            return Err(eyre!("cache.url cannot be empty"));
        }

        if self.cache.pool_min == 0 {
            return Err(eyre!("cache.pool_min must be at least 1"));
        }

        if self.cache.pool_max < self.cache.pool_min {
            return Err(eyre!(
                "cache.pool_max ({}) must be >= cache.pool_min ({})",
                self.cache.pool_max,
                self.cache.pool_min
            ));
        }

        if !(0.0..=1.0).contains(&self.cache.memory_pressure_threshold) {
            return Err(eyre!(
                "cache.memory_pressure_threshold must be within [0, 1]"
            ));
        }

        if !self.upstream.ws_url.starts_with("ws://") && !self.upstream.ws_url.starts_with("wss://")
        {
            return Err(eyre!("upstream.ws_url must be a ws:// or wss:// URL"));
        }

        if self.upstream.api_key.is_empty() {
            return Err(eyre!("upstream.api_key cannot be empty"));
        }

        if self.encryption.salt.len() < 16 {
            return Err(eyre!("encryption.salt must be at least 16 characters"));
        }

        let salt_lower = self.encryption.salt.to_lowercase();
        if INSECURE_LITERALS.iter().any(|lit| salt_lower == *lit) {
            return Err(eyre!(
                "encryption.salt is a known-insecure placeholder; set a real value"
            ));
        }

        if let Some(ref master) = self.encryption.privacy_master_key {
            if master.len() < 32 {
                return Err(eyre!(
                    "encryption.privacy_master_key must be at least 32 characters"
                ));
            }
            let master_lower = master.to_lowercase();
            if INSECURE_LITERALS.iter().any(|lit| master_lower.contains(lit)) {
                return Err(eyre!(
                    "encryption.privacy_master_key is a known-insecure placeholder"
                ));
            }
        }

        if let Some(ref url) = self.oracle.price_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(eyre!("oracle.price_url must be an http(s) URL"));
            }
        }

        Ok(())
    }
}

/// Split a comma-separated wallet list, trimming whitespace and dropping
/// empty entries.
pub fn parse_wallet_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
