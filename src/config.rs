//! Configuration management for forge-throttle.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::rules::TierRule;
use crate::ratelimit::{CounterStore, MemoryStore, TieredRateLimiter};

/// Prefix for environment variable overrides, e.g. `FORGE_THROTTLE__STORE__URL`.
pub const ENV_PREFIX: &str = "FORGE_THROTTLE";

/// Main configuration for the throttling layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit tiers, evaluated in order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierRule>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            tiers: default_tiers(),
        }
    }
}

fn default_tiers() -> Vec<TierRule> {
    vec![
        TierRule::from_preset("burst", "burst"),
        TierRule::from_preset("api", "standard"),
        TierRule::from_preset("daily", "daily"),
    ]
}

/// Which counter store backs the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, one per tier
    #[default]
    Memory,
    /// Shared Redis store, one namespace per tier
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for shared store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Interval between sweeps of expired in-process counters, 0 disables
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Bound on each store call in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    "forge-throttle:".to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_timeout() -> u64 {
    500
}

impl ThrottleConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttle config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file layered under
    /// `FORGE_THROTTLE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading throttle configuration");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ThrottleConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ThrottleError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check tier names are unique and every tier resolves to limits.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if !seen.insert(tier.name.as_str()) {
                return Err(ThrottleError::DuplicateTier(tier.name.clone()));
            }
            tier.limits()?;
        }
        Ok(())
    }

    /// Get the store call timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Build the tiered limiter described by this configuration.
    ///
    /// Memory-backed tiers each get their own store, with a sweeper when
    /// called inside a Tokio runtime. Redis-backed tiers share one connection.
    pub async fn build_limiter(&self) -> Result<TieredRateLimiter> {
        match self.store.backend {
            StoreBackend::Memory => {
                let stores = self
                    .tiers
                    .iter()
                    .map(|_| Arc::new(self.memory_store()) as Arc<dyn CounterStore>)
                    .collect();
                self.assemble(stores)
            }
            StoreBackend::Redis => {
                let store = self.connect_redis().await?;
                self.build_limiter_with_store(store)
            }
        }
    }

    /// Build the tiers over one shared store.
    ///
    /// Each tier counts under its own name, so keys land at `<tier>:<key>`
    /// inside the store.
    pub fn build_limiter_with_store(&self, store: Arc<dyn CounterStore>) -> Result<TieredRateLimiter> {
        let stores = self.tiers.iter().map(|_| Arc::clone(&store)).collect();
        self.assemble(stores)
    }

    fn assemble(&self, stores: Vec<Arc<dyn CounterStore>>) -> Result<TieredRateLimiter> {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for (rule, store) in self.tiers.iter().zip(stores) {
            let config = rule
                .to_config(store)?
                .with_store_timeout(self.store_timeout());
            tiers.push((rule.name.clone(), config));
        }

        let limiter = TieredRateLimiter::new(tiers)?;
        info!(
            backend = ?self.store.backend,
            tiers = self.tiers.len(),
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    fn memory_store(&self) -> MemoryStore {
        match self.store.sweep_interval_secs {
            0 => MemoryStore::new(),
            secs => MemoryStore::sweeping(Duration::from_secs(secs)),
        }
    }

    #[cfg(feature = "redis-store")]
    async fn connect_redis(&self) -> Result<Arc<dyn CounterStore>> {
        use crate::ratelimit::redis_store::{RedisStore, RedisStoreConfig};

        let url = self
            .store
            .url
            .as_deref()
            .ok_or_else(|| ThrottleError::Config("redis backend requires store.url".into()))?;
        let config = RedisStoreConfig {
            key_prefix: self.store.key_prefix.clone(),
        };
        let store = RedisStore::connect_with_config(url, config).await?;
        info!(key_prefix = %store.key_prefix(), "Connected to Redis counter store");
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis-store"))]
    async fn connect_redis(&self) -> Result<Arc<dyn CounterStore>> {
        Err(ThrottleError::Config(
            "redis backend requires the redis-store feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RequestContext;

    #[test]
    fn test_default_config() {
        let config = ThrottleConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store_timeout(), Duration::from_millis(500));
        assert_eq!(config.store.sweep_interval_secs, 300);

        let names: Vec<&str> = config.tiers.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["burst", "api", "daily"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  backend: memory
  sweep_interval_secs: 60
  timeout_ms: 250
tiers:
  - name: burst
    preset: burst
  - name: generate
    requests_per_unit: 10
    unit: hour
    key_by: header:authorization
    fail_mode: closed
"#;
        let config = ThrottleConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.sweep_interval_secs, 60);
        assert_eq!(config.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.tiers[1].limits().unwrap(), (Duration::from_secs(3600), 10));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = ThrottleConfig::from_yaml("store:\n  timeout_ms: 100\n").unwrap();
        assert_eq!(config.tiers.len(), 3);
        assert_eq!(config.store.key_prefix, "forge-throttle:");
    }

    #[test]
    fn test_duplicate_tier_names_rejected() {
        let yaml = r#"
tiers:
  - name: api
    preset: standard
  - name: api
    preset: strict
"#;
        assert!(matches!(
            ThrottleConfig::from_yaml(yaml),
            Err(ThrottleError::DuplicateTier(name)) if name == "api"
        ));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(matches!(
            ThrottleConfig::from_yaml("tiers: [name: {"),
            Err(ThrottleError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_build_memory_limiter() {
        let yaml = r#"
tiers:
  - name: burst
    requests_per_unit: 2
    unit: second
  - name: daily
    preset: daily
"#;
        let limiter = ThrottleConfig::from_yaml(yaml).unwrap().build_limiter().await.unwrap();
        let ctx = RequestContext::new().with_remote_addr("10.1.1.1:80".parse().unwrap());

        limiter.check_all_tiers(&ctx).await.unwrap();
        limiter.check_all_tiers(&ctx).await.unwrap();
        let third = limiter.check_all_tiers(&ctx).await.unwrap();

        assert_eq!(third.tier, "burst");
        assert!(!third.decision.allowed);

        let burst = limiter.limiter("burst").unwrap();
        assert_eq!(burst.config().store_timeout, Duration::from_millis(500));
        assert_eq!(burst.config().key_prefix.as_deref(), Some("burst"));
        limiter.close();
    }

    #[cfg(not(feature = "redis-store"))]
    #[tokio::test]
    async fn test_redis_backend_requires_feature() {
        let config = ThrottleConfig::from_yaml("store:\n  backend: redis\n  url: redis://127.0.0.1/\n").unwrap();
        assert!(matches!(config.build_limiter().await, Err(ThrottleError::Config(_))));
    }

    fn write_config(name: &str, contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("forge-throttle-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("throttle.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_from_file() {
        let path = write_config(
            "file",
            "store:\n  sweep_interval_secs: 30\ntiers:\n  - name: api\n    preset: standard\n",
        );

        let config = ThrottleConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.sweep_interval_secs, 30);
        assert_eq!(config.tiers[0].name, "api");

        let from_file = ThrottleConfig::from_file(&path).unwrap();
        assert_eq!(from_file.tiers, config.tiers);
        assert_eq!(from_file.store.sweep_interval_secs, 30);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_env_overrides_file() {
        let path = write_config(
            "env",
            r#"
store:
  timeout_ms: 250
tiers:
  - name: keyed
    requests_per_unit: 20
    unit: minute
    units: 2
    key_by: header:X-Api-Key
    fail_mode: closed
"#,
        );

        std::env::set_var("FORGE_THROTTLE__STORE__TIMEOUT_MS", "123");
        let loaded = ThrottleConfig::load(Some(&path));
        std::env::remove_var("FORGE_THROTTLE__STORE__TIMEOUT_MS");
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.store_timeout(), Duration::from_millis(123));

        let rule = &config.tiers[0];
        assert_eq!(rule.unit, Some(crate::ratelimit::TimeWindow::Minute));
        assert_eq!(rule.key_by, crate::ratelimit::KeyBy::Header("x-api-key".into()));
        assert_eq!(rule.fail_mode, crate::ratelimit::FailMode::Closed);
        assert_eq!(rule.limits().unwrap(), (Duration::from_secs(120), 20));
    }

    #[tokio::test]
    async fn test_shared_store_namespaces_each_tier_once() {
        let yaml = r#"
tiers:
  - name: burst
    preset: burst
  - name: daily
    preset: daily
"#;
        let store = Arc::new(MemoryStore::new());
        let limiter = ThrottleConfig::from_yaml(yaml)
            .unwrap()
            .build_limiter_with_store(store.clone())
            .unwrap();

        limiter.check_all_for_key("10.1.1.1").await.unwrap();

        assert_eq!(store.get("burst:10.1.1.1").await.unwrap().unwrap().count, 1);
        assert_eq!(store.get("daily:10.1.1.1").await.unwrap().unwrap().count, 1);
        assert_eq!(store.len(), 2);
    }
}
