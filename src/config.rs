//! Process configuration.
//!
//! Loaded with `figment`: environment variables prefixed `OTR__` take
//! precedence over an optional TOML file, matching the env-var-first
//! style of the system this crate replaces. See spec.md §6 for the
//! recognized option list.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

fn default_max_catch_up_secs() -> u64 {
    300
}

fn default_mongo_query_timeout_secs() -> u64 {
    10
}

fn default_publisher_parallelism() -> usize {
    1
}

fn default_redis_prefix() -> String {
    String::new()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_max_publish_retries() -> u32 {
    5
}

fn default_publish_backoff_cap_secs() -> u64 {
    30
}

fn default_partition_channel_capacity() -> usize {
    1024
}

fn default_health_tailer_stall_secs() -> u64 {
    60
}

fn default_health_backoff_stall_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mongo_url: String,

    pub redis_url: String,

    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,

    #[serde(default = "default_max_catch_up_secs")]
    pub max_catch_up_secs: u64,

    #[serde(default = "default_mongo_query_timeout_secs")]
    pub mongo_query_timeout_secs: u64,

    #[serde(default = "default_publisher_parallelism")]
    pub publisher_parallelism: usize,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    #[serde(default = "default_max_publish_retries")]
    pub max_publish_retries: u32,

    #[serde(default = "default_publish_backoff_cap_secs")]
    pub publish_backoff_cap_secs: u64,

    #[serde(default = "default_partition_channel_capacity")]
    pub partition_channel_capacity: usize,

    /// If set, only entries from these databases are published; the
    /// hard-coded internal-namespace exclusions apply regardless.
    #[serde(default)]
    pub allowed_databases: Option<Vec<String>>,

    /// Databases excluded from publication even if `allowed_databases`
    /// would otherwise permit them.
    #[serde(default)]
    pub denied_databases: Vec<String>,

    /// How long the tailer can go without a successful read cycle before
    /// `/healthz` reports unhealthy.
    #[serde(default = "default_health_tailer_stall_secs")]
    pub health_tailer_stall_secs: u64,

    /// How long a partition worker can stay in backoff before `/healthz`
    /// reports unhealthy.
    #[serde(default = "default_health_backoff_stall_secs")]
    pub health_backoff_stall_secs: u64,
}

impl Config {
    pub fn max_catch_up(&self) -> Duration {
        Duration::from_secs(self.max_catch_up_secs)
    }

    pub fn mongo_query_timeout(&self) -> Duration {
        Duration::from_secs(self.mongo_query_timeout_secs)
    }

    pub fn publish_backoff_cap(&self) -> Duration {
        Duration::from_secs(self.publish_backoff_cap_secs)
    }

    pub fn health_tailer_stall(&self) -> Duration {
        Duration::from_secs(self.health_tailer_stall_secs)
    }

    pub fn health_backoff_stall(&self) -> Duration {
        Duration::from_secs(self.health_backoff_stall_secs)
    }

    pub fn namespace_filter(&self) -> crate::transform::NamespaceFilter {
        crate::transform::NamespaceFilter {
            allowed_databases: self.allowed_databases.clone(),
            denied_databases: self.denied_databases.clone(),
        }
    }

    /// The Redis key under which the resume checkpoint is persisted.
    pub fn checkpoint_key(&self) -> String {
        format!("{}:lastProcessedEntry", self.redis_prefix)
    }

    /// Load from an optional TOML file, overlaid with `OTR__*` env vars.
    /// Env vars always win so a deployment can override a checked-in
    /// file without editing it. The double underscore after `OTR` is the
    /// nesting separator figment uses to tell "end of prefix" from the
    /// single underscores inside field names like `mongo_url` — a single-
    /// underscore separator would mis-split those field names themselves.
    pub fn load(toml_path: Option<&str>) -> Result<Config, figment::Error> {
        let mut figment = Figment::new();
        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("OTR__").split("__")).extract()
    }

    #[cfg(test)]
    pub fn for_test() -> Config {
        Config {
            mongo_url: "mongodb://localhost:27017".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            redis_prefix: "otr:".to_string(),
            max_catch_up_secs: default_max_catch_up_secs(),
            mongo_query_timeout_secs: default_mongo_query_timeout_secs(),
            publisher_parallelism: default_publisher_parallelism(),
            metrics_addr: default_metrics_addr(),
            max_publish_retries: default_max_publish_retries(),
            publish_backoff_cap_secs: default_publish_backoff_cap_secs(),
            partition_channel_capacity: default_partition_channel_capacity(),
            allowed_databases: None,
            denied_databases: Vec::new(),
            health_tailer_stall_secs: default_health_tailer_stall_secs(),
            health_backoff_stall_secs: default_health_backoff_stall_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_keys_must_be_present() {
        let result: Result<Config, _> = Figment::new()
            .merge(Env::prefixed("OTR_TEST_MISSING_"))
            .extract();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_fill_in_optional_keys() {
        let cfg = Figment::new()
            .merge(("mongo_url", "mongodb://localhost:27017"))
            .merge(("redis_url", "redis://localhost:6379"))
            .extract::<Config>()
            .unwrap();
        assert_eq!(cfg.publisher_parallelism, 1);
        assert_eq!(cfg.max_catch_up_secs, 300);
        assert_eq!(cfg.checkpoint_key(), ":lastProcessedEntry");
    }

    #[test]
    fn env_vars_override_defaults() {
        std::env::set_var("OTR_TEST__MONGO_URL", "mongodb://example:27017");
        let cfg = Figment::new()
            .merge(Env::prefixed("OTR_TEST__").split("__"))
            .merge(("redis_url", "redis://localhost:6379"))
            .extract::<Config>()
            .unwrap();
        assert_eq!(cfg.mongo_url, "mongodb://example:27017");
        std::env::remove_var("OTR_TEST__MONGO_URL");
    }

    #[test]
    fn env_vars_override_a_toml_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            mongo_url = "mongodb://from-file:27017"
            redis_url = "redis://from-file:6379"
            publisher_parallelism = 4
            "#
        )
        .unwrap();

        let from_file_only = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(from_file_only.mongo_url, "mongodb://from-file:27017");
        assert_eq!(from_file_only.publisher_parallelism, 4);

        std::env::set_var("OTR__MONGO_URL", "mongodb://from-env:27017");
        let overridden = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(overridden.mongo_url, "mongodb://from-env:27017");
        assert_eq!(
            overridden.redis_url, "redis://from-file:6379",
            "keys the env override doesn't touch still come from the file"
        );
        std::env::remove_var("OTR__MONGO_URL");
    }
}
