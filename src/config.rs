use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::models::RuleConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    /// Data source name → URL
    #[serde(default)]
    pub data_sources: BTreeMap<String, String>,
    /// JSON file holding the sharding rules
    #[serde(default)]
    pub rules_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Units per data source above which units share connections
    pub max_connections_per_query: usize,
    /// Global cap on units executing at once
    pub max_concurrent_units: usize,
    pub sql_federation_enabled: bool,
    /// Log every logical statement with its physical SQL
    pub sql_show: bool,
    pub query_timeout_secs: u64,
    #[serde(default)]
    pub unicast_preferred_data_source: Option<String>,
}

impl EngineConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections_per_query: 1,
            max_concurrent_units: num_cpus::get() * 2,
            sql_federation_enabled: true,
            sql_show: false,
            query_timeout_secs: 30,
            unicast_preferred_data_source: None,
        }
    }
}

/// Parse `name=url,name=url`
fn parse_data_sources(text: &str) -> Result<Vec<(String, String)>, config::ConfigError> {
    text.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() => Ok((name.trim().to_string(), url.trim().to_string())),
            _ => Err(config::ConfigError::Message(format!(
                "Invalid DATA_SOURCES entry '{}', expected name=url",
                entry
            ))),
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let defaults = EngineConfig::default();
        let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "shard-query.toml".to_string());
        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?
            .set_default("engine.max_connections_per_query", defaults.max_connections_per_query as u64)?
            .set_default("engine.max_concurrent_units", defaults.max_concurrent_units as u64)?
            .set_default("engine.sql_federation_enabled", defaults.sql_federation_enabled)?
            .set_default("engine.sql_show", defaults.sql_show)?
            .set_default("engine.query_timeout_secs", defaults.query_timeout_secs)?
            .add_source(config::File::from(Path::new(&config_path)).required(false));

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port.parse::<u16>().unwrap_or(3000))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        if let Ok(rules_path) = env::var("RULES_PATH") {
            builder = builder.set_override("rules_path", rules_path)?;
        }

        if let Ok(sql_show) = env::var("SQL_SHOW") {
            builder = builder.set_override("engine.sql_show", sql_show.parse::<bool>().unwrap_or(false))?;
        }

        if let Ok(enabled) = env::var("SQL_FEDERATION_ENABLED") {
            builder = builder.set_override("engine.sql_federation_enabled", enabled.parse::<bool>().unwrap_or(true))?;
        }

        if let Ok(max) = env::var("MAX_CONNECTIONS_PER_QUERY") {
            builder = builder.set_override(
                "engine.max_connections_per_query",
                max.parse::<u64>().unwrap_or(defaults.max_connections_per_query as u64),
            )?;
        }

        if let Ok(max) = env::var("MAX_CONCURRENT_UNITS") {
            builder = builder.set_override(
                "engine.max_concurrent_units",
                max.parse::<u64>().unwrap_or(defaults.max_concurrent_units as u64),
            )?;
        }

        if let Ok(secs) = env::var("QUERY_TIMEOUT_SECS") {
            builder = builder.set_override(
                "engine.query_timeout_secs",
                secs.parse::<u64>().unwrap_or(defaults.query_timeout_secs),
            )?;
        }

        if let Ok(sources) = env::var("DATA_SOURCES") {
            for (name, url) in parse_data_sources(&sources)? {
                builder = builder.set_override(format!("data_sources.{}", name), url)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Rules from `rules_path`, or an empty rule set over the configured data sources
    pub fn load_rules(&self) -> Result<RuleConfig, AppError> {
        match &self.rules_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| AppError::Configuration(format!("Cannot read rules file '{}': {}", path, e)))?;
                serde_json::from_str(&text)
                    .map_err(|e| AppError::Configuration(format!("Invalid rules file '{}': {}", path, e)))
            }
            None => Ok(RuleConfig {
                data_sources: self.data_sources.keys().cloned().collect(),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        // Clear environment variables for this test
        env::remove_var("HOST");
        env::remove_var("PORT");
        env::remove_var("RULES_PATH");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.engine.query_timeout(), Duration::from_secs(30));
        assert!(config.engine.max_connections_per_query >= 1);
    }

    #[test]
    fn test_parse_data_sources() {
        let parsed = parse_data_sources("ds_0=sqlite::memory:, ds_1=postgres://u:p@h/db").unwrap();
        assert_eq!(parsed[0], ("ds_0".to_string(), "sqlite::memory:".to_string()));
        assert_eq!(parsed[1].1, "postgres://u:p@h/db");
        assert!(parse_data_sources("nonsense").is_err());
    }

    #[test]
    fn test_load_rules_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"data_sources": ["ds_0"], "broadcast_tables": ["dict"]}}"#).unwrap();
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                style: "auto".to_string(),
            },
            engine: EngineConfig::default(),
            data_sources: BTreeMap::new(),
            rules_path: Some(file.path().display().to_string()),
        };
        let rules = config.load_rules().unwrap();
        assert_eq!(rules.broadcast_tables, vec!["dict".to_string()]);

        let missing = Config {
            rules_path: Some("/nonexistent/rules.json".to_string()),
            ..config
        };
        assert!(matches!(missing.load_rules(), Err(AppError::Configuration(_))));
    }
}
