/// Configuration management for the geoflow engine
///
/// Handles server binding, run persistence and engine behaviour (backend precedence,
/// process environment inheritance, output folder).

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Run history database
    pub database: DatabaseConfig,
    /// Pipeline engine configuration
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Run history database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection url (default: "sqlite://geoflow.db")
    pub url: String,
}

/// Engine configuration, passed explicitly into the registry and the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend names, highest precedence first
    ///
    /// When two backends register the same type name, the one listed first wins.
    /// Backends not listed rank below every listed backend; among those the last
    /// registration wins.
    pub backend_precedence: Vec<String>,

    /// Whether `${NAME}` tokens may fall back to the process environment
    pub inherit_process_env: bool,

    /// Base folder for run outputs (default: "output")
    pub output_folder: String,
}

impl EngineConfig {
    /// Rank of a backend, lower is stronger; unlisted backends share the weakest rank
    pub fn backend_rank(&self, backend: &str) -> usize {
        self.backend_precedence
            .iter()
            .position(|b| b.eq_ignore_ascii_case(backend))
            .unwrap_or(self.backend_precedence.len())
    }

    /// Read engine settings from `GEOFLOW_*` environment variables
    pub fn from_env() -> Self {
        Self {
            backend_precedence: std::env::var("GEOFLOW_BACKENDS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            inherit_process_env: std::env::var("GEOFLOW_INHERIT_ENV")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            output_folder: std::env::var("GEOFLOW_OUTPUT_FOLDER").unwrap_or_else(|_| "output".to_string()),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("GEOFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("GEOFLOW_PORT")
                    .unwrap_or_else(|_| "3004".to_string())
                    .parse()
                    .unwrap_or(3004),
            },
            database: DatabaseConfig {
                url: std::env::var("GEOFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://geoflow.db".to_string()),
            },
            engine: EngineConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_backends_rank_last() {
        let config = EngineConfig {
            backend_precedence: vec!["gdal".into(), "core".into()],
            ..EngineConfig::default()
        };
        assert_eq!(config.backend_rank("GDAL"), 0);
        assert_eq!(config.backend_rank("core"), 1);
        assert_eq!(config.backend_rank("plugin"), 2);
    }
}
