use std::path::PathBuf;

use commitscan_core::OrchestratorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Defaults without any file or environment input. Used by tests and as
    /// the base the loader layers onto.
    pub fn with_orchestrator(orchestrator: OrchestratorConfig) -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            orchestrator,
            metadata: ConfigMetadata::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `None` runs the orchestrator on the in-process store.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
