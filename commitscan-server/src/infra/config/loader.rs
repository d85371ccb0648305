use once_cell::sync::Lazy;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use url::Url;

use super::{
    models::{Config, ConfigMetadata, DatabaseConfig, ServerConfig},
    sources::{EnvConfig, FileConfig},
};
use commitscan_core::OrchestratorConfig;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("commitscan.toml"),
        PathBuf::from("config/commitscan.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    fn push(&mut self, message: impl Into<String>, hint: Option<&str>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: hint.map(str::to_string),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        compose_config(
            file_config.unwrap_or_default(),
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env_config.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.clone(),
                None => return Ok((None, None)),
            },
        };

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

/// Layer environment overrides onto the file values and validate the result.
pub fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let defaults = ServerConfig::default();
    let port = match env.server_port {
        Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
            ConfigLoadError::InvalidValue {
                key: "SERVER_PORT",
                value: raw,
            }
        })?,
        None => file.server.port.unwrap_or(defaults.port),
    };
    let server = ServerConfig {
        host: env.server_host.or(file.server.host).unwrap_or(defaults.host),
        port,
    };

    let database_url = env.database_url.or(file.database.url);
    if let Some(url) = &database_url {
        Url::parse(url)
            .map_err(|source| ConfigLoadError::InvalidDatabaseUrl { source })?;
    }
    let database = DatabaseConfig {
        url: database_url,
        max_connections: file
            .database
            .max_connections
            .unwrap_or(DatabaseConfig::default().max_connections),
    };

    let mut orchestrator = file.orchestrator;
    if let Some(raw) = env.workers {
        orchestrator.workers.count = raw.trim().parse::<usize>().map_err(
            |_| ConfigLoadError::InvalidValue {
                key: "COMMITSCAN_WORKERS",
                value: raw,
            },
        )?;
    }

    let warnings = validate(&orchestrator, &database)?;

    Ok(ConfigLoad {
        config: Config {
            server,
            database,
            orchestrator,
            metadata,
        },
        warnings,
    })
}

fn validate(
    orchestrator: &OrchestratorConfig,
    database: &DatabaseConfig,
) -> Result<ConfigWarnings, ConfigLoadError> {
    let guard = |ok: bool, message: &str| {
        if ok {
            Ok(())
        } else {
            Err(ConfigLoadError::GuardRail(message.to_string()))
        }
    };

    guard(orchestrator.workers.count > 0, "workers.count must be at least 1")?;
    guard(
        orchestrator.workers.claim_batch > 0,
        "workers.claim_batch must be at least 1",
    )?;
    guard(
        orchestrator.workers.write_attempts > 0,
        "workers.write_attempts must be at least 1",
    )?;
    guard(
        orchestrator.lease.renew_at_fraction > 0.0
            && orchestrator.lease.renew_at_fraction < 1.0,
        "lease.renew_at_fraction must be within (0, 1)",
    )?;
    guard(
        (0.0..=1.0).contains(&orchestrator.retry.jitter_ratio),
        "retry.jitter_ratio must be within [0, 1]",
    )?;
    guard(
        orchestrator.retry.backoff_base_ms <= orchestrator.retry.backoff_max_ms,
        "retry.backoff_base_ms must not exceed retry.backoff_max_ms",
    )?;
    guard(
        orchestrator.measures.chunk_size > 0,
        "measures.chunk_size must be at least 1",
    )?;

    let mut seen = HashSet::new();
    for instance in &orchestrator.instances {
        if !seen.insert(instance.id.as_str()) {
            return Err(ConfigLoadError::GuardRail(format!(
                "instance id '{}' is configured twice",
                instance.id
            )));
        }
        guard(
            instance.capacity > 0,
            "instance capacity must be at least 1",
        )?;
    }

    let mut warnings = ConfigWarnings::default();
    if orchestrator.instances.iter().all(|instance| !instance.enabled) {
        warnings.push(
            "no enabled analysis instances; jobs will wait in the queue",
            Some("add [[orchestrator.instances]] entries to the config file"),
        );
    }
    if database.url.is_none() {
        warnings.push(
            "no database configured; scan jobs live in memory only",
            Some("set DATABASE_URL or [database].url for durable jobs"),
        );
    }
    Ok(warnings)
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid database URL")]
    InvalidDatabaseUrl {
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    GuardRail(String),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> FileConfig {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn file_values_fill_orchestrator_sections() {
        let file = parse(
            r#"
            [server]
            port = 9090

            [orchestrator.workers]
            count = 2

            [orchestrator.retry]
            default_max_retries = 5

            [[orchestrator.instances]]
            id = "sonar-a"
            base_url = "http://sonar-a:9000"
            token = "squ_a"
            capacity = 3
            "#,
        );
        let load = compose_config(
            file,
            EnvConfig::default(),
            ConfigMetadata::default(),
        )
        .unwrap();

        assert_eq!(load.config.server.port, 9090);
        assert_eq!(load.config.orchestrator.workers.count, 2);
        assert_eq!(load.config.orchestrator.retry.default_max_retries, 5);
        assert_eq!(load.config.orchestrator.max_concurrency(), 3);
        // only the missing database is worth a warning
        assert_eq!(load.warnings.items.len(), 1);
    }

    #[test]
    fn environment_overrides_file() {
        let file = parse(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9090
            [database]
            url = "postgres://file@localhost/scans"
            "#,
        );
        let env = EnvConfig {
            database_url: Some("postgres://env@localhost/scans".into()),
            server_port: Some("7000".into()),
            workers: Some("8".into()),
            ..EnvConfig::default()
        };
        let config =
            compose_config(file, env, ConfigMetadata::default()).unwrap().config;

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://env@localhost/scans")
        );
        assert_eq!(config.orchestrator.workers.count, 8);
    }

    #[test]
    fn rejects_duplicate_instances_and_bad_numbers() {
        let file = parse(
            r#"
            [[orchestrator.instances]]
            id = "sq"
            base_url = "http://a:9000"
            [[orchestrator.instances]]
            id = "sq"
            base_url = "http://b:9000"
            "#,
        );
        let err = compose_config(
            file,
            EnvConfig::default(),
            ConfigMetadata::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::GuardRail(_)));

        let env = EnvConfig {
            workers: Some("many".into()),
            ..EnvConfig::default()
        };
        let err =
            compose_config(FileConfig::default(), env, ConfigMetadata::default())
                .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidValue { key: "COMMITSCAN_WORKERS", .. }
        ));
    }

    #[test]
    fn bundled_sample_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("config")
            .join("commitscan.toml");
        let file = read_file_config(&path).unwrap();
        let load = compose_config(
            file,
            EnvConfig::default(),
            ConfigMetadata::default(),
        )
        .unwrap();
        assert_eq!(load.config.orchestrator.instances.len(), 1);
        assert_eq!(load.config.orchestrator.max_concurrency(), 2);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = ConfigLoader::new()
            .with_config_path(&missing)
            .with_env_file(dir.path().join(".env"))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }
}
