// Worker configuration
//
// Loaded from environment variables, optionally seeded from `.env` files.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pgq_queue::PoolConfig;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Configuration errors. All of them abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Load `.env.{APP_ENVIRONMENT}` and then `.env`.
///
/// dotenvy never overrides variables that are already set, so real
/// environment variables win over the environment file, which wins over the
/// base file. Returns the environment name and the files that were loaded.
pub fn load_env_files() -> (String, Vec<PathBuf>) {
    let environment = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "local".to_string());

    let loaded = [
        dotenvy::from_filename(format!(".env.{}", environment)),
        dotenvy::dotenv(),
    ]
    .into_iter()
    .filter_map(Result::ok)
    .collect();

    (environment, loaded)
}

/// Database coordinates
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the individual fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: PgSslMode,
}

impl DatabaseConfig {
    /// Build sqlx connect options
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url);
        }

        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
            .ssl_mode(self.ssl_mode))
    }
}

// Credentials stay out of logs
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Complete worker configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Deployment environment name (`APP_ENVIRONMENT`)
    pub environment: String,
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    /// Apply the embedded migration before starting workers
    pub run_migrations: bool,
    /// Human-readable logs instead of JSON
    pub pretty_log: bool,
}

impl AppConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `APP_ENVIRONMENT`: Environment name (default: "local")
    /// - `DATABASE_URL`: Full connection URL, or the individual parts below
    /// - `DATABASE_HOST`, `DATABASE_NAME`: Required without `DATABASE_URL`
    /// - `DATABASE_PORT` (5432), `DATABASE_USER` ("postgres"), `DATABASE_PASSWORD` ("")
    /// - `DATABASE_SSLMODE`: sqlx ssl mode (default: "disable")
    /// - `WORKER_POOL_SIZE` (10), `WORKER_BATCH_SIZE` (1000)
    /// - `WORKER_GRACE_PERIOD_MS` (3000), `WORKER_ERROR_CAPACITY` (256)
    /// - `WORKER_ERROR_SEND_TIMEOUT_MS` (1000), `WORKER_ERROR_BACKOFF_MS` (1000)
    /// - `WORKER_PROGRESS_INTERVAL_MS` (5000)
    /// - `WORKER_RUN_MIGRATIONS`: "true" to migrate on startup
    /// - `PRETTY_LOG`: "true" for human-readable logs
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let url = vars.get("DATABASE_URL");
        let (host, name) = if url.is_some() {
            (
                vars.get("DATABASE_HOST").unwrap_or_default(),
                vars.get("DATABASE_NAME").unwrap_or_default(),
            )
        } else {
            (vars.require("DATABASE_HOST")?, vars.require("DATABASE_NAME")?)
        };

        let ssl_mode = match vars.get("DATABASE_SSLMODE") {
            Some(value) => PgSslMode::from_str(&value).map_err(|_| ConfigError::Invalid {
                name: "DATABASE_SSLMODE",
                value,
            })?,
            None => PgSslMode::Disable,
        };

        let database = DatabaseConfig {
            url,
            host,
            port: vars.parse("DATABASE_PORT", 5432)?,
            user: vars.get("DATABASE_USER").unwrap_or_else(|| "postgres".to_string()),
            password: vars.get("DATABASE_PASSWORD").unwrap_or_default(),
            name,
            ssl_mode,
        };

        let defaults = PoolConfig::default();
        let pool = PoolConfig::new(
            vars.parse("WORKER_POOL_SIZE", defaults.pool_size)?,
            vars.parse("WORKER_BATCH_SIZE", defaults.batch_size)?,
        )
        .with_grace_period(vars.millis("WORKER_GRACE_PERIOD_MS", defaults.grace_period)?)
        .with_error_capacity(vars.parse("WORKER_ERROR_CAPACITY", defaults.error_capacity)?)
        .with_error_send_timeout(vars.millis(
            "WORKER_ERROR_SEND_TIMEOUT_MS",
            defaults.error_send_timeout,
        )?)
        .with_error_backoff(vars.millis("WORKER_ERROR_BACKOFF_MS", defaults.error_backoff)?)
        .with_progress_interval(vars.millis(
            "WORKER_PROGRESS_INTERVAL_MS",
            defaults.progress_interval,
        )?);

        for (name, value) in [
            ("WORKER_POOL_SIZE", pool.pool_size),
            ("WORKER_BATCH_SIZE", pool.batch_size),
            ("WORKER_ERROR_CAPACITY", pool.error_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                });
            }
        }

        Ok(Self {
            environment: vars
                .get("APP_ENVIRONMENT")
                .unwrap_or_else(|| "local".to_string()),
            database,
            pool,
            run_migrations: vars.flag("WORKER_RUN_MIGRATIONS"),
            pretty_log: vars.flag("PRETTY_LOG"),
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
            None => Ok(default),
        }
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let millis = self.parse(name, default.as_millis() as u64)?;
        Ok(Duration::from_millis(millis))
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_url() {
        let config =
            AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/pgq")]))
                .unwrap();

        assert_eq!(config.environment, "local");
        assert_eq!(config.pool.pool_size, 10);
        assert_eq!(config.pool.batch_size, 1000);
        assert_eq!(config.pool.grace_period, Duration::from_secs(3));
        assert!(!config.run_migrations);
        assert!(!config.pretty_log);
        assert!(config.database.connect_options().is_ok());
    }

    #[test]
    fn test_individual_database_fields() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_HOST", "db.internal"),
            ("DATABASE_PORT", "6543"),
            ("DATABASE_USER", "queue"),
            ("DATABASE_PASSWORD", "secret"),
            ("DATABASE_NAME", "jobs"),
            ("DATABASE_SSLMODE", "require"),
        ]))
        .unwrap();

        assert!(config.database.url.is_none());
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.name, "jobs");
        assert!(matches!(config.database.ssl_mode, PgSslMode::Require));

        let options = config.database.connect_options().unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("jobs"));
    }

    #[test]
    fn test_worker_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pgq"),
            ("APP_ENVIRONMENT", "staging"),
            ("WORKER_POOL_SIZE", "4"),
            ("WORKER_BATCH_SIZE", "250"),
            ("WORKER_GRACE_PERIOD_MS", "500"),
            ("WORKER_RUN_MIGRATIONS", "true"),
            ("PRETTY_LOG", "1"),
        ]))
        .unwrap();

        assert_eq!(config.environment, "staging");
        assert_eq!(config.pool.pool_size, 4);
        assert_eq!(config.pool.batch_size, 250);
        assert_eq!(config.pool.grace_period, Duration::from_millis(500));
        assert!(config.run_migrations);
        assert!(config.pretty_log);
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[("DATABASE_NAME", "jobs")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_HOST")));
    }

    #[test]
    fn test_unparseable_number_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pgq"),
            ("WORKER_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "WORKER_BATCH_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_pool_size_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pgq"),
            ("WORKER_POOL_SIZE", "0"),
        ]))
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "WORKER_POOL_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_error_capacity_is_an_error() {
        let err = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/pgq"),
            ("WORKER_ERROR_CAPACITY", "0"),
        ]))
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "WORKER_ERROR_CAPACITY",
                ..
            }
        ));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_HOST", "db"),
            ("DATABASE_NAME", "jobs"),
            ("DATABASE_PASSWORD", "hunter2"),
        ]))
        .unwrap();

        let rendered = format!("{:?}", config.database);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
