//! Bootstrap configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! environment variables. The resolved [`Config`] is passed explicitly into
//! the orchestrator; nothing reads the environment after loading.

use crate::error::BootstrapError;
use crate::seed::Department;
use crate::steps::FailurePolicy;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an optional TOML overlay file.
pub const CONFIG_PATH_ENV: &str = "BOOTSTRAP_CONFIG";

/// Password used for the seeded administrator when none is configured.
pub const FALLBACK_ADMIN_PASSWORD: &str = "admin123";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub readiness: ReadinessConfig,
    pub server: ServerConfig,
    pub health: HealthConfig,
    pub steps: StepsConfig,
    pub seed: SeedConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    /// Full connection URL; when set it wins over the individual parts.
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub interval_seconds: u64,
    pub attempt_timeout_seconds: u64,
    /// `None` waits forever.
    pub max_wait_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Replace this process with the server. No bootstrap liveness listener
    /// is started; health checks target the application's own path.
    Exec,
    /// Run the server as a child and keep the liveness endpoint up.
    Supervise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub command: String,
    pub app: String,
    pub bind_host: String,
    pub port: u16,
    pub workers: u32,
    pub threads: u32,
    pub timeout_seconds: u64,
    pub handoff: HandoffMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// `0` disables the liveness listener.
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepsConfig {
    pub manage_command: String,
    pub command_timeout_seconds: u64,
    pub migrations_dir: Option<PathBuf>,
    pub collectstatic_policy: FailurePolicy,
    pub cache_table: String,
    pub enable_compress: bool,
    pub enable_clear_sessions: bool,
    pub enable_schema_export: bool,
    pub enable_security_audit: bool,
    pub schema_export_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub admin_username: String,
    pub admin_email: String,
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
    pub admin_policy: FailurePolicy,
    pub seed_departments: bool,
    pub departments: Vec<Department>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: None,
            database: "hospital_db".to_string(),
            url: None,
            max_connections: 5,
            acquire_timeout_seconds: 30,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1,
            attempt_timeout_seconds: 5,
            max_wait_seconds: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "gunicorn".to_string(),
            app: "hospital_management.wsgi:application".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 3,
            threads: 2,
            timeout_seconds: 120,
            handoff: HandoffMode::Exec,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            path: "/health/".to_string(),
        }
    }
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            manage_command: "python manage.py".to_string(),
            command_timeout_seconds: 300,
            migrations_dir: None,
            collectstatic_policy: FailurePolicy::Fatal,
            cache_table: "cache_table".to_string(),
            enable_compress: true,
            enable_clear_sessions: true,
            enable_schema_export: true,
            enable_security_audit: true,
            schema_export_path: PathBuf::from("schema.yml"),
        }
    }
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            admin_username: "admin".to_string(),
            admin_email: "admin@hospital.com".to_string(),
            admin_password: None,
            admin_policy: FailurePolicy::Fatal,
            seed_departments: true,
            departments: Department::defaults(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from the file named by `BOOTSTRAP_CONFIG` (if any) and the
    /// process environment.
    pub fn load() -> Result<Self, BootstrapError> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load from an optional TOML file, then overlay values from `lookup`.
    pub fn load_from<F>(path: Option<&Path>, lookup: F) -> Result<Self, BootstrapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    BootstrapError::Config(format!("reading {}: {}", path.display(), e))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, BootstrapError> {
        toml::from_str(raw).map_err(|e| BootstrapError::Config(format!("invalid TOML: {}", e)))
    }

    /// Overlay environment values onto the current configuration.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), BootstrapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        // Database
        env.string("DB_HOST", &mut self.database.host);
        env.parse("DB_PORT", &mut self.database.port)?;
        env.string("DB_NAME", &mut self.database.database);
        env.string("DB_USER", &mut self.database.username);
        env.optional_string("DB_PASSWORD", &mut self.database.password);
        env.optional_string("DATABASE_URL", &mut self.database.url);
        env.parse("DB_MAX_CONNECTIONS", &mut self.database.max_connections)?;

        // Readiness
        env.parse("READINESS_INTERVAL_SECS", &mut self.readiness.interval_seconds)?;
        env.parse(
            "READINESS_ATTEMPT_TIMEOUT_SECS",
            &mut self.readiness.attempt_timeout_seconds,
        )?;
        env.optional_parse("READINESS_MAX_WAIT_SECS", &mut self.readiness.max_wait_seconds)?;

        // Server handoff
        env.string("SERVER_COMMAND", &mut self.server.command);
        env.string("SERVER_APP", &mut self.server.app);
        env.string("SERVER_BIND_HOST", &mut self.server.bind_host);
        env.parse("PORT", &mut self.server.port)?;
        env.parse("SERVER_WORKERS", &mut self.server.workers)?;
        env.parse("SERVER_THREADS", &mut self.server.threads)?;
        env.parse("SERVER_TIMEOUT", &mut self.server.timeout_seconds)?;
        env.parse("HANDOFF_MODE", &mut self.server.handoff)?;

        // Liveness
        env.parse("HEALTH_PORT", &mut self.health.port)?;
        env.string("HEALTH_PATH", &mut self.health.path);

        // Steps
        env.string("MANAGE_COMMAND", &mut self.steps.manage_command);
        env.parse("COMMAND_TIMEOUT_SECS", &mut self.steps.command_timeout_seconds)?;
        if let Some(dir) = env.get("MIGRATIONS_DIR") {
            self.steps.migrations_dir = Some(PathBuf::from(dir));
        }
        env.parse("COLLECTSTATIC_POLICY", &mut self.steps.collectstatic_policy)?;
        env.string("CACHE_TABLE", &mut self.steps.cache_table);
        env.flag("ENABLE_COMPRESS", &mut self.steps.enable_compress)?;
        env.flag("ENABLE_CLEAR_SESSIONS", &mut self.steps.enable_clear_sessions)?;
        env.flag("ENABLE_SCHEMA_EXPORT", &mut self.steps.enable_schema_export)?;
        env.flag("ENABLE_SECURITY_AUDIT", &mut self.steps.enable_security_audit)?;
        if let Some(path) = env.get("SCHEMA_EXPORT_PATH") {
            self.steps.schema_export_path = PathBuf::from(path);
        }

        // Seeding
        env.string("ADMIN_USERNAME", &mut self.seed.admin_username);
        env.string("ADMIN_EMAIL", &mut self.seed.admin_email);
        env.optional_string("ADMIN_PASSWORD", &mut self.seed.admin_password);
        env.parse("ADMIN_SEED_POLICY", &mut self.seed.admin_policy)?;
        env.flag("SEED_DEPARTMENTS", &mut self.seed.seed_departments)?;

        // Logging
        env.parse("LOG_FORMAT", &mut self.logging.format)?;
        env.string("RUST_LOG", &mut self.logging.filter);

        Ok(())
    }

    pub fn validate(&self) -> Result<(), BootstrapError> {
        let fail = |msg: String| Err(BootstrapError::Config(msg));

        if self.readiness.interval_seconds == 0 {
            return fail("READINESS_INTERVAL_SECS must be at least 1".into());
        }
        if self.readiness.attempt_timeout_seconds == 0 {
            return fail("READINESS_ATTEMPT_TIMEOUT_SECS must be at least 1".into());
        }
        if self.server.workers == 0 || self.server.threads == 0 {
            return fail("SERVER_WORKERS and SERVER_THREADS must be at least 1".into());
        }
        if self.server.command.trim().is_empty() {
            return fail("SERVER_COMMAND must not be empty".into());
        }
        if self.steps.manage_command.trim().is_empty() {
            return fail("MANAGE_COMMAND must not be empty".into());
        }
        if !crate::db::is_plain_identifier(&self.steps.cache_table) {
            return fail(format!(
                "CACHE_TABLE '{}' is not a plain SQL identifier",
                self.steps.cache_table
            ));
        }
        if !self.health.path.starts_with('/') {
            return fail(format!("HEALTH_PATH '{}' must start with '/'", self.health.path));
        }
        if self.seed.admin_username.trim().is_empty() {
            return fail("ADMIN_USERNAME must not be empty".into());
        }

        let mut seen = std::collections::HashSet::new();
        for department in &self.seed.departments {
            if department.floor_number < 0 {
                return fail(format!(
                    "department '{}' has a negative floor number",
                    department.name
                ));
            }
            if !seen.insert(department.name.as_str()) {
                return fail(format!("department '{}' is declared twice", department.name));
            }
        }

        Ok(())
    }

    /// Connection options for the configured database.
    pub fn connect_options(&self) -> Result<PgConnectOptions, BootstrapError> {
        match &self.database.url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| BootstrapError::Config(format!("invalid DATABASE_URL: {}", e))),
            None => {
                let mut options = PgConnectOptions::new()
                    .host(&self.database.host)
                    .port(self.database.port)
                    .username(&self.database.username)
                    .database(&self.database.database);
                if let Some(password) = &self.database.password {
                    options = options.password(password);
                }
                Ok(options)
            }
        }
    }

    /// `user@host:port/db`, safe to log.
    pub fn database_display(&self) -> String {
        match &self.database.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!(
                "{}@{}:{}/{}",
                self.database.username, self.database.host, self.database.port, self.database.database
            ),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.readiness.interval_seconds)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness.attempt_timeout_seconds)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.readiness.max_wait_seconds.map(Duration::from_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.steps.command_timeout_seconds)
    }

    /// The configured administrator password, and whether the built-in
    /// fallback was used instead.
    pub fn admin_password(&self) -> (String, bool) {
        match &self.seed.admin_password {
            Some(password) if !password.is_empty() => (password.clone(), false),
            _ => (FALLBACK_ADMIN_PASSWORD.to_string(), true),
        }
    }
}

impl FromStr for HandoffMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exec" => Ok(HandoffMode::Exec),
            "supervise" => Ok(HandoffMode::Supervise),
            other => Err(format!("unknown handoff mode '{}' (expected exec or supervise)", other)),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}' (expected text or json)", other)),
        }
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.get(key) {
            *slot = value;
        }
    }

    fn optional_string(&self, key: &str, slot: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            *slot = Some(value);
        }
    }

    fn parse<T>(&self, key: &str, slot: &mut T) -> Result<(), BootstrapError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(key) {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e| BootstrapError::Config(format!("{}='{}': {}", key, raw, e)))?;
        }
        Ok(())
    }

    fn optional_parse<T>(&self, key: &str, slot: &mut Option<T>) -> Result<(), BootstrapError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(key) {
            let value = raw
                .trim()
                .parse()
                .map_err(|e| BootstrapError::Config(format!("{}='{}': {}", key, raw, e)))?;
            *slot = Some(value);
        }
        Ok(())
    }

    fn flag(&self, key: &str, slot: &mut bool) -> Result<(), BootstrapError> {
        if let Some(raw) = self.get(key) {
            *slot = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(BootstrapError::Config(format!(
                        "{}='{}': expected a boolean",
                        key, raw
                    )))
                }
            };
        }
        Ok(())
    }
}
