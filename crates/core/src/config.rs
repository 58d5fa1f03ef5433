use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::NoRulePolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub currency: CurrencyConfig,
    pub approvals: ApprovalsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Exchange-rate service used to normalize expense amounts.
#[derive(Clone, Debug)]
pub struct CurrencyConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ApprovalsConfig {
    pub no_rule_policy: NoRulePolicy,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub currency_enabled: Option<bool>,
    pub currency_base_url: Option<String>,
    pub currency_api_key: Option<String>,
    pub no_rule_policy: Option<NoRulePolicy>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://expensa.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            currency: CurrencyConfig {
                enabled: false,
                base_url: "https://api.exchangerate-api.com/v4".to_string(),
                api_key: None,
                timeout_secs: 10,
            },
            approvals: ApprovalsConfig { no_rule_policy: NoRulePolicy::DefaultApprover },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("expensa.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            overwrite(&mut self.database.url, database.url);
            overwrite(&mut self.database.max_connections, database.max_connections);
            overwrite(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(server) = patch.server {
            overwrite(&mut self.server.bind_address, server.bind_address);
            overwrite(&mut self.server.port, server.port);
            overwrite(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }

        if let Some(currency) = patch.currency {
            overwrite(&mut self.currency.enabled, currency.enabled);
            overwrite(&mut self.currency.base_url, currency.base_url);
            overwrite(&mut self.currency.timeout_secs, currency.timeout_secs);
            if currency.api_key.is_some() {
                self.currency.api_key = currency.api_key.map(secret_value);
            }
        }

        if let Some(policy) = patch.approvals.and_then(|approvals| approvals.no_rule_policy) {
            self.approvals.no_rule_policy = parse_policy("approvals.no_rule_policy", &policy)?;
        }

        if let Some(logging) = patch.logging {
            overwrite(&mut self.logging.level, logging.level);
            overwrite(&mut self.logging.format, logging.format);
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        overwrite(&mut self.database.url, read_env("EXPENSA_DATABASE_URL"));
        overwrite(&mut self.database.max_connections, parse_env("EXPENSA_DATABASE_MAX_CONNECTIONS")?);
        overwrite(&mut self.database.timeout_secs, parse_env("EXPENSA_DATABASE_TIMEOUT_SECS")?);

        overwrite(&mut self.server.bind_address, read_env("EXPENSA_SERVER_BIND_ADDRESS"));
        overwrite(&mut self.server.port, parse_env("EXPENSA_SERVER_PORT")?);
        overwrite(
            &mut self.server.graceful_shutdown_secs,
            parse_env("EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS")?,
        );

        overwrite(&mut self.currency.enabled, parse_env("EXPENSA_CURRENCY_ENABLED")?);
        overwrite(&mut self.currency.base_url, read_env("EXPENSA_CURRENCY_BASE_URL"));
        overwrite(&mut self.currency.timeout_secs, parse_env("EXPENSA_CURRENCY_TIMEOUT_SECS")?);
        if let Some(value) = read_env("EXPENSA_CURRENCY_API_KEY") {
            self.currency.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("EXPENSA_APPROVALS_NO_RULE_POLICY") {
            self.approvals.no_rule_policy = parse_policy("EXPENSA_APPROVALS_NO_RULE_POLICY", &value)?;
        }

        let log_level = read_env("EXPENSA_LOGGING_LEVEL").or_else(|| read_env("EXPENSA_LOG_LEVEL"));
        overwrite(&mut self.logging.level, log_level);
        let log_format =
            read_env("EXPENSA_LOGGING_FORMAT").or_else(|| read_env("EXPENSA_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        overwrite(&mut self.database.url, overrides.database_url);
        overwrite(&mut self.logging.level, overrides.log_level);
        overwrite(&mut self.server.port, overrides.server_port);
        overwrite(&mut self.currency.enabled, overrides.currency_enabled);
        overwrite(&mut self.currency.base_url, overrides.currency_base_url);
        overwrite(&mut self.approvals.no_rule_policy, overrides.no_rule_policy);
        if let Some(api_key) = overrides.currency_api_key {
            self.currency.api_key = Some(secret_value(api_key));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_currency(&self.currency)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("expensa.toml"), PathBuf::from("config/expensa.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_currency(currency: &CurrencyConfig) -> Result<(), ConfigError> {
    if currency.timeout_secs == 0 || currency.timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "currency.timeout_secs must be in range 1..=60".to_string(),
        ));
    }

    let base_url = currency.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "currency.base_url must start with http:// or https://".to_string(),
        ));
    }

    let blank_key =
        currency.api_key.as_ref().is_some_and(|value| value.expose_secret().trim().is_empty());
    if blank_key {
        return Err(ConfigError::Validation(
            "currency.api_key must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_policy(key: &str, value: &str) -> Result<NoRulePolicy, ConfigError> {
    NoRulePolicy::parse(value).ok_or_else(|| ConfigError::Validation(format!(
        "{key} must be one of default_approver|auto_approve|reject (got `{value}`)"
    )))
}

/// Reads and parses an env override; a present but unparsable value is an error.
fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    read_env(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}

fn overwrite<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    currency: Option<CurrencyPatch>,
    approvals: Option<ApprovalsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CurrencyPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApprovalsPatch {
    no_rule_policy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
