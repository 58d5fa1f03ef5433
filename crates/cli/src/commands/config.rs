use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use expensa_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

/// One rendered setting: dotted key, display value, and the env var that
/// can override it.
struct Setting {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(settings(&config).into_iter().map(|setting| {
        let source = field_source(&setting, file_doc.as_ref(), file_path.as_deref());
        format!("- {} = {} (source: {source})", setting.key, setting.value)
    }));
    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let setting = |key, value: String, env_key| Setting { key, value, env_key };
    vec![
        setting("database.url", config.database.url.clone(), "EXPENSA_DATABASE_URL"),
        setting(
            "database.max_connections",
            config.database.max_connections.to_string(),
            "EXPENSA_DATABASE_MAX_CONNECTIONS",
        ),
        setting(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "EXPENSA_DATABASE_TIMEOUT_SECS",
        ),
        setting("server.bind_address", config.server.bind_address.clone(), "EXPENSA_SERVER_BIND_ADDRESS"),
        setting("server.port", config.server.port.to_string(), "EXPENSA_SERVER_PORT"),
        setting(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "EXPENSA_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        setting("currency.enabled", config.currency.enabled.to_string(), "EXPENSA_CURRENCY_ENABLED"),
        setting("currency.base_url", config.currency.base_url.clone(), "EXPENSA_CURRENCY_BASE_URL"),
        setting("currency.api_key", redact(config.currency.api_key.as_ref()), "EXPENSA_CURRENCY_API_KEY"),
        setting(
            "currency.timeout_secs",
            config.currency.timeout_secs.to_string(),
            "EXPENSA_CURRENCY_TIMEOUT_SECS",
        ),
        setting(
            "approvals.no_rule_policy",
            config.approvals.no_rule_policy.as_str().to_string(),
            "EXPENSA_APPROVALS_NO_RULE_POLICY",
        ),
        setting("logging.level", config.logging.level.clone(), "EXPENSA_LOGGING_LEVEL"),
        setting("logging.format", format!("{:?}", config.logging.format), "EXPENSA_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("expensa.toml"), PathBuf::from("config/expensa.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(setting: &Setting, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if env::var_os(setting.env_key).is_some() {
        return format!("env ({})", setting.env_key);
    }

    if file_doc.is_some_and(|doc| contains_path(doc, setting.key)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact(secret: Option<&SecretString>) -> String {
    match secret {
        None => "<unset>".to_string(),
        Some(secret) if secret.expose_secret().trim().is_empty() => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
