use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use esgflow_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let policy = config.sla.policy;
    let fields = vec![
        field(
            "database.url",
            redact_database_url(&config.database.url),
            &["ESGFLOW_DATABASE_URL"],
        ),
        field(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["ESGFLOW_DATABASE_MAX_CONNECTIONS"],
        ),
        field(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["ESGFLOW_DATABASE_TIMEOUT_SECS"],
        ),
        field(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["ESGFLOW_SERVER_BIND_ADDRESS"],
        ),
        field("server.port", config.server.port.to_string(), &["ESGFLOW_SERVER_PORT"]),
        field(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["ESGFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        field(
            "sla.poll_interval_secs",
            config.sla.poll_interval_secs.to_string(),
            &["ESGFLOW_SLA_POLL_INTERVAL_SECS"],
        ),
        field(
            "sla.critical_overdue_hours",
            config.sla.critical_overdue_hours.to_string(),
            &["ESGFLOW_SLA_CRITICAL_OVERDUE_HOURS"],
        ),
        field("sla.critical_hours", policy.critical_hours.to_string(), &[]),
        field("sla.high_hours", policy.high_hours.to_string(), &[]),
        field("sla.medium_hours", policy.medium_hours.to_string(), &[]),
        field("sla.low_hours", policy.low_hours.to_string(), &[]),
        field(
            "logging.level",
            config.logging.level.clone(),
            &["ESGFLOW_LOGGING_LEVEL", "ESGFLOW_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["ESGFLOW_LOGGING_FORMAT", "ESGFLOW_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in fields {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

type Field = (&'static str, String, &'static [&'static str]);

fn field(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Field {
    (key, value, env_keys)
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("esgflow.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/esgflow.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
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

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Masks a password embedded in a URL's authority section.
fn redact_database_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) if credentials.contains(':') => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        _ => url.to_string(),
    }
}
