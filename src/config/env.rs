//! Environment variable loading.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use super::{AuthApiSecret, ServerConfig, TlsConfig, parse_auth_api_secrets_json};

/// Every variable the relay reads.
pub(crate) const ENV_KEYS: &[&str] = &[
    "HOST",
    "PORT",
    "RELAY_PATH",
    "TLS_CERT_PATH",
    "TLS_KEY_PATH",
    "UPSTREAM_URL",
    "UPSTREAM_MODEL",
    "UPSTREAM_API_KEY",
    "OPENAI_API_KEY",
    "UPSTREAM_HEADERS_JSON",
    "RELAY_DEFAULT_VOICE",
    "TRANSCRIPTION_MODEL",
    "HISTORY_LIMIT",
    "SETTINGS_TIMEOUT_MS",
    "AUTH_REQUIRED",
    "AUTH_API_SECRETS_JSON",
    "AUTH_API_SECRET",
    "AUTH_API_SECRET_ID",
    "CORS_ALLOWED_ORIGINS",
    "MAX_CONNECTIONS",
    "MAX_CONNECTIONS_PER_IP",
];

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid {key} '{raw}': {e}").into()),
        None => Ok(None),
    }
}

fn parse_bool(key: &str) -> Option<bool> {
    var(key).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Build a configuration from defaults and environment variables.
pub(crate) fn load_from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();

    if let Some(host) = var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_var::<u16>("PORT")? {
        config.port = port;
    }
    if let Some(path) = var("RELAY_PATH") {
        config.relay_path = path;
    }
    config.tls = match (var("TLS_CERT_PATH"), var("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".into()),
    };

    if let Some(url) = var("UPSTREAM_URL") {
        config.upstream_url = url;
    }
    if let Some(model) = var("UPSTREAM_MODEL") {
        config.upstream_model = model;
    }
    config.upstream_api_key = var("UPSTREAM_API_KEY").or_else(|| var("OPENAI_API_KEY"));
    if let Some(json) = var("UPSTREAM_HEADERS_JSON") {
        config.upstream_headers = serde_json::from_str::<HashMap<String, String>>(&json)
            .map_err(|e| format!("Invalid UPSTREAM_HEADERS_JSON format: {e}"))?;
    }
    config.default_voice = var("RELAY_DEFAULT_VOICE");
    if let Some(model) = var("TRANSCRIPTION_MODEL") {
        config.transcription_model = model;
    }

    if let Some(limit) = parse_var::<usize>("HISTORY_LIMIT")? {
        config.history_limit = limit;
    }
    if let Some(timeout) = parse_var::<u64>("SETTINGS_TIMEOUT_MS")? {
        config.settings_timeout_ms = timeout;
    }

    config.auth_required = parse_bool("AUTH_REQUIRED").unwrap_or(false);
    config.auth_api_secrets = match (var("AUTH_API_SECRETS_JSON"), var("AUTH_API_SECRET")) {
        (Some(json), _) => parse_auth_api_secrets_json(&json)?,
        (None, Some(secret)) => vec![AuthApiSecret {
            id: var("AUTH_API_SECRET_ID").unwrap_or_else(|| "default".to_string()),
            secret,
        }],
        (None, None) => Vec::new(),
    };

    config.cors_allowed_origins = var("CORS_ALLOWED_ORIGINS");
    config.max_connections = parse_var::<usize>("MAX_CONNECTIONS")?;
    if let Some(per_ip) = parse_var::<u32>("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = per_ip;
    }

    Ok(config)
}
