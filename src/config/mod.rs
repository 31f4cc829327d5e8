//! Relay server configuration.
//!
//! Configuration is assembled from defaults, environment variables (with `.env`
//! loaded by `main.rs`) and an optional YAML file, in increasing priority.
//!
//! # Example
//! ```rust,no_run
//! use waav_agent_relay::config::ServerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_env()?;
//! println!("Relay listening on {}{}", config.address(), config.relay_path);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use subtle::ConstantTimeEq;

mod env;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::session::DEFAULT_HISTORY_LIMIT;

pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_UPSTREAM_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_RELAY_PATH: &str = "/agent";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_SETTINGS_TIMEOUT_MS: u64 = 5000;

/// Beta header the upstream realtime endpoint requires.
const OPENAI_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "realtime=v1");

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// API secret authentication entry with a client identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthApiSecret {
    pub id: String,
    pub secret: String,
}

/// Server configuration
///
/// Contains everything needed to run the relay:
/// - Server settings (host, port, TLS, relay path)
/// - Upstream realtime service (URL, model, key, extra headers)
/// - Session limits (history, settings timeout)
/// - Authentication and connection limits
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Path clients connect to for the voice-agent protocol
    pub relay_path: String,

    // Upstream settings
    pub upstream_url: String,
    pub upstream_model: String,
    pub upstream_api_key: Option<String>,
    /// Extra headers for the upstream connection, merged under the required defaults
    pub upstream_headers: HashMap<String, String>,
    /// Voice used when a client's settings name none
    pub default_voice: Option<String>,
    pub transcription_model: String,

    // Session settings
    /// Most recent context messages replayed to upstream
    pub history_limit: usize,
    /// How long to wait for upstream to apply settings before warning the client
    pub settings_timeout_ms: u64,

    // Authentication configuration
    pub auth_api_secrets: Vec<AuthApiSecret>,
    pub auth_required: bool,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    /// Maximum concurrent relay connections. None means unlimited.
    pub max_connections: Option<usize>,
    /// Maximum connections per IP address
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            relay_path: DEFAULT_RELAY_PATH.to_string(),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            upstream_model: DEFAULT_UPSTREAM_MODEL.to_string(),
            upstream_api_key: None,
            upstream_headers: HashMap::new(),
            default_voice: None,
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            settings_timeout_ms: DEFAULT_SETTINGS_TIMEOUT_MS,
            auth_api_secrets: Vec::new(),
            auth_required: false,
            cors_allowed_origins: None,
            max_connections: None,
            max_connections_per_ip: 100,
        }
    }
}

/// Zeroize secret fields when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.upstream_api_key {
            key.zeroize();
        }
        for value in self.upstream_headers.values_mut() {
            value.zeroize();
        }
        for secret in &mut self.auth_api_secrets {
            secret.secret.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = env::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the YAML file cannot be read or is malformed, an
    /// environment variable has an invalid format, or validation fails.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = YamlConfig::from_file(path)?;
        let mut config = env::load_from_env()?;
        config.apply_yaml(yaml_config);
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(server) = yaml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if let Some(path) = server.relay_path {
                self.relay_path = path;
            }
            if let Some(tls) = server.tls {
                match (tls.enabled, tls.cert_path, tls.key_path) {
                    (Some(false), _, _) => self.tls = None,
                    (_, Some(cert), Some(key)) => {
                        self.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        })
                    }
                    _ => {}
                }
            }
        }

        if let Some(upstream) = yaml.upstream {
            if let Some(url) = upstream.url {
                self.upstream_url = url;
            }
            if let Some(model) = upstream.model {
                self.upstream_model = model;
            }
            if upstream.api_key.is_some() {
                self.upstream_api_key = upstream.api_key;
            }
            if upstream.default_voice.is_some() {
                self.default_voice = upstream.default_voice;
            }
            if let Some(model) = upstream.transcription_model {
                self.transcription_model = model;
            }
            self.upstream_headers.extend(upstream.headers);
        }

        if let Some(session) = yaml.session {
            if let Some(limit) = session.history_limit {
                self.history_limit = limit;
            }
            if let Some(timeout) = session.settings_timeout_ms {
                self.settings_timeout_ms = timeout;
            }
        }

        if let Some(auth) = yaml.auth {
            if let Some(required) = auth.required {
                self.auth_required = required;
            }
            if !auth.api_secrets.is_empty() {
                self.auth_api_secrets = auth
                    .api_secrets
                    .into_iter()
                    .map(|entry| AuthApiSecret {
                        id: entry.id,
                        secret: entry.secret,
                    })
                    .collect();
            } else if let Some(secret) = auth.api_secret {
                self.auth_api_secrets = vec![AuthApiSecret {
                    id: "default".to_string(),
                    secret,
                }];
            }
        }

        if let Some(security) = yaml.security {
            if security.cors_allowed_origins.is_some() {
                self.cors_allowed_origins = security.cors_allowed_origins;
            }
            if security.max_connections.is_some() {
                self.max_connections = security.max_connections;
            }
            if let Some(per_ip) = security.max_connections_per_ip {
                self.max_connections_per_ip = per_ip;
            }
        }
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.relay_path.starts_with('/') || self.relay_path.len() < 2 {
            return Err(format!(
                "relay_path must start with '/' and name a route, got '{}'",
                self.relay_path
            )
            .into());
        }
        if self.relay_path == "/" {
            return Err("relay_path cannot be the health check path '/'".into());
        }

        let upstream = url::Url::parse(&self.upstream_url)
            .map_err(|e| format!("Invalid upstream_url '{}': {e}", self.upstream_url))?;
        if !matches!(upstream.scheme(), "ws" | "wss") {
            return Err(format!(
                "upstream_url must use ws:// or wss://, got '{}'",
                upstream.scheme()
            )
            .into());
        }

        if self.auth_api_secrets.iter().any(|s| s.secret.is_empty()) {
            return Err("API secrets must not be empty".into());
        }
        if self.auth_required && self.auth_api_secrets.is_empty() {
            return Err(
                "AUTH_REQUIRED is set but no API secrets are configured (AUTH_API_SECRETS_JSON or AUTH_API_SECRET)"
                    .into(),
            );
        }
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than zero".into());
        }
        if self.history_limit == 0 {
            return Err("history_limit must be greater than zero".into());
        }

        Ok(())
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Check if API secret authentication is configured
    pub fn has_api_secret_auth(&self) -> bool {
        !self.auth_api_secrets.is_empty()
    }

    /// Find the API secret identifier that matches a bearer token
    ///
    /// Every entry is compared in constant time.
    pub fn find_api_secret_id(&self, token: &str) -> Option<&str> {
        let mut found = None;
        for entry in &self.auth_api_secrets {
            if bool::from(entry.secret.as_bytes().ct_eq(token.as_bytes())) && found.is_none() {
                found = Some(entry.id.as_str());
            }
        }
        found
    }

    /// Upstream endpoint with the configured model in the query.
    pub fn upstream_endpoint(&self) -> Result<String, url::ParseError> {
        let mut url = url::Url::parse(&self.upstream_url)?;
        let has_model = url.query_pairs().any(|(key, _)| key == "model");
        if !has_model && !self.upstream_model.is_empty() {
            url.query_pairs_mut()
                .append_pair("model", &self.upstream_model);
        }
        Ok(url.to_string())
    }

    /// Headers for the upstream connection.
    ///
    /// Host-supplied headers are kept. `OpenAI-Beta` always takes the relay's
    /// value, and so does `Authorization` when an upstream API key is set.
    pub fn upstream_connect_headers(&self) -> Vec<(String, String)> {
        let mut defaults = vec![(
            OPENAI_BETA_HEADER.0.to_string(),
            OPENAI_BETA_HEADER.1.to_string(),
        )];
        let api_key = self.upstream_api_key.as_ref().filter(|k| !k.is_empty());
        if let Some(key) = api_key {
            defaults.push(("Authorization".to_string(), format!("Bearer {key}")));
        }

        let mut headers: Vec<(String, String)> = self
            .upstream_headers
            .iter()
            .filter(|(name, _)| {
                !(api_key.is_some() && name.eq_ignore_ascii_case("authorization"))
                    && !name.eq_ignore_ascii_case(OPENAI_BETA_HEADER.0)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        headers.sort();
        headers.extend(defaults);
        headers
    }
}

pub(crate) fn parse_auth_api_secrets_json(
    json_str: &str,
) -> Result<Vec<AuthApiSecret>, Box<dyn std::error::Error>> {
    #[derive(serde::Deserialize)]
    struct AuthApiSecretJson {
        id: String,
        secret: String,
    }

    let secrets: Vec<AuthApiSecretJson> = serde_json::from_str(json_str)
        .map_err(|e| format!("Invalid AUTH_API_SECRETS_JSON format: {e}"))?;

    Ok(secrets
        .into_iter()
        .map(|entry| AuthApiSecret {
            id: entry.id,
            secret: entry.secret,
        })
        .collect())
}
