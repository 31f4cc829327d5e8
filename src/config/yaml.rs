use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in the
/// file override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   relay_path: "/agent"
///   tls:
///     enabled: true
///     cert_path: "/etc/relay/cert.pem"
///     key_path: "/etc/relay/key.pem"
///
/// upstream:
///   url: "wss://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   api_key: "sk-..."
///   default_voice: "alloy"
///   transcription_model: "whisper-1"
///   headers:
///     X-Request-Source: "relay"
///
/// session:
///   history_limit: 50
///   settings_timeout_ms: 5000
///
/// auth:
///   required: true
///   api_secrets:
///     - id: "client-a"
///       secret: "your-api-secret"
///
/// security:
///   cors_allowed_origins: "https://app.example.com"
///   max_connections: 1000
///   max_connections_per_ip: 20
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub upstream: Option<UpstreamYaml>,
    pub session: Option<SessionYaml>,
    pub auth: Option<AuthYaml>,
    pub security: Option<SecurityYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub relay_path: Option<String>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Upstream realtime service from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamYaml {
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub default_voice: Option<String>,
    pub transcription_model: Option<String>,
    /// Extra connection headers; required defaults still win
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub history_limit: Option<usize>,
    pub settings_timeout_ms: Option<u64>,
}

/// Authentication configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub required: Option<bool>,
    /// Preferred multi-secret form. If non-empty, it takes precedence over api_secret.
    #[serde(default)]
    pub api_secrets: Vec<AuthApiSecretYaml>,
    /// Single-secret alias. Ignored when api_secrets is non-empty.
    pub api_secret: Option<String>,
}

/// API secret authentication entry in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct AuthApiSecretYaml {
    pub id: String,
    pub secret: String,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    /// Maximum concurrent relay connections
    pub max_connections: Option<usize>,
    /// Maximum connections per IP address
    pub max_connections_per_ip: Option<u32>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080
  relay_path: "/relay"

upstream:
  url: "wss://upstream.example.com/v1/realtime"
  model: "realtime-test"
  api_key: "sk-test"
  headers:
    X-Trace: "on"

session:
  history_limit: 10
  settings_timeout_ms: 2500

auth:
  required: true
  api_secrets:
    - id: "client-a"
      secret: "secret-a"

security:
  max_connections: 5
  max_connections_per_ip: 2
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(server.port, Some(8080));
        assert_eq!(server.relay_path.as_deref(), Some("/relay"));

        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.model.as_deref(), Some("realtime-test"));
        assert_eq!(upstream.headers.get("X-Trace").map(String::as_str), Some("on"));

        let session = config.session.unwrap();
        assert_eq!(session.history_limit, Some(10));
        assert_eq!(session.settings_timeout_ms, Some(2500));

        let auth = config.auth.unwrap();
        assert_eq!(auth.required, Some(true));
        assert_eq!(auth.api_secrets[0].id, "client-a");

        let security = config.security.unwrap();
        assert_eq!(security.max_connections, Some(5));
        assert_eq!(security.max_connections_per_ip, Some(2));
    }

    #[test]
    fn test_yaml_config_partial() {
        let config: YamlConfig = serde_yaml::from_str("server:\n  port: 9000\n").unwrap();
        assert_eq!(config.server.unwrap().port, Some(9000));
        assert!(config.upstream.is_none());
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_yaml_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "upstream:\n  default_voice: \"verse\"\n").unwrap();

        let config = YamlConfig::from_file(&path).unwrap();
        assert_eq!(
            config.upstream.unwrap().default_voice.as_deref(),
            Some("verse")
        );
    }

    #[test]
    fn test_yaml_config_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "server: [not, a, map").unwrap();

        let err = YamlConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse YAML config"));
    }
}
