use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Broker configuration, loaded from a JSON file.
///
/// Field names mirror the wire-facing config document
/// (`hostname`, `port`, `notifyPrefix`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    #[serde(rename = "notifyPrefix")]
    pub notify_prefix: String,
    #[serde(rename = "groupPrefix")]
    pub group_prefix: String,
    #[serde(rename = "useTLS", default)]
    pub use_tls: bool,
    #[serde(rename = "certFilename", default)]
    pub cert_filename: String,
    #[serde(rename = "keyFilename", default)]
    pub key_filename: String,
    #[serde(rename = "stateFile", default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("pushd-state.json")
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("hostname must not be empty".into()));
        }
        if !self.notify_prefix.starts_with('/') || !self.notify_prefix.ends_with('/') {
            return Err(ConfigError::Invalid(
                "notifyPrefix must start and end with '/'".into(),
            ));
        }
        if !self.group_prefix.starts_with('/') || self.group_prefix.trim_end_matches('/').is_empty()
        {
            return Err(ConfigError::Invalid(
                "groupPrefix must be a non-root path starting with '/'".into(),
            ));
        }
        if self.use_tls && (self.cert_filename.is_empty() || self.key_filename.is_empty()) {
            return Err(ConfigError::Invalid(
                "useTLS requires certFilename and keyFilename".into(),
            ));
        }
        Ok(())
    }

    /// Scheme of advertised push endpoint URLs. TLS termination itself is
    /// expected from a fronting proxy; the flag only affects the URLs.
    pub fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    /// Stable push endpoint URL for a channel or group id.
    pub fn endpoint_url(&self, id: &str) -> String {
        format!(
            "{}://{}:{}{}{}",
            self.scheme(),
            self.hostname,
            self.port,
            self.notify_prefix,
            id
        )
    }

    /// Extract the channel id from a push endpoint URL previously handed out
    /// by register. Returns `None` when the URL does not point at a single
    /// id under the notify prefix.
    pub fn channel_id_from_endpoint(&self, endpoint: &str) -> Option<String> {
        let after_scheme = endpoint.split_once("://")?.1;
        let path = &after_scheme[after_scheme.find('/')?..];
        let id = path.strip_prefix(self.notify_prefix.as_str())?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerConfig {
        ServerConfig {
            hostname: "push.example.org".to_string(),
            port: 8080,
            notify_prefix: "/notify/".to_string(),
            group_prefix: "/group".to_string(),
            use_tls: false,
            cert_filename: String::new(),
            key_filename: String::new(),
            state_file: PathBuf::from("pushd-state.json"),
        }
    }

    #[test]
    fn load_parses_wire_field_names() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "hostname": "localhost",
                "port": 9000,
                "notifyPrefix": "/notify/",
                "groupPrefix": "/group",
                "useTLS": false
            }"#,
        )
        .expect("write config");

        let config = ServerConfig::load(&path).expect("load");
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 9000);
        assert_eq!(config.notify_prefix, "/notify/");
        assert_eq!(config.state_file, PathBuf::from("pushd-state.json"));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let result = ServerConfig::load(Path::new("/nonexistent/pushd/config.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write config");
        let result = ServerConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn validate_rejects_bad_prefixes() {
        let mut config = sample();
        config.notify_prefix = "/notify".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.group_prefix = "group".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.use_tls = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn endpoint_url_scheme_follows_tls_flag() {
        let mut config = sample();
        assert_eq!(
            config.endpoint_url("c1"),
            "http://push.example.org:8080/notify/c1"
        );

        config.use_tls = true;
        config.cert_filename = "cert.pem".to_string();
        config.key_filename = "key.pem".to_string();
        assert_eq!(
            config.endpoint_url("c1"),
            "https://push.example.org:8080/notify/c1"
        );
    }

    #[test]
    fn channel_id_round_trips_through_endpoint_url() {
        let config = sample();
        let endpoint = config.endpoint_url("channel-abc");
        assert_eq!(
            config.channel_id_from_endpoint(&endpoint),
            Some("channel-abc".to_string())
        );
    }

    #[test]
    fn channel_id_rejects_foreign_and_nested_paths() {
        let config = sample();
        assert_eq!(
            config.channel_id_from_endpoint("http://push.example.org:8080/other/c1"),
            None
        );
        assert_eq!(
            config.channel_id_from_endpoint("http://push.example.org:8080/notify/a/b"),
            None
        );
        assert_eq!(
            config.channel_id_from_endpoint("http://push.example.org:8080/notify/"),
            None
        );
        assert_eq!(config.channel_id_from_endpoint("not a url"), None);
    }
}
