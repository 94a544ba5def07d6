//! Server configuration.
//!
//! Values come from, in increasing priority: built-in defaults, `.env` /
//! environment variables, and an optional YAML file passed with `-c`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Sentinel accepted by reload requests to mean the configured default
/// characters directory.
pub const DEFAULT_CHARACTERS_ALIAS: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Speech-to-text service websocket URL.
    pub stt_url: String,
    /// Text-to-speech service websocket URL.
    pub tts_url: String,
    /// OpenAI-compatible chat completion base URL (http/https).
    pub llm_url: String,
    pub llm_api_key: Option<String>,
    /// Model name; when unset the single model the server offers is used.
    pub llm_model: Option<String>,
    pub llm_temperature: f32,
    /// Voice cloning service URL. Optional and never blocks admission.
    pub voice_cloning_url: Option<String>,

    /// Default character definition directory.
    pub characters_dir: PathBuf,
    /// Where consented event recordings are spooled. Disabled when unset.
    pub recordings_dir: Option<PathBuf>,

    /// Admission ceiling: concurrently running realtime sessions. We prefer
    /// scaling out with more processes over raising this number.
    pub max_sessions: usize,

    pub cors_allowed_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8000,
            stt_url: "ws://127.0.0.1:8090".to_string(),
            tts_url: "ws://127.0.0.1:8089".to_string(),
            llm_url: "http://127.0.0.1:8091".to_string(),
            llm_api_key: None,
            llm_model: None,
            llm_temperature: 1.0,
            voice_cloning_url: None,
            characters_dir: PathBuf::from("characters"),
            recordings_dir: None,
            max_sessions: 4,
            cors_allowed_origins: None,
        }
    }
}

/// YAML overlay: every field optional, present values win over env.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    stt_url: Option<String>,
    tts_url: Option<String>,
    llm_url: Option<String>,
    llm_api_key: Option<String>,
    llm_model: Option<String>,
    llm_temperature: Option<f32>,
    voice_cloning_url: Option<String>,
    characters_dir: Option<PathBuf>,
    recordings_dir: Option<PathBuf>,
    max_sessions: Option<usize>,
    cors_allowed_origins: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Ok(host) = std::env::var("SOTTO_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("SOTTO_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                name: "SOTTO_PORT",
                value: port,
            })?;
        }
        if let Ok(url) = std::env::var("STT_SERVER") {
            config.stt_url = url;
        }
        if let Ok(url) = std::env::var("TTS_SERVER") {
            config.tts_url = url;
        }
        if let Ok(url) = std::env::var("LLM_SERVER") {
            config.llm_url = url;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm_model = Some(model);
        }
        if let Ok(temp) = std::env::var("LLM_TEMPERATURE") {
            config.llm_temperature = temp.parse().map_err(|_| ConfigError::InvalidValue {
                name: "LLM_TEMPERATURE",
                value: temp,
            })?;
        }
        if let Ok(url) = std::env::var("VOICE_CLONING_SERVER") {
            config.voice_cloning_url = Some(url);
        }
        if let Ok(dir) = std::env::var("CHARACTERS_DIR") {
            config.characters_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("RECORDINGS_DIR") {
            config.recordings_dir = Some(PathBuf::from(dir));
        }
        if let Ok(n) = std::env::var("MAX_SESSIONS") {
            config.max_sessions = n.parse().map_err(|_| ConfigError::InvalidValue {
                name: "MAX_SESSIONS",
                value: n,
            })?;
        }
        if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
            config.cors_allowed_origins = Some(origins);
        }

        Ok(config)
    }

    /// Load from a YAML file, with environment variables filling the gaps.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let overlay: FileConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut config = Self::from_env()?;
        if let Some(host) = overlay.host {
            config.host = host;
        }
        if let Some(port) = overlay.port {
            config.port = port;
        }
        if let Some(url) = overlay.stt_url {
            config.stt_url = url;
        }
        if let Some(url) = overlay.tts_url {
            config.tts_url = url;
        }
        if let Some(url) = overlay.llm_url {
            config.llm_url = url;
        }
        if let Some(key) = overlay.llm_api_key {
            config.llm_api_key = Some(key);
        }
        if let Some(model) = overlay.llm_model {
            config.llm_model = Some(model);
        }
        if let Some(temp) = overlay.llm_temperature {
            config.llm_temperature = temp;
        }
        if let Some(url) = overlay.voice_cloning_url {
            config.voice_cloning_url = Some(url);
        }
        if let Some(dir) = overlay.characters_dir {
            config.characters_dir = dir;
        }
        if let Some(dir) = overlay.recordings_dir {
            config.recordings_dir = Some(dir);
        }
        if let Some(n) = overlay.max_sessions {
            config.max_sessions = n;
        }
        if let Some(origins) = overlay.cors_allowed_origins {
            config.cors_allowed_origins = Some(origins);
        }

        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve a reload request directory, honoring the `"default"` alias.
    pub fn resolve_characters_dir(&self, requested: &str) -> PathBuf {
        if requested == DEFAULT_CHARACTERS_ALIAS {
            self.characters_dir.clone()
        } else {
            PathBuf::from(requested)
        }
    }
}

/// Convert a websocket URL into its HTTP equivalent for health probes.
pub fn ws_to_http(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}
