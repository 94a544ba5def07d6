//! Aggregate health of the backing services, cached with a short TTL so
//! connection bursts don't hammer the backends.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use tracing::debug;

use crate::config::{ServerConfig, ws_to_http};

/// How long one probe result stays fresh.
const HEALTH_TTL: Duration = Duration::from_millis(500);

/// Per-probe request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub stt_up: bool,
    pub tts_up: bool,
    pub llm_up: bool,
    /// Absent when no voice-cloning service is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_cloning_up: Option<bool>,
    pub ok: bool,
}

impl HealthStatus {
    fn compute(stt_up: bool, tts_up: bool, llm_up: bool, voice_cloning_up: Option<bool>) -> Self {
        HealthStatus {
            stt_up,
            tts_up,
            llm_up,
            voice_cloning_up,
            // Voice cloning never gates admission.
            ok: stt_up && tts_up && llm_up,
        }
    }
}

pub struct HealthChecker {
    http: reqwest::Client,
    config: Arc<ServerConfig>,
    cache: Cache<(), HealthStatus>,
}

impl HealthChecker {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        HealthChecker {
            http: reqwest::Client::new(),
            config,
            cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(HEALTH_TTL)
                .build(),
        }
    }

    /// Cached aggregate health. Probes run concurrently on a cache miss.
    pub async fn check(&self) -> HealthStatus {
        self.cache.get_with((), self.probe_all()).await
    }

    async fn probe_all(&self) -> HealthStatus {
        let stt = self.probe(format!(
            "{}/api/build_info",
            ws_to_http(&self.config.stt_url)
        ));
        let tts = self.probe(format!(
            "{}/api/build_info",
            ws_to_http(&self.config.tts_url)
        ));
        let llm = self.probe_with_auth(format!(
            "{}/v1/models",
            self.config.llm_url.trim_end_matches('/')
        ));
        let cloning = async {
            match &self.config.voice_cloning_url {
                Some(url) => Some(
                    self.probe(format!("{}/api/build_info", ws_to_http(url)))
                        .await,
                ),
                None => None,
            }
        };

        let (stt_up, tts_up, llm_up, voice_cloning_up) = tokio::join!(stt, tts, llm, cloning);
        let status = HealthStatus::compute(stt_up, tts_up, llm_up, voice_cloning_up);
        debug!(?status, "Health probes completed");
        status
    }

    async fn probe(&self, url: String) -> bool {
        self.http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn probe_with_auth(&self, url: String) -> bool {
        let mut request = self.http.get(&url).timeout(PROBE_TIMEOUT);
        if let Some(key) = &self.config.llm_api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
