//! Shared application state.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::characters::CharacterRegistry;
use crate::config::ServerConfig;
use crate::errors::SessionResult;
use crate::llm::ChatClient;
use crate::services::HealthChecker;
use crate::session::SessionRegistry;

pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Admission gate for realtime sessions.
    pub admission: Arc<Semaphore>,
    pub health: HealthChecker,
    pub sessions: SessionRegistry,
    /// Process-wide character roster, used only by the discovery
    /// endpoints. Every session loads its own private registry.
    pub characters: CharacterRegistry,
    pub chat: Arc<ChatClient>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> SessionResult<Arc<Self>> {
        let config = Arc::new(config);
        let chat = Arc::new(ChatClient::new(&config)?);

        let state = Arc::new(AppState {
            admission: Arc::new(Semaphore::new(config.max_sessions)),
            health: HealthChecker::new(config.clone()),
            sessions: SessionRegistry::new(),
            characters: CharacterRegistry::new(),
            chat,
            config: config.clone(),
        });

        match state.characters.load(&config.characters_dir).await {
            Ok(result) => info!(
                loaded = result.loaded_count,
                errors = result.error_count,
                "Global character roster loaded"
            ),
            Err(e) => warn!(
                error = %e,
                "Global character roster unavailable; discovery endpoints start empty"
            ),
        }

        Ok(state)
    }
}
