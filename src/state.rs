use std::sync::Arc;

use crate::api::{ChatProvider, OpenAICompatibleProvider};
use crate::bible::BibleClient;
use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::session::SessionManager;
use crate::storage::StorageManager;

/// All long-lived services, constructed once at application start and
/// passed to consumers explicitly. There are no global singletons; tests
/// substitute fakes by constructing the pieces directly.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageManager>,
    pub cache: CacheStore,
    pub bible: Arc<BibleClient>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub async fn init(config: &AppConfig) -> Result<Self, anyhow::Error> {
        let storage = Arc::new(StorageManager::new(&config.database_path).await?);
        let cache = CacheStore::new(storage.clone());

        let bible = Arc::new(BibleClient::new(
            config.bible_api_url.clone(),
            config.bible_api_key.clone(),
            cache.clone(),
        ));

        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAICompatibleProvider::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(storage.clone(), provider));

        Ok(Self {
            storage,
            cache,
            bible,
            sessions,
        })
    }
}
