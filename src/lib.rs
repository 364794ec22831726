// Declare the modules
pub mod api;
pub mod bible;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod state;
pub mod storage;

pub use api::{ChatOptions, ChatProvider, DeltaStream, OpenAICompatibleProvider};
pub use bible::BibleClient;
pub use cache::CacheStore;
pub use config::AppConfig;
pub use error::{Error, Result};
pub use models::{
    BibleBook, BibleVersion, ChatMessage, ChatSession, Role, Testament, Verse,
};
pub use session::SessionManager;
pub use state::AppState;
pub use storage::StorageManager;
