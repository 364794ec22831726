use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// A Bible translation/edition as listed by the scripture API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BibleVersion {
    pub id: String,
    pub name: String,
    pub abbreviation: String,
    pub language: String,
    pub language_code: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Testament {
    Old,
    New,
}

// A book within one version's book list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BibleBook {
    pub id: String,
    pub name: String,
    pub testament: Testament,
    pub chapter_count: u32,
}

// The smallest addressable unit of scripture text. `id` is derived as
// "{book_id}.{chapter}.{verse_number}"; `text` is always plain (tags
// stripped, entities decoded).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Verse {
    pub id: String,
    pub book_id: String,
    pub chapter: u32,
    pub verse_number: u32,
    pub text: String,
    pub version_id: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    // Matches the serde rename so the same strings appear on the chat API
    // wire and in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

// A single message in a conversation. Append-only; never mutated after
// creation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatMessage {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub is_voice: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, language: &str, is_voice: bool) -> Self {
        Self::new(Role::User, content, Some(language.to_string()), is_voice)
    }

    pub fn assistant(content: impl Into<String>, language: &str) -> Self {
        Self::new(Role::Assistant, content, Some(language.to_string()), false)
    }

    fn new(role: Role, content: impl Into<String>, language: Option<String>, is_voice: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            language,
            is_voice,
        }
    }
}

// One conversation thread between a user and the assistant. The session
// accumulator is the only writer; `updated_at` is bumped in the same
// transaction as every message append.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatSession {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}
