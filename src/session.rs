use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ChatOptions, ChatProvider};
use crate::error::{Error, Result};
use crate::models::{ChatMessage, ChatSession, Role};
use crate::storage::StorageManager;

// Most recent sessions returned by `load_sessions`.
const MAX_SESSIONS_LOADED: u32 = 50;

// Completion requests carry at most this many trailing history messages.
const MAX_HISTORY_MESSAGES: usize = 50;

/// Owns chat sessions and drives the submit → complete → append flow.
///
/// Per session the accumulator models Idle → AwaitingCompletion → Idle:
/// only one completion may be outstanding at a time, a second submit
/// fails fast with [`Error::Busy`]. On submit the user message is
/// persisted before the completion call, so it survives any failure; on
/// failure an error string is retained for the caller to surface and the
/// session stays consistent and resumable.
pub struct SessionManager {
    storage: Arc<StorageManager>,
    provider: Arc<dyn ChatProvider>,
    options: ChatOptions,
    in_flight: DashMap<Uuid, ()>,
    cancelled: DashMap<Uuid, bool>,
    last_errors: DashMap<Uuid, String>,
}

impl SessionManager {
    pub fn new(storage: Arc<StorageManager>, provider: Arc<dyn ChatProvider>) -> Self {
        Self::with_options(storage, provider, ChatOptions::default())
    }

    pub fn with_options(
        storage: Arc<StorageManager>,
        provider: Arc<dyn ChatProvider>,
        options: ChatOptions,
    ) -> Self {
        Self {
            storage,
            provider,
            options,
            in_flight: DashMap::new(),
            cancelled: DashMap::new(),
            last_errors: DashMap::new(),
        }
    }

    // --- Session CRUD ---

    pub async fn create_session(&self, user_id: &str) -> Result<ChatSession> {
        Ok(self.storage.create_session(user_id).await?)
    }

    /// The user's sessions, most recently updated first.
    pub async fn load_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        Ok(self.storage.list_sessions(user_id, MAX_SESSIONS_LOADED).await?)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<ChatSession> {
        self.require_session(session_id).await
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        self.storage.delete_session(session_id).await?;
        self.last_errors.remove(&session_id);
        self.cancelled.remove(&session_id);
        Ok(())
    }

    // --- Message flow ---

    /// Submits a user message and waits for the complete assistant reply.
    pub async fn send_message(
        &self,
        session_id: Uuid,
        content: &str,
        language: &str,
        is_voice: bool,
    ) -> Result<ChatMessage> {
        let _guard = InFlightGuard::acquire(&self.in_flight, session_id)?;
        self.last_errors.remove(&session_id);

        let history = self
            .append_user_message(session_id, content, language, is_voice)
            .await?;

        let result = self
            .complete_and_append(session_id, &history, language)
            .await;
        self.record_failure(session_id, &result);
        result
    }

    /// Submits a user message and streams the reply. `on_chunk` is invoked
    /// once per non-empty content delta, in arrival order, with the delta
    /// and the accumulated text so far. Resolves with the persisted
    /// assistant message once the stream closes.
    pub async fn send_message_streaming<F>(
        &self,
        session_id: Uuid,
        content: &str,
        language: &str,
        is_voice: bool,
        on_chunk: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(&str, &str) + Send,
    {
        let _guard = InFlightGuard::acquire(&self.in_flight, session_id)?;
        self.last_errors.remove(&session_id);

        let history = self
            .append_user_message(session_id, content, language, is_voice)
            .await?;

        let result = self
            .stream_and_append(session_id, &history, language, on_chunk)
            .await;
        self.record_failure(session_id, &result);
        result
    }

    /// Discards the most recent assistant reply and generates a new one
    /// from the history preceding it.
    pub async fn regenerate_last_reply(
        &self,
        session_id: Uuid,
        language: &str,
    ) -> Result<ChatMessage> {
        let _guard = InFlightGuard::acquire(&self.in_flight, session_id)?;
        self.last_errors.remove(&session_id);

        let session = self.require_session(session_id).await?;
        let Some(last_assistant_idx) = session
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        else {
            return Err(Error::InvalidState(
                "No previous assistant message to regenerate".to_string(),
            ));
        };

        let last_assistant_id = session.messages[last_assistant_idx].id;
        let history = session.messages[..last_assistant_idx].to_vec();

        self.storage.delete_message(last_assistant_id).await?;
        log::info!(
            "Regenerating reply for session {} (deleted message {})",
            session_id,
            last_assistant_id
        );

        let result = self
            .complete_and_append(session_id, &history, language)
            .await;
        self.record_failure(session_id, &result);
        result
    }

    /// Requests cooperative cancellation of the session's streamed reply.
    /// The stream loop stops at the next delta; content already received
    /// is persisted as the (partial) assistant message. The transport is
    /// not aborted. With no stream in flight the flag is consumed by the
    /// next streamed submit, cancelling it before any content arrives.
    pub fn cancel_generation(&self, session_id: Uuid) {
        log::warn!("Cancellation requested for session {}", session_id);
        self.cancelled.insert(session_id, true);
    }

    /// The error from the most recent failed submit, if any.
    pub fn last_error(&self, session_id: Uuid) -> Option<String> {
        self.last_errors.get(&session_id).map(|e| e.value().clone())
    }

    pub fn clear_error(&self, session_id: Uuid) {
        self.last_errors.remove(&session_id);
    }

    // --- Internals ---

    // Appends + persists the user message, returning the full updated
    // history. The message is visible to any reader of the session from
    // here on, regardless of how the completion goes.
    async fn append_user_message(
        &self,
        session_id: Uuid,
        content: &str,
        language: &str,
        is_voice: bool,
    ) -> Result<Vec<ChatMessage>> {
        let session = self.require_session(session_id).await?;

        let user_message = ChatMessage::user(content, language, is_voice);
        self.storage.append_message(session_id, &user_message).await?;
        log::info!("User message {} saved.", user_message.id);

        let mut history = session.messages;
        history.push(user_message);
        Ok(history)
    }

    async fn complete_and_append(
        &self,
        session_id: Uuid,
        history: &[ChatMessage],
        language: &str,
    ) -> Result<ChatMessage> {
        let reply = self
            .provider
            .complete(history_window(history), language, &self.options)
            .await?;

        let assistant_message = ChatMessage::assistant(reply, language);
        self.storage
            .append_message(session_id, &assistant_message)
            .await?;
        Ok(assistant_message)
    }

    async fn stream_and_append<F>(
        &self,
        session_id: Uuid,
        history: &[ChatMessage],
        language: &str,
        mut on_chunk: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(&str, &str) + Send,
    {
        let mut stream = self
            .provider
            .stream_chat(history_window(history), language, &self.options)
            .await?;

        let mut full_content = String::new();
        let mut was_cancelled = false;

        while let Some(delta_result) = stream.next().await {
            if self.cancelled.remove(&session_id).is_some() {
                log::warn!("Stopping stream for session {} on cancellation", session_id);
                was_cancelled = true;
                break;
            }

            // A transport error mid-stream fails the whole generation; the
            // user message stays, no assistant message is appended.
            let delta = delta_result?;
            full_content.push_str(&delta);
            on_chunk(&delta, &full_content);
        }

        if was_cancelled && full_content.is_empty() {
            return Err(Error::Cancelled);
        }

        // A cancelled stream with content still persists the partial
        // reply; the user has already seen that text.
        let assistant_message = ChatMessage::assistant(full_content, language);
        self.storage
            .append_message(session_id, &assistant_message)
            .await?;
        log::info!(
            "Assistant message {} saved ({} chars{})",
            assistant_message.id,
            assistant_message.content.len(),
            if was_cancelled { ", partial" } else { "" }
        );
        Ok(assistant_message)
    }

    async fn require_session(&self, session_id: Uuid) -> Result<ChatSession> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or(Error::SessionNotFound(session_id))
    }

    // Remembers failures for `last_error`, except cancellations the caller
    // asked for.
    fn record_failure(&self, session_id: Uuid, result: &Result<ChatMessage>) {
        if let Err(e) = result {
            if !matches!(e, Error::Cancelled) {
                self.last_errors.insert(session_id, e.to_string());
            }
        }
    }
}

// Drains the history to the trailing window sent to the model.
fn history_window(messages: &[ChatMessage]) -> &[ChatMessage] {
    let start = messages.len().saturating_sub(MAX_HISTORY_MESSAGES);
    &messages[start..]
}

// RAII marker for the AwaitingCompletion state: present in the map while
// a completion is outstanding, removed on drop along every exit path.
struct InFlightGuard<'a> {
    map: &'a DashMap<Uuid, ()>,
    session_id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(map: &'a DashMap<Uuid, ()>, session_id: Uuid) -> Result<Self> {
        use dashmap::mapref::entry::Entry;
        match map.entry(session_id) {
            Entry::Occupied(_) => Err(Error::Busy),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(Self { map, session_id })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.session_id);
    }
}
