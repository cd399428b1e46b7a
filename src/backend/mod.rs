//! Interfaces to the managed backend: row store, durable change feed and
//! ephemeral broadcast bus.
//!
//! The engines only ever talk to these traits. [`memory::MemoryBackend`]
//! implements all three in process.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::StoreResult;
use crate::protocol::ChangeEvent;
use crate::types::*;

pub use memory::MemoryBackend;

/// Column that must be non-null when selecting answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerColumn {
    OptionId,
    Text,
}

/// Typed select/insert/update access to the four tables
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_session(&self, id: &str) -> StoreResult<Session>;

    /// Active session with the given join code, if any
    async fn find_active_session(&self, code: &str) -> StoreResult<Option<Session>>;

    /// Sessions owned by a teacher, newest first
    async fn list_sessions(&self, teacher_id: &str) -> StoreResult<Vec<Session>>;

    /// Fails with [`StoreError::Conflict`](crate::error::StoreError::Conflict) when the code is taken
    async fn insert_session(&self, code: String, teacher_id: Option<TeacherId>)
        -> StoreResult<Session>;

    async fn set_session_active(&self, id: &str, active: bool) -> StoreResult<Session>;

    async fn get_question(&self, id: &str) -> StoreResult<Question>;

    /// Questions of a session, oldest first
    async fn list_questions(&self, session_id: &str) -> StoreResult<Vec<Question>>;

    async fn insert_question(&self, question: NewQuestion) -> StoreResult<QuestionWithOptions>;

    async fn set_question_active(&self, id: &str, active: bool) -> StoreResult<Question>;

    /// Options of a question ordered by position
    async fn list_options(&self, question_id: &str) -> StoreResult<Vec<QuestionOption>>;

    /// Answers of a question whose `not_null` column is set
    async fn select_answers(
        &self,
        question_id: &str,
        not_null: AnswerColumn,
    ) -> StoreResult<Vec<AnswerRow>>;

    async fn insert_answers(&self, rows: Vec<NewAnswer>) -> StoreResult<Vec<AnswerRow>>;

    async fn set_answer_hidden(&self, id: &str, is_hidden: bool) -> StoreResult<AnswerRow>;
}

/// Durable insert/update notifications, filtered per question or session
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe_answers(
        &self,
        question_id: &str,
    ) -> StoreResult<Subscription<ChangeEvent<AnswerRow>>>;

    async fn subscribe_questions(
        &self,
        session_id: &str,
    ) -> StoreResult<Subscription<ChangeEvent<Question>>>;
}

/// Best-effort, non-persisted messages between clients
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> StoreResult<Subscription<serde_json::Value>>;

    async fn send(&self, channel: &str, event: &str, payload: serde_json::Value)
        -> StoreResult<()>;
}

/// One wakeup of [`Subscription::next`]
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    Message(T),
    /// The consumer fell behind and this many messages were overwritten
    Lagged(u64),
}

/// Handle to one live subscription. Dropping it releases the subscription.
pub struct Subscription<T> {
    topic: String,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(topic: impl Into<String>, rx: broadcast::Receiver<T>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message or lag report, `None` once the publisher is gone.
    /// Consumers that must not miss messages resynchronize on `Lagged`.
    pub async fn next(&mut self) -> Option<Delivery<T>> {
        match self.rx.recv().await {
            Ok(msg) => Some(Delivery::Message(msg)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    "Subscription {} lagged, {} messages dropped",
                    self.topic,
                    skipped
                );
                Some(Delivery::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Next message, or `None` once the publisher is gone.
    /// Lag is logged and skipped, which suits best-effort channels.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.next().await? {
                Delivery::Message(msg) => return Some(msg),
                Delivery::Lagged(_) => continue,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Release the subscription, logging the topic
    pub fn unsubscribe(self) {
        tracing::debug!("Unsubscribed from {}", self.topic);
    }
}

/// The three collaborator interfaces bundled for views and services
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn Store>,
    pub changes: Arc<dyn ChangeFeed>,
    pub bus: Arc<dyn BroadcastBus>,
}

impl Backend {
    pub fn new(
        store: Arc<dyn Store>,
        changes: Arc<dyn ChangeFeed>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        Self {
            store,
            changes,
            bus,
        }
    }

    /// Use one in-memory backend for all three roles
    pub fn in_memory(memory: Arc<MemoryBackend>) -> Self {
        Self {
            store: memory.clone(),
            changes: memory.clone(),
            bus: memory,
        }
    }
}

/// Fetch a question with its options
pub async fn load_question(store: &dyn Store, id: &str) -> StoreResult<QuestionWithOptions> {
    let question = store.get_question(id).await?;
    let options = match question.kind {
        QuestionType::Mcq => store.list_options(id).await?,
        QuestionType::Essay => Vec::new(),
    };
    Ok(QuestionWithOptions { question, options })
}

