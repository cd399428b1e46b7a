use crate::results::{FeedFilter, FeedSnapshot, TallySnapshot};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broadcast event name used for freshly submitted answers
pub const NEW_ANSWER_EVENT: &str = "new-answer";

/// Broadcast channel carrying low-latency answer notifications for a question
pub fn question_channel(question_id: &str) -> String {
    format!("question-{}", question_id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Durable change notification emitted by the store for one row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent<R> {
    pub event_type: ChangeKind,
    pub row: R,
}

impl<R> ChangeEvent<R> {
    pub fn insert(row: R) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            row,
        }
    }

    pub fn update(row: R) -> Self {
        Self {
            event_type: ChangeKind::Update,
            row,
        }
    }
}

/// Payload of a `new-answer` broadcast. Every field is optional on the wire;
/// the answer model decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewAnswerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<QuestionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<OptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<OptionId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Messages sent by a results socket client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    ToggleHidden {
        answer_id: AnswerId,
        current_hidden: bool,
    },
    SetFilter {
        filter: FeedFilter,
    },
    /// Retry after a failed initial load
    Reload,
}

/// Messages pushed to a results or session socket client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Loading {
        question_id: QuestionId,
    },
    McqResults {
        question_id: QuestionId,
        tally: TallySnapshot,
    },
    EssayResults {
        question_id: QuestionId,
        feed: FeedSnapshot,
    },
    LoadFailed {
        question_id: QuestionId,
        msg: String,
    },
    /// The session's active question changed; `None` when closed
    ActiveQuestion {
        question: Option<QuestionWithOptions>,
    },
    /// A moderation toggle was reverted
    ModerationFailed {
        answer_id: AnswerId,
        msg: String,
    },
    Error {
        code: String,
        msg: String,
    },
}
