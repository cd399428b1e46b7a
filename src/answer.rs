//! Answer record model
//!
//! Every answer reaches the engines through one canonical shape, whatever its
//! origin: a row from the initial load, a durable change notification, or an
//! ephemeral broadcast sent by the submitting student.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedEvent;
use crate::protocol::NewAnswerPayload;
use crate::types::*;

/// Student id used when a choice broadcast does not say who sent it
pub const ANONYMOUS_STUDENT: &str = "anonymous";

/// Prefix of ids synthesized for broadcast-originated answers
pub const PROVISIONAL_PREFIX: &str = "provisional-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerBody {
    /// Selected options. Durable rows always hold exactly one.
    Choice { option_ids: Vec<OptionId> },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub id: AnswerId,
    pub question_id: QuestionId,
    pub student_id: StudentId,
    #[serde(flatten)]
    pub body: AnswerBody,
    pub created_at: DateTime<Utc>,
    pub is_hidden: bool,
    /// Came from a broadcast and has no store-assigned id
    pub provisional: bool,
}

impl Answer {
    pub fn option_ids(&self) -> &[OptionId] {
        match &self.body {
            AnswerBody::Choice { option_ids } => option_ids,
            AnswerBody::Text { .. } => &[],
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            AnswerBody::Text { text } => Some(text),
            AnswerBody::Choice { .. } => None,
        }
    }
}

/// Where an answer came from, before normalization
#[derive(Debug, Clone)]
pub enum AnswerSource {
    Loaded(AnswerRow),
    Durable(AnswerRow),
    Broadcast(serde_json::Value),
}

/// Fields of an answer that may change after insert
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnswerPatch {
    pub id: AnswerId,
    pub is_hidden: Option<bool>,
    pub text: Option<String>,
}

impl AnswerPatch {
    pub fn hidden(id: impl Into<AnswerId>, is_hidden: bool) -> Self {
        Self {
            id: id.into(),
            is_hidden: Some(is_hidden),
            text: None,
        }
    }

    /// Build the patch carried by a durable update notification
    pub fn from_row(row: &AnswerRow) -> Self {
        Self {
            id: row.id.clone(),
            is_hidden: Some(row.is_hidden),
            text: row.text.clone(),
        }
    }
}

/// Normalize any origin shape into a canonical [`Answer`].
pub fn normalize(source: AnswerSource) -> Result<Answer, MalformedEvent> {
    match source {
        AnswerSource::Loaded(row) | AnswerSource::Durable(row) => from_row(row),
        AnswerSource::Broadcast(value) => {
            let payload: NewAnswerPayload = serde_json::from_value(value)
                .map_err(|e| MalformedEvent::Invalid(e.to_string()))?;
            from_broadcast(payload, Utc::now())
        }
    }
}

fn from_row(row: AnswerRow) -> Result<Answer, MalformedEvent> {
    if row.id.is_empty() {
        return Err(MalformedEvent::MissingField("id"));
    }
    if row.student_id.is_empty() {
        return Err(MalformedEvent::MissingField("student_id"));
    }

    let body = match (row.option_id, row.text) {
        (Some(_), Some(_)) => return Err(MalformedEvent::AmbiguousBody),
        (Some(option_id), None) => AnswerBody::Choice {
            option_ids: vec![option_id],
        },
        (None, Some(text)) => AnswerBody::Text { text },
        (None, None) => return Err(MalformedEvent::EmptyBody),
    };

    Ok(Answer {
        id: row.id,
        question_id: row.question_id,
        student_id: row.student_id,
        body,
        created_at: row.created_at,
        is_hidden: row.is_hidden,
        provisional: false,
    })
}

/// Broadcasts carry no store id and maybe no timestamp, so both are synthesized.
fn from_broadcast(
    payload: NewAnswerPayload,
    received_at: DateTime<Utc>,
) -> Result<Answer, MalformedEvent> {
    let question_id = payload
        .question_id
        .filter(|q| !q.is_empty())
        .ok_or(MalformedEvent::MissingField("question_id"))?;

    // `options` wins over the single `option_id` when both are sent
    let mut option_ids = payload.options.unwrap_or_default();
    if option_ids.is_empty() {
        option_ids.extend(payload.option_id);
    }

    let (body, student_id) = match (option_ids.is_empty(), payload.text) {
        (false, Some(_)) => return Err(MalformedEvent::AmbiguousBody),
        (false, None) => (
            AnswerBody::Choice { option_ids },
            payload
                .student_id
                .unwrap_or_else(|| ANONYMOUS_STUDENT.to_string()),
        ),
        (true, Some(text)) => (
            AnswerBody::Text { text },
            payload
                .student_id
                .filter(|s| !s.is_empty())
                .ok_or(MalformedEvent::MissingField("student_id"))?,
        ),
        (true, None) => return Err(MalformedEvent::EmptyBody),
    };

    Ok(Answer {
        id: format!("{}{}", PROVISIONAL_PREFIX, ulid::Ulid::new()),
        question_id,
        student_id,
        body,
        created_at: payload.created_at.unwrap_or(received_at),
        is_hidden: false,
        provisional: true,
    })
}
