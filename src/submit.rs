//! Student answer submission
//!
//! Every submission is persisted first and then announced on the question's
//! broadcast channel so open result views can update before the durable
//! change notification arrives.

use chrono::Utc;

use crate::backend::Backend;
use crate::error::{PersistError, SubmitError};
use crate::protocol::{question_channel, NewAnswerPayload, NEW_ANSWER_EVENT};
use crate::types::*;

/// Validate a selection against the question. Duplicate ids collapse, order
/// is kept.
pub fn validate_choice(
    question: &QuestionWithOptions,
    selected: &[OptionId],
) -> Result<Vec<OptionId>, SubmitError> {
    if question.question.kind != QuestionType::Mcq {
        return Err(SubmitError::WrongQuestionType);
    }

    let mut options: Vec<OptionId> = Vec::with_capacity(selected.len());
    for id in selected {
        if !question.has_option(id) {
            return Err(SubmitError::UnknownOption(id.clone()));
        }
        if !options.contains(id) {
            options.push(id.clone());
        }
    }

    match options.len() {
        0 => Err(SubmitError::EmptySelection),
        1 => Ok(options),
        _ if question.question.allow_multiple => Ok(options),
        _ => Err(SubmitError::MultipleNotAllowed),
    }
}

/// Store one row per selected option and announce the submission
pub async fn submit_choice(
    backend: &Backend,
    question: &QuestionWithOptions,
    student_id: &str,
    selected: &[OptionId],
) -> Result<Vec<AnswerRow>, SubmitError> {
    if !question.question.is_active {
        return Err(SubmitError::QuestionInactive);
    }
    let options = validate_choice(question, selected)?;

    let rows = options
        .iter()
        .map(|option_id| NewAnswer {
            question_id: question.id().clone(),
            student_id: student_id.to_string(),
            option_id: Some(option_id.clone()),
            text: None,
        })
        .collect();
    let stored = backend
        .store
        .insert_answers(rows)
        .await
        .map_err(|e| PersistError::new(format!("answer to question {}", question.id()), e))?;

    tracing::debug!(
        "Student {} chose {:?} on question {}",
        student_id,
        options,
        question.id()
    );

    announce(
        backend,
        question.id(),
        NewAnswerPayload {
            question_id: Some(question.id().clone()),
            student_id: Some(student_id.to_string()),
            option_id: options.first().cloned(),
            options: Some(options),
            text: None,
            created_at: Some(Utc::now()),
        },
    )
    .await;

    Ok(stored)
}

pub async fn submit_essay(
    backend: &Backend,
    question: &QuestionWithOptions,
    student_id: &str,
    text: &str,
) -> Result<AnswerRow, SubmitError> {
    if question.question.kind != QuestionType::Essay {
        return Err(SubmitError::WrongQuestionType);
    }
    if !question.question.is_active {
        return Err(SubmitError::QuestionInactive);
    }
    let text = text.trim();
    if text.is_empty() {
        return Err(SubmitError::EmptyText);
    }

    let stored = backend
        .store
        .insert_answers(vec![NewAnswer {
            question_id: question.id().clone(),
            student_id: student_id.to_string(),
            option_id: None,
            text: Some(text.to_string()),
        }])
        .await
        .map_err(|e| PersistError::new(format!("answer to question {}", question.id()), e))?
        .into_iter()
        .next()
        .ok_or_else(|| {
            PersistError::new(
                format!("answer to question {}", question.id()),
                crate::error::StoreError::Unavailable("insert returned no row".to_string()),
            )
        })?;

    tracing::debug!(
        "Student {} answered essay question {}",
        student_id,
        question.id()
    );

    announce(
        backend,
        question.id(),
        NewAnswerPayload {
            question_id: Some(question.id().clone()),
            student_id: Some(student_id.to_string()),
            text: Some(text.to_string()),
            created_at: Some(Utc::now()),
            ..Default::default()
        },
    )
    .await;

    Ok(stored)
}

/// Best effort; the durable notification still reaches every view
async fn announce(backend: &Backend, question_id: &str, payload: NewAnswerPayload) {
    let payload = match serde_json::to_value(&payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Failed to serialize new-answer payload: {}", e);
            return;
        }
    };
    if let Err(e) = backend
        .bus
        .send(&question_channel(question_id), NEW_ANSWER_EVENT, payload)
        .await
    {
        tracing::warn!(
            "Failed to broadcast new answer for question {}: {}",
            question_id,
            e
        );
    }
}
