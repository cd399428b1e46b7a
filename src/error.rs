//! Error taxonomy shared by the engines, the services and the HTTP layer.

use thiserror::Error;

/// Errors reported by a store implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("conflicting row: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Initial fetch of a results view failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to load answers for question {question_id}: {source}")]
pub struct LoadError {
    pub question_id: String,
    #[source]
    pub source: StoreError,
}

/// An insert or update could not be persisted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to persist {what}: {source}")]
pub struct PersistError {
    pub what: String,
    #[source]
    pub source: StoreError,
}

impl PersistError {
    pub fn new(what: impl Into<String>, source: StoreError) -> Self {
        Self {
            what: what.into(),
            source,
        }
    }
}

/// An incoming event is missing required fields or has the wrong shape
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("answer carries both an option and a text")]
    AmbiguousBody,

    #[error("answer carries neither an option nor a text")]
    EmptyBody,

    #[error("invalid payload: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModerationError {
    #[error("only the session's teacher can moderate answers")]
    NotPermitted,

    #[error("answer {0} is not in this feed")]
    UnknownAnswer(String),

    #[error("view is not ready")]
    NotReady,

    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("no option selected")]
    EmptySelection,

    #[error("this question accepts a single option")]
    MultipleNotAllowed,

    #[error("option {0} does not belong to this question")]
    UnknownOption(String),

    #[error("answer text is empty")]
    EmptyText,

    #[error("question type does not accept this kind of answer")]
    WrongQuestionType,

    #[error("question is not active")]
    QuestionInactive,

    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("please enter a valid 6-digit code")]
    InvalidCode,

    #[error("invalid or inactive session code")]
    NotFound,

    #[error("{0}")]
    Invalid(String),

    #[error("could not allocate a unique session code")]
    CodeExhausted,

    #[error(transparent)]
    Store(#[from] StoreError),
}
