use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque ID types for readability
pub type SessionId = String;
pub type QuestionId = String;
pub type OptionId = String;
pub type AnswerId = String;
pub type StudentId = String;
pub type TeacherId = String;

/// Length of the join code shown to students
pub const SESSION_CODE_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub is_active: bool,
    pub teacher_id: Option<TeacherId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Mcq,
    Essay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: QuestionId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub text: String,
    pub is_active: bool,
    pub allow_multiple: bool,
    pub created_at: DateTime<Utc>,
}

/// One selectable option of an MCQ question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    pub id: OptionId,
    pub question_id: QuestionId,
    pub text: String,
    pub position: u32,
}

/// A question together with its options, ordered by `position`.
/// Essay questions carry an empty option list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionWithOptions {
    #[serde(flatten)]
    pub question: Question,
    pub options: Vec<QuestionOption>,
}

impl QuestionWithOptions {
    pub fn id(&self) -> &QuestionId {
        &self.question.id
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|o| o.id == option_id)
    }
}

/// Raw `answers` row as stored and as delivered by change notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerRow {
    pub id: AnswerId,
    pub question_id: QuestionId,
    pub student_id: StudentId,
    pub option_id: Option<OptionId>,
    pub text: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert shape for `answers` (id and timestamp are store-assigned)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAnswer {
    pub question_id: QuestionId,
    pub student_id: StudentId,
    pub option_id: Option<OptionId>,
    pub text: Option<String>,
}

/// Insert shape for `questions` plus its option texts
#[derive(Debug, Clone, PartialEq)]
pub struct NewQuestion {
    pub session_id: SessionId,
    pub kind: QuestionType,
    pub text: String,
    pub allow_multiple: bool,
    /// (text, position) pairs
    pub options: Vec<(String, u32)>,
}

/// Who is looking at a results view
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Projector,
    Student,
}

impl Role {
    /// Only the owning teacher gets moderation controls
    pub fn can_moderate(&self) -> bool {
        matches!(self, Role::Teacher)
    }
}

/// Generate an opaque per-device student identifier
pub fn new_student_id() -> StudentId {
    ulid::Ulid::new().to_string()
}
