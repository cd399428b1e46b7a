//! Session and question lifecycle: join codes, question creation and
//! activation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{load_question, Store};
use crate::error::{SessionError, StoreError};
use crate::protocol::ChangeEvent;
use crate::types::*;

/// Attempts at drawing an unused join code before giving up
const CODE_ATTEMPTS: usize = 5;

/// Random six-digit join code
pub fn generate_session_code() -> String {
    rand::rng().random_range(100_000..=999_999u32).to_string()
}

pub fn is_valid_code(code: &str) -> bool {
    code.len() == SESSION_CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

/// Question as submitted by a teacher, before validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionDraft {
    #[serde(rename = "type")]
    pub kind: QuestionType,
    pub text: String,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

impl QuestionDraft {
    /// Trim texts, drop blank options and number the rest in input order
    pub fn validate(self, session_id: &str) -> Result<NewQuestion, SessionError> {
        let text = self.text.trim().to_string();
        if text.is_empty() {
            return Err(SessionError::Invalid("question text is empty".to_string()));
        }

        let (options, allow_multiple) = match self.kind {
            QuestionType::Mcq => {
                let options: Vec<(String, u32)> = self
                    .options
                    .iter()
                    .map(|o| o.trim())
                    .filter(|o| !o.is_empty())
                    .enumerate()
                    .map(|(i, o)| (o.to_string(), i as u32))
                    .collect();
                if options.len() < 2 {
                    return Err(SessionError::Invalid(
                        "a multiple choice question needs at least 2 options".to_string(),
                    ));
                }
                (options, self.allow_multiple)
            }
            QuestionType::Essay => (Vec::new(), false),
        };

        Ok(NewQuestion {
            session_id: session_id.to_string(),
            kind: self.kind,
            text,
            allow_multiple,
            options,
        })
    }
}

#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn Store>,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_session(&self, teacher_id: &str) -> Result<Session, SessionError> {
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_session_code();
            match self
                .store
                .insert_session(code.clone(), Some(teacher_id.to_string()))
                .await
            {
                Ok(session) => {
                    tracing::info!("Created session {} with code {}", session.id, code);
                    return Ok(session);
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!("Session code {} already taken, retrying", code);
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!("Gave up allocating a session code for teacher {}", teacher_id);
        Err(SessionError::CodeExhausted)
    }

    /// Resolve a join code to its active session
    pub async fn join(&self, code: &str) -> Result<Session, SessionError> {
        let code = code.trim();
        if !is_valid_code(code) {
            return Err(SessionError::InvalidCode);
        }
        self.store
            .find_active_session(code)
            .await?
            .ok_or(SessionError::NotFound)
    }

    pub async fn list_sessions(&self, teacher_id: &str) -> Result<Vec<Session>, SessionError> {
        Ok(self.store.list_sessions(teacher_id).await?)
    }

    pub async fn set_session_active(
        &self,
        session_id: &str,
        active: bool,
    ) -> Result<Session, SessionError> {
        let session = self.store.set_session_active(session_id, active).await?;
        tracing::info!("Session {} active={}", session.id, session.is_active);
        Ok(session)
    }

    pub async fn create_question(
        &self,
        session_id: &str,
        draft: QuestionDraft,
    ) -> Result<QuestionWithOptions, SessionError> {
        let new_question = draft.validate(session_id)?;
        let question = self.store.insert_question(new_question).await?;
        tracing::info!(
            "Created {:?} question {} in session {}",
            question.question.kind,
            question.id(),
            session_id
        );
        Ok(question)
    }

    /// Make a question the session's only active one
    pub async fn activate_question(&self, question_id: &str) -> Result<Question, SessionError> {
        let question = self.store.get_question(question_id).await?;
        for other in self.store.list_questions(&question.session_id).await? {
            if other.is_active && other.id != question.id {
                self.store.set_question_active(&other.id, false).await?;
            }
        }
        let question = self.store.set_question_active(question_id, true).await?;
        tracing::info!(
            "Activated question {} in session {}",
            question.id,
            question.session_id
        );
        Ok(question)
    }

    pub async fn deactivate_question(&self, question_id: &str) -> Result<Question, SessionError> {
        Ok(self.store.set_question_active(question_id, false).await?)
    }

    /// The question students should currently see, with its options
    pub async fn active_question(
        &self,
        session_id: &str,
    ) -> Result<Option<QuestionWithOptions>, SessionError> {
        let active = self
            .store
            .list_questions(session_id)
            .await?
            .into_iter()
            .rev()
            .find(|q| q.is_active);
        match active {
            Some(q) => Ok(Some(load_question(self.store.as_ref(), &q.id).await?)),
            None => Ok(None),
        }
    }
}

/// What a student screen should do after a question change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveChange {
    /// Fetch and show this question
    Activated(QuestionId),
    /// The shown question was closed
    Deactivated,
}

/// Follows question change events of one session and reports when the
/// active question switches
#[derive(Debug, Clone, Default)]
pub struct ActiveQuestionTracker {
    current: Option<QuestionId>,
}

impl ActiveQuestionTracker {
    pub fn new(current: Option<QuestionId>) -> Self {
        Self { current }
    }

    pub fn current(&self) -> Option<&QuestionId> {
        self.current.as_ref()
    }

    pub fn observe(&mut self, event: &ChangeEvent<Question>) -> Option<ActiveChange> {
        let row = &event.row;
        if row.is_active {
            if self.current.as_ref() == Some(&row.id) {
                return None;
            }
            self.current = Some(row.id.clone());
            return Some(ActiveChange::Activated(row.id.clone()));
        }

        if self.current.as_ref() == Some(&row.id) {
            self.current = None;
            return Some(ActiveChange::Deactivated);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::Utc;

    fn service() -> (Arc<MemoryBackend>, SessionService) {
        let memory = Arc::new(MemoryBackend::new());
        (memory.clone(), SessionService::new(memory))
    }

    fn mcq_draft(options: &[&str]) -> QuestionDraft {
        QuestionDraft {
            kind: QuestionType::Mcq,
            text: "  Pick one  ".to_string(),
            allow_multiple: false,
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    fn question_row(id: &str, active: bool) -> Question {
        Question {
            id: id.to_string(),
            session_id: "s1".to_string(),
            kind: QuestionType::Essay,
            text: "Why?".to_string(),
            is_active: active,
            allow_multiple: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_generated_codes_are_valid() {
        for _ in 0..100 {
            assert!(is_valid_code(&generate_session_code()));
        }
    }

    #[test]
    fn test_code_validation() {
        assert!(is_valid_code("123456"));
        assert!(!is_valid_code("12345"));
        assert!(!is_valid_code("1234567"));
        assert!(!is_valid_code("12a456"));
        assert!(!is_valid_code(""));
    }

    #[test]
    fn test_draft_positions_follow_input_order() {
        let question = mcq_draft(&[" A ", "", "B", "   ", "C"]).validate("s1").unwrap();
        assert_eq!(question.text, "Pick one");
        assert_eq!(
            question.options,
            vec![
                ("A".to_string(), 0),
                ("B".to_string(), 1),
                ("C".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_mcq_draft_needs_two_options() {
        let result = mcq_draft(&["only", " "]).validate("s1");
        assert!(matches!(result, Err(SessionError::Invalid(_))));
    }

    #[test]
    fn test_essay_draft_never_allows_multiple() {
        let draft = QuestionDraft {
            kind: QuestionType::Essay,
            text: "Explain".to_string(),
            allow_multiple: true,
            options: vec!["ignored".to_string()],
        };
        let question = draft.validate("s1").unwrap();
        assert!(!question.allow_multiple);
        assert!(question.options.is_empty());
    }

    #[tokio::test]
    async fn test_create_and_join_session() {
        let (_, service) = service();
        let session = service.create_session("teacher-1").await.unwrap();
        assert!(is_valid_code(&session.code));
        assert!(session.is_active);

        let joined = service.join(&format!(" {} ", session.code)).await.unwrap();
        assert_eq!(joined.id, session.id);
    }

    #[tokio::test]
    async fn test_join_rejects_bad_and_inactive_codes() {
        let (_, service) = service();
        assert_eq!(service.join("12ab").await, Err(SessionError::InvalidCode));
        assert_eq!(service.join("000000").await, Err(SessionError::NotFound));

        let session = service.create_session("teacher-1").await.unwrap();
        service.set_session_active(&session.id, false).await.unwrap();
        assert_eq!(service.join(&session.code).await, Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_list_sessions_newest_first() {
        let (_, service) = service();
        let first = service.create_session("teacher-1").await.unwrap();
        let second = service.create_session("teacher-1").await.unwrap();
        service.create_session("teacher-2").await.unwrap();

        let sessions = service.list_sessions("teacher-1").await.unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn test_activation_keeps_one_active_question() {
        let (_, service) = service();
        let session = service.create_session("teacher-1").await.unwrap();
        let q1 = service
            .create_question(&session.id, mcq_draft(&["A", "B"]))
            .await
            .unwrap();
        let q2 = service
            .create_question(&session.id, mcq_draft(&["C", "D"]))
            .await
            .unwrap();
        assert!(!q1.question.is_active);

        service.activate_question(q1.id()).await.unwrap();
        service.activate_question(q2.id()).await.unwrap();

        let active = service.active_question(&session.id).await.unwrap().unwrap();
        assert_eq!(active.id(), q2.id());
        assert_eq!(active.options.len(), 2);

        service.deactivate_question(q2.id()).await.unwrap();
        assert_eq!(service.active_question(&session.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_question_in_unknown_session() {
        let (_, service) = service();
        let result = service.create_question("missing", mcq_draft(&["A", "B"])).await;
        assert!(matches!(
            result,
            Err(SessionError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_tracker_follows_activation() {
        let mut tracker = ActiveQuestionTracker::default();
        assert_eq!(
            tracker.observe(&ChangeEvent::update(question_row("q1", true))),
            Some(ActiveChange::Activated("q1".to_string()))
        );
        assert_eq!(
            tracker.observe(&ChangeEvent::update(question_row("q1", true))),
            None
        );
        // Another question closing does not affect the shown one
        assert_eq!(
            tracker.observe(&ChangeEvent::update(question_row("q0", false))),
            None
        );
        assert_eq!(
            tracker.observe(&ChangeEvent::update(question_row("q1", false))),
            Some(ActiveChange::Deactivated)
        );
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn test_tracker_ignores_inactive_inserts() {
        let mut tracker = ActiveQuestionTracker::new(Some("q1".to_string()));
        assert_eq!(
            tracker.observe(&ChangeEvent::insert(question_row("q2", false))),
            None
        );
        assert_eq!(tracker.current(), Some(&"q1".to_string()));
    }
}
