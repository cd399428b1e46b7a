//! In-process backend
//!
//! Rows live in `RwLock`ed maps like the rest of the server state; change
//! notifications and broadcasts fan out through `tokio::sync::broadcast`
//! channels keyed by their filter. Fault switches let tests exercise the
//! failure paths of loads, inserts and moderation updates.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::{AnswerColumn, BroadcastBus, ChangeFeed, Store, Subscription};
use crate::error::{StoreError, StoreResult};
use crate::protocol::ChangeEvent;
use crate::types::*;

/// Default capacity of every per-topic channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Publisher registry for one kind of topic
struct Topics<K, T> {
    senders: RwLock<HashMap<K, broadcast::Sender<T>>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, T: Clone> Topics<K, T> {
    fn new(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    async fn subscribe(&self, key: &K) -> broadcast::Receiver<T> {
        let mut senders = self.senders.write().await;
        // Topics whose last subscriber went away are dropped here
        senders.retain(|_, sender| sender.receiver_count() > 0);
        senders
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publisher for a topic with live subscribers. A topic without any is
    /// removed and `None` returned.
    async fn sender(&self, key: &K) -> Option<broadcast::Sender<T>> {
        {
            let senders = self.senders.read().await;
            match senders.get(key) {
                None => return None,
                Some(sender) if sender.receiver_count() > 0 => return Some(sender.clone()),
                Some(_) => {}
            }
        }

        let mut senders = self.senders.write().await;
        if senders
            .get(key)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            senders.remove(key);
        }
        None
    }

    async fn receiver_count(&self, key: &K) -> usize {
        self.senders
            .read()
            .await
            .get(key)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct Faults {
    selects: AtomicBool,
    inserts: AtomicBool,
    updates: AtomicBool,
}

pub struct MemoryBackend {
    sessions: RwLock<HashMap<SessionId, Session>>,
    questions: RwLock<HashMap<QuestionId, Question>>,
    options: RwLock<HashMap<OptionId, QuestionOption>>,
    /// Insertion order is kept so equal timestamps stay stable
    answers: RwLock<Vec<AnswerRow>>,
    last_created_at: RwLock<Option<DateTime<Utc>>>,
    answer_changes: Topics<QuestionId, ChangeEvent<AnswerRow>>,
    question_changes: Topics<SessionId, ChangeEvent<Question>>,
    broadcasts: Topics<(String, String), serde_json::Value>,
    change_delay: Duration,
    faults: Faults,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_CHANNEL_CAPACITY, Duration::ZERO)
    }

    /// `change_delay` postpones durable notifications to mimic replication lag
    pub fn with_settings(capacity: usize, change_delay: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            questions: RwLock::new(HashMap::new()),
            options: RwLock::new(HashMap::new()),
            answers: RwLock::new(Vec::new()),
            last_created_at: RwLock::new(None),
            answer_changes: Topics::new(capacity),
            question_changes: Topics::new(capacity),
            broadcasts: Topics::new(capacity),
            change_delay,
            faults: Faults::default(),
        }
    }

    pub fn fail_selects(&self, on: bool) {
        self.faults.selects.store(on, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, on: bool) {
        self.faults.inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, on: bool) {
        self.faults.updates.store(on, Ordering::SeqCst);
    }

    /// Insert a row as-is, without notifying anyone
    pub async fn seed_answer(&self, row: AnswerRow) {
        self.answers.write().await.push(row);
    }

    /// Live subscribers on a question's answer change feed
    pub async fn answer_subscribers(&self, question_id: &str) -> usize {
        self.answer_changes
            .receiver_count(&question_id.to_string())
            .await
    }

    /// Live subscribers on a broadcast channel/event pair
    pub async fn broadcast_subscribers(&self, channel: &str, event: &str) -> usize {
        self.broadcasts
            .receiver_count(&(channel.to_string(), event.to_string()))
            .await
    }

    fn check(flag: &AtomicBool, what: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{} rejected", what)))
        } else {
            Ok(())
        }
    }

    /// Strictly increasing timestamps, so rows inserted in the same
    /// millisecond still order by insertion
    async fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_created_at.write().await;
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + ChronoDuration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    async fn publish<T: Clone + Send + 'static>(&self, sender: Option<broadcast::Sender<T>>, event: T) {
        let Some(sender) = sender else {
            return;
        };
        if self.change_delay.is_zero() {
            // No receivers is fine
            let _ = sender.send(event);
        } else {
            let delay = self.change_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(event);
            });
        }
    }

    async fn publish_answer(&self, event: ChangeEvent<AnswerRow>) {
        let sender = self.answer_changes.sender(&event.row.question_id).await;
        self.publish(sender, event).await;
    }

    async fn publish_question(&self, event: ChangeEvent<Question>) {
        let sender = self.question_changes.sender(&event.row.session_id).await;
        self.publish(sender, event).await;
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryBackend {
    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        Self::check(&self.faults.selects, "select")?;
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }

    async fn find_active_session(&self, code: &str) -> StoreResult<Option<Session>> {
        Self::check(&self.faults.selects, "select")?;
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.code == code && s.is_active)
            .cloned())
    }

    async fn list_sessions(&self, teacher_id: &str) -> StoreResult<Vec<Session>> {
        Self::check(&self.faults.selects, "select")?;
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.teacher_id.as_deref() == Some(teacher_id))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn insert_session(
        &self,
        code: String,
        teacher_id: Option<TeacherId>,
    ) -> StoreResult<Session> {
        Self::check(&self.faults.inserts, "insert")?;
        let created_at = self.next_timestamp().await;
        let mut sessions = self.sessions.write().await;
        if sessions.values().any(|s| s.code == code) {
            return Err(StoreError::Conflict(format!("session code {}", code)));
        }

        let session = Session {
            id: ulid::Ulid::new().to_string(),
            code,
            is_active: true,
            teacher_id,
            created_at,
        };
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn set_session_active(&self, id: &str, active: bool) -> StoreResult<Session> {
        Self::check(&self.faults.updates, "update")?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", id)))?;
        session.is_active = active;
        Ok(session.clone())
    }

    async fn get_question(&self, id: &str) -> StoreResult<Question> {
        Self::check(&self.faults.selects, "select")?;
        self.questions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("question {}", id)))
    }

    async fn list_questions(&self, session_id: &str) -> StoreResult<Vec<Question>> {
        Self::check(&self.faults.selects, "select")?;
        let mut questions: Vec<Question> = self
            .questions
            .read()
            .await
            .values()
            .filter(|q| q.session_id == session_id)
            .cloned()
            .collect();
        questions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(questions)
    }

    async fn insert_question(&self, new: NewQuestion) -> StoreResult<QuestionWithOptions> {
        Self::check(&self.faults.inserts, "insert")?;
        if !self.sessions.read().await.contains_key(&new.session_id) {
            return Err(StoreError::NotFound(format!("session {}", new.session_id)));
        }

        let question = Question {
            id: ulid::Ulid::new().to_string(),
            session_id: new.session_id,
            kind: new.kind,
            text: new.text,
            is_active: false,
            allow_multiple: new.allow_multiple,
            created_at: self.next_timestamp().await,
        };
        let options: Vec<QuestionOption> = new
            .options
            .into_iter()
            .map(|(text, position)| QuestionOption {
                id: ulid::Ulid::new().to_string(),
                question_id: question.id.clone(),
                text,
                position,
            })
            .collect();

        self.questions
            .write()
            .await
            .insert(question.id.clone(), question.clone());
        {
            let mut stored = self.options.write().await;
            for option in &options {
                stored.insert(option.id.clone(), option.clone());
            }
        }

        self.publish_question(ChangeEvent::insert(question.clone()))
            .await;
        Ok(QuestionWithOptions { question, options })
    }

    async fn set_question_active(&self, id: &str, active: bool) -> StoreResult<Question> {
        Self::check(&self.faults.updates, "update")?;
        let question = {
            let mut questions = self.questions.write().await;
            let question = questions
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("question {}", id)))?;
            question.is_active = active;
            question.clone()
        };

        self.publish_question(ChangeEvent::update(question.clone()))
            .await;
        Ok(question)
    }

    async fn list_options(&self, question_id: &str) -> StoreResult<Vec<QuestionOption>> {
        Self::check(&self.faults.selects, "select")?;
        let mut options: Vec<QuestionOption> = self
            .options
            .read()
            .await
            .values()
            .filter(|o| o.question_id == question_id)
            .cloned()
            .collect();
        options.sort_by_key(|o| o.position);
        Ok(options)
    }

    async fn select_answers(
        &self,
        question_id: &str,
        not_null: AnswerColumn,
    ) -> StoreResult<Vec<AnswerRow>> {
        Self::check(&self.faults.selects, "select")?;
        Ok(self
            .answers
            .read()
            .await
            .iter()
            .filter(|a| a.question_id == question_id)
            .filter(|a| match not_null {
                AnswerColumn::OptionId => a.option_id.is_some(),
                AnswerColumn::Text => a.text.is_some(),
            })
            .cloned()
            .collect())
    }

    async fn insert_answers(&self, rows: Vec<NewAnswer>) -> StoreResult<Vec<AnswerRow>> {
        Self::check(&self.faults.inserts, "insert")?;
        let created_at = self.next_timestamp().await;
        let inserted: Vec<AnswerRow> = rows
            .into_iter()
            .map(|new| AnswerRow {
                id: ulid::Ulid::new().to_string(),
                question_id: new.question_id,
                student_id: new.student_id,
                option_id: new.option_id,
                text: new.text,
                is_hidden: false,
                created_at,
            })
            .collect();

        self.answers.write().await.extend(inserted.iter().cloned());
        for row in &inserted {
            self.publish_answer(ChangeEvent::insert(row.clone())).await;
        }
        Ok(inserted)
    }

    async fn set_answer_hidden(&self, id: &str, is_hidden: bool) -> StoreResult<AnswerRow> {
        Self::check(&self.faults.updates, "update")?;
        let row = {
            let mut answers = self.answers.write().await;
            let row = answers
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("answer {}", id)))?;
            row.is_hidden = is_hidden;
            row.clone()
        };

        self.publish_answer(ChangeEvent::update(row.clone())).await;
        Ok(row)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe_answers(
        &self,
        question_id: &str,
    ) -> StoreResult<Subscription<ChangeEvent<AnswerRow>>> {
        let rx = self.answer_changes.subscribe(&question_id.to_string()).await;
        Ok(Subscription::new(
            format!("answers:question_id={}", question_id),
            rx,
        ))
    }

    async fn subscribe_questions(
        &self,
        session_id: &str,
    ) -> StoreResult<Subscription<ChangeEvent<Question>>> {
        let rx = self.question_changes.subscribe(&session_id.to_string()).await;
        Ok(Subscription::new(
            format!("questions:session_id={}", session_id),
            rx,
        ))
    }
}

#[async_trait]
impl BroadcastBus for MemoryBackend {
    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> StoreResult<Subscription<serde_json::Value>> {
        let rx = self
            .broadcasts
            .subscribe(&(channel.to_string(), event.to_string()))
            .await;
        Ok(Subscription::new(format!("{}/{}", channel, event), rx))
    }

    async fn send(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        // Nobody listening is not an error for a best-effort bus
        if let Some(sender) = self
            .broadcasts
            .sender(&(channel.to_string(), event.to_string()))
            .await
        {
            let _ = sender.send(payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Delivery;

    async fn mcq(backend: &MemoryBackend) -> QuestionWithOptions {
        let session = backend
            .insert_session("123456".to_string(), Some("t1".to_string()))
            .await
            .unwrap();
        backend
            .insert_question(NewQuestion {
                session_id: session.id,
                kind: QuestionType::Mcq,
                text: "Pick one".to_string(),
                allow_multiple: false,
                options: vec![("A".to_string(), 0), ("B".to_string(), 1)],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_session_code_conflicts() {
        let backend = MemoryBackend::new();
        backend
            .insert_session("123456".to_string(), None)
            .await
            .unwrap();
        let result = backend.insert_session("123456".to_string(), None).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_insert_answer_notifies_subscribers() {
        let backend = MemoryBackend::new();
        let question = mcq(&backend).await;
        let mut sub = backend.subscribe_answers(question.id()).await.unwrap();

        backend
            .insert_answers(vec![NewAnswer {
                question_id: question.id().clone(),
                student_id: "s1".to_string(),
                option_id: Some(question.options[0].id.clone()),
                text: None,
            }])
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, crate::protocol::ChangeKind::Insert);
        assert_eq!(event.row.student_id, "s1");
    }

    #[tokio::test]
    async fn test_select_answers_filters_by_column() {
        let backend = MemoryBackend::new();
        let question = mcq(&backend).await;
        backend
            .insert_answers(vec![NewAnswer {
                question_id: question.id().clone(),
                student_id: "s1".to_string(),
                option_id: Some(question.options[1].id.clone()),
                text: None,
            }])
            .await
            .unwrap();

        let choices = backend
            .select_answers(question.id(), AnswerColumn::OptionId)
            .await
            .unwrap();
        let texts = backend
            .select_answers(question.id(), AnswerColumn::Text)
            .await
            .unwrap();
        assert_eq!(choices.len(), 1);
        assert!(texts.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_it() {
        let backend = MemoryBackend::new();
        let sub = backend.subscribe_answers("q1").await.unwrap();
        let bsub = BroadcastBus::subscribe(&backend, "question-q1", "new-answer")
            .await
            .unwrap();
        assert_eq!(backend.answer_subscribers("q1").await, 1);
        assert_eq!(
            backend.broadcast_subscribers("question-q1", "new-answer").await,
            1
        );

        sub.unsubscribe();
        drop(bsub);
        assert_eq!(backend.answer_subscribers("q1").await, 0);
        assert_eq!(
            backend.broadcast_subscribers("question-q1", "new-answer").await,
            0
        );
    }

    #[tokio::test]
    async fn test_abandoned_topics_are_pruned() {
        let backend = MemoryBackend::new();
        let question = mcq(&backend).await;

        let sub = backend.subscribe_answers(question.id()).await.unwrap();
        drop(sub);
        assert_eq!(backend.answer_changes.senders.read().await.len(), 1);

        // Publishing to a topic nobody listens to removes it
        backend
            .insert_answers(vec![NewAnswer {
                question_id: question.id().clone(),
                student_id: "s1".to_string(),
                option_id: Some(question.options[0].id.clone()),
                text: None,
            }])
            .await
            .unwrap();
        assert!(backend.answer_changes.senders.read().await.is_empty());

        // So does subscribing to any other topic
        let bsub = BroadcastBus::subscribe(&backend, "question-q1", "new-answer")
            .await
            .unwrap();
        drop(bsub);
        let _live = BroadcastBus::subscribe(&backend, "question-q2", "new-answer")
            .await
            .unwrap();
        let topics = backend.broadcasts.senders.read().await;
        assert_eq!(topics.len(), 1);
        assert!(topics.contains_key(&("question-q2".to_string(), "new-answer".to_string())));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told_how_much_it_missed() {
        let backend = MemoryBackend::with_settings(2, Duration::ZERO);
        let mut sub = backend.subscribe_answers("q1").await.unwrap();

        for i in 0..4 {
            backend
                .insert_answers(vec![NewAnswer {
                    question_id: "q1".to_string(),
                    student_id: format!("s{}", i),
                    option_id: Some("A".to_string()),
                    text: None,
                }])
                .await
                .unwrap();
        }

        assert_eq!(sub.next().await, Some(Delivery::Lagged(2)));
        match sub.next().await {
            Some(Delivery::Message(event)) => assert_eq!(event.row.student_id, "s2"),
            other => panic!("expected a message, got {:?}", other),
        }
        // recv skips lag and keeps going
        assert_eq!(sub.recv().await.map(|e| e.row.student_id), Some("s3".to_string()));
    }

    #[tokio::test]
    async fn test_broadcast_without_listeners_is_ok() {
        let backend = MemoryBackend::new();
        let result = backend
            .send("question-q1", "new-answer", serde_json::json!({}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fault_switches() {
        let backend = MemoryBackend::new();
        backend.fail_selects(true);
        assert!(backend.list_sessions("t1").await.is_err());
        backend.fail_selects(false);
        assert!(backend.list_sessions("t1").await.is_ok());

        backend.fail_inserts(true);
        assert!(backend.insert_session("111111".to_string(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let backend = MemoryBackend::new();
        let a = backend.next_timestamp().await;
        let b = backend.next_timestamp().await;
        assert!(b > a);
    }
}
