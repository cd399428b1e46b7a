//! Event reconciliation
//!
//! Two channels feed a results view: durable change notifications (real ids,
//! possibly seconds late) and ephemeral broadcasts (fast, provisional ids, may
//! never arrive). Both are normalized here and routed into the aggregate.
//!
//! A broadcast and the durable insert for the same submission are both
//! applied, so a submission can be counted twice. `Dedup::ByAnswerId` only
//! collapses repeated deliveries of the same id; it does not pair provisional
//! answers with their durable rows.
//!
//! Durable inserts of rows that were part of the base load are always skipped,
//! whatever the `Dedup` mode, since the load already counted them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::answer::{normalize, Answer, AnswerPatch, AnswerSource};
use crate::error::MalformedEvent;
use crate::protocol::{ChangeEvent, ChangeKind};
use crate::results::Aggregate;
use crate::types::{AnswerId, AnswerRow, QuestionId};

/// One event from either channel, before normalization
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Durable(ChangeEvent<AnswerRow>),
    Broadcast(serde_json::Value),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dedup {
    /// Apply every delivery
    #[default]
    None,
    /// Skip inserts whose answer id was already applied
    ByAnswerId,
}

/// What happened to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Applied,
    /// Well formed but not relevant to this aggregate
    Ignored,
    Duplicate,
    Dropped(MalformedEvent),
}

pub struct Reconciler {
    question_id: QuestionId,
    dedup: Dedup,
    /// Ids already in the aggregate from its base load
    loaded: HashSet<AnswerId>,
    seen: HashSet<AnswerId>,
}

impl Reconciler {
    pub fn new(question_id: impl Into<QuestionId>, dedup: Dedup) -> Self {
        Self {
            question_id: question_id.into(),
            dedup,
            loaded: HashSet::new(),
            seen: HashSet::new(),
        }
    }

    pub fn question_id(&self) -> &QuestionId {
        &self.question_id
    }

    /// Record the ids of the base load. Queued inserts of these rows are
    /// skipped in every mode.
    pub fn seed(&mut self, ids: impl IntoIterator<Item = AnswerId>) {
        self.loaded.extend(ids);
    }

    pub fn route<A: Aggregate>(&mut self, aggregate: &mut A, event: LiveEvent) -> Routed {
        match event {
            LiveEvent::Durable(ChangeEvent {
                event_type: ChangeKind::Insert,
                row,
            }) => match normalize(AnswerSource::Durable(row)) {
                Ok(answer) => self.insert(aggregate, answer),
                Err(e) => self.drop_malformed(e),
            },

            LiveEvent::Durable(ChangeEvent {
                event_type: ChangeKind::Update,
                row,
            }) => {
                if row.question_id != self.question_id {
                    return Routed::Ignored;
                }
                if row.id.is_empty() {
                    return self.drop_malformed(MalformedEvent::MissingField("id"));
                }
                if aggregate.apply_update(AnswerPatch::from_row(&row)) {
                    Routed::Applied
                } else {
                    Routed::Ignored
                }
            }

            LiveEvent::Broadcast(payload) => match normalize(AnswerSource::Broadcast(payload)) {
                Ok(answer) => self.insert(aggregate, answer),
                Err(e) => self.drop_malformed(e),
            },
        }
    }

    fn insert<A: Aggregate>(&mut self, aggregate: &mut A, answer: Answer) -> Routed {
        if answer.question_id != self.question_id {
            tracing::debug!(
                "Ignoring answer {} for question {} on view of {}",
                answer.id,
                answer.question_id,
                self.question_id
            );
            return Routed::Ignored;
        }

        if !answer.provisional && self.loaded.contains(&answer.id) {
            tracing::debug!("Skipping insert of already loaded answer {}", answer.id);
            return Routed::Duplicate;
        }

        if self.dedup == Dedup::ByAnswerId && !self.seen.insert(answer.id.clone()) {
            tracing::debug!("Skipping duplicate delivery of answer {}", answer.id);
            return Routed::Duplicate;
        }

        if aggregate.apply_new(answer) {
            Routed::Applied
        } else {
            Routed::Ignored
        }
    }

    fn drop_malformed(&self, error: MalformedEvent) -> Routed {
        tracing::warn!(
            "Dropping malformed event for question {}: {}",
            self.question_id,
            error
        );
        Routed::Dropped(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::PROVISIONAL_PREFIX;
    use crate::results::{EssayFeed, McqTally};
    use crate::types::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn mcq() -> QuestionWithOptions {
        QuestionWithOptions {
            question: Question {
                id: "q1".to_string(),
                session_id: "s".to_string(),
                kind: QuestionType::Mcq,
                text: "Pick".to_string(),
                is_active: true,
                allow_multiple: false,
                created_at: Utc::now(),
            },
            options: ["A", "B"]
                .iter()
                .enumerate()
                .map(|(i, t)| QuestionOption {
                    id: t.to_string(),
                    question_id: "q1".to_string(),
                    text: t.to_string(),
                    position: i as u32,
                })
                .collect(),
        }
    }

    fn choice_row(id: &str, option: &str) -> AnswerRow {
        AnswerRow {
            id: id.to_string(),
            question_id: "q1".to_string(),
            student_id: "s1".to_string(),
            option_id: Some(option.to_string()),
            text: None,
            is_hidden: false,
            created_at: Utc.timestamp_opt(10, 0).unwrap(),
        }
    }

    fn essay_row(id: &str, student: &str, t: i64) -> AnswerRow {
        AnswerRow {
            id: id.to_string(),
            question_id: "q1".to_string(),
            student_id: student.to_string(),
            option_id: None,
            text: Some(format!("text {}", id)),
            is_hidden: false,
            created_at: Utc.timestamp_opt(t, 0).unwrap(),
        }
    }

    #[test]
    fn test_durable_insert_increments_tally() {
        let mut tally = McqTally::new(&mcq());
        let mut reconciler = Reconciler::new("q1", Dedup::None);

        let routed = reconciler.route(
            &mut tally,
            LiveEvent::Durable(ChangeEvent::insert(choice_row("a1", "B"))),
        );
        assert_eq!(routed, Routed::Applied);
        assert_eq!(tally.option("B").unwrap().count, 1);
    }

    #[test]
    fn test_broadcast_and_durable_are_both_counted() {
        let mut tally = McqTally::new(&mcq());
        let mut reconciler = Reconciler::new("q1", Dedup::ByAnswerId);

        reconciler.route(
            &mut tally,
            LiveEvent::Broadcast(json!({
                "question_id": "q1",
                "student_id": "s1",
                "option_id": "B",
            })),
        );
        reconciler.route(
            &mut tally,
            LiveEvent::Durable(ChangeEvent::insert(choice_row("a1", "B"))),
        );

        assert_eq!(tally.total_answers(), 2);
        assert_eq!(tally.option("B").unwrap().count, 2);
    }

    #[test]
    fn test_same_durable_id_twice_without_dedup() {
        let mut feed = EssayFeed::new("q1");
        let mut reconciler = Reconciler::new("q1", Dedup::None);
        for _ in 0..2 {
            reconciler.route(
                &mut feed,
                LiveEvent::Durable(ChangeEvent::insert(essay_row("a1", "s1", 10))),
            );
        }
        assert_eq!(feed.total_answers(), 2);
    }

    #[test]
    fn test_dedup_by_id_makes_inserts_idempotent() {
        let mut feed = EssayFeed::new("q1");
        let mut reconciler = Reconciler::new("q1", Dedup::ByAnswerId);

        let first = reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::insert(essay_row("a1", "s1", 10))),
        );
        let second = reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::insert(essay_row("a1", "s1", 10))),
        );

        assert_eq!(first, Routed::Applied);
        assert_eq!(second, Routed::Duplicate);
        assert_eq!(feed.total_answers(), 1);
    }

    #[test]
    fn test_seeded_ids_are_skipped() {
        let mut feed = EssayFeed::from_answers(
            "q1",
            vec![normalize(AnswerSource::Loaded(essay_row("a1", "s1", 10))).unwrap()],
        );
        let mut reconciler = Reconciler::new("q1", Dedup::ByAnswerId);
        reconciler.seed(Aggregate::answer_ids(&feed));

        let routed = reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::insert(essay_row("a1", "s1", 10))),
        );
        assert_eq!(routed, Routed::Duplicate);
        assert_eq!(feed.total_answers(), 1);
    }

    #[test]
    fn test_loaded_ids_are_skipped_without_dedup() {
        let mut feed = EssayFeed::from_answers(
            "q1",
            vec![normalize(AnswerSource::Loaded(essay_row("a1", "s1", 10))).unwrap()],
        );
        let mut reconciler = Reconciler::new("q1", Dedup::None);
        reconciler.seed(Aggregate::answer_ids(&feed));

        let routed = reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::insert(essay_row("a1", "s1", 10))),
        );
        assert_eq!(routed, Routed::Duplicate);
        assert_eq!(feed.total_answers(), 1);
        assert_eq!(feed.all().iter().filter(|e| e.answer.id == "a1").count(), 1);

        // Rows that were not in the load still go through
        let routed = reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::insert(essay_row("a2", "s2", 11))),
        );
        assert_eq!(routed, Routed::Applied);
    }

    #[test]
    fn test_seeding_keeps_broadcast_and_durable_pair() {
        let mut tally = McqTally::new(&mcq());
        let mut reconciler = Reconciler::new("q1", Dedup::None);
        reconciler.seed(vec!["a0".to_string()]);

        let fast = reconciler.route(
            &mut tally,
            LiveEvent::Broadcast(json!({
                "question_id": "q1",
                "student_id": "s1",
                "option_id": "A",
            })),
        );
        let durable = reconciler.route(
            &mut tally,
            LiveEvent::Durable(ChangeEvent::insert(choice_row("a1", "A"))),
        );

        assert_eq!(fast, Routed::Applied);
        assert_eq!(durable, Routed::Applied);
        assert_eq!(tally.option("A").unwrap().count, 2);
    }

    #[test]
    fn test_durable_update_routes_to_apply_update() {
        let mut feed = EssayFeed::new("q1");
        let mut reconciler = Reconciler::new("q1", Dedup::None);
        reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::insert(essay_row("a1", "s1", 10))),
        );

        let mut hidden = essay_row("a1", "s1", 10);
        hidden.is_hidden = true;
        let routed = reconciler.route(&mut feed, LiveEvent::Durable(ChangeEvent::update(hidden)));

        assert_eq!(routed, Routed::Applied);
        assert!(feed.get("a1").unwrap().answer.is_hidden);
        assert_eq!(feed.total_answers(), 1);
    }

    #[test]
    fn test_update_for_unloaded_answer_is_ignored() {
        let mut feed = EssayFeed::new("q1");
        let mut reconciler = Reconciler::new("q1", Dedup::None);
        let routed = reconciler.route(
            &mut feed,
            LiveEvent::Durable(ChangeEvent::update(essay_row("later", "s1", 10))),
        );
        assert_eq!(routed, Routed::Ignored);
    }

    #[test]
    fn test_essay_broadcast_becomes_provisional_latest() {
        let mut feed = EssayFeed::new("q1");
        let mut reconciler = Reconciler::new("q1", Dedup::None);

        reconciler.route(
            &mut feed,
            LiveEvent::Broadcast(json!({
                "question_id": "q1",
                "student_id": "s1",
                "text": "fast",
            })),
        );

        let entry = &feed.all()[0];
        assert!(entry.is_latest);
        assert!(entry.answer.provisional);
        assert!(entry.answer.id.starts_with(PROVISIONAL_PREFIX));
    }

    #[test]
    fn test_malformed_broadcast_is_dropped() {
        let mut tally = McqTally::new(&mcq());
        let mut reconciler = Reconciler::new("q1", Dedup::None);

        let routed = reconciler.route(&mut tally, LiveEvent::Broadcast(json!({ "foo": 1 })));
        assert!(matches!(routed, Routed::Dropped(_)));
        assert_eq!(tally.total_answers(), 0);
    }

    #[test]
    fn test_broadcast_for_other_question_is_ignored() {
        let mut tally = McqTally::new(&mcq());
        let mut reconciler = Reconciler::new("q1", Dedup::None);

        let routed = reconciler.route(
            &mut tally,
            LiveEvent::Broadcast(json!({ "question_id": "q2", "option_id": "A" })),
        );
        assert_eq!(routed, Routed::Ignored);
    }

    #[test]
    fn test_malformed_durable_row_is_dropped() {
        let mut tally = McqTally::new(&mcq());
        let mut reconciler = Reconciler::new("q1", Dedup::None);
        let mut row = choice_row("a1", "A");
        row.option_id = None;

        let routed = reconciler.route(&mut tally, LiveEvent::Durable(ChangeEvent::insert(row)));
        assert_eq!(routed, Routed::Dropped(MalformedEvent::EmptyBody));
    }
}
