//! Essay answer feed grouped by student
//!
//! Every student has exactly one "latest" entry; older answers of the same
//! student stay in the feed but sort after all latest entries. Hidden answers
//! are dimmed, never removed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::Aggregate;
use crate::answer::{normalize, Answer, AnswerPatch, AnswerSource};
use crate::backend::{AnswerColumn, Store};
use crate::error::{LoadError, PersistError};
use crate::types::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEntry {
    #[serde(flatten)]
    pub answer: Answer,
    pub is_latest: bool,
    /// Arrival order, newest highest
    #[serde(skip)]
    seq: u64,
}

/// Read-only projection of the feed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedFilter {
    /// Only each student's latest answer
    Latest,
    #[default]
    All,
}

impl FeedFilter {
    pub fn admits(&self, entry: &FeedEntry) -> bool {
        match self {
            FeedFilter::Latest => entry.is_latest,
            FeedFilter::All => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedSnapshot {
    pub total_answers: u32,
    pub entries: Vec<FeedEntry>,
}

impl FeedSnapshot {
    pub fn filtered(&self, filter: FeedFilter) -> FeedSnapshot {
        FeedSnapshot {
            total_answers: self.total_answers,
            entries: self
                .entries
                .iter()
                .filter(|e| filter.admits(e))
                .cloned()
                .collect(),
        }
    }
}

/// A moderation change applied locally but not yet confirmed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToggle {
    pub answer_id: AnswerId,
    pub previous: bool,
    pub tentative: bool,
}

#[derive(Debug, Clone)]
pub struct EssayFeed {
    question_id: QuestionId,
    entries: Vec<FeedEntry>,
    total_answers: u32,
    next_seq: u64,
}

/// Latest entries first, then newest `created_at`, then most recently processed
fn feed_order(a: &FeedEntry, b: &FeedEntry) -> Ordering {
    b.is_latest
        .cmp(&a.is_latest)
        .then_with(|| b.answer.created_at.cmp(&a.answer.created_at))
        .then_with(|| b.seq.cmp(&a.seq))
}

impl EssayFeed {
    pub fn new(question_id: impl Into<QuestionId>) -> Self {
        Self {
            question_id: question_id.into(),
            entries: Vec::new(),
            total_answers: 0,
            next_seq: 0,
        }
    }

    /// Build the feed from a full load. Within each student the newest
    /// answer is latest; equal timestamps favour the later row.
    pub fn from_answers(
        question_id: impl Into<QuestionId>,
        answers: impl IntoIterator<Item = Answer>,
    ) -> Self {
        let mut feed = Self::new(question_id);
        for answer in answers {
            if answer.question_id != feed.question_id || answer.text().is_none() {
                continue;
            }
            let seq = feed.bump_seq();
            feed.entries.push(FeedEntry {
                answer,
                is_latest: false,
                seq,
            });
        }
        feed.total_answers = feed.entries.len() as u32;

        let mut latest: HashMap<&str, usize> = HashMap::new();
        for (idx, entry) in feed.entries.iter().enumerate() {
            latest
                .entry(entry.answer.student_id.as_str())
                .and_modify(|best| {
                    let current = &feed.entries[*best];
                    if (entry.answer.created_at, entry.seq)
                        > (current.answer.created_at, current.seq)
                    {
                        *best = idx;
                    }
                })
                .or_insert(idx);
        }
        let latest: HashSet<usize> = latest.into_values().collect();
        for (idx, entry) in feed.entries.iter_mut().enumerate() {
            entry.is_latest = latest.contains(&idx);
        }

        feed.entries.sort_by(feed_order);
        feed
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn question_id(&self) -> &QuestionId {
        &self.question_id
    }

    pub fn total_answers(&self) -> u32 {
        self.total_answers
    }

    /// The canonical ordered list
    pub fn all(&self) -> &[FeedEntry] {
        &self.entries
    }

    pub fn latest_only(&self) -> impl Iterator<Item = &FeedEntry> {
        self.entries.iter().filter(|e| e.is_latest)
    }

    pub fn view(&self, filter: FeedFilter) -> Vec<&FeedEntry> {
        self.entries.iter().filter(|e| filter.admits(e)).collect()
    }

    pub fn get(&self, answer_id: &str) -> Option<&FeedEntry> {
        self.entries.iter().find(|e| e.answer.id == answer_id)
    }

    pub fn distinct_students(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.answer.student_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Put a freshly observed answer at the head as its student's latest,
    /// demoting that student's earlier entries. Not idempotent.
    pub fn apply_new_answer(&mut self, answer: Answer) -> bool {
        if answer.question_id != self.question_id || answer.text().is_none() {
            return false;
        }

        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.answer.student_id == answer.student_id)
        {
            entry.is_latest = false;
        }

        let seq = self.bump_seq();
        self.entries.insert(
            0,
            FeedEntry {
                answer,
                is_latest: true,
                seq,
            },
        );
        self.entries.sort_by(feed_order);
        self.total_answers += 1;
        true
    }

    /// Merge changed fields into the entry with the patch's id.
    /// Unknown ids are dropped.
    pub fn apply_update(&mut self, patch: AnswerPatch) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.answer.id == patch.id) else {
            tracing::debug!("Dropping update for unknown answer {}", patch.id);
            return false;
        };

        if let Some(is_hidden) = patch.is_hidden {
            entry.answer.is_hidden = is_hidden;
        }
        if let Some(text) = patch.text {
            if let crate::answer::AnswerBody::Text { text: current } = &mut entry.answer.body {
                *current = text;
            }
        }
        true
    }

    /// First phase of a moderation toggle: flip the flag locally
    pub fn begin_toggle(&mut self, answer_id: &str, current_hidden: bool) -> Option<PendingToggle> {
        let entry = self.entries.iter_mut().find(|e| e.answer.id == answer_id)?;
        entry.answer.is_hidden = !current_hidden;
        Some(PendingToggle {
            answer_id: answer_id.to_string(),
            previous: current_hidden,
            tentative: !current_hidden,
        })
    }

    /// Second phase: keep the tentative value on success, restore the
    /// previous one on failure and hand the error back
    pub fn settle_toggle(
        &mut self,
        pending: PendingToggle,
        result: Result<(), PersistError>,
    ) -> Result<(), PersistError> {
        if let Err(e) = result {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.answer.id == pending.answer_id)
            {
                entry.answer.is_hidden = pending.previous;
            }
            tracing::warn!(
                "Reverted moderation of answer {}: {}",
                pending.answer_id,
                e
            );
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Aggregate for EssayFeed {
    type Snapshot = FeedSnapshot;

    async fn load_base(
        store: &dyn Store,
        question: &QuestionWithOptions,
    ) -> Result<Self, LoadError> {
        let rows = store
            .select_answers(question.id(), AnswerColumn::Text)
            .await
            .map_err(|source| LoadError {
                question_id: question.id().clone(),
                source,
            })?;

        let answers = rows
            .into_iter()
            .filter_map(|row| match normalize(AnswerSource::Loaded(row)) {
                Ok(answer) => Some(answer),
                Err(e) => {
                    tracing::warn!("Dropping malformed stored answer: {}", e);
                    None
                }
            });

        let feed = Self::from_answers(question.id().clone(), answers);
        tracing::info!(
            "Loaded {} essay answers from {} students for question {}",
            feed.total_answers,
            feed.distinct_students(),
            question.id()
        );
        Ok(feed)
    }

    fn apply_new(&mut self, answer: Answer) -> bool {
        self.apply_new_answer(answer)
    }

    fn apply_update(&mut self, patch: AnswerPatch) -> bool {
        EssayFeed::apply_update(self, patch)
    }

    fn answer_ids(&self) -> Vec<AnswerId> {
        self.entries.iter().map(|e| e.answer.id.clone()).collect()
    }

    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            total_answers: self.total_answers,
            entries: self.entries.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::AnswerBody;
    use crate::error::StoreError;
    use chrono::{TimeZone, Utc};

    fn essay(id: &str, student: &str, t: i64) -> Answer {
        Answer {
            id: id.to_string(),
            question_id: "q1".to_string(),
            student_id: student.to_string(),
            body: AnswerBody::Text {
                text: format!("answer {}", id),
            },
            created_at: Utc.timestamp_opt(t, 0).unwrap(),
            is_hidden: false,
            provisional: false,
        }
    }

    fn ids(feed: &EssayFeed) -> Vec<(&str, bool)> {
        feed.all()
            .iter()
            .map(|e| (e.answer.id.as_str(), e.is_latest))
            .collect()
    }

    fn latest_count(feed: &EssayFeed) -> usize {
        feed.latest_only().count()
    }

    #[test]
    fn test_load_orders_latest_first() {
        let feed = EssayFeed::from_answers(
            "q1",
            vec![essay("A", "1", 10), essay("B", "2", 20), essay("C", "1", 30)],
        );
        assert_eq!(ids(&feed), vec![("C", true), ("B", true), ("A", false)]);
        assert_eq!(feed.total_answers(), 3);
    }

    #[test]
    fn test_load_order_independent_of_input_order() {
        let feed = EssayFeed::from_answers(
            "q1",
            vec![essay("C", "1", 30), essay("A", "1", 10), essay("B", "2", 20)],
        );
        assert_eq!(ids(&feed), vec![("C", true), ("B", true), ("A", false)]);
    }

    #[test]
    fn test_equal_timestamps_favour_later_row() {
        let feed = EssayFeed::from_answers(
            "q1",
            vec![essay("first", "1", 10), essay("second", "1", 10)],
        );
        assert_eq!(ids(&feed), vec![("second", true), ("first", false)]);
    }

    #[test]
    fn test_load_skips_choice_answers() {
        let mut choice = essay("X", "1", 5);
        choice.body = AnswerBody::Choice {
            option_ids: vec!["o1".to_string()],
        };
        let feed = EssayFeed::from_answers("q1", vec![choice, essay("A", "2", 10)]);
        assert_eq!(feed.total_answers(), 1);
    }

    #[test]
    fn test_one_latest_per_student_after_every_new_answer() {
        let mut feed = EssayFeed::new("q1");
        let arrivals = [
            ("a", "1", 10),
            ("b", "2", 11),
            ("c", "1", 12),
            ("d", "3", 13),
            ("e", "2", 14),
            ("f", "1", 15),
        ];
        for (id, student, t) in arrivals {
            feed.apply_new_answer(essay(id, student, t));
            assert_eq!(latest_count(&feed), feed.distinct_students());
        }
        assert_eq!(feed.total_answers(), 6);
        assert_eq!(
            ids(&feed),
            vec![
                ("f", true),
                ("e", true),
                ("d", true),
                ("c", false),
                ("b", false),
                ("a", false)
            ]
        );
    }

    #[test]
    fn test_new_answer_demotes_previous_latest() {
        let mut feed = EssayFeed::from_answers("q1", vec![essay("A", "1", 10)]);
        feed.apply_new_answer(essay("B", "1", 20));

        assert!(!feed.get("A").unwrap().is_latest);
        assert!(feed.get("B").unwrap().is_latest);
    }

    #[test]
    fn test_duplicate_new_answer_is_not_deduplicated() {
        let mut feed = EssayFeed::new("q1");
        feed.apply_new_answer(essay("A", "1", 10));
        feed.apply_new_answer(essay("A", "1", 10));

        assert_eq!(feed.total_answers(), 2);
        assert_eq!(feed.all().len(), 2);
        assert_eq!(latest_count(&feed), 1);
    }

    #[test]
    fn test_update_merges_by_id() {
        let mut feed = EssayFeed::from_answers("q1", vec![essay("A", "1", 10)]);
        assert!(feed.apply_update(AnswerPatch::hidden("A", true)));
        assert!(feed.get("A").unwrap().answer.is_hidden);
    }

    #[test]
    fn test_update_for_unknown_id_is_dropped() {
        let mut feed = EssayFeed::from_answers("q1", vec![essay("A", "1", 10)]);
        let before = feed.snapshot();
        assert!(!feed.apply_update(AnswerPatch::hidden("nope", true)));
        assert_eq!(feed.snapshot(), before);
    }

    #[test]
    fn test_projections_do_not_mutate() {
        let feed = EssayFeed::from_answers(
            "q1",
            vec![essay("A", "1", 10), essay("B", "2", 20), essay("C", "1", 30)],
        );
        let latest: Vec<&str> = feed
            .view(FeedFilter::Latest)
            .iter()
            .map(|e| e.answer.id.as_str())
            .collect();
        assert_eq!(latest, vec!["C", "B"]);
        assert_eq!(feed.view(FeedFilter::All).len(), 3);
        assert_eq!(feed.all().len(), 3);

        let snapshot = feed.snapshot().filtered(FeedFilter::Latest);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.total_answers, 3);
    }

    #[test]
    fn test_toggle_success_keeps_tentative_value() {
        let mut feed = EssayFeed::from_answers("q1", vec![essay("A", "1", 10)]);
        let pending = feed.begin_toggle("A", false).unwrap();
        assert!(feed.get("A").unwrap().answer.is_hidden);

        assert!(feed.settle_toggle(pending, Ok(())).is_ok());
        assert!(feed.get("A").unwrap().answer.is_hidden);
    }

    #[test]
    fn test_toggle_failure_rolls_back() {
        let mut feed = EssayFeed::from_answers("q1", vec![essay("A", "1", 10)]);
        let before = feed.snapshot();

        let pending = feed.begin_toggle("A", false).unwrap();
        let err = PersistError::new("answer A", StoreError::Unavailable("down".to_string()));
        let result = feed.settle_toggle(pending, Err(err.clone()));

        assert_eq!(result, Err(err));
        assert!(!feed.get("A").unwrap().answer.is_hidden);
        assert_eq!(feed.snapshot(), before);
    }

    #[test]
    fn test_hidden_entries_stay_in_feed() {
        let mut feed = EssayFeed::from_answers("q1", vec![essay("A", "1", 10)]);
        feed.begin_toggle("A", false).unwrap();
        assert_eq!(feed.view(FeedFilter::Latest).len(), 1);
    }

    #[test]
    fn test_toggle_unknown_answer() {
        let mut feed = EssayFeed::new("q1");
        assert!(feed.begin_toggle("missing", false).is_none());
    }
}
