//! Running per-option counts for multiple-choice questions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Aggregate;
use crate::answer::{normalize, Answer, AnswerPatch, AnswerSource};
use crate::backend::{AnswerColumn, Store};
use crate::error::LoadError;
use crate::types::*;

/// Share of `count` in `total` as a whole percent, rounding halves up.
/// Zero when nothing has been answered yet.
pub fn percentage(count: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let (count, total) = (count as u64, total as u64);
    ((count * 200 + total) / (total * 2)) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionTally {
    pub option_id: OptionId,
    pub text: String,
    pub position: u32,
    pub count: u32,
    pub percentage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TallySnapshot {
    pub total_answers: u32,
    pub options: Vec<OptionTally>,
}

#[derive(Debug, Clone)]
pub struct McqTally {
    question_id: QuestionId,
    total_answers: u32,
    options: Vec<OptionTally>,
    /// Answer ids seen, in arrival order
    seen: Vec<AnswerId>,
}

impl McqTally {
    /// Empty tally over the question's options, in position order
    pub fn new(question: &QuestionWithOptions) -> Self {
        let mut options: Vec<OptionTally> = question
            .options
            .iter()
            .map(|o| OptionTally {
                option_id: o.id.clone(),
                text: o.text.clone(),
                position: o.position,
                count: 0,
                percentage: 0,
            })
            .collect();
        options.sort_by_key(|o| o.position);

        Self {
            question_id: question.id().clone(),
            total_answers: 0,
            options,
            seen: Vec::new(),
        }
    }

    /// Tally a batch of already normalized answers
    pub fn from_answers(
        question: &QuestionWithOptions,
        answers: impl IntoIterator<Item = Answer>,
    ) -> Self {
        let mut tally = Self::new(question);
        for answer in answers {
            if !tally.apply_increment(&answer) {
                tracing::debug!(
                    "Skipping answer {} with no known option for question {}",
                    answer.id,
                    tally.question_id
                );
            }
        }
        tally
    }

    pub fn total_answers(&self) -> u32 {
        self.total_answers
    }

    pub fn options(&self) -> &[OptionTally] {
        &self.options
    }

    pub fn option(&self, option_id: &str) -> Option<&OptionTally> {
        self.options.iter().find(|o| o.option_id == option_id)
    }

    /// Count one submission. Every known option it selects goes up by one and
    /// the total goes up by one per call. Unknown options are ignored; an
    /// answer with no known option is a no-op. Duplicates are not detected.
    pub fn apply_increment(&mut self, answer: &Answer) -> bool {
        if answer.question_id != self.question_id {
            return false;
        }

        let ids = answer.option_ids();
        let mut matched = false;
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                continue;
            }
            match self.options.iter_mut().find(|o| &o.option_id == id) {
                Some(option) => {
                    option.count += 1;
                    matched = true;
                }
                None => {
                    tracing::debug!("Ignoring increment for unknown option {}", id);
                }
            }
        }

        if !matched {
            return false;
        }

        self.total_answers += 1;
        self.seen.push(answer.id.clone());
        self.recompute_percentages();
        true
    }

    fn recompute_percentages(&mut self) {
        let total = self.total_answers;
        for option in &mut self.options {
            option.percentage = percentage(option.count, total);
        }
    }
}

#[async_trait]
impl Aggregate for McqTally {
    type Snapshot = TallySnapshot;

    async fn load_base(
        store: &dyn Store,
        question: &QuestionWithOptions,
    ) -> Result<Self, LoadError> {
        let rows = store
            .select_answers(question.id(), AnswerColumn::OptionId)
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

        let tally = Self::from_answers(question, answers);
        tracing::info!(
            "Loaded {} answers for MCQ question {}",
            tally.total_answers,
            question.id()
        );
        Ok(tally)
    }

    fn apply_new(&mut self, answer: Answer) -> bool {
        self.apply_increment(&answer)
    }

    /// Choices never change after insert; hiding does not affect counts
    fn apply_update(&mut self, _patch: AnswerPatch) -> bool {
        false
    }

    fn answer_ids(&self) -> Vec<AnswerId> {
        self.seen.clone()
    }

    fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            total_answers: self.total_answers,
            options: self.options.clone(),
        }
    }
}
