//! Result aggregates kept live by a [`LiveView`](crate::view::LiveView)

pub mod feed;
pub mod tally;

use async_trait::async_trait;

use crate::answer::{Answer, AnswerPatch};
use crate::backend::Store;
use crate::error::LoadError;
use crate::types::{AnswerId, QuestionWithOptions};

pub use feed::{EssayFeed, FeedEntry, FeedFilter, FeedSnapshot, PendingToggle};
pub use tally::{percentage, McqTally, OptionTally, TallySnapshot};

/// An in-memory aggregate built from one full load and then kept current
/// by incremental events
#[async_trait]
pub trait Aggregate: Sized + Send + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    /// Fetch every existing answer of the question and aggregate it
    async fn load_base(store: &dyn Store, question: &QuestionWithOptions)
        -> Result<Self, LoadError>;

    /// Fold in a newly observed answer. Returns false when it was ignored.
    fn apply_new(&mut self, answer: Answer) -> bool;

    /// Merge a mutation of an already known answer. Returns false when no
    /// entry matched.
    fn apply_update(&mut self, patch: AnswerPatch) -> bool;

    /// Ids of the answers folded in so far
    fn answer_ids(&self) -> Vec<AnswerId>;

    fn snapshot(&self) -> Self::Snapshot;
}
