//! Live results view
//!
//! A [`LiveView`] owns everything one question's result screen needs: both
//! event subscriptions, the aggregate, and the task that folds events into it.
//! Snapshots are published on a `watch` channel for the rendering side.
//!
//! Subscriptions are opened before the base load starts, so events that arrive
//! while the load is in flight queue up and are applied after it. If the
//! change feed lags, the base is loaded again and live events resume on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{Backend, Delivery, Store, Subscription};
use crate::error::{ModerationError, PersistError, StoreResult};
use crate::protocol::{question_channel, ChangeEvent, NEW_ANSWER_EVENT};
use crate::reconcile::{Dedup, LiveEvent, Reconciler, Routed};
use crate::results::{Aggregate, EssayFeed};
use crate::types::{AnswerRow, QuestionWithOptions, Role};

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState<S> {
    Loading,
    Ready(S),
    /// Initial load failed; the view can be reloaded
    Failed(String),
}

impl<S> ViewState<S> {
    pub fn ready(&self) -> Option<&S> {
        match self {
            ViewState::Ready(s) => Some(s),
            _ => None,
        }
    }
}

struct Shared<A: Aggregate> {
    aggregate: Mutex<Option<A>>,
    alive: AtomicBool,
    state_tx: watch::Sender<ViewState<A::Snapshot>>,
}

impl<A: Aggregate> Shared<A> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn publish(&self, state: ViewState<A::Snapshot>) {
        if self.is_alive() {
            self.state_tx.send_replace(state);
        }
    }
}

pub struct LiveView<A: Aggregate> {
    question: QuestionWithOptions,
    backend: Backend,
    role: Role,
    dedup: Dedup,
    shared: Arc<Shared<A>>,
    task: Option<JoinHandle<()>>,
}

impl<A: Aggregate> LiveView<A> {
    /// Subscribe to both channels of the question and start loading
    pub async fn start(
        backend: Backend,
        question: QuestionWithOptions,
        role: Role,
        dedup: Dedup,
    ) -> StoreResult<Self> {
        let (state_tx, _) = watch::channel(ViewState::Loading);
        let mut view = Self {
            question,
            backend,
            role,
            dedup,
            shared: Arc::new(Shared {
                aggregate: Mutex::new(None),
                alive: AtomicBool::new(false),
                state_tx,
            }),
            task: None,
        };
        view.spawn().await?;
        Ok(view)
    }

    async fn spawn(&mut self) -> StoreResult<()> {
        let question_id = self.question.id().clone();
        let changes = self.backend.changes.subscribe_answers(&question_id).await?;
        let broadcasts = self
            .backend
            .bus
            .subscribe(&question_channel(&question_id), NEW_ANSWER_EVENT)
            .await?;

        *self.shared.aggregate.lock().await = None;
        self.shared.alive.store(true, Ordering::SeqCst);
        self.shared.state_tx.send_replace(ViewState::Loading);

        tracing::info!("Starting results view for question {}", question_id);
        self.task = Some(tokio::spawn(run::<A>(
            self.backend.store.clone(),
            self.question.clone(),
            self.dedup,
            self.shared.clone(),
            changes,
            broadcasts,
        )));
        Ok(())
    }

    pub fn question(&self) -> &QuestionWithOptions {
        &self.question
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Receiver of every published state
    pub fn subscribe(&self) -> watch::Receiver<ViewState<A::Snapshot>> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> ViewState<A::Snapshot> {
        self.shared.state_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_alive() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Read the current aggregate, if loaded
    pub async fn with_aggregate<R>(&self, f: impl FnOnce(&A) -> R) -> Option<R> {
        self.shared.aggregate.lock().await.as_ref().map(f)
    }

    /// Release both subscriptions and discard any in-flight load
    pub async fn stop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            // Subscriptions are owned by the task and dropped with it
            let _ = task.await;
            tracing::info!("Stopped results view for question {}", self.question.id());
        }
    }

    /// Throw the aggregate away and load it again from scratch
    pub async fn reload(&mut self) -> StoreResult<()> {
        self.stop().await;
        self.spawn().await
    }
}

impl LiveView<EssayFeed> {
    /// Optimistically flip an answer's hidden flag, persist it, and revert
    /// the local flag if the store refuses.
    pub async fn toggle_hidden(
        &self,
        answer_id: &str,
        current_hidden: bool,
    ) -> Result<(), ModerationError> {
        if !self.role.can_moderate() {
            return Err(ModerationError::NotPermitted);
        }

        let pending = {
            let mut guard = self.shared.aggregate.lock().await;
            let feed = guard.as_mut().ok_or(ModerationError::NotReady)?;
            let pending = feed
                .begin_toggle(answer_id, current_hidden)
                .ok_or_else(|| ModerationError::UnknownAnswer(answer_id.to_string()))?;
            self.shared.publish(ViewState::Ready(feed.snapshot()));
            pending
        };

        let result = self
            .backend
            .store
            .set_answer_hidden(answer_id, pending.tentative)
            .await
            .map(|_| ())
            .map_err(|e| PersistError::new(format!("answer {}", answer_id), e));

        let mut guard = self.shared.aggregate.lock().await;
        let Some(feed) = guard.as_mut() else {
            // Stopped while the request was in flight
            return result.map_err(ModerationError::from);
        };
        let settled = feed.settle_toggle(pending, result);
        self.shared.publish(ViewState::Ready(feed.snapshot()));
        settled.map_err(ModerationError::from)
    }
}

impl<A: Aggregate> Drop for LiveView<A> {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<A: Aggregate>(
    store: Arc<dyn Store>,
    question: QuestionWithOptions,
    dedup: Dedup,
    shared: Arc<Shared<A>>,
    mut changes: Subscription<ChangeEvent<AnswerRow>>,
    mut broadcasts: Subscription<serde_json::Value>,
) {
    follow(
        store.as_ref(),
        &question,
        dedup,
        &shared,
        &mut changes,
        &mut broadcasts,
    )
    .await;
    changes.unsubscribe();
    broadcasts.unsubscribe();
}

/// Load the base aggregate and install it with a freshly seeded reconciler.
/// Returns `None` if the load failed or the view stopped meanwhile.
async fn install<A: Aggregate>(
    store: &dyn Store,
    question: &QuestionWithOptions,
    dedup: Dedup,
    shared: &Shared<A>,
) -> Option<Reconciler> {
    let loaded = A::load_base(store, question).await;
    if !shared.is_alive() {
        tracing::debug!(
            "Discarding load of question {} after the view stopped",
            question.id()
        );
        return None;
    }

    match loaded {
        Ok(aggregate) => {
            let mut reconciler = Reconciler::new(question.id().clone(), dedup);
            reconciler.seed(aggregate.answer_ids());
            let snapshot = aggregate.snapshot();
            *shared.aggregate.lock().await = Some(aggregate);
            shared.publish(ViewState::Ready(snapshot));
            Some(reconciler)
        }
        Err(e) => {
            tracing::warn!("{}", e);
            *shared.aggregate.lock().await = None;
            shared.publish(ViewState::Failed(e.to_string()));
            None
        }
    }
}

async fn follow<A: Aggregate>(
    store: &dyn Store,
    question: &QuestionWithOptions,
    dedup: Dedup,
    shared: &Shared<A>,
    changes: &mut Subscription<ChangeEvent<AnswerRow>>,
    broadcasts: &mut Subscription<serde_json::Value>,
) {
    let Some(mut reconciler) = install(store, question, dedup, shared).await else {
        return;
    };

    loop {
        let event = tokio::select! {
            change = changes.next() => match change {
                Some(Delivery::Message(change)) => LiveEvent::Durable(change),
                Some(Delivery::Lagged(skipped)) => {
                    // Missed durable rows only exist in the store now
                    tracing::warn!(
                        "Reloading question {} after missing {} changes",
                        question.id(),
                        skipped
                    );
                    match install(store, question, dedup, shared).await {
                        Some(fresh) => reconciler = fresh,
                        None => return,
                    }
                    continue;
                }
                None => {
                    tracing::info!("Change feed {} closed", changes.topic());
                    return;
                }
            },
            message = broadcasts.recv() => match message {
                Some(message) => LiveEvent::Broadcast(message),
                None => {
                    tracing::info!("Broadcast channel {} closed", broadcasts.topic());
                    return;
                }
            },
        };

        if !shared.is_alive() {
            return;
        }

        let mut guard = shared.aggregate.lock().await;
        let Some(aggregate) = guard.as_mut() else {
            return;
        };
        if reconciler.route(aggregate, event) == Routed::Applied {
            let snapshot = aggregate.snapshot();
            drop(guard);
            shared.publish(ViewState::Ready(snapshot));
        }
    }
}
