//! WebSocket endpoints
//!
//! `/ws/results/{question_id}` streams a question's live results to the
//! teacher dashboard or the projector. `/ws/sessions/{session_id}` tells a
//! student screen which question is currently open.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::backend::{load_question, Delivery};
use crate::error::ModerationError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::results::{Aggregate, EssayFeed, FeedFilter, McqTally};
use crate::session::{ActiveChange, ActiveQuestionTracker};
use crate::state::AppState;
use crate::types::*;
use crate::view::{LiveView, ViewState};

type WsSender = SplitSink<WebSocket, Message>;

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub role: Option<String>,
}

fn parse_role(role: Option<&str>) -> Role {
    match role {
        Some("teacher") => Role::Teacher,
        Some("student") => Role::Student,
        _ => Role::Projector,
    }
}

async fn send_message(sender: &mut WsSender, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            true
        }
    }
}

fn error_message(code: &str, msg: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        code: code.to_string(),
        msg: msg.into(),
    }
}

/// How an aggregate is rendered on the results socket
#[async_trait]
trait ResultsPresenter: Aggregate {
    fn render(question_id: &QuestionId, snapshot: &Self::Snapshot, filter: FeedFilter)
        -> ServerMessage;

    async fn toggle_hidden(
        view: &LiveView<Self>,
        answer_id: &str,
        current_hidden: bool,
    ) -> Result<(), ModerationError>;
}

#[async_trait]
impl ResultsPresenter for McqTally {
    fn render(
        question_id: &QuestionId,
        snapshot: &Self::Snapshot,
        _filter: FeedFilter,
    ) -> ServerMessage {
        ServerMessage::McqResults {
            question_id: question_id.clone(),
            tally: snapshot.clone(),
        }
    }

    /// Choices carry no hidden flag
    async fn toggle_hidden(
        _view: &LiveView<Self>,
        answer_id: &str,
        _current_hidden: bool,
    ) -> Result<(), ModerationError> {
        Err(ModerationError::UnknownAnswer(answer_id.to_string()))
    }
}

#[async_trait]
impl ResultsPresenter for EssayFeed {
    fn render(
        question_id: &QuestionId,
        snapshot: &Self::Snapshot,
        filter: FeedFilter,
    ) -> ServerMessage {
        ServerMessage::EssayResults {
            question_id: question_id.clone(),
            feed: snapshot.filtered(filter),
        }
    }

    async fn toggle_hidden(
        view: &LiveView<Self>,
        answer_id: &str,
        current_hidden: bool,
    ) -> Result<(), ModerationError> {
        view.toggle_hidden(answer_id, current_hidden).await
    }
}

fn render_state<P: ResultsPresenter>(
    question_id: &QuestionId,
    state: &ViewState<P::Snapshot>,
    filter: FeedFilter,
) -> ServerMessage {
    match state {
        ViewState::Loading => ServerMessage::Loading {
            question_id: question_id.clone(),
        },
        ViewState::Ready(snapshot) => P::render(question_id, snapshot, filter),
        ViewState::Failed(msg) => ServerMessage::LoadFailed {
            question_id: question_id.clone(),
            msg: msg.clone(),
        },
    }
}

/// WebSocket upgrade handler for a question's live results
pub async fn results_ws(
    ws: WebSocketUpgrade,
    Path(question_id): Path<QuestionId>,
    Query(params): Query<ResultsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let role = parse_role(params.role.as_deref());
    tracing::info!(
        "Results connection request: question={}, role={:?}",
        question_id,
        role
    );
    ws.on_upgrade(move |socket| handle_results_socket(socket, question_id, role, state))
}

async fn handle_results_socket(
    socket: WebSocket,
    question_id: QuestionId,
    role: Role,
    state: Arc<AppState>,
) {
    let (mut sender, receiver) = socket.split();

    if role == Role::Student {
        let error = error_message("NOT_PERMITTED", "students cannot view live results");
        let _ = send_message(&mut sender, &error).await;
        return;
    }

    let question = match load_question(state.backend.store.as_ref(), &question_id).await {
        Ok(question) => question,
        Err(e) => {
            tracing::warn!("Results socket for unknown question {}: {}", question_id, e);
            let _ = send_message(&mut sender, &error_message("NOT_FOUND", e.to_string())).await;
            return;
        }
    };

    match question.question.kind {
        QuestionType::Mcq => serve_results::<McqTally>(sender, receiver, question, role, state).await,
        QuestionType::Essay => {
            serve_results::<EssayFeed>(sender, receiver, question, role, state).await
        }
    }
}

async fn serve_results<P: ResultsPresenter>(
    mut sender: WsSender,
    mut receiver: futures::stream::SplitStream<WebSocket>,
    question: QuestionWithOptions,
    role: Role,
    state: Arc<AppState>,
) {
    let question_id = question.id().clone();
    let mut view =
        match LiveView::<P>::start(state.backend.clone(), question, role, state.config.dedup).await
        {
            Ok(view) => view,
            Err(e) => {
                tracing::error!("Failed to subscribe to question {}: {}", question_id, e);
                let _ = send_message(&mut sender, &error_message("UNAVAILABLE", e.to_string()))
                    .await;
                return;
            }
        };

    let mut updates = view.subscribe();
    let mut filter = FeedFilter::default();

    let initial = render_state::<P>(&question_id, &updates.borrow_and_update(), filter);
    if !send_message(&mut sender, &initial).await {
        view.stop().await;
        return;
    }

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let msg = render_state::<P>(&question_id, &updates.borrow_and_update(), filter);
                if !send_message(&mut sender, &msg).await {
                    break;
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message: {}", text);

                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::ToggleHidden { answer_id, current_hidden }) => {
                                match P::toggle_hidden(&view, &answer_id, current_hidden).await {
                                    Ok(()) => None,
                                    Err(e) => {
                                        tracing::warn!("Moderation of {} failed: {}", answer_id, e);
                                        Some(ServerMessage::ModerationFailed {
                                            answer_id,
                                            msg: e.to_string(),
                                        })
                                    }
                                }
                            }
                            Ok(ClientMessage::SetFilter { filter: new_filter }) => {
                                filter = new_filter;
                                Some(render_state::<P>(&question_id, &updates.borrow(), filter))
                            }
                            Ok(ClientMessage::Reload) => match view.reload().await {
                                Ok(()) => None,
                                Err(e) => Some(error_message("UNAVAILABLE", e.to_string())),
                            },
                            Err(e) => {
                                tracing::error!("Failed to parse client message: {}", e);
                                Some(error_message(
                                    "PARSE_ERROR",
                                    format!("Invalid message format: {}", e),
                                ))
                            }
                        };

                        if let Some(reply) = reply {
                            if !send_message(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Results socket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    view.stop().await;
    tracing::info!("Results connection closed for question {}", question_id);
}

/// WebSocket upgrade handler following a session's active question
pub async fn session_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!("Session connection request: session={}", session_id);
    ws.on_upgrade(move |socket| handle_session_socket(socket, session_id, state))
}

async fn handle_session_socket(socket: WebSocket, session_id: SessionId, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the current question so no activation is missed
    let mut changes = match state.backend.changes.subscribe_questions(&session_id).await {
        Ok(changes) => changes,
        Err(e) => {
            let _ = send_message(&mut sender, &error_message("UNAVAILABLE", e.to_string())).await;
            return;
        }
    };

    let current = match state.sessions.active_question(&session_id).await {
        Ok(current) => current,
        Err(e) => {
            let _ = send_message(&mut sender, &error_message("NOT_FOUND", e.to_string())).await;
            return;
        }
    };
    let mut tracker = ActiveQuestionTracker::new(current.as_ref().map(|q| q.id().clone()));
    if !send_message(&mut sender, &ServerMessage::ActiveQuestion { question: current }).await {
        return;
    }

    loop {
        tokio::select! {
            change = changes.next() => {
                let change = match change {
                    Some(Delivery::Message(change)) => change,
                    Some(Delivery::Lagged(_)) => {
                        // Missed activations: read the current question again
                        let current = match state.sessions.active_question(&session_id).await {
                            Ok(current) => current,
                            Err(e) => {
                                tracing::warn!("Failed to reload active question of {}: {}", session_id, e);
                                continue;
                            }
                        };
                        tracker = ActiveQuestionTracker::new(current.as_ref().map(|q| q.id().clone()));
                        if !send_message(&mut sender, &ServerMessage::ActiveQuestion { question: current }).await {
                            break;
                        }
                        continue;
                    }
                    None => {
                        tracing::info!("Question feed for session {} closed", session_id);
                        break;
                    }
                };
                let msg = match tracker.observe(&change) {
                    Some(ActiveChange::Activated(question_id)) => {
                        match load_question(state.backend.store.as_ref(), &question_id).await {
                            Ok(question) => ServerMessage::ActiveQuestion { question: Some(question) },
                            Err(e) => {
                                tracing::warn!("Failed to load activated question {}: {}", question_id, e);
                                continue;
                            }
                        }
                    }
                    Some(ActiveChange::Deactivated) => ServerMessage::ActiveQuestion { question: None },
                    None => continue,
                };
                if !send_message(&mut sender, &msg).await {
                    break;
                }
            }

            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Session connection closed for session {}", session_id);
}
