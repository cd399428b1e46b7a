//! HTTP API endpoints for sessions, questions and answer submission.
//!
//! Live results are served over WebSocket, see [`crate::ws`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::load_question;
use crate::error::{SessionError, StoreError, SubmitError};
use crate::session::QuestionDraft;
use crate::state::AppState;
use crate::submit::{submit_choice, submit_essay};
use crate::types::*;
use crate::ws;

/// All HTTP and WebSocket routes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/teachers/{teacher_id}/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}/active", post(set_session_active))
        .route("/api/join", post(join_session))
        .route("/api/sessions/{session_id}/questions", post(create_question))
        .route(
            "/api/sessions/{session_id}/active-question",
            get(active_question),
        )
        .route("/api/questions/{question_id}/activate", post(activate_question))
        .route(
            "/api/questions/{question_id}/deactivate",
            post(deactivate_question),
        )
        .route("/api/questions/{question_id}/answers", post(submit_answer))
        .route("/ws/results/{question_id}", get(ws::results_ws))
        .route("/ws/sessions/{session_id}", get(ws::session_ws))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    msg: String,
}

/// Error response rendered as `{code, msg}` JSON
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    msg: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{} {}: {}", self.status, self.code, self.msg);
        }
        (
            self.status,
            Json(ErrorBody {
                code: self.code,
                msg: self.msg,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, code) = match &e {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            StoreError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            StoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
        };
        Self::new(status, code, e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidCode => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_CODE", e.to_string())
            }
            SessionError::NotFound => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string()),
            SessionError::Invalid(msg) => Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", msg),
            SessionError::CodeExhausted => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "CODE_EXHAUSTED",
                e.to_string(),
            ),
            SessionError::Store(e) => e.into(),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::QuestionInactive => {
                Self::new(StatusCode::CONFLICT, "QUESTION_INACTIVE", e.to_string())
            }
            SubmitError::Persist(e) => {
                let mut error = ApiError::from(e.source.clone());
                error.msg = e.to_string();
                error
            }
            _ => Self::new(StatusCode::BAD_REQUEST, "INVALID_ANSWER", e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub teacher_id: TeacherId,
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    if req.teacher_id.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            "teacher_id is required",
        ));
    }
    let session = state.sessions.create_session(req.teacher_id.trim()).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/teachers/{teacher_id}/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(teacher_id): Path<TeacherId>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.sessions.list_sessions(&teacher_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

/// POST /api/sessions/{session_id}/active
pub async fn set_session_active(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<SetActiveRequest>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(
        state
            .sessions
            .set_session_active(&session_id, req.active)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub code: String,
    /// Identifier the device already holds, if any
    #[serde(default)]
    pub student_id: Option<StudentId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub session: Session,
    pub student_id: StudentId,
}

/// POST /api/join
pub async fn join_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let session = state.sessions.join(&req.code).await?;
    let student_id = req
        .student_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_student_id);
    tracing::debug!("Student {} joined session {}", student_id, session.id);
    Ok(Json(JoinResponse {
        session,
        student_id,
    }))
}

/// POST /api/sessions/{session_id}/questions
pub async fn create_question(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Json(draft): Json<QuestionDraft>,
) -> Result<(StatusCode, Json<QuestionWithOptions>), ApiError> {
    let question = state.sessions.create_question(&session_id, draft).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

/// GET /api/sessions/{session_id}/active-question
///
/// Responds with `null` when no question is active.
pub async fn active_question(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Option<QuestionWithOptions>>, ApiError> {
    Ok(Json(state.sessions.active_question(&session_id).await?))
}

/// POST /api/questions/{question_id}/activate
pub async fn activate_question(
    State(state): State<Arc<AppState>>,
    Path(question_id): Path<QuestionId>,
) -> Result<Json<Question>, ApiError> {
    Ok(Json(state.sessions.activate_question(&question_id).await?))
}

/// POST /api/questions/{question_id}/deactivate
pub async fn deactivate_question(
    State(state): State<Arc<AppState>>,
    Path(question_id): Path<QuestionId>,
) -> Result<Json<Question>, ApiError> {
    Ok(Json(
        state.sessions.deactivate_question(&question_id).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub student_id: StudentId,
    #[serde(default)]
    pub option_ids: Vec<OptionId>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub answers: Vec<AnswerRow>,
}

/// POST /api/questions/{question_id}/answers
///
/// MCQ questions read `option_ids`, essay questions read `text`.
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Path(question_id): Path<QuestionId>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let student_id = req.student_id.trim();
    if student_id.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            "student_id is required",
        ));
    }

    let question = load_question(state.backend.store.as_ref(), &question_id).await?;
    let answers = match question.question.kind {
        QuestionType::Mcq => {
            submit_choice(&state.backend, &question, student_id, &req.option_ids).await?
        }
        QuestionType::Essay => {
            let text = req.text.as_deref().unwrap_or_default();
            vec![submit_essay(&state.backend, &question, student_id, text).await?]
        }
    };
    Ok((StatusCode::CREATED, Json(SubmitResponse { answers })))
}
