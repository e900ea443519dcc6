use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::parse_flag;
use crate::engine::BracketEngine;
use crate::error::EngineError;
use crate::store::MemoryStore;
use crate::types::{
    Actor, BracketFormat, BracketView, Match, MatchId, MatchReport, Participant, ParticipantId,
    ReportId, ReportOutcome, ReviewDecision, Scores, Slot, TournamentId,
};

pub type SharedEngine = Arc<BracketEngine<MemoryStore>>;

#[derive(Clone)]
pub struct ServerState {
    pub engine: SharedEngine,
    pub state_path: Option<PathBuf>,
}

impl ServerState {
    pub fn new(engine: BracketEngine<MemoryStore>, state_path: Option<PathBuf>) -> Self {
        ServerState { engine: Arc::new(engine), state_path }
    }

    /// Writes the snapshot after a committed mutation. The mutation stands
    /// even when the write fails.
    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        if let Err(e) = self.engine.store().save_snapshot(path) {
            error!("failed to save bracket snapshot to {}: {e}", path.display());
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidTransition { .. } | EngineError::ReportAlreadyReviewed { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::PreconditionViolated(_) => StatusCode::PRECONDITION_FAILED,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Forbidden { .. } => StatusCode::FORBIDDEN,
            EngineError::TopologyInvariantViolated(_) | EngineError::Storage(_) => {
                error!("request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "error": self.0.kind(), "message": self.0.public_message() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Request bodies ─────────────────────────────────────────────────────

fn default_checked_in() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    name: String,
    seed: u32,
    #[serde(default = "default_checked_in")]
    checked_in: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantCheckInBody {
    #[serde(default = "default_checked_in")]
    checked_in: bool,
}

#[derive(Deserialize)]
struct GenerateBody {
    format: BracketFormat,
}

#[derive(Deserialize)]
struct SlotBody {
    slot: Slot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoresBody {
    p1_score: i32,
    p2_score: i32,
}

impl ScoresBody {
    fn scores(&self) -> Scores {
        Scores::new(self.p1_score, self.p2_score)
    }
}

#[derive(Deserialize)]
struct ReviewBody {
    decision: ReviewDecision,
}

/// Capability forwarded by the gateway in `x-actor-id` / `x-actor-authorized`.
fn actor_from(headers: &HeaderMap) -> Actor {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    Actor {
        id: header("x-actor-id").unwrap_or_else(|| "anonymous".to_string()),
        authorized: header("x-actor-authorized")
            .and_then(|raw| parse_flag(&raw))
            .unwrap_or(false),
    }
}

fn require(actor: &Actor) -> Result<(), ApiError> {
    if actor.authorized {
        Ok(())
    } else {
        Err(EngineError::Forbidden { actor: actor.id.clone() }.into())
    }
}

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/tournaments/:id/participants", post(register_participant))
        .route(
            "/tournaments/:id/participants/:pid/check-in",
            post(check_in_participant),
        )
        .route("/tournaments/:id/bracket", post(generate_bracket).get(bracket_view))
        .route("/matches/:id/check-in", post(check_in))
        .route("/matches/:id/start", post(start_match))
        .route("/matches/:id/reports", post(report_result))
        .route("/matches/:id/result", put(edit_result))
        .route("/matches/:id/advance", post(advance_winner))
        .route("/reports/:id/review", post(review_report))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: ServerState, addr: &str) -> std::io::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!("bracket server listening at http://{addr}/");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn register_participant(
    State(state): State<ServerState>,
    Path(tournament): Path<TournamentId>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Participant> {
    require(&actor_from(&headers))?;
    let participant =
        state
            .engine
            .store()
            .register_participant(tournament, body.name, body.seed, body.checked_in)?;
    state.persist();
    Ok(Json(participant))
}

async fn check_in_participant(
    State(state): State<ServerState>,
    Path((tournament, participant)): Path<(TournamentId, ParticipantId)>,
    headers: HeaderMap,
    Json(body): Json<ParticipantCheckInBody>,
) -> ApiResult<Participant> {
    require(&actor_from(&headers))?;
    let participant = state
        .engine
        .store()
        .set_participant_checked_in(tournament, participant, body.checked_in)?;
    state.persist();
    Ok(Json(participant))
}

async fn generate_bracket(
    State(state): State<ServerState>,
    Path(tournament): Path<TournamentId>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> ApiResult<BracketView> {
    let view = state
        .engine
        .generate_bracket(&actor_from(&headers), tournament, body.format)?;
    state.persist();
    Ok(Json(view))
}

async fn bracket_view(
    State(state): State<ServerState>,
    Path(tournament): Path<TournamentId>,
) -> ApiResult<BracketView> {
    Ok(Json(state.engine.bracket_view(tournament)?))
}

async fn check_in(
    State(state): State<ServerState>,
    Path(match_id): Path<MatchId>,
    headers: HeaderMap,
    Json(body): Json<SlotBody>,
) -> ApiResult<Match> {
    let row = state.engine.check_in(&actor_from(&headers), match_id, body.slot)?;
    state.persist();
    Ok(Json(row))
}

async fn start_match(
    State(state): State<ServerState>,
    Path(match_id): Path<MatchId>,
    headers: HeaderMap,
) -> ApiResult<Match> {
    let row = state.engine.start_match(&actor_from(&headers), match_id)?;
    state.persist();
    Ok(Json(row))
}

async fn report_result(
    State(state): State<ServerState>,
    Path(match_id): Path<MatchId>,
    headers: HeaderMap,
    Json(body): Json<ScoresBody>,
) -> ApiResult<MatchReport> {
    let report = state
        .engine
        .report_result(&actor_from(&headers), match_id, body.scores())?;
    state.persist();
    Ok(Json(report))
}

async fn review_report(
    State(state): State<ServerState>,
    Path(report_id): Path<ReportId>,
    headers: HeaderMap,
    Json(body): Json<ReviewBody>,
) -> ApiResult<ReportOutcome> {
    let outcome = state
        .engine
        .review_report(&actor_from(&headers), report_id, body.decision)?;
    state.persist();
    Ok(Json(outcome))
}

async fn edit_result(
    State(state): State<ServerState>,
    Path(match_id): Path<MatchId>,
    headers: HeaderMap,
    Json(body): Json<ScoresBody>,
) -> ApiResult<ReportOutcome> {
    let outcome = state
        .engine
        .edit_verified_result(&actor_from(&headers), match_id, body.scores())?;
    state.persist();
    Ok(Json(outcome))
}

async fn advance_winner(
    State(state): State<ServerState>,
    Path(match_id): Path<MatchId>,
    headers: HeaderMap,
) -> ApiResult<Vec<Match>> {
    let touched = state.engine.advance_winner(&actor_from(&headers), match_id)?;
    state.persist();
    Ok(Json(touched))
}
