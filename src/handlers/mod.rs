//! HTTP surface for voters, results readers and poll admins.
//!
//! - `POST /vote` — submit a vote (`{pollId, optionId, idNumber | voterKey}`)
//! - `GET /results?pollId=...` — current tallies
//! - `GET /currentPoll` — the poll `CURRENT` points at
//! - `POST /admin/newPoll` — create a poll and make it current
//! - `POST /admin/resetPoll` — zero a poll and clear its voter roll
//! - `POST /admin/reconcile` — recompute a poll's tallies from its voters
//!
//! Admin routes require the `x-admin-key` header.

mod error;


use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, Method, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db::VoteStore;
use crate::identity::VoterCredential;
use crate::models::OptionCount;
use crate::voting::{PollManager, ResultsReader, VoteLedger, VoteOutcome};

pub use error::ApiError;

const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Clone)]
pub struct AppState {
    ledger: Arc<VoteLedger>,
    polls: Arc<PollManager>,
    results: Arc<ResultsReader>,
    admin_key: Arc<str>,
}

impl AppState {
    pub fn new(store: Arc<dyn VoteStore>, config: &Config) -> Self {
        Self {
            ledger: Arc::new(VoteLedger::new(store.clone(), config.pepper.clone())),
            polls: Arc::new(PollManager::new(store.clone(), config.reset_page_size)),
            results: Arc::new(ResultsReader::new(store)),
            admin_key: Arc::from(config.admin_key.as_str()),
        }
    }

    fn is_admin(&self, headers: &HeaderMap) -> bool {
        headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|provided| provided.as_bytes().ct_eq(self.admin_key.as_bytes()).into())
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/newPoll", post(new_poll))
        .route("/resetPoll", post(reset_poll))
        .route("/reconcile", post(reconcile));

    Router::new()
        .route("/vote", post(submit_vote))
        .route("/results", get(get_results))
        .route("/currentPoll", get(current_poll))
        .nest("/admin", admin)
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(ADMIN_KEY_HEADER)])
}

/// An empty body reads as the type's default, so `POST` with no payload
/// behaves like `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::MalformedBody(e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteRequest {
    poll_id: Option<String>,
    option_id: Option<String>,
    id_number: Option<String>,
    voter_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollTarget {
    poll_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    #[serde(rename = "pollId", alias = "pollID")]
    poll_id: Option<String>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultsResponse {
    poll_id: String,
    results: Vec<OptionCount>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewPollResponse {
    message: &'static str,
    poll_id: String,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentPollResponse {
    poll_id: String,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetResponse {
    ok: bool,
    poll_id: String,
    voters_removed: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileResponse {
    ok: bool,
    poll_id: String,
    results: Vec<OptionCount>,
}

async fn submit_vote(State(state): State<AppState>, body: Bytes) -> Result<Json<MessageResponse>, ApiError> {
    const REQUIRED: &[&str] = &["pollId", "optionId", "idNumber | voterKey"];

    let request: VoteRequest = parse_body(&body)?;
    let (Some(poll_id), Some(option_id)) = (non_empty(request.poll_id), non_empty(request.option_id)) else {
        return Err(ApiError::MissingFields(REQUIRED));
    };

    // A server-derived key is preferred whenever an identifier is present.
    let credential = match (non_empty(request.id_number), non_empty(request.voter_key)) {
        (Some(id_number), _) => VoterCredential::IdNumber(id_number),
        (None, Some(voter_key)) => VoterCredential::VoterKey(voter_key),
        (None, None) => return Err(ApiError::MissingFields(REQUIRED)),
    };

    let message = match state.ledger.submit_vote(&poll_id, &option_id, &credential).await? {
        VoteOutcome::Recorded => "Vote recorded successfully",
        VoteOutcome::AlreadyVoted => "Already voted",
    };

    Ok(Json(MessageResponse { message }))
}

async fn get_results(
    State(state): State<AppState>,
    query: Result<Query<ResultsQuery>, QueryRejection>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::MalformedQuery(rejection.body_text()))?;
    let Some(poll_id) = non_empty(query.poll_id) else {
        return Err(ApiError::MissingFields(&["pollId"]));
    };

    let results = state.results.get_results(&poll_id).await?;
    Ok(Json(ResultsResponse {
        poll_id: results.poll_id,
        results: results.results,
    }))
}

async fn current_poll(State(state): State<AppState>) -> Result<Json<CurrentPollResponse>, ApiError> {
    let current = state.polls.current().await?.ok_or(ApiError::NoCurrentPoll)?;
    Ok(Json(CurrentPollResponse {
        poll_id: current.poll_id,
        updated_at: current.updated_at,
    }))
}

async fn new_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<NewPollResponse>, ApiError> {
    if !state.is_admin(&headers) {
        warn!("Rejected newPoll with bad admin key");
        return Err(ApiError::Forbidden);
    }

    let target: PollTarget = parse_body(&body)?;
    let requested = non_empty(target.poll_id);
    let created = state.polls.create_poll(requested.as_deref()).await?;

    Ok(Json(NewPollResponse {
        message: "New poll created",
        poll_id: created.poll_id,
        updated_at: created.updated_at,
    }))
}

async fn reset_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResetResponse>, ApiError> {
    if !state.is_admin(&headers) {
        warn!("Rejected resetPoll with bad admin key");
        return Err(ApiError::Unauthorized);
    }

    let target: PollTarget = parse_body(&body)?;
    let requested = non_empty(target.poll_id);
    let report = state.polls.reset_poll(requested.as_deref()).await?;

    Ok(Json(ResetResponse {
        ok: true,
        poll_id: report.poll_id,
        voters_removed: report.voters_removed,
    }))
}

async fn reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReconcileResponse>, ApiError> {
    if !state.is_admin(&headers) {
        warn!("Rejected reconcile with bad admin key");
        return Err(ApiError::Unauthorized);
    }

    let target: PollTarget = parse_body(&body)?;
    let requested = non_empty(target.poll_id);
    let results = state.polls.reconcile(requested.as_deref()).await?;

    Ok(Json(ReconcileResponse {
        ok: true,
        poll_id: results.poll_id,
        results: results.results,
    }))
}
