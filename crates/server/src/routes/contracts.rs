use axum::{
    Extension, Json,
    body::{Body, Bytes},
    extract::{Query, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Json as ResponseJson, Response},
};
use db::models::{
    contract::{Contract, UpdateContract},
    user::User,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use utils::{response::ApiResponse, sse::SseEvent};

use crate::{AppState, error::ApiError};

const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct CreateContractRequest {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct ContractListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditContractRequest {
    pub edit_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StopContractResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SuggestionsResponse {
    pub suggestions: Vec<String>,
}

/// Starts a generation and hands the driver's frames back as a long-lived
/// `text/event-stream` response.
pub async fn create_contract(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<CreateContractRequest>,
) -> Result<Response, ApiError> {
    let stream = state
        .generation
        .start_generation(user.id, &payload.prompt)
        .await?;
    tracing::info!(contract_id = %stream.contract.id, "contract generation started");
    Ok(event_stream_response(stream.events))
}

pub async fn get_contracts(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Query(query): Query<ContractListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Contract>>>, ApiError> {
    let contracts = Contract::find_for_user(
        &state.db.pool,
        user.id,
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        query.offset.unwrap_or(0),
    )
    .await?;
    Ok(ResponseJson(ApiResponse::success(contracts)))
}

pub async fn get_contract(
    Extension(contract): Extension<Contract>,
) -> Result<ResponseJson<ApiResponse<Contract>>, ApiError> {
    Ok(ResponseJson(ApiResponse::success(contract)))
}

pub async fn update_contract(
    Extension(contract): Extension<Contract>,
    State(state): State<AppState>,
    Json(payload): Json<UpdateContract>,
) -> Result<ResponseJson<ApiResponse<Contract>>, ApiError> {
    let updated = Contract::update(&state.db.pool, contract.id, &payload)
        .await?
        .ok_or_else(|| ApiError::NotFound("Contract not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(updated)))
}

pub async fn create_version(
    Extension(contract): Extension<Contract>,
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(payload): Json<CreateVersionRequest>,
) -> Result<ResponseJson<ApiResponse<Contract>>, ApiError> {
    let Some(content) = payload.content.filter(|content| !content.trim().is_empty()) else {
        return Err(ApiError::BadRequest("Content is required".to_string()));
    };

    let version = Contract::create_version(&state.db.pool, contract.id, &content, user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Contract not found".to_string()))?;
    Ok(ResponseJson(ApiResponse::success(version)))
}

/// Signals cancellation for the active generation and any active edits keyed
/// to this contract. A missing token means the operation already reached a
/// terminal event, reported as 404 rather than an error.
pub async fn stop_contract(
    Extension(contract): Extension<Contract>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<StopContractResponse>>, ApiError> {
    let signalled = state.generation.stop(contract.id);
    if signalled == 0 {
        return Err(ApiError::NotFound(format!(
            "Contract {} not found or already completed",
            contract.id
        )));
    }

    tracing::info!(contract_id = %contract.id, signalled, "contract generation stopped by user");
    Ok(ResponseJson(ApiResponse::success(StopContractResponse {
        message: format!("Contract generation {} stopped successfully", contract.id),
    })))
}

pub async fn edit_contract(
    Extension(contract): Extension<Contract>,
    State(state): State<AppState>,
    Json(payload): Json<EditContractRequest>,
) -> Result<Response, ApiError> {
    let Some(edit_prompt) = payload
        .edit_prompt
        .filter(|prompt| !prompt.trim().is_empty())
    else {
        return Err(ApiError::BadRequest("Edit prompt is required".to_string()));
    };

    let contract_id = contract.id;
    let stream = state.generation.start_edit(contract, &edit_prompt).await?;
    tracing::info!(contract_id = %contract_id, edit_id = %stream.edit_id, "contract edit started");
    Ok(event_stream_response(stream.events))
}

pub async fn get_suggestions(
    Extension(contract): Extension<Contract>,
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<SuggestionsResponse>>, ApiError> {
    let suggestions = state.generation.suggestions_for(&contract).await?;
    Ok(ResponseJson(ApiResponse::success(SuggestionsResponse {
        suggestions,
    })))
}

fn event_stream_response(events: mpsc::Receiver<SseEvent>) -> Response {
    let body = Body::from_stream(
        ReceiverStream::new(events)
            .map(|event| Ok::<_, std::convert::Infallible>(Bytes::from(event.encode()))),
    );
    (
        [
            (CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
