use axum::{
    Extension,
    extract::{Path, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use db::models::{contract::Contract, user::User};
use utils::jwt::decode_token;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// Resolves the Bearer token to a user and stores it as a request extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    let claims = decode_token(&state.config.jwt_secret, token)
        .map_err(|_| ApiError::Unauthorized("Invalid token or expired token".to_string()))?;

    let user = User::find_by_email(&state.db.pool, &claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid token or expired token".to_string()))?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Loads the contract addressed by the path and enforces ownership. Every
/// id-addressed contract route sits behind this: absent rows are 404, foreign
/// rows are 403 regardless of existence of other state.
pub async fn load_contract_middleware(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
    Extension(user): Extension<User>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let contract = Contract::find_by_id(&state.db.pool, contract_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Contract not found".to_string()))?;

    if contract.user_id != user.id {
        return Err(ApiError::Forbidden(
            "Not authorized to access this contract".to_string(),
        ));
    }

    request.extensions_mut().insert(contract);
    Ok(next.run(request).await)
}
