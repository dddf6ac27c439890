use axum::{Extension, Json, extract::State, http::StatusCode};
use chrono::Duration;
use db::models::user::{CreateUser, User};
use serde::{Deserialize, Serialize};
use utils::{jwt::create_access_token, response::ApiResponse};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct RegistrationResponse {
    pub user: User,
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct SignoutResponse {
    pub message: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<Credentials>,
) -> Result<(StatusCode, Json<ApiResponse<RegistrationResponse>>), ApiError> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(ApiError::BadRequest(
            "Email and password are required".to_string(),
        ));
    }
    if User::find_by_email(&state.db.pool, &payload.email)
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("Email already registered".to_string()));
    }

    let password_hash = bcrypt::hash(&payload.password, bcrypt::DEFAULT_COST)
        .map_err(|err| ApiError::Internal(err.into()))?;
    let user = User::create(
        &state.db.pool,
        &CreateUser {
            email: payload.email.clone(),
            password_hash,
        },
        Uuid::new_v4(),
    )
    .await?;

    let access_token = issue_token(&state, &user.email)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(RegistrationResponse {
            user,
            access_token,
            token_type: "bearer".to_string(),
        })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<Credentials>,
) -> Result<Json<ApiResponse<Token>>, ApiError> {
    let user = User::find_by_email(&state.db.pool, &payload.email)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".to_string()))?;

    let valid = bcrypt::verify(&payload.password, &user.password_hash)
        .map_err(|err| ApiError::Internal(err.into()))?;
    if !valid {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let access_token = issue_token(&state, &user.email)?;
    Ok(Json(ApiResponse::success(Token {
        access_token,
        token_type: "bearer".to_string(),
    })))
}

/// Tokens are stateless; this just confirms the caller's token was valid so
/// clients have a definite point to drop it.
pub async fn signout(
    Extension(user): Extension<User>,
) -> Result<Json<ApiResponse<SignoutResponse>>, ApiError> {
    tracing::info!(user_id = %user.id, "user signed out");
    Ok(Json(ApiResponse::success(SignoutResponse {
        message: "Successfully signed out".to_string(),
    })))
}

fn issue_token(state: &AppState, email: &str) -> Result<String, ApiError> {
    create_access_token(
        &state.config.jwt_secret,
        email,
        Duration::minutes(state.config.access_token_expire_minutes),
    )
    .map_err(|err| ApiError::Internal(err.into()))
}
