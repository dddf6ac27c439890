pub mod contracts;
pub mod users;

use axum::{
    Json, Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use crate::{AppState, middleware::{auth_middleware, load_contract_middleware}};

pub fn router(state: AppState) -> Router {
    let contract_router = Router::new()
        .route(
            "/",
            get(contracts::get_contract).put(contracts::update_contract),
        )
        .route("/stop", delete(contracts::stop_contract))
        .route("/versions", post(contracts::create_version))
        .route("/edit", post(contracts::edit_contract))
        .route("/suggestions", get(contracts::get_suggestions))
        .layer(from_fn_with_state(state.clone(), load_contract_middleware));

    let contracts_router = Router::new()
        .route(
            "/",
            get(contracts::get_contracts).post(contracts::create_contract),
        )
        .nest("/{contract_id}", contract_router)
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let users_router = Router::new()
        .route("/register", post(users::register))
        .route("/login", post(users::login))
        .route(
            "/signout",
            post(users::signout).layer(from_fn_with_state(state.clone(), auth_middleware)),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/contracts", contracts_router)
        .nest("/users", users_router)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}
