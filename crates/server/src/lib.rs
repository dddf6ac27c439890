pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use db::DBService;
use services::services::generator::GenerationService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub generation: GenerationService,
    pub config: Arc<Config>,
}
