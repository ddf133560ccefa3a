pub mod config;
pub mod error;
pub mod hub;

use std::sync::Arc;
use actix_web::HttpResponse;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;
pub use hub::{BroadcastHub, ConnectionRegistry};

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub hub: Arc<BroadcastHub>,
}

impl AppState {
    pub fn new(config: Settings) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.hub.clone()));

        Self {
            config: Arc::new(config),
            hub,
        }
    }
}
