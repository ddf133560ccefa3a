use actix_web::{web, App, HttpServer};
use actix_cors::Cors;
use whiteboard_hub::{health_check, AppError, AppState, Settings};
use dotenv::dotenv;
use std::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> whiteboard_hub::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging; RUST_LOG overrides the info default
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!("Configuration loaded successfully");

    // Initialize application state
    let state = AppState::new(config.clone());

    // Start the whiteboard hub on its own listener; every accepted stream
    // gets its own connection task
    let ws_addr = format!("{}:{}", config.server.host, config.server.ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;
    info!("Whiteboard hub accepting WebSocket connections at ws://{}", ws_addr);

    tokio::spawn(state.hub.clone().serve(ws_listener));

    let state = web::Data::new(state);

    // Create and bind TCP listener for the HTTP surface
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;

    info!("HTTP server listening at {}:{}", config.server.host, config.server.port);

    // Start HTTP server
    HttpServer::new(move || {
        let cors = if config.cors.enabled {
            let cors_config = Cors::default();

            let cors_config = if config.cors.allow_any_origin {
                cors_config
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
            } else {
                // More restrictive CORS for production use
                cors_config
                    .allowed_origin("http://localhost:8080")
                    .allowed_origin("http://127.0.0.1:8080")
                    .allowed_methods(vec!["GET"])
                    .allowed_headers(vec!["Content-Type"])
            };

            cors_config.max_age(config.cors.max_age as usize)
        } else {
            // CORS disabled - use most restrictive settings
            Cors::default()
        };

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
