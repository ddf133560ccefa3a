use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// HTTP port (health endpoint).
    pub port: u16,
    /// Port the WebSocket hub listens on.
    pub ws_port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    /// Upper bound on a single outbound frame delivery. A destination that
    /// stays stuck past this bound is dropped rather than allowed to stall
    /// the fan-out to everyone else.
    pub send_timeout_secs: u64,
    /// Whether a broadcast is delivered back to the connection that sent it.
    /// Off by default: whiteboard clients render their own strokes locally.
    pub echo_to_sender: bool,
}

impl HubConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default values
            .set_default("environment", "development")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.ws_port", 8081)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("hub.send_timeout_secs", 10)?
            .set_default("hub.echo_to_sender", false)?
            .set_default("cors.enabled", true)?
            .set_default("cors.allow_any_origin", true)?
            .set_default("cors.max_age", 3600)?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_SERVER__WS_PORT=5001` would set `Settings.server.ws_port`
            .add_source(
                Environment::with_prefix("app")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        s.try_deserialize()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("environment", "test")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.ws_port", 8081)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("hub.send_timeout_secs", 1)?
            .set_default("hub.echo_to_sender", false)?
            .set_default("cors.enabled", false)?
            .set_default("cors.allow_any_origin", false)?
            .set_default("cors.max_age", 3600)?
            .build()?
            .try_deserialize()
    }
}
