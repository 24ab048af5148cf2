mod api;
mod call;
mod config;
mod records;
mod registry;
mod telephony;
#[cfg(test)]
mod testing;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use call::{ActiveConnectionSlot, CallController, ControllerHandle};
use config::Config;
use records::rest::RestRecordStore;
use twilio::client::TwilioClient;
use twilio::device::TwilioDevice;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// The desk's call controller; every call action goes through it.
    pub controller: ControllerHandle,
    /// Twilio legs, for the webhooks.
    pub device: Arc<TwilioDevice>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("call-desk {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create tokio runtime: {e}");
                    std::process::exit(1);
                }
            };
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("call-desk {VERSION}");
    println!("Call lifecycle controller for a sales-calling desk via Twilio");
    println!();
    println!("Usage: call-desk [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the desk server.");
}

fn router(state: AppState) -> Router {
    Router::new()
        // Twilio webhooks
        .route("/twilio/voice", post(twilio::webhook::handle_voice))
        .route("/twilio/voice/hold", post(twilio::webhook::handle_hold))
        .route("/twilio/voice/bridge", post(twilio::webhook::handle_bridge))
        .route("/twilio/status", post(twilio::webhook::handle_status))
        // Desk API
        .route(
            "/api/call",
            get(api::call::handle_get).post(api::call::handle_start),
        )
        .route("/api/call/hangup", post(api::call::handle_hangup))
        .route("/api/call/mute", post(api::call::handle_mute))
        .route("/api/call/reset", post(api::call::handle_reset))
        .route("/api/call/outcome", post(api::call::handle_outcome))
        .route("/api/incoming/accept", post(api::incoming::handle_accept))
        .route("/api/incoming/reject", post(api::incoming::handle_reject))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn server() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_desk=info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting call-desk"
    );

    let twilio = Arc::new(TwilioClient::new(
        &config.twilio,
        &config.server.external_url,
    ));
    let device = Arc::new(TwilioDevice::new(twilio));
    let records = Arc::new(RestRecordStore::new(&config.records));

    // Outlives the controller: a restarted controller hydrates from it.
    let slot = ActiveConnectionSlot::new();
    let controller =
        CallController::new(&config.controller, device.clone(), records, slot).spawn();

    let state = AppState {
        config: config.clone(),
        controller,
        device,
    };
    let app = router(state);

    // Start server
    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid server address: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "Listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {e}");
    }
}

async fn health() -> &'static str {
    "ok"
}
