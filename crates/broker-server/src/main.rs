mod bootstrap;
mod config;
mod middleware;
mod routes;

use axum::http::{header, HeaderValue};
use broker_core::{Broker, Clock, Store};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use middleware::BasicAuthValidator;
use routes::BrokerState;

const ACCOUNTS_FILE: &str = "accounts.txt";

#[derive(Parser)]
#[command(name = "account-broker")]
#[command(about = "Account broker - hands out pooled game accounts to devices")]
struct Args {
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&config.general.log_level);

    info!(config_path = %args.config, "Starting account broker");

    let store = match Store::connect(&config.database.path).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            std::process::exit(1);
        }
    };

    match bootstrap::load_accounts_file(&store, ACCOUNTS_FILE).await {
        Ok(count) => info!(accounts = count, "Bootstrap finished"),
        Err(e) => {
            error!(error = %e, "Failed to bootstrap accounts");
            std::process::exit(1);
        }
    }

    let validator = Arc::new(BasicAuthValidator::new(
        config.general.auth_username.clone(),
        config.general.auth_password.clone(),
    ));
    if validator.is_open() {
        info!("No auth credentials configured - requests will not be authenticated");
    }

    let broker = Broker::new(store, config.broker_settings(), Clock::system());
    let state = Arc::new(BrokerState { broker });

    let app = routes::router(state, validator)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static("account-broker"),
        ));

    let addr = format!(
        "{}:{}",
        config.general.listen_host, config.general.listen_port
    );
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, address = %addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(address = %addr, "Server listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Server terminated");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(filter))
        .init();
}
