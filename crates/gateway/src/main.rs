use std::sync::Arc;

use axum::http::Method;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use weft_gateway::api;
use weft_gateway::bootstrap::build_app_state;
use weft_gateway::cli::{load_config, Cli, Command, ConfigCommand};
use weft_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (mut config, config_path) = load_config(cli.config.as_ref())?;
            if let Some(bind) = cli.bind {
                config.server.bind = bind;
            }
            if let Some(path) = &config_path {
                tracing::info!(path = %path.display(), "config loaded");
            }
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, _) = load_config(cli.config.as_ref())?;
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if !issues.is_empty() {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = load_config(cli.config.as_ref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("weftd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,weft_engine=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config: Arc<weft_domain::config::Config>) -> anyhow::Result<()> {
    let state: AppState = build_app_state(config.clone())?;

    let cors = if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any)
    };

    let app = api::router(state.clone())
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "weftd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// Wait for ctrl-c, then drain streamer buffers before exiting.
async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested, flushing streams");
    state.runtime.flush_streams().await;
}
