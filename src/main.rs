use clap::Parser;
use glucose_wizard::api::{AppState, Cli, Command, build_config, run_http_server};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("glucose_wizard=info,tower_http=info")),
        )
        .init();

    let Command::Serve(args) = Cli::parse().command;
    let config = match build_config(args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let state = match AppState::load(&config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "cannot open patient data");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_http_server(state, config.port).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
