use toolgate::config::{AppConfig, config_path_from_env, load_config};
use toolgate::error::AppError;

#[tokio::main]
async fn main() {
    let config = match load_config(&config_path_from_env()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err.message);
            std::process::exit(1);
        }
    };

    let default_filter = if config.features.log_level.eq_ignore_ascii_case("disabled") {
        "off".to_string()
    } else {
        let level = config.features.log_level.to_ascii_lowercase();
        format!("{level},toolgate={level}")
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .init();

    if let Err(err) = run(config).await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), AppError> {
    let bind = config.server.bind_addr();
    let state = toolgate::app::load_state_with_config(config)?;
    let app = toolgate::app::build_app(state);
    let addr: std::net::SocketAddr =
        bind.parse()
            .map_err(|err: std::net::AddrParseError| {
                AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "listen_invalid",
                    err.to_string(),
                )
            })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            err.to_string(),
        )
    })?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "serve_failed",
            err.to_string(),
        )
    })?;
    Ok(())
}
