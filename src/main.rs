use keymux::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| {
                    std::env::var("LOG_LEVEL")
                        .map(tracing_subscriber::EnvFilter::new)
                })
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keymux=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = keymux::app::load_state().await?;
    let app = keymux::app::build_app(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.runtime.port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            format!("listen failed: {}", err),
        )
    })?;
    tracing::info!("{} listening on {}", state.runtime.server_title, addr);
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "proxy_error",
            format!("serve failed: {}", err),
        )
    })?;
    Ok(())
}
