mod cache;
mod config;
mod download;
mod error;
mod filename;
mod housekeeping;
mod identifier;
mod metadata;
mod rate_limit;
mod routes;
mod tools;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    error::ApiError,
    housekeeping::Housekeeper,
    routes::{AppState, build_router},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.staging_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "No se pudo crear la carpeta temporal de descargas: {error}"
            ))
        })?;

    let http_client = reqwest::Client::builder()
        .timeout(config.metadata_timeout)
        .build()
        .map_err(|error| ApiError::internal(format!("No se pudo crear cliente HTTP: {error}")))?;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: se usara la IP del socket para limitar solicitudes.");
    }
    info!(
        "Politica de descarga: {} (entorno {})",
        config.policy.as_str(),
        if config.production { "produccion" } else { "desarrollo" }
    );

    let addr = config.bind_addr.clone();
    let state = AppState::new(config, http_client);

    let tools = state.tools.status().await;
    if !tools.yt_dlp_available() {
        warn!(
            "yt-dlp no esta disponible en {:?}. Las descargas usaran archivos de ejemplo.",
            state.tools.yt_dlp_path()
        );
    }

    let shutdown = CancellationToken::new();
    let housekeeping = Housekeeper::new(
        state.config.staging_dir.clone(),
        state.config.staging_max_age,
        state.config.housekeeping_interval,
        Arc::clone(&state.cache),
        Arc::clone(&state.rate_limiter),
    )
    .spawn(shutdown.clone());

    let app = build_router(state)?;

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("No se pudo iniciar el puerto {addr}: {error}"))
    })?;

    info!("Backend listo en http://{addr}");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")));

    shutdown.cancel();
    if let Err(error) = housekeeping.await {
        warn!("La tarea de limpieza termino con error: {error}");
    }
    info!("Servidor detenido");

    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("No se pudo escuchar Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("No se pudo escuchar SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Senal de apagado recibida");
}
