#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

mod config;
mod error;
mod fetchers;
mod routes;
mod storage;
mod telemetry;

use std::sync::Arc;

use axum::{extract::Extension, Router};
use clap::Parser;
use index_cache::{Clock, CoreFacade, IndexSpec, SystemClock};
use tokio::runtime::Runtime;

use config::Args;
use fetchers::{http_artifact::HttpArtifactFetcher, http_metadata::HttpMetadataFetcher};
use routes::AppState;
use storage::local_fs::LocalFsStorage;

fn main() {
    telemetry::init_logging();

    let args = Args::parse();

    let rt = Runtime::new().expect("failed to start the Tokio runtime");
    rt.block_on(async_main(args));
}

async fn async_main(args: Args) {
    let indices: Vec<IndexSpec> = args
        .index_urls()
        .into_iter()
        .zip(args.index_ttls())
        .map(|(url, ttl)| IndexSpec { url, ttl })
        .collect();

    let client = reqwest::Client::builder()
        .connect_timeout(args.connect_timeout)
        .danger_accept_invalid_certs(args.disable_ssl_verification)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .expect("failed to build the upstream HTTP client");

    let metadata_fetcher = Arc::new(HttpMetadataFetcher::new(client.clone(), args.read_timeout));
    let artifact_fetcher = Arc::new(HttpArtifactFetcher::new(client, args.download_timeout));
    let storage = Arc::new(LocalFsStorage::new(args.cache_dir.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let facade = CoreFacade::new(
        metadata_fetcher,
        artifact_fetcher,
        storage,
        clock,
        indices,
        args.serve_stale_on_error,
        args.cache_size_bytes,
    );

    let state: routes::State = Arc::new(AppState {
        facade,
        binary_file_mime_type: args.binary_file_mime_type,
    });

    let app = Router::new()
        .merge(routes::get_router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(Extension(state));

    tracing::info!("Listening on {}", args.listen);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .expect("failed to bind the listen address");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down");
}
