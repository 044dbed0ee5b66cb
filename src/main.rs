use std::{process, sync::Arc};

use precache::{
    cancel::CancellationRegistry,
    config,
    error::AppError,
    handler::Handler,
    infra::{
        error::InfraError,
        http::{self, ProxyState},
        telemetry,
        upstream::UpstreamHandler,
    },
    precache::PreCacheConfig,
    queue::PriorityTaskQueue,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let state = build_state(&settings)?;
    serve_http(&settings, state).await
}

fn build_state(settings: &config::Settings) -> Result<ProxyState, AppError> {
    let upstream: Arc<dyn Handler> = Arc::new(UpstreamHandler::new(
        settings.upstream.base_url.clone(),
        settings.upstream.timeout,
    )?);
    let registry = Arc::new(CancellationRegistry::new(
        settings.cancellation.tokens.iter().cloned(),
    ));

    let precache_config = PreCacheConfig::from(&settings.precache);
    let precache = if precache_config.enabled {
        let store = precache_config
            .open_store()
            .map_err(|source| InfraError::StoreOpen {
                path: precache_config.directory.clone(),
                source,
            })?;
        let queue = PriorityTaskQueue::new(settings.queue.concurrency);
        info!(
            store = precache_config.store.as_str(),
            concurrency = settings.queue.concurrency.get(),
            "pre-cache enabled"
        );
        Some((queue, store))
    } else {
        warn!("pre-cache disabled, forwarding every request");
        None
    };

    Ok(ProxyState::assemble(
        upstream,
        precache,
        registry,
        settings.server.max_body_bytes.get(),
    ))
}

async fn serve_http(settings: &config::Settings, state: ProxyState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|source| InfraError::Bind {
            addr: settings.server.addr,
            source,
        })?;
    info!(
        addr = %settings.server.addr,
        upstream = %settings.upstream.base_url,
        "proxy listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!("proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
