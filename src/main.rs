use std::{process, sync::Arc, time::Duration};

use cachegate::{
    cache::MemoryCacheStorage,
    config::{self, OriginSettings, OriginSource},
    error::AppError,
    gateway::{CacheGateway, GatewayConfig, OriginFetch},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        origin::{DirectoryOrigin, HttpOrigin},
        telemetry,
    },
};
use tokio::sync::oneshot;
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
        config::Command::Prefetch(_) => run_prefetch(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let gateway = Arc::new(build_gateway(&settings)?);

    // A partial install still leaves earlier batches usable.
    if let Err(err) = gateway.install(&gateway.config().manifest).await {
        warn!(error = %err, "continuing with a partially populated cache");
    }
    if let Err(err) = gateway.activate(&gateway.config().whitelist).await {
        warn!(error = %err, "stale caches were not cleaned up");
    }

    let state = HttpState {
        gateway,
        max_body_bytes: settings.origin.max_body_bytes,
    };
    serve_http(&settings.server, state).await
}

async fn run_prefetch(settings: config::Settings) -> Result<(), AppError> {
    let gateway = build_gateway(&settings)?;

    let installed = gateway.install(&gateway.config().manifest).await?;
    let activated = gateway.activate(&gateway.config().whitelist).await?;
    info!(
        entries = installed.entry_count(),
        deleted = activated.deleted.len(),
        "prefetch complete"
    );

    let snapshot = gateway.snapshot().await.map_err(|err| {
        AppError::unexpected(format!("failed to read cache snapshot: {err}"))
    })?;
    let rendered = serde_json::to_string_pretty(&snapshot)
        .map_err(|err| AppError::unexpected(format!("failed to render snapshot: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn build_gateway(settings: &config::Settings) -> Result<CacheGateway, AppError> {
    let origin = build_origin(&settings.origin)?;
    let config = GatewayConfig::from(&settings.gateway);

    if !config.write_cache_is_whitelisted() {
        warn!(
            write_cache = %config.write_cache,
            "write cache is not whitelisted; any later activation will prune its write-through entries"
        );
    }

    Ok(CacheGateway::new(
        config,
        Arc::new(MemoryCacheStorage::new()),
        origin,
    ))
}

fn build_origin(settings: &OriginSettings) -> Result<Arc<dyn OriginFetch>, AppError> {
    match settings.source.as_ref() {
        Some(OriginSource::Http(base)) => {
            let origin = HttpOrigin::new(base.clone(), settings.timeout, settings.max_body_bytes)?;
            info!(origin = %origin.base(), "using HTTP origin");
            Ok(Arc::new(origin))
        }
        Some(OriginSource::Directory { root, index_file }) => {
            let origin = DirectoryOrigin::new(root.clone(), index_file.clone());
            info!(origin = %origin.root().display(), "using directory origin");
            Ok(Arc::new(origin))
        }
        None => Err(AppError::validation(
            "no origin configured; set `origin.base_url` or `origin.directory`",
        )),
    }
}

async fn serve_http(server: &config::ServerSettings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %server.addr, "gateway listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut handle = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    tokio::select! {
        joined = &mut handle => return server_exit(joined),
        () = shutdown_signal() => {}
    }

    info!("shutdown requested; draining connections");
    let _ = stop_tx.send(());
    drain(handle, server.graceful_shutdown).await
}

async fn drain(
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
    grace: Duration,
) -> Result<(), AppError> {
    match tokio::time::timeout(grace, handle).await {
        Ok(joined) => server_exit(joined),
        Err(_) => {
            warn!(seconds = grace.as_secs(), "graceful shutdown timed out");
            Ok(())
        }
    }
}

fn server_exit(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
