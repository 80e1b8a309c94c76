use std::{process, sync::Arc};

use qrverse::{
    application::{
        daily_verse::{DailyVerseError, DailyVerseService},
        error::{AppError, ErrorReport},
        generator::VerseGenerator,
        identity::IdentityResolver,
    },
    cache::{CacheConfig, MemoryStore},
    config,
    infra::{
        error::InfraError,
        generator::OpenAiVerseGenerator,
        http::{self, HttpState},
        telemetry,
    },
};
use axum::http::StatusCode;
use tokio::{signal, sync::Notify};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "qrverse::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = ErrorReport::from_error(SOURCE, StatusCode::INTERNAL_SERVER_ERROR, error).messages;
    let emit = || error!(target = SOURCE, error = %error, chain = ?chain, "application error");

    if dispatcher::has_been_set() {
        emit();
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, emit);
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Generate(args) => run_generate(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let generator: Arc<dyn VerseGenerator> =
        Arc::new(OpenAiVerseGenerator::new(&settings.generator)?);
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(MemoryStore::new(&cache_config));

    let state = HttpState {
        daily_verse: Arc::new(DailyVerseService::new(store, generator, &cache_config)),
        identity: Arc::new(IdentityResolver::new(
            settings.identity.platform_header.clone(),
        )),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| InfraError::bind(settings.server.addr, err))?;

    info!(
        target = SOURCE,
        addr = %settings.server.addr,
        model = %settings.generator.model,
        ttl_seconds = cache_config.ttl.whole_seconds(),
        "listening"
    );

    let grace = settings.server.graceful_shutdown;
    let shutdown = Arc::new(Notify::new());
    let trigger = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { trigger.notified().await });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => return finish_server(joined),
        _ = shutdown_signal() => shutdown.notify_one(),
    }

    // In-flight requests get `grace` to drain after the signal.
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => finish_server(joined),
        Err(_) => {
            warn!(
                target = SOURCE,
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; dropping remaining connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn finish_server(
    joined: Result<Result<(), std::io::Error>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => {
            info!(target = SOURCE, "server stopped");
            Ok(())
        }
        Ok(Err(err)) => Err(InfraError::Serve(err).into()),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn run_generate(
    settings: config::Settings,
    args: config::GenerateArgs,
) -> Result<(), AppError> {
    let generator = OpenAiVerseGenerator::new(&settings.generator)?;
    let verse = generator
        .generate(args.lang)
        .await
        .map_err(DailyVerseError::from)?;

    let json = serde_json::to_string_pretty(&verse)
        .map_err(|err| AppError::unexpected(format!("failed to encode verse: {err}")))?;
    println!("{json}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(target = SOURCE, error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!(target = SOURCE, "received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(target = SOURCE, "received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(target = SOURCE, error = %err, "failed to install SIGTERM handler");
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
}
