//! Consume a Redis stream with a group of polling consumers.
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use envconfig::Envconfig;
use stream_common::health::{HealthHandle, HealthRegistry};
use stream_common::metrics::{health_routes, serve, setup_metrics_routes};
use stream_common::redis::RedisClient;
use stream_worker::config::Config;
use stream_worker::error::WorkerError;
use stream_worker::handler::{Handler, LogHandler, WebhookHandler};
use stream_worker::orchestrator::{GroupCreationPolicy, GroupOrchestrator};
use stream_worker::policy::PollPolicy;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Stdout gets `RUST_LOG` (or info); the optional log file also gets debug events.
fn setup_tracing(log_file: Option<&Path>) -> Result<(), std::io::Error> {
    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new("debug")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(())
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

fn start_health_liveness_server(config: &Config, liveness: HealthRegistry) {
    let bind = config.bind();
    let router = match setup_metrics_routes(health_routes(liveness)) {
        Ok(router) => router,
        Err(err) => {
            error!("failed to install metrics recorder: {}", err);
            return;
        }
    };

    tokio::task::spawn(async move {
        if let Err(err) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, err);
        }
    });
}

async fn consume<H: Handler>(
    config: &Config,
    client: RedisClient,
    handler: H,
    liveness: HealthHandle,
) -> Result<(), WorkerError> {
    let mut poll_policy =
        PollPolicy::build(config.poll_interval.0).jitter(config.poll_jitter.0);
    if let Some(max_rounds) = config.max_rounds {
        poll_policy = poll_policy.max_rounds(max_rounds);
    }

    let group_creation_policy = if config.strict_group_creation {
        GroupCreationPolicy::Strict
    } else {
        GroupCreationPolicy::Tolerant
    };

    let orchestrator = GroupOrchestrator::new(
        client,
        config.stream_name.as_str(),
        config.consumer_count,
        handler,
    )
    .poll_policy(poll_policy.provide())
    .check_backlog(config.check_backlog)
    .batch_size(config.batch_size)
    .group_creation_policy(group_creation_policy)
    .liveness(liveness);

    tokio::select! {
        result = orchestrator.run() => {
            let rounds = result?;
            info!(rounds, "reached the configured number of rounds");
        }
        _ = shutdown() => {}
    };

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env().map_err(|err| WorkerError::Config(err.to_string()))?;

    setup_tracing(config.log_file.as_deref())?;
    info!(stream = config.stream_name.as_str(), "Starting up...");

    let registry = HealthRegistry::new("liveness");
    let liveness = registry
        .register(
            "orchestrator".to_string(),
            ::time::Duration::try_from(config.liveness_deadline())
                .unwrap_or(::time::Duration::MAX),
        )
        .await;
    start_health_liveness_server(&config, registry);

    let client = RedisClient::new(&config.redis_url)
        .await?
        .command_timeout(config.redis_timeout.0)
        .mkstream(config.mkstream);

    match &config.webhook_url {
        Some(url) => {
            let handler = WebhookHandler::new(url.clone(), config.webhook_timeout.0)
                .map_err(|err| WorkerError::Config(format!("{:#}", err)))?;
            consume(&config, client, handler, liveness).await
        }
        None => consume(&config, client, LogHandler, liveness).await,
    }
}
