use anyhow::{Context, Result};
use gallery_service::api::{start_api_server, AppState};
use gallery_service::config::Config;
use gallery_service::messaging::{KafkaMessageSource, Subscription};
use gallery_service::metrics_sink::init_metrics;
use gallery_service::repository::{self, CommentRepository, ImageRepository};
use gallery_service::{
    startup, CommentService, HttpProbe, ImageService, InMemoryCommentRepository,
    InMemoryImageRepository, PgCommentRepository, PgImageRepository, RecorderMetricsSink,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Gallery Service"
    );

    init_metrics(config.service.metrics_port)?;

    let (images_repo, comments_repo): (Arc<dyn ImageRepository>, Arc<dyn CommentRepository>) =
        match config.database {
            Some(ref database) => {
                let pool = repository::connect(database)
                    .await
                    .context("Failed to initialize metadata store")?;

                if database.run_migrations {
                    repository::run_migrations(&pool)
                        .await
                        .context("Failed to run database migrations")?;
                }

                (
                    Arc::new(PgImageRepository::new(pool.clone())),
                    Arc::new(PgCommentRepository::new(pool)),
                )
            }
            None => {
                warn!("No database configured, using in-memory repositories");
                (
                    Arc::new(InMemoryImageRepository::new()),
                    Arc::new(InMemoryCommentRepository::new()),
                )
            }
        };

    startup::prepare(
        &config.startup,
        &config.images.upload_root,
        comments_repo.as_ref(),
    )
    .await
    .context("Failed to prepare startup state")?;

    let image_service = Arc::new(ImageService::new(images_repo, &config.images));
    let comment_service = Arc::new(CommentService::new(
        comments_repo,
        Arc::new(RecorderMetricsSink),
    ));

    let subscriptions = vec![Subscription::bind(
        config.kafka.comments_topic.clone(),
        config.kafka.comments_routing_key.clone(),
        comment_service,
    )];
    let message_source = KafkaMessageSource::new(&config.kafka, subscriptions)
        .context("Failed to initialize Kafka consumer")?;
    let consumer_shutdown = message_source.shutdown_handle();

    let probe = HttpProbe::new(config.health.probe_url.clone(), config.probe_timeout())
        .context("Failed to build health probe client")?;

    let api_state = AppState {
        images: image_service,
        probe: Arc::new(probe),
    };

    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = message_source.run().await {
            error!(error = %e, "Kafka consumer error");
        }
    });

    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Gallery service started successfully");

    shutdown_signal().await;

    info!("Shutting down gallery service");

    let _ = consumer_shutdown.send(());
    if let Err(e) = consumer_handle.await {
        warn!(error = %e, "Kafka consumer task did not stop cleanly");
    }
    api_handle.abort();

    info!("Gallery service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
