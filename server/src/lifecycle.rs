//! Application lifecycle and graceful shutdown.
//!
//! 1. **Startup**: pick the storage and transport backends, wire the
//!    orchestrator, build the inbound consumers and the replay sweeper
//! 2. **Runtime**: serve HTTP while the consumers process deliveries
//! 3. **Shutdown**: on Ctrl+C or SIGTERM stop accepting connections, broadcast
//!    shutdown and give background tasks `SHUTDOWN_TIMEOUT` to finish

use crate::config::{Config, EventBusBackend, StorageBackend};
use crate::server::{AppState, build_router};
use anyhow::Context;
use failsafe_core::event_bus::EventBus;
use failsafe_core::pending::PendingEventStore;
use failsafe_core::registry::RequestRegistry;
use failsafe_postgres::{PostgresPendingEventStore, PostgresRequestRegistry};
use failsafe_redpanda::RedpandaEventBus;
use failsafe_runtime::metrics::MetricsServer;
use failsafe_runtime::{
    EventConsumer, FailSafeOrchestrator, ReplaySweeper, RequestCreatedHandler,
    StatusChangeHandler,
};
use failsafe_testing::{InMemoryEventBus, InMemoryPendingEventStore, InMemoryRequestRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Running application with all background tasks.
pub struct Application {
    listener: tokio::net::TcpListener,
    app: axum::Router,
    consumers: Vec<EventConsumer>,
    sweeper: Option<ReplaySweeper>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Application {
    /// Connect the backends, wire the engine and bind the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when a backend cannot be reached, a consumer is misconfigured, the
    /// metrics exporter cannot start, or the HTTP address cannot be bound.
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let (registry, pending) = build_storage(config).await?;
        let event_bus = build_event_bus(config)?;

        let orchestrator = Arc::new(FailSafeOrchestrator::new(
            config.failsafe_config(),
            registry,
            pending,
            Arc::clone(&event_bus),
        ));

        let metrics_addr: SocketAddr = config
            .metrics_addr()
            .parse()
            .with_context(|| format!("Invalid metrics address {}", config.metrics_addr()))?;
        MetricsServer::new(metrics_addr)
            .start()
            .context("Failed to start metrics server")?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let consumers = vec![
            EventConsumer::builder()
                .name("request-created")
                .topics(vec![config.event_bus.new_requests_topic.clone()])
                .event_bus(Arc::clone(&event_bus))
                .handler(Arc::new(RequestCreatedHandler::new(Arc::clone(&orchestrator))))
                .shutdown(shutdown_tx.subscribe())
                .retry_policy(config.retry_policy())
                .max_in_flight(config.engine.max_in_flight)
                .build()?,
            EventConsumer::builder()
                .name("status-change")
                .topics(vec![config.event_bus.status_change_topic.clone()])
                .event_bus(Arc::clone(&event_bus))
                .handler(Arc::new(StatusChangeHandler::new(Arc::clone(&orchestrator))))
                .shutdown(shutdown_tx.subscribe())
                .retry_policy(config.retry_policy())
                .max_in_flight(config.engine.max_in_flight)
                .build()?,
        ];

        let sweeper = config.sweep_interval().map(|interval| {
            ReplaySweeper::new(Arc::clone(&orchestrator), interval, shutdown_tx.subscribe())
        });

        let app = build_router(AppState::new(orchestrator));

        let addr = config.http_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        Ok(Self {
            listener,
            app,
            consumers,
            sweeper,
            shutdown_tx,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Address the HTTP server is bound to.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until a shutdown signal is received, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let address = self.local_addr()?;

        info!(consumer_count = self.consumers.len(), "Starting event consumers");
        let mut handles: Vec<(String, JoinHandle<()>)> = self
            .consumers
            .into_iter()
            .map(|consumer| (consumer.name().to_string(), consumer.spawn()))
            .collect();

        if let Some(sweeper) = self.sweeper {
            handles.push(("replay-sweeper".to_string(), sweeper.spawn()));
        }

        info!(address = %address, "HTTP server listening for requests");
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;

        info!("HTTP server stopped, initiating graceful shutdown...");
        // No receivers left means every task already stopped.
        let _ = self.shutdown_tx.send(());

        await_shutdown(handles, self.shutdown_timeout).await;

        info!("Graceful shutdown complete");
        Ok(())
    }
}

async fn build_storage(
    config: &Config,
) -> anyhow::Result<(Arc<dyn RequestRegistry>, Arc<dyn PendingEventStore>)> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage: requests and pending events are lost on restart");
            Ok((
                Arc::new(InMemoryRequestRegistry::new()),
                Arc::new(InMemoryPendingEventStore::new()),
            ))
        },
        StorageBackend::Postgres => {
            info!("Connecting to PostgreSQL...");
            let pool = failsafe_postgres::connect(
                &config.storage.database_url,
                config.storage.max_connections,
            )
            .await
            .context("Failed to connect to PostgreSQL")?;
            failsafe_postgres::schema::bootstrap(&pool)
                .await
                .context("Failed to apply schema")?;
            info!("PostgreSQL connected");

            Ok((
                Arc::new(PostgresRequestRegistry::from_pool(pool.clone())),
                Arc::new(PostgresPendingEventStore::from_pool(pool)),
            ))
        },
    }
}

fn build_event_bus(config: &Config) -> anyhow::Result<Arc<dyn EventBus>> {
    match config.event_bus.backend {
        EventBusBackend::Memory => {
            warn!("Using in-memory event bus: messages are not shared between instances");
            Ok(Arc::new(InMemoryEventBus::new()))
        },
        EventBusBackend::Redpanda => {
            info!(brokers = %config.event_bus.brokers, "Connecting to Redpanda event bus...");
            let bus = RedpandaEventBus::builder()
                .brokers(&config.event_bus.brokers)
                .consumer_group(&config.event_bus.consumer_group)
                .build()
                .context("Failed to create Redpanda event bus")?;
            info!("Event bus connected");
            Ok(Arc::new(bus))
        },
    }
}

/// Wait for background tasks, giving each `timeout` to finish its current work.
async fn await_shutdown(handles: Vec<(String, JoinHandle<()>)>, timeout: Duration) {
    for (name, handle) in handles {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!(task = %name, "Task stopped gracefully"),
            Ok(Err(e)) => warn!(task = %name, error = %e, "Task failed"),
            Err(_) => warn!(task = %name, "Task shutdown timed out"),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
