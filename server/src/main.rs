//! Failsafe HTTP server.

use failsafe_server::{Application, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "failsafe=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting failsafe server");

    let config = Config::from_env()?;
    info!(
        storage = %config.storage.backend,
        event_bus = %config.event_bus.backend,
        new_requests_topic = %config.event_bus.new_requests_topic,
        status_change_topic = %config.event_bus.status_change_topic,
        "Configuration loaded"
    );

    let app = Application::build(&config).await?;
    app.run().await?;

    info!("Server stopped");
    Ok(())
}
