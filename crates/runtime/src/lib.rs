use anyhow::{Context, Result};
use parley_config::{AppConfig, RedisConfig};
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::TRACE)
            .with_env_filter(env_filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// Load and validate the configuration every service starts from.
pub fn load_config() -> Result<AppConfig> {
    let config = parley_config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Redis handles shared by the bus, the gateway channels and the presence registry.
#[derive(Clone)]
pub struct RedisServices {
    pub client: redis::Client,
    pub connection: ConnectionManager,
}

impl RedisServices {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis_client(config)?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .with_context(|| format!("failed to connect to redis at {}", config.url))?;

        info!(url = %config.url, "redis connection established");
        Ok(Self { client, connection })
    }
}

/// Parse the configured URL without opening a connection.
pub fn redis_client(config: &RedisConfig) -> Result<redis::Client> {
    redis::Client::open(config.url.as_str())
        .with_context(|| format!("invalid redis url {}", config.url))
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(?error, "failed to listen for shutdown signal");
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
                tracing::warn!(?error, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}

/// A token cancelled once [`shutdown_signal`] fires, for background loops.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_client_rejects_malformed_urls() {
        let config = RedisConfig {
            url: "not a redis url".to_string(),
        };
        let error = match redis_client(&config) {
            Ok(_) => panic!("expected an invalid url error"),
            Err(error) => error,
        };
        assert!(error.to_string().contains("invalid redis url"));
    }

    #[test]
    fn redis_client_accepts_default_url_without_connecting() {
        assert!(redis_client(&RedisConfig::default()).is_ok());
    }
}
