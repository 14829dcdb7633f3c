use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_auth::JwtManager;
use parley_bus::{EventPublisher, RedisEventBus, RedisGatewayChannel, StreamOptions};
use parley_config::AppConfig;
use parley_events::UserId;
use parley_fanout::{
    spawn_partition_workers, FanoutRouter, HttpMembershipResolver, RetryPolicy, RetryingResolver,
};
use parley_gateway::{
    create_router as gateway_router, spawn_background_tasks, ConnectionManager, GatewayState,
};
use parley_presence::RedisPresenceRegistry;
use parley_runtime::{load_config, shutdown_token, telemetry, RedisServices};
use parley_sequencer::{
    create_router as sequencer_router, initialize_database, ConversationRepository, MessageSender,
    NoopMessageStore, Sequencer, SequencerState,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley realtime delivery pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Terminate client websockets for one gateway instance
    Gateway,
    /// Consume the event bus and route events to gateways
    Fanout,
    /// Serve sequence allocation and membership lookups
    Sequencer,
    /// Mint an access token for a user with the configured secret
    IssueToken {
        /// User id placed in the token's subject
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway => run_gateway().await,
        Commands::Fanout => run_fanout().await,
        Commands::Sequencer => run_sequencer().await,
        Commands::IssueToken { user_id } => issue_token(&user_id),
    }
}

async fn bootstrap(service: &str) -> anyhow::Result<(AppConfig, RedisServices)> {
    telemetry::init_tracing().context("failed to initialise tracing")?;
    info!(service, "starting parley");

    let config = load_config()?;
    let redis = RedisServices::connect(&config.redis).await?;
    Ok((config, redis))
}

async fn run_gateway() -> anyhow::Result<()> {
    let (config, redis) = bootstrap("gateway").await?;

    let presence = Arc::new(RedisPresenceRegistry::new(redis.connection.clone()));
    let channel = Arc::new(
        RedisGatewayChannel::connect(redis.client.clone())
            .await
            .context("failed to open gateway channel")?,
    );
    let connections = Arc::new(ConnectionManager::from_config(
        &config.gateway,
        &config.presence,
        presence,
    ));
    let tokens = Arc::new(JwtManager::from_config(&config.auth));

    let shutdown = shutdown_token();
    let background = spawn_background_tasks(
        connections.clone(),
        channel,
        config.gateway.heartbeat_interval(),
        shutdown.clone(),
    );

    let app = gateway_router(GatewayState::new(connections.clone(), tokens));
    let address = format!("{}:{}", config.gateway.address, config.gateway.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind gateway listener on {address}"))?;

    info!(%address, gateway_id = %connections.gateway_id(), "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("gateway server error")?;

    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    connections.shutdown().await;

    info!("gateway shut down");
    Ok(())
}

async fn run_fanout() -> anyhow::Result<()> {
    let (config, redis) = bootstrap("fanout").await?;

    let bus = Arc::new(
        RedisEventBus::connect(redis.client.clone(), StreamOptions::from(&config.bus))
            .await
            .context("failed to open event bus")?,
    );
    let channel = Arc::new(
        RedisGatewayChannel::connect(redis.client.clone())
            .await
            .context("failed to open gateway channel")?,
    );
    let presence = Arc::new(RedisPresenceRegistry::new(redis.connection.clone()));
    let resolver = Arc::new(RetryingResolver::new(
        Arc::new(
            HttpMembershipResolver::from_config(&config.membership)
                .context("failed to build membership client")?,
        ),
        RetryPolicy::from(&config.membership),
    ));
    let router = Arc::new(FanoutRouter::new(resolver, presence, channel));

    let shutdown = shutdown_token();
    let workers = spawn_partition_workers(bus, router, &config.fanout, shutdown.clone())
        .await
        .context("failed to start partition workers")?;

    let mut failed = false;
    for worker in workers {
        if let Err(error) = flatten(worker).await {
            error!(%error, "partition worker stopped");
            failed = true;
            shutdown.cancel();
        }
    }

    info!("fanout shut down");
    if failed {
        anyhow::bail!("fanout stopped after a worker failure");
    }
    Ok(())
}

async fn flatten<E>(handle: JoinHandle<Result<(), E>>) -> anyhow::Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    handle.await.context("partition worker panicked")??;
    Ok(())
}

async fn run_sequencer() -> anyhow::Result<()> {
    let (config, redis) = bootstrap("sequencer").await?;

    let pool = initialize_database(&config.database).await?;
    let bus = Arc::new(
        RedisEventBus::connect(redis.client.clone(), StreamOptions::from(&config.bus))
            .await
            .context("failed to open event bus")?,
    );

    let sequencer = Sequencer::new(pool.clone());
    let sender = MessageSender::new(
        sequencer.clone(),
        Arc::new(NoopMessageStore),
        EventPublisher::new(bus),
    );
    let state = SequencerState {
        sequencer,
        conversations: ConversationRepository::new(pool),
        tokens: Arc::new(JwtManager::from_config(&config.auth)),
        sender,
    };

    let address = format!("{}:{}", config.sequencer.address, config.sequencer.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind sequencer listener on {address}"))?;

    info!(%address, "sequencer listening");

    axum::serve(listener, sequencer_router(state))
        .with_graceful_shutdown(parley_runtime::shutdown_signal())
        .await
        .context("sequencer server error")?;

    info!("sequencer shut down");
    Ok(())
}

fn issue_token(user_id: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let token = JwtManager::from_config(&config.auth)
        .issue(&UserId::from(user_id))
        .context("failed to issue token")?;
    println!("{token}");
    Ok(())
}
