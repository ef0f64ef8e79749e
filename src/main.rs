use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use broadcast_bench::broadcaster::Broadcaster;
use broadcast_bench::config::{
    Backend, BroadcastArgs, BroadcasterConfig, Cli, Command, HarnessConfig, StandaloneArgs,
    SubscribeArgs, SubscriberConfig,
};
use broadcast_bench::harness::Harness;
use broadcast_bench::mock_broker::{MockBroker, MockBrokerConfig};
use broadcast_bench::report::HarnessReport;
use broadcast_bench::transport::{
    CableIdentifier, CableTransport, CentrifugoTransport, RedisTransport, Transport,
};

/// Channel class the Action Cable app under test streams `all` from
const ACTION_CABLE_CHANNEL: &str = "BenchmarkChannel";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::load();

    // Initialize logging with a configured level
    let log_level = cli.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let debug = !cli.quiet;

    match cli.command {
        Command::Broadcast(args) => run_broadcast(args, debug).await,
        Command::Subscribe(args) => run_subscribe(args, debug).await,
        Command::Standalone(args) => run_standalone(args, debug).await,
    }
}

async fn run_broadcast(args: BroadcastArgs, debug: bool) -> Result<()> {
    let config = args.to_config(debug)?;

    tracing::info!(backend = %args.backend, "Starting broadcaster...");
    tracing::info!("Broadcast rate: {}ms", args.interval);

    let transport = broadcaster_transport(args.backend, &config, args.secret.clone())
        .with_context(|| format!("failed to set up {} broadcaster", args.backend))?;

    let root = CancellationToken::new();
    let broadcaster = Broadcaster::new(config, transport).spawn(&root);

    shutdown_signal().await;
    let stats = broadcaster.stop().await;

    println!(
        "Published {} messages ({} failed, {} skipped, {} reconnects)",
        stats.published, stats.failed, stats.skipped, stats.reconnects
    );
    Ok(())
}

async fn run_subscribe(args: SubscribeArgs, debug: bool) -> Result<()> {
    let config = args.to_config(debug)?;
    let backend = args.backend;
    let token = args.token.clone();

    let mut harness = Harness::new(config)?;
    harness
        .start(|subscriber| subscriber_transport(backend, subscriber, token.clone()))
        .with_context(|| format!("failed to set up {} subscribers", backend))?;

    shutdown_signal().await;
    let report = harness.shutdown().await;
    print_report(&report, args.json);
    Ok(())
}

async fn run_standalone(args: StandaloneArgs, debug: bool) -> Result<()> {
    let mut broker = MockBroker::new(MockBrokerConfig {
        degraded_delay: Duration::from_millis(args.slow_delay),
        ..Default::default()
    });
    broker.start().await.context("failed to start mock broker")?;

    let mut harness = Harness::new(HarnessConfig {
        subscribers: args.subscribers,
        log_slow: args.log_slow,
        skip_slow: args.skip_slow,
        standard: broker.endpoint(),
        degraded: broker.degraded_endpoint(),
        reconnect_interval: Duration::from_secs(1),
        debug,
        ..Default::default()
    })?;
    harness.start(|subscriber| CableTransport::new(&subscriber.endpoint, CableIdentifier::PubSub))?;

    let broadcaster_config = BroadcasterConfig {
        endpoint: broker.endpoint(),
        broadcast_interval: Duration::from_millis(args.interval),
        filler_size: args.filler_size,
        reconnect_delay: Duration::from_secs(1),
        debug,
        ..Default::default()
    };
    broadcaster_config.validate()?;
    let transport = CableTransport::new(&broker.endpoint(), CableIdentifier::PubSub)?;
    harness.attach_broadcaster("anycable (mock)", broadcaster_config, transport);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {
            tracing::info!(seconds = args.duration, "Run complete");
        }
        _ = shutdown_signal() => {}
    }

    let report = harness.shutdown().await;
    broker.stop();
    print_report(&report, args.json);
    Ok(())
}

fn broadcaster_transport(
    backend: Backend,
    config: &BroadcasterConfig,
    secret: Option<String>,
) -> broadcast_bench::Result<Box<dyn Transport>> {
    let endpoint = &config.endpoint;
    let transport: Box<dyn Transport> = match backend {
        Backend::Redis | Backend::Actioncable => Box::new(RedisTransport::new(endpoint)?),
        Backend::Anycable => {
            Box::new(CableTransport::new(endpoint, CableIdentifier::PubSub)?.with_secret(secret))
        }
        Backend::Centrifugo => Box::new(CentrifugoTransport::new(endpoint)?.with_api_key(secret)),
    };
    Ok(transport)
}

fn subscriber_transport(
    backend: Backend,
    config: &SubscriberConfig,
    token: Option<String>,
) -> broadcast_bench::Result<Box<dyn Transport>> {
    let endpoint = &config.endpoint;
    let transport: Box<dyn Transport> = match backend {
        Backend::Redis => Box::new(RedisTransport::new(endpoint)?),
        Backend::Anycable => Box::new(CableTransport::new(endpoint, CableIdentifier::PubSub)?),
        Backend::Actioncable => Box::new(CableTransport::new(
            endpoint,
            CableIdentifier::Named(ACTION_CABLE_CHANNEL.to_string()),
        )?),
        Backend::Centrifugo => Box::new(CentrifugoTransport::new(endpoint)?.with_token(token)),
    };
    Ok(transport)
}

fn print_report(report: &HarnessReport, json: bool) {
    if json {
        println!("{}", report.to_json());
    } else {
        report.print_table();
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
