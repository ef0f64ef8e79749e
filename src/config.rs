use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::time::Duration;

use crate::error::{BenchError, Result};
use crate::payload::FillerSize;

/// Broadcast latency benchmarks for real-time pub/sub backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Drop per-message lines to debug level
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Cli::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish benchmark envelopes to a backend until interrupted
    Broadcast(BroadcastArgs),

    /// Run N fast subscribers plus one slow subscriber until interrupted
    Subscribe(SubscribeArgs),

    /// Run an in-process cable broker, broadcaster and subscriber fleet
    Standalone(StandaloneArgs),
}

/// Backend under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Redis pub/sub on both sides
    Redis,
    /// AnyCable: HTTP broadcast, `$pubsub` stream over /cable
    Anycable,
    /// Action Cable: Redis broadcast, `BenchmarkChannel` over /cable
    Actioncable,
    /// Centrifugo: HTTP API publish, JSON protocol over WebSocket
    Centrifugo,
}

impl Backend {
    /// Whether the broadcaster side talks to Redis
    pub fn publishes_to_redis(&self) -> bool {
        matches!(self, Backend::Redis | Backend::Actioncable)
    }

    /// Whether the subscriber side talks to Redis
    pub fn subscribes_to_redis(&self) -> bool {
        matches!(self, Backend::Redis)
    }

    pub fn default_broadcast_port(&self) -> u16 {
        match self {
            Backend::Redis | Backend::Actioncable => redis_port_from_env(),
            Backend::Anycable => 8090,
            Backend::Centrifugo => 8010,
        }
    }

    /// (standard, degraded) subscriber ports
    pub fn default_subscriber_ports(&self) -> (u16, u16) {
        match self {
            Backend::Redis => {
                let port = redis_port_from_env();
                (port, port)
            }
            Backend::Anycable | Backend::Actioncable => (8080, 8081),
            Backend::Centrifugo => (8010, 8011),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Redis => write!(f, "redis"),
            Backend::Anycable => write!(f, "anycable"),
            Backend::Actioncable => write!(f, "actioncable"),
            Backend::Centrifugo => write!(f, "centrifugo"),
        }
    }
}

fn redis_port_from_env() -> u16 {
    std::env::var("REDIS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(6379)
}

#[derive(Args, Debug, Clone)]
pub struct BroadcastArgs {
    /// Backend to publish to
    #[arg(value_enum)]
    pub backend: Backend,

    /// Broadcast interval in milliseconds
    #[arg(default_value = "1000")]
    pub interval: u64,

    /// Backend host
    #[arg(short = 'H', long, env = "BENCH_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Backend port (defaults depend on the backend; Redis honours REDIS_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Channel / stream to publish to
    #[arg(short, long, default_value = "all")]
    pub channel: String,

    /// Broadcast secret (AnyCable bearer token or Centrifugo API key)
    #[arg(long, env = "BROADCAST_SECRET")]
    pub secret: Option<String>,

    /// Random filler per message, in bytes
    #[arg(long, default_value = "500")]
    pub filler_size: FillerSize,

    /// Fixed delay before reconnecting, in milliseconds
    #[arg(long, default_value = "5000")]
    pub reconnect_delay: u64,
}

impl BroadcastArgs {
    pub fn to_config(&self, debug: bool) -> Result<BroadcasterConfig> {
        let config = BroadcasterConfig {
            endpoint: Endpoint::new(
                &self.host,
                self.port
                    .unwrap_or_else(|| self.backend.default_broadcast_port()),
            ),
            broadcast_interval: Duration::from_millis(self.interval),
            channel: self.channel.clone(),
            debug,
            filler_size: self.filler_size,
            reconnect_delay: Duration::from_millis(self.reconnect_delay),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SubscribeArgs {
    /// Backend to subscribe to
    #[arg(value_enum)]
    pub backend: Backend,

    /// Number of fast subscribers
    #[arg(short = 'n', long, env = "N", default_value = "10")]
    pub subscribers: usize,

    /// Log every slow-path arrival, not just the ones after a stall
    #[arg(long, env = "LOG_SLOW", value_parser = FalseyValueParser::new())]
    pub log_slow: bool,

    /// Do not start the slow subscriber
    #[arg(long, env = "SKIP_SLOW", value_parser = FalseyValueParser::new())]
    pub skip_slow: bool,

    /// Backend host
    #[arg(short = 'H', long, env = "BENCH_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the fast subscribers
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port for the slow subscriber (typically a latency-injecting proxy)
    #[arg(long)]
    pub slow_port: Option<u16>,

    /// Channel / stream to subscribe to
    #[arg(short, long, default_value = "all")]
    pub channel: String,

    /// Fixed delay before reconnecting, in milliseconds
    #[arg(long, default_value = "5000")]
    pub reconnect_interval: u64,

    /// Arrival gap that counts as a stall, in milliseconds
    #[arg(long, default_value = "100")]
    pub stall_threshold: u64,

    /// Stay disconnected after the first close
    #[arg(long)]
    pub no_reconnect: bool,

    /// Centrifugo connection token
    #[arg(long, env = "CENTRIFUGO_TOKEN")]
    pub token: Option<String>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

impl SubscribeArgs {
    pub fn to_config(&self, debug: bool) -> Result<HarnessConfig> {
        let (standard_port, slow_port) = self.backend.default_subscriber_ports();
        let config = HarnessConfig {
            subscribers: self.subscribers,
            log_slow: self.log_slow,
            skip_slow: self.skip_slow,
            standard: Endpoint::new(&self.host, self.port.unwrap_or(standard_port)),
            degraded: Endpoint::new(&self.host, self.slow_port.unwrap_or(slow_port)),
            channel: self.channel.clone(),
            stall_threshold: Duration::from_millis(self.stall_threshold),
            reconnect_interval: Duration::from_millis(self.reconnect_interval),
            reconnect: !self.no_reconnect,
            debug,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct StandaloneArgs {
    /// Number of fast subscribers
    #[arg(short = 'n', long, env = "N", default_value = "10")]
    pub subscribers: usize,

    /// Broadcast interval in milliseconds
    #[arg(short, long, default_value = "50")]
    pub interval: u64,

    /// How long to run, in seconds
    #[arg(short, long, default_value = "10")]
    pub duration: u64,

    /// Extra per-frame delay on the degraded listener, in milliseconds
    #[arg(long, default_value = "250")]
    pub slow_delay: u64,

    /// Log every slow-path arrival
    #[arg(long, env = "LOG_SLOW", value_parser = FalseyValueParser::new())]
    pub log_slow: bool,

    /// Do not start the slow subscriber
    #[arg(long, env = "SKIP_SLOW", value_parser = FalseyValueParser::new())]
    pub skip_slow: bool,

    /// Random filler per message, in bytes
    #[arg(long, default_value = "500")]
    pub filler_size: FillerSize,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

/// A host/port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Take host and port out of a URL such as `http://127.0.0.1:1234`
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| BenchError::InvalidArgument(format!("invalid URL {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BenchError::InvalidArgument(format!("URL has no host: {}", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| BenchError::InvalidArgument(format!("URL has no port: {}", url)))?;
        Ok(Self::new(host, port))
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, self.port, path)
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("127.0.0.1", 8080)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Broadcaster options
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub endpoint: Endpoint,
    pub broadcast_interval: Duration,
    pub channel: String,
    pub debug: bool,
    pub filler_size: FillerSize,
    pub reconnect_delay: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            broadcast_interval: Duration::from_millis(1000),
            channel: "all".to_string(),
            debug: false,
            filler_size: FillerSize::default(),
            reconnect_delay: Duration::from_millis(5000),
        }
    }
}

impl BroadcasterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_interval.is_zero() {
            return Err(BenchError::InvalidArgument(
                "broadcast interval must be positive".to_string(),
            ));
        }
        if self.channel.is_empty() {
            return Err(BenchError::InvalidArgument(
                "channel must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub name: String,
    pub endpoint: Endpoint,
    pub reconnect_interval: Duration,
    pub channel: String,
    pub debug: bool,
    pub slow: bool,
    pub reconnect: bool,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            name: "subscriber".to_string(),
            endpoint: Endpoint::default(),
            reconnect_interval: Duration::from_millis(5000),
            channel: "all".to_string(),
            debug: false,
            slow: false,
            reconnect: true,
        }
    }
}

/// Harness options
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Number of fast subscribers (`N`)
    pub subscribers: usize,
    /// Log every slow-path arrival (`LOG_SLOW`)
    pub log_slow: bool,
    /// Omit the slow subscriber (`SKIP_SLOW`)
    pub skip_slow: bool,
    pub standard: Endpoint,
    pub degraded: Endpoint,
    pub channel: String,
    pub stall_threshold: Duration,
    pub reconnect_interval: Duration,
    pub reconnect: bool,
    pub shutdown_grace: Duration,
    pub debug: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            subscribers: 10,
            log_slow: false,
            skip_slow: false,
            standard: Endpoint::new("127.0.0.1", 8080),
            degraded: Endpoint::new("127.0.0.1", 8081),
            channel: "all".to_string(),
            stall_threshold: Duration::from_millis(100),
            reconnect_interval: Duration::from_millis(5000),
            reconnect: true,
            shutdown_grace: Duration::from_secs(2),
            debug: false,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subscribers == 0 && self.skip_slow {
            return Err(BenchError::InvalidArgument(
                "nothing to run: no fast subscribers and the slow one is skipped".to_string(),
            ));
        }
        if self.channel.is_empty() {
            return Err(BenchError::InvalidArgument(
                "channel must not be empty".to_string(),
            ));
        }
        if self.stall_threshold.is_zero() {
            return Err(BenchError::InvalidArgument(
                "stall threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Options for fast subscriber `index`
    pub fn fast_subscriber(&self, index: usize) -> SubscriberConfig {
        SubscriberConfig {
            name: format!("Subscriber: {}", index),
            endpoint: self.standard.clone(),
            reconnect_interval: self.reconnect_interval,
            channel: self.channel.clone(),
            debug: self.debug,
            slow: false,
            reconnect: self.reconnect,
        }
    }

    /// Options for the slow subscriber
    pub fn slow_subscriber(&self) -> SubscriberConfig {
        SubscriberConfig {
            name: "Slow subscriber".to_string(),
            endpoint: self.degraded.clone(),
            slow: true,
            ..self.fast_subscriber(0)
        }
    }
}
