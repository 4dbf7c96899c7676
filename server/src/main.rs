use anyhow::{Context, Result};
use clap::Parser;
use ethers::types::Address;
use odds_contract::{ChainConfig, Cursor, EventListener, ListenerConfig, LotteryClient};
use odds_server::config::{OriginPolicy, RotationPolicy, Secret, ServerConfig};
use odds_server::store::Store;
use odds_server::{Api, App};
use odds_types::WalletAddress;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SQLITE_PATH: &str = "odds.db";
const DEFAULT_CONFIRMATIONS: u64 = 2;
const DEFAULT_LOG_RANGE: u64 = 2_000;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const LISTENER_BUFFER: usize = 1_024;

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "odds-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("odds-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on (falls back to PORT, then 3000).
    #[arg(short, long)]
    port: Option<u16>,

    /// Postgres connection string (falls back to DATABASE_URL). SQLite is used when unset.
    #[arg(long)]
    database_url: Option<String>,
    /// SQLite database path (falls back to SQLITE_PATH).
    #[arg(long)]
    sqlite_path: Option<PathBuf>,
    /// Allow Postgres hosts outside private networks.
    #[arg(long, default_value_t = false)]
    database_allow_public: bool,
    /// Allow Postgres hostnames that are not IP literals.
    #[arg(long, default_value_t = false)]
    database_allow_hostname: bool,

    /// HS256 signing secret for session tokens (falls back to JWT_SECRET).
    #[arg(long)]
    jwt_secret: Option<String>,
    /// Session token lifetime in seconds.
    #[arg(long)]
    token_ttl_secs: Option<u64>,
    /// Operator token for admin routes (falls back to ADMIN_AUTH_TOKEN).
    #[arg(long)]
    admin_token: Option<String>,
    /// Token guarding /metrics (falls back to METRICS_AUTH_TOKEN).
    #[arg(long)]
    metrics_token: Option<String>,
    /// Alchemy webhook signing key (falls back to ALCHEMY_SIGNING_KEY).
    #[arg(long)]
    webhook_signing_key: Option<String>,

    /// JSON-RPC endpoint (falls back to BASE_SEPOLIA_RPC_URL).
    #[arg(long)]
    rpc_url: Option<String>,
    /// Contract owner key (falls back to PRIVATE_KEY).
    #[arg(long)]
    private_key: Option<String>,
    /// OddsLottery address (falls back to LOTTERY_CONTRACT_ADDRESS).
    #[arg(long)]
    contract_address: Option<String>,
    /// Chain id; queried from the node when omitted.
    #[arg(long)]
    chain_id: Option<u64>,

    /// Comma-separated browser origins (falls back to ALLOWED_HTTP_ORIGINS; `*` allows any).
    #[arg(long)]
    allowed_origins: Option<String>,
    /// Accept requests without an Origin header (falls back to ALLOW_HTTP_NO_ORIGIN, default true).
    #[arg(long, value_parser = clap::value_parser!(bool))]
    allow_no_origin: Option<bool>,
    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,
    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,
    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// Raffle rotation: pool or daily (falls back to RAFFLE_ROTATION).
    #[arg(long)]
    rotation: Option<String>,
    /// Raffles kept open under the pool rotation.
    #[arg(long)]
    active_target: Option<u64>,
    /// Days scheduled ahead under the daily rotation.
    #[arg(long)]
    horizon_days: Option<u32>,
    /// Seconds between scheduler ticks.
    #[arg(long)]
    scheduler_interval_secs: Option<u64>,
    /// Entries returned by the referral leaderboard.
    #[arg(long)]
    leaderboard_size: Option<u64>,

    /// Blocks to wait before a log counts as confirmed.
    #[arg(long)]
    confirmations: Option<u64>,
    /// Maximum blocks per log query.
    #[arg(long)]
    log_range: Option<u64>,
    /// Seconds between listener polls.
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    /// Block to start scanning from when no cursor is stored.
    #[arg(long)]
    listener_start_block: Option<u64>,
    /// Do not run the contract event listener.
    #[arg(long, default_value_t = false)]
    no_listener: bool,
    /// Do not run the raffle scheduler.
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Non-blank `arg`, else the non-blank value of `var`.
fn arg_or_env(arg: Option<&str>, var: &str) -> Option<String> {
    arg.map(str::to_string)
        .or_else(|| std::env::var(var).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn require_arg_or_env(arg: Option<&str>, var: &str) -> Result<String> {
    arg_or_env(arg, var).with_context(|| format!("Missing required env: {var}"))
}

fn parse_arg_or_env<T>(arg: Option<T>, var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if arg.is_some() {
        return Ok(arg);
    }
    match arg_or_env(None, var) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("Invalid {var}: {value} ({err})")),
        None => Ok(None),
    }
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();

    let jwt_secret = require_arg_or_env(args.jwt_secret.as_deref(), "JWT_SECRET")?;
    let mut rotation = match arg_or_env(args.rotation.as_deref(), "RAFFLE_ROTATION") {
        Some(value) => value
            .parse::<RotationPolicy>()
            .map_err(|err| anyhow::anyhow!("invalid rotation policy: {err}"))?,
        None => defaults.rotation,
    };
    match &mut rotation {
        RotationPolicy::Pool { active_target } => {
            if let Some(target) = args.active_target {
                if target == 0 {
                    anyhow::bail!("active_target must be > 0");
                }
                *active_target = target;
            }
        }
        RotationPolicy::Daily { horizon_days } => {
            if let Some(days) = args.horizon_days {
                if days == 0 {
                    anyhow::bail!("horizon_days must be > 0");
                }
                *horizon_days = days;
            }
        }
    }
    if let Some(0) = args.scheduler_interval_secs {
        anyhow::bail!("scheduler_interval_secs must be > 0 when set");
    }

    let lottery_contract = arg_or_env(args.contract_address.as_deref(), "LOTTERY_CONTRACT_ADDRESS")
        .map(|address| WalletAddress::parse(&address))
        .transpose()
        .map_err(|err| anyhow::anyhow!("invalid lottery contract address: {err}"))?;
    let allowed_origins =
        arg_or_env(args.allowed_origins.as_deref(), "ALLOWED_HTTP_ORIGINS").unwrap_or_default();
    let allow_no_origin = match args.allow_no_origin {
        Some(value) => value,
        None => std::env::var("ALLOW_HTTP_NO_ORIGIN")
            .map(|_| env_flag("ALLOW_HTTP_NO_ORIGIN"))
            .unwrap_or(true),
    };
    let http_rate_limit_per_second =
        parse_arg_or_env(args.http_rate_limit_per_second, "RATE_LIMIT_HTTP_PER_SEC")?;
    let http_rate_limit_burst =
        parse_arg_or_env(args.http_rate_limit_burst, "RATE_LIMIT_HTTP_BURST")?;

    Ok(ServerConfig {
        jwt_secret: Secret::new(jwt_secret),
        token_ttl: args
            .token_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.token_ttl),
        webhook_signing_key: arg_or_env(args.webhook_signing_key.as_deref(), "ALCHEMY_SIGNING_KEY")
            .map(Secret::new),
        admin_token: arg_or_env(args.admin_token.as_deref(), "ADMIN_AUTH_TOKEN").map(Secret::new),
        metrics_token: arg_or_env(args.metrics_token.as_deref(), "METRICS_AUTH_TOKEN")
            .map(Secret::new),
        lottery_contract,
        rotation,
        template: defaults.template,
        scheduler_interval: args
            .scheduler_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.scheduler_interval),
        leaderboard_size: args.leaderboard_size.unwrap_or(defaults.leaderboard_size).max(1),
        origins: OriginPolicy::from_list(&allowed_origins, allow_no_origin),
        http_rate_limit_per_second: map_optional_limit(
            http_rate_limit_per_second,
            defaults.http_rate_limit_per_second,
        ),
        http_rate_limit_burst: map_optional_limit(
            http_rate_limit_burst,
            defaults.http_rate_limit_burst,
        ),
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
    })
}

fn build_chain_config(args: &Args) -> Result<ChainConfig> {
    Ok(ChainConfig {
        rpc_url: require_arg_or_env(args.rpc_url.as_deref(), "BASE_SEPOLIA_RPC_URL")?,
        private_key: require_arg_or_env(args.private_key.as_deref(), "PRIVATE_KEY")?,
        contract_address: require_arg_or_env(
            args.contract_address.as_deref(),
            "LOTTERY_CONTRACT_ADDRESS",
        )?,
        chain_id: args.chain_id,
        receipt_poll_interval: RECEIPT_POLL_INTERVAL,
    })
}

fn build_listener_config(args: &Args, chain: &ChainConfig) -> Result<ListenerConfig> {
    let contract_address = chain
        .contract_address
        .parse::<Address>()
        .context("invalid lottery contract address")?;
    Ok(ListenerConfig {
        rpc_url: chain.rpc_url.clone(),
        contract_address,
        confirmations: args.confirmations.unwrap_or(DEFAULT_CONFIRMATIONS),
        log_range: args.log_range.unwrap_or(DEFAULT_LOG_RANGE).max(1),
        poll_interval: args
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL),
    })
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }
    require_env("DATABASE_URL")?;
    require_env("JWT_SECRET")?;
    require_env("PRIVATE_KEY")?;
    require_env("LOTTERY_CONTRACT_ADDRESS")?;
    require_env("BASE_SEPOLIA_RPC_URL")?;
    require_env("ALCHEMY_SIGNING_KEY")?;
    require_env("ADMIN_AUTH_TOKEN")?;
    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;
    Ok(())
}

async fn open_store(args: &Args) -> Result<Store> {
    if let Some(url) = arg_or_env(args.database_url.as_deref(), "DATABASE_URL") {
        let allow_public = args.database_allow_public || env_flag("DATABASE_ALLOW_PUBLIC");
        let allow_hostname = args.database_allow_hostname || env_flag("DATABASE_ALLOW_HOSTNAME");
        let store = tokio::task::spawn_blocking(move || {
            Store::connect_postgres(&url, allow_public, allow_hostname)
        })
        .await
        .context("postgres connect task failed")?
        .context("failed to connect to postgres")?;
        info!("using postgres storage");
        return Ok(store);
    }
    let path = args
        .sqlite_path
        .clone()
        .or_else(|| arg_or_env(None, "SQLITE_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH));
    let store = Store::open_sqlite(&path)
        .with_context(|| format!("failed to open sqlite database {}", path.display()))?;
    info!(path = %path.display(), "using sqlite storage");
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    ensure_production_env()?;

    let config = build_config(&args)?;
    let chain_config = build_chain_config(&args)?;
    let store = open_store(&args).await?;
    let chain = LotteryClient::connect(&chain_config)
        .await
        .context("failed to connect to lottery contract")?;
    info!(rotation = ?config.rotation, "configuration loaded");

    let app = Arc::new(
        App::new(config, store, chain)
            .map_err(|err| anyhow::anyhow!("invalid JWT secret: {err}"))?,
    );

    if args.no_scheduler {
        info!("raffle scheduler disabled");
    } else {
        tokio::spawn(app.scheduler().run());
    }

    if args.no_listener {
        info!("contract event listener disabled");
    } else {
        let listener_config = build_listener_config(&args, &chain_config)?;
        let cursor = app
            .reconciler
            .cursor()
            .await
            .context("failed to load listener cursor")?
            .or(args.listener_start_block.map(Cursor::at_block));
        let (updates, receiver) = mpsc::channel(LISTENER_BUFFER);
        tokio::spawn(app.reconciler.clone().run(receiver));
        tokio::spawn(EventListener::new(listener_config, updates).run(cursor));
    }

    let router = Api::new(app).router();

    // Start server
    let port = parse_arg_or_env(args.port, "PORT")?.unwrap_or(3000);
    let addr = SocketAddr::new(args.host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "odds server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rotation_and_limits() {
        let args = Args::parse_from([
            "odds-server",
            "--jwt-secret",
            "secret",
            "--rotation",
            "daily",
            "--horizon-days",
            "7",
            "--http-rate-limit-per-second",
            "0",
            "--allowed-origins",
            "https://odds.fun",
            "--allow-no-origin",
            "false",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.rotation, RotationPolicy::Daily { horizon_days: 7 });
        assert_eq!(config.http_rate_limit_per_second, None);
        assert!(config.origins.allowed.contains("https://odds.fun"));
        assert!(!config.origins.allow_no_origin);
    }

    #[test]
    fn rejects_bad_rotation() {
        let args = Args::parse_from([
            "odds-server",
            "--jwt-secret",
            "secret",
            "--rotation",
            "weekly",
        ]);
        let err = build_config(&args).unwrap_err();
        assert!(
            err.to_string().contains("rotation"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_zero_pool_target() {
        let args = Args::parse_from([
            "odds-server",
            "--jwt-secret",
            "secret",
            "--rotation",
            "pool",
            "--active-target",
            "0",
        ]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn optional_limits_map_zero_to_none() {
        assert_eq!(map_optional_limit(Some(0u64), Some(5)), None);
        assert_eq!(map_optional_limit(Some(3u64), Some(5)), Some(3));
        assert_eq!(map_optional_limit(None, Some(5u64)), Some(5));
    }
}
