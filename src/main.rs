//! goldengate — policy-driven signing reverse proxy

use clap::Parser;
use goldengate::config::{find_config_file, load_policies, load_rulesets, Settings};
use goldengate::credentials;
use goldengate::metrics::Metrics;
use goldengate::notify::{LogBroker, NotificationBroker};
use goldengate::pipeline::Gateway;
use goldengate::policy::PolicySet;
use goldengate::proxy::ProxyClient;
use goldengate::rules::{compile_all, RuleRegistry};
use goldengate::server;
use goldengate::timelock::MemoryTimeLockStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Time locks are garbage-collected once they are a day old; cancelled or
/// abandoned entries never outlive this.
const TIMELOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// goldengate — re-signs authenticated client requests with privileged
/// upstream credentials, under declarative per-action policy.
#[derive(Parser, Debug)]
#[command(name = "goldengate")]
#[command(version, author, about, long_about = None)]
struct Cli {
    /// Path to the ruleset configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides GOLDENGATE_LISTEN_ADDR)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Path to the policy file (overrides GOLDENGATE_POLICIES)
    #[arg(long, value_name = "FILE")]
    policies: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print a fresh access key and secret, then exit
    #[arg(long)]
    generate_credentials: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Credential generation needs no config and no runtime state.
    if cli.generate_credentials {
        let (key, secret) = credentials::generate_credentials();
        println!("key: {key}");
        println!("secret: {secret}");
        return Ok(());
    }

    // Priority: RUST_LOG > GOLDENGATE_LOG_LEVEL > --verbose > default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("GOLDENGATE_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("goldengate=trace,tower_http=debug")
            } else {
                EnvFilter::new("goldengate=info")
            }
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::from_env();
    if let Some(ref listen) = cli.listen {
        settings.listen_addr = listen.parse()?;
    }
    if let Some(policies) = cli.policies {
        settings.policies = Some(policies);
    }

    info!("Starting goldengate v{}", env!("CARGO_PKG_VERSION"));

    let config_path = find_config_file(cli.config.as_deref())?;
    info!("  Ruleset config: {}", config_path.display());
    let raw_rulesets = load_rulesets(&config_path)?;
    let registry = RuleRegistry::standard();
    let rulesets = compile_all(&raw_rulesets, &registry)?;
    info!("  Rulesets: {}", rulesets.len());

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryTimeLockStore::new());
    let broker: Arc<dyn NotificationBroker> = Arc::new(LogBroker);

    let policies = match &settings.policies {
        Some(path) => {
            let specs = load_policies(path)?;
            info!("  Policies: {} from {}", specs.len(), path.display());
            PolicySet::from_specs(&specs, store.clone(), broker)?
        }
        None => {
            warn!("  Policies: none configured, authorization step disabled");
            PolicySet::empty()
        }
    };

    info!("  Upstream timeout: {}s", settings.upstream_timeout_secs);
    let proxy = ProxyClient::new(Duration::from_secs(settings.upstream_timeout_secs))?;
    let gateway = Arc::new(Gateway::new(rulesets, policies, proxy, metrics.clone()));

    // Periodic cleanup for abandoned time locks.
    spawn_periodic(Duration::from_secs(300), {
        let store = store.clone();
        move || store.cleanup_expired(TIMELOCK_TTL)
    });

    // Control listener: cancellation links, health, metrics.
    let control_addr = settings.control_addr();
    let control_app = server::control_router(store, metrics);
    let control_listener = TcpListener::bind(&control_addr).await?;
    info!("Control listener on http://{}", control_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(control_listener, control_app).await {
            warn!(error = %e, "control listener failed");
        }
    });

    // Proxy listener.
    let app = server::proxy_router(gateway, settings.scheme.clone());
    let listener = TcpListener::bind(&settings.listen_addr).await?;
    info!(
        "goldengate listening on {}://{}",
        settings.scheme, settings.listen_addr
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Spawn a background task that runs `f` every `interval`.
fn spawn_periodic(interval: Duration, f: impl Fn() + Send + 'static) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            f();
        }
    });
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
