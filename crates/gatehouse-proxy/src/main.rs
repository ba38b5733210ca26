//! Gatehouse proxy
//!
//! A multi-tenant SQL wire-protocol proxy: accepts PostgreSQL-compatible
//! client connections, extracts the target cluster from connection
//! parameters, resolves the tenant to a live backend pod through the
//! tenant directory, and relays bytes for the life of the session.

mod admit;
mod backend;
mod cert;
mod denylist;
mod directory;
mod errors;
mod handler;
mod idle;
mod metrics;
mod relay;
mod routing;
mod server;
mod telemetry;
#[cfg(test)]
mod testutil;
mod throttler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use crate::handler::{ProxyHandler, ProxyOptions};
use crate::server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "gatehouse-proxy")]
#[command(about = "Multi-tenant SQL wire-protocol proxy")]
struct Args {
    /// Listen address for incoming client connections
    #[arg(long, env = "GATEHOUSE_LISTEN_ADDR", default_value = "127.0.0.1:46257")]
    listen_addr: String,

    /// PEM certificate for the listen address; "*" auto-generates a
    /// self-signed cert, empty serves plaintext
    #[arg(long, env = "GATEHOUSE_LISTEN_CERT", default_value = "")]
    listen_cert: String,

    /// PEM key paired with --listen-cert
    #[arg(long, env = "GATEHOUSE_LISTEN_KEY", default_value = "")]
    listen_key: String,

    /// Listen address for metrics and health endpoints
    #[arg(long, env = "GATEHOUSE_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_address: String,

    /// Denylist file limiting access by IP and cluster; empty disables
    #[arg(long, env = "GATEHOUSE_DENYLIST", default_value = "")]
    denylist: String,

    /// Skip identity verification of the backend (testing only)
    #[arg(long, env = "GATEHOUSE_SKIP_VERIFY")]
    skip_verify: bool,

    /// Connect to the backend without TLS (testing only)
    #[arg(long, env = "GATEHOUSE_INSECURE")]
    insecure: bool,

    /// Backend address template; {{clusterName}} is substituted with
    /// "<cluster name>-<tenant id>"
    #[arg(long, env = "GATEHOUSE_ROUTING_RULE", default_value = "")]
    routing_rule: String,

    /// Tenant directory address; overrides --routing-rule when set
    #[arg(long, env = "GATEHOUSE_DIRECTORY_ADDR", default_value = "")]
    directory_addr: String,

    /// Initial backoff after a failed login, in milliseconds (legacy
    /// alias of --throttle-base-delay-ms)
    #[arg(long, env = "GATEHOUSE_RATELIMIT_BASE_DELAY_MS", default_value = "0")]
    ratelimit_base_delay_ms: u64,

    /// Interval between re-validations of live connections against the
    /// denylist, in seconds
    #[arg(long, env = "GATEHOUSE_VALIDATE_ACCESS_SECS", default_value = "30")]
    validate_access_secs: u64,

    /// Polling interval for denylist file changes, in seconds
    #[arg(long, env = "GATEHOUSE_POLL_CONFIG_SECS", default_value = "30")]
    poll_config_secs: u64,

    /// Close DRAINING backend connections idle for this many seconds;
    /// 0 disables the idle monitor
    #[arg(long, env = "GATEHOUSE_DRAIN_TIMEOUT_SECS", default_value = "0")]
    drain_timeout_secs: u64,

    /// Initial exponential backoff after a failed login, in milliseconds;
    /// 0 disables throttling
    #[arg(long, env = "GATEHOUSE_THROTTLE_BASE_DELAY_MS", default_value = "100")]
    throttle_base_delay_ms: u64,

    /// Log level
    #[arg(long, env = "GATEHOUSE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            denylist: self.denylist.clone(),
            listen_addr: self.listen_addr.clone(),
            listen_cert: self.listen_cert.clone(),
            listen_key: self.listen_key.clone(),
            metrics_address: self.metrics_address.clone(),
            skip_verify: self.skip_verify,
            insecure: self.insecure,
            routing_rule: self.routing_rule.clone(),
            directory_addr: self.directory_addr.clone(),
            ratelimit_base_delay: Duration::from_millis(self.ratelimit_base_delay_ms),
            validate_access_interval: Duration::from_secs(self.validate_access_secs),
            poll_config_interval: Duration::from_secs(self.poll_config_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            throttle_base_delay: Duration::from_millis(self.throttle_base_delay_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    let args = Args::parse();

    telemetry::init(&args.log_level)?;
    metrics::init();

    info!("starting gatehouse proxy");
    info!("  listen address: {}", args.listen_addr);
    info!("  metrics address: {}", args.metrics_address);
    if args.directory_addr.is_empty() {
        info!("  routing rule: {}", args.routing_rule);
    } else {
        info!("  tenant directory: {}", args.directory_addr);
    }

    let (quiesce_tx, quiesce_rx) = watch::channel(false);
    let options = args.proxy_options();
    let listen_addr = options.listen_addr.clone();
    let metrics_addr: SocketAddr = options.metrics_address.parse()?;
    let handler = Arc::new(ProxyHandler::new(options, quiesce_rx.clone())?);

    // SIGHUP reloads the listener certificate; new sessions pick it up.
    #[cfg(unix)]
    {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                match handler.cert_source().reload() {
                    Ok(()) => info!("listener certificate reloaded"),
                    Err(err) => error!("certificate reload failed: {}", err),
                }
            }
        });
    }

    // Metrics and health endpoints.
    let app = Router::new()
        .route("/metrics", get(|| async { metrics::gather() }))
        .route("/health", get(|| async { "ok" }));
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(metrics_addr).await {
            Ok(listener) => {
                info!("metrics listening on {}", metrics_addr);
                if let Err(err) = axum::serve(listener, app).await {
                    error!("metrics server error: {}", err);
                }
            }
            Err(err) => error!("failed to bind metrics address: {}", err),
        }
    });

    let proxy = ProxyServer::new(handler, listen_addr, quiesce_rx);
    let serve = tokio::spawn(proxy.serve());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = quiesce_tx.send(true);
        }
        result = serve => {
            result??;
        }
    }

    Ok(())
}
