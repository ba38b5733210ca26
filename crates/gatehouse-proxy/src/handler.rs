//! Per-connection orchestration.
//!
//! One `handle` call owns a client connection end to end: admission and
//! TLS, cluster-identifier extraction, denylist and throttle guards, the
//! resolve-and-dial retry loop, the optional idle wrap, the
//! authentication relay, and finally the byte relay. Terminal events
//! (denylist revocation, idle fire, relay outcome) race into a
//! single-slot channel; the first writer decides the session outcome and
//! late writers are dropped.

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::proto::{Pod, PodState};
use gatehouse_common::GatehouseError;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tonic::Code;
use tracing::{debug, error, info};

use crate::admit::{frontend_admit, Conn, StartupMessage};
use crate::backend::{authenticate, backend_dial, BackendTls};
use crate::cert::CertSource;
use crate::denylist::{self, Denylist};
use crate::directory::Directory;
use crate::errors::{send_err_to_client, ErrorCode, ProxyError};
use crate::idle::IdleMonitor;
use crate::metrics;
use crate::relay;
use crate::routing::{cluster_and_tenant, TenantId};
use crate::throttler::{self, Throttler};

/// Everything needed to construct a proxy handler.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Denylist file limiting access by IP and cluster; empty disables.
    pub denylist: String,
    /// Listen address for incoming client connections.
    pub listen_addr: String,
    /// PEM cert for the listen address; "*" auto-generates self-signed,
    /// empty disables client TLS.
    pub listen_cert: String,
    /// PEM key paired with `listen_cert`.
    pub listen_key: String,
    /// Listen address for the metrics endpoint.
    pub metrics_address: String,
    /// Skip identity verification of the backend. Testing only.
    pub skip_verify: bool,
    /// No TLS to the backend at all. Testing only.
    pub insecure: bool,
    /// Backend address template; `{{clusterName}}` is substituted with
    /// "<cluster name>-<tenant id>".
    pub routing_rule: String,
    /// Tenant directory address; when set it takes precedence over the
    /// routing rule.
    pub directory_addr: String,
    /// Initial login backoff (legacy alias of `throttle_base_delay`).
    pub ratelimit_base_delay: Duration,
    /// Interval between re-validations of live connections against the
    /// denylist.
    pub validate_access_interval: Duration,
    /// Polling interval for picking up denylist file changes.
    pub poll_config_interval: Duration,
    /// Close DRAINING connections idle for this long; zero disables.
    pub drain_timeout: Duration,
    /// Initial exponential backoff after a failed login; zero disables
    /// throttling.
    pub throttle_base_delay: Duration,
}

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(5);
const LOG_SUPPRESSION_WINDOW: Duration = Duration::from_secs(60);

/// Rate-limits repetitive log lines to once per interval, tallying what
/// was suppressed in between.
struct LogEvery {
    interval: Duration,
    last: Option<tokio::time::Instant>,
}

impl LogEvery {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn should_log(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// The proxy handler: one instance per process, shared by every accepted
/// connection.
pub struct ProxyHandler {
    options: ProxyOptions,
    cert_source: CertSource,
    denylist: Denylist,
    throttler: Throttler,
    idle_monitor: Option<Arc<IdleMonitor>>,
    directory: Option<Arc<Directory>>,
    backend_tls: Option<Arc<rustls::ClientConfig>>,
    quiesce: watch::Receiver<bool>,
}

impl ProxyHandler {
    pub fn new(
        options: ProxyOptions,
        quiesce: watch::Receiver<bool>,
    ) -> Result<Self, GatehouseError> {
        let cert_source = CertSource::from_options(&options.listen_cert, &options.listen_key)?;

        let denylist = if options.denylist.is_empty() {
            Denylist::disabled()
        } else {
            Denylist::from_file(
                &options.denylist,
                options.poll_config_interval,
                options.validate_access_interval,
                quiesce.clone(),
            )
        };

        // The dedicated throttle delay wins; the rate-limit flag is the
        // legacy way of spelling the same thing.
        let base_delay = if options.throttle_base_delay.is_zero() {
            options.ratelimit_base_delay
        } else {
            options.throttle_base_delay
        };
        let throttler = Throttler::new(base_delay);

        // The idle monitor only makes sense with a directory feeding it
        // pod state transitions.
        let idle_monitor = if !options.directory_addr.is_empty() && !options.drain_timeout.is_zero()
        {
            Some(IdleMonitor::new(options.drain_timeout, quiesce.clone()))
        } else {
            None
        };

        let directory = if options.directory_addr.is_empty() {
            None
        } else {
            let pod_watcher = idle_monitor.as_ref().map(|monitor| {
                let (tx, rx) = mpsc::channel::<Pod>(16);
                start_pod_watcher(Arc::clone(monitor), rx, quiesce.clone());
                tx
            });
            Some(Directory::new(
                &options.directory_addr,
                pod_watcher,
                quiesce.clone(),
            )?)
        };

        let backend_tls = if options.insecure {
            None
        } else {
            Some(Arc::new(gatehouse_common::tls::backend_client_config(
                options.skip_verify,
            )?))
        };

        Ok(Self {
            options,
            cert_source,
            denylist,
            throttler,
            idle_monitor,
            directory,
            backend_tls,
            quiesce,
        })
    }

    pub fn cert_source(&self) -> &CertSource {
        &self.cert_source
    }

    /// Handle a single client connection end to end. The returned error,
    /// if any, has already been accounted for in metrics and (where the
    /// protocol allows) reported to the client.
    pub async fn handle(&self, conn: TcpStream) -> Result<(), ProxyError> {
        let remote_addr = conn.peer_addr().map_err(|_| {
            ProxyError::new(ErrorCode::ParamsRoutingFailed, "unexpected connection address")
        })?;

        // The TLS config is read per connection so cert reloads take
        // effect on new sessions.
        let admitted = match frontend_admit(conn, self.cert_source.server_config()).await {
            Ok(admitted) => admitted,
            Err(mut admit_err) => {
                if let Some(conn) = admit_err.conn.as_mut() {
                    let _ = send_err_to_client(conn, &admit_err.error).await;
                }
                metrics::update_for_error(&admit_err.error);
                return Err(admit_err.error);
            }
        };

        // Cancel requests are closed without a reply.
        let Some(msg) = admitted.msg else {
            return Ok(());
        };
        let mut conn = admitted.conn;

        // Errors from here on are user-facing; keep the details tight.
        let (backend_msg, cluster_name, tenant_id) = match cluster_and_tenant(&msg, remote_addr) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!("unable to extract cluster name and tenant id: {}", err);
                let _ = send_err_to_client(&mut conn, &err).await;
                metrics::update_for_error(&err);
                return Err(err);
            }
        };

        let client_ip = remote_addr.ip().to_string();

        // Terminal events race into this single-slot channel; the first
        // writer wins and late errors are dropped, not queued.
        let (err_tx, mut err_rx) = mpsc::channel::<Result<(), ProxyError>>(1);

        let deny_tx = err_tx.clone();
        let _deny_subscription = match self.denylist.subscribe(
            denylist::ConnectionTags {
                ip: client_ip.clone(),
                cluster: tenant_id.to_string(),
            },
            Box::new(move |denied| {
                let err = ProxyError::new(
                    ErrorCode::ExpiredClientConnection,
                    format!("connection added to deny list: {}", denied),
                );
                let _ = deny_tx.try_send(Err(err));
            }),
        ) {
            Ok(subscription) => subscription,
            Err(denied) => {
                error!(
                    cluster = %cluster_name,
                    tenant = tenant_id.get(),
                    "connection matched denylist: {}", denied
                );
                let err = ProxyError::new(ErrorCode::ProxyRefusedConnection, "connection refused");
                let _ = send_err_to_client(&mut conn, &err).await;
                metrics::update_for_error(&err);
                return Err(err);
            }
        };

        let throttle_tags = throttler::ConnectionTags {
            ip: client_ip,
            tenant: tenant_id.to_string(),
        };
        let throttle_time = match self.throttler.login_check(&throttle_tags) {
            Ok(token) => token,
            Err(err) => {
                error!(
                    cluster = %cluster_name,
                    tenant = tenant_id.get(),
                    "throttler refused connection"
                );
                let _ = send_err_to_client(&mut conn, &err).await;
                metrics::update_for_error(&err);
                return Err(err);
            }
        };

        let (backend_conn, outgoing_addr) = match self
            .resolve_and_dial(&backend_msg, &cluster_name, tenant_id)
            .await
        {
            Ok(Some(dialed)) => dialed,
            Ok(None) => return Ok(()), // quiesce during the retry loop
            Err(err) => {
                let _ = send_err_to_client(&mut conn, &err).await;
                metrics::update_for_error(&err);
                return Err(err);
            }
        };

        let mut backend_conn = backend_conn;
        if let Some(monitor) = &self.idle_monitor {
            let idle_tx = err_tx.clone();
            backend_conn = monitor.detect_idle(
                backend_conn,
                &outgoing_addr,
                Box::new(move || {
                    let err =
                        ProxyError::new(ErrorCode::IdleDisconnect, "idle connection closed");
                    let _ = idle_tx.try_send(Err(err));
                }),
            );
        }

        if let Err(err) = authenticate(&mut conn, &mut backend_conn, |status| {
            self.throttler
                .report_attempt(&throttle_tags, throttle_time, status)
        })
        .await
        {
            error!(
                cluster = %cluster_name,
                tenant = tenant_id.get(),
                "authenticate: {}", err
            );
            metrics::update_for_error(&err);
            return Err(err);
        }

        metrics::SUCCESSFUL_CONNS.inc();
        info!(
            cluster = %cluster_name,
            tenant = tenant_id.get(),
            backend = %outgoing_addr,
            "new connection"
        );
        let session_start = tokio::time::Instant::now();

        // Hand both connections to the relay; from here the handler never
        // touches payload bytes again.
        let relay_tx = err_tx.clone();
        let relay_task = tokio::spawn(async move {
            let result = relay::connection_copy(conn, backend_conn).await;
            let _ = relay_tx.try_send(result);
        });

        let mut quiesce = self.quiesce.clone();
        let result = tokio::select! {
            received = err_rx.recv() => match received {
                Some(Ok(())) | None => Ok(()),
                Some(Err(err)) => Err(err),
            },
            _ = quiesce.changed() => Ok(()),
        };

        // Dropping the relay tears down both connections.
        relay_task.abort();
        info!(
            cluster = %cluster_name,
            tenant = tenant_id.get(),
            "closing after {:.2}s",
            session_start.elapsed().as_secs_f64()
        );
        if let Err(err) = &result {
            metrics::update_for_error(err);
        }
        result
    }

    /// Resolve the tenant and dial the backend, retrying transient
    /// failures forever with capped backoff. Returns `Ok(None)` when the
    /// process quiesced mid-loop.
    async fn resolve_and_dial(
        &self,
        backend_msg: &StartupMessage,
        cluster_name: &str,
        tenant_id: TenantId,
    ) -> Result<Option<(Conn, String)>, ProxyError> {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut quiesce = self.quiesce.clone();

        let mut resolve_log = LogEvery::new(LOG_SUPPRESSION_WINDOW);
        let mut dial_log = LogEvery::new(LOG_SUPPRESSION_WINDOW);
        let mut report_log = LogEvery::new(LOG_SUPPRESSION_WINDOW);
        let (mut resolve_errs, mut dial_errs, mut report_errs) = (0u64, 0u64, 0u64);

        loop {
            match self.outgoing_address(cluster_name, tenant_id).await {
                Err(status) if status.code() != Code::NotFound => {
                    // Transient; retry after backoff.
                    resolve_errs += 1;
                    if resolve_log.should_log() {
                        error!(
                            errors_tallied = resolve_errs,
                            "outgoing address: {}", status
                        );
                        resolve_errs = 0;
                    }
                }
                Err(status) => {
                    debug!("could not retrieve outgoing address: {}", status);
                    return Err(ProxyError::new(
                        ErrorCode::ParamsRoutingFailed,
                        format!("cluster {}-{} not found", cluster_name, tenant_id),
                    ));
                }
                Ok(outgoing_addr) => {
                    let tls = self.backend_tls_for(&outgoing_addr, cluster_name, tenant_id)?;
                    match backend_dial(backend_msg, &outgoing_addr, tls.as_ref()).await {
                        Ok(conn) => return Ok(Some((conn, outgoing_addr))),
                        Err(err) if err.code == ErrorCode::BackendDown => {
                            metrics::BACKEND_DOWN_RETRIES.inc();
                            dial_errs += 1;
                            if dial_log.should_log() {
                                error!(errors_tallied = dial_errs, "backend dial: {}", err);
                                dial_errs = 0;
                            }
                            // Tell the directory so it can refresh the
                            // stale state that sent us here.
                            if let Some(directory) = &self.directory {
                                if let Err(report_err) =
                                    directory.report_failure(tenant_id, &outgoing_addr).await
                                {
                                    report_errs += 1;
                                    if report_log.should_log() {
                                        error!(
                                            errors_tallied = report_errs,
                                            "report failure: {}", report_err
                                        );
                                        report_errs = 0;
                                    }
                                }
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = quiesce.changed() => return Ok(None),
            }
            backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
        }
    }

    /// Resolve a cluster name and tenant id to a backend address: the
    /// directory when configured, falling back to the static routing rule
    /// plus a DNS lookup. A host that does not resolve maps to NotFound.
    async fn outgoing_address(
        &self,
        cluster_name: &str,
        tenant_id: TenantId,
    ) -> Result<String, tonic::Status> {
        if let Some(directory) = &self.directory {
            match directory.ensure_tenant_addr(tenant_id, cluster_name).await {
                Ok(addr) => return Ok(addr),
                Err(status) if status.code() != Code::NotFound => return Err(status),
                Err(_) => {} // fall back to the routing rule
            }
        }

        let addr = self.options.routing_rule.replace(
            "{{clusterName}}",
            &format!("{}-{}", cluster_name, tenant_id),
        );
        let result = match tokio::net::lookup_host(&addr).await {
            Ok(mut resolved) => {
                if resolved.next().is_some() {
                    Ok(addr.clone())
                } else {
                    Err(tonic::Status::not_found(format!(
                        "no addresses for {}",
                        addr
                    )))
                }
            }
            Err(err) => Err(tonic::Status::not_found(err.to_string())),
        };
        result
    }

    /// Backend TLS material for one dial attempt: `None` in insecure
    /// mode, otherwise the shared client config pinned to the outgoing
    /// host. The server name is ignored by the verifier when skip-verify
    /// is on but is still required to build the connector.
    fn backend_tls_for(
        &self,
        addr: &str,
        cluster_name: &str,
        tenant_id: TenantId,
    ) -> Result<Option<BackendTls>, ProxyError> {
        let Some(config) = &self.backend_tls else {
            return Ok(None);
        };
        let host = host_of(addr);
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            error!("could not derive a server name from '{}'", addr);
            ProxyError::new(
                ErrorCode::ParamsRoutingFailed,
                format!("cluster {}-{} not found", cluster_name, tenant_id),
            )
        })?;
        Ok(Some(BackendTls {
            config: Arc::clone(config),
            server_name,
        }))
    }
}

fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Background consumer of pod lifecycle events: DRAINING arms idle
/// detection for the pod's address, any other state disarms it.
fn start_pod_watcher(
    monitor: Arc<IdleMonitor>,
    mut events: mpsc::Receiver<Pod>,
    mut quiesce: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(pod) => {
                        if pod.state() == PodState::Draining {
                            monitor.set_idle_checks(&pod.addr);
                        } else {
                            monitor.clear_idle_checks(&pod.addr);
                        }
                    }
                    None => return,
                },
                _ = quiesce.changed() => return,
            }
        }
    });
}
