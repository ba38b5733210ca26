//! TCP accept loop for the proxy listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::handler::ProxyHandler;
use crate::metrics;

/// Keepalive probes catch clients that vanish without a FIN.
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Owns the listener and fans accepted connections out to handler tasks.
pub struct ProxyServer {
    handler: Arc<ProxyHandler>,
    listen_addr: String,
    quiesce: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        handler: Arc<ProxyHandler>,
        listen_addr: String,
        quiesce: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handler,
            listen_addr,
            quiesce,
        }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!("proxy listening on {}", listener.local_addr()?);

        let mut quiesce = self.quiesce.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = accepted?;
                    configure_tcp_keepalive(&conn);
                    metrics::ACCEPTED_CONNS.inc();
                    metrics::CURRENT_CONNS.inc();

                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        debug!(%peer, "accepted connection");
                        if let Err(err) = handler.handle(conn).await {
                            debug!(%peer, "connection closed: {}", err);
                        }
                        metrics::CURRENT_CONNS.dec();
                    });
                }
                _ = quiesce.changed() => {
                    info!("quiescing; no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

fn configure_tcp_keepalive(conn: &TcpStream) {
    use socket2::SockRef;

    if let Err(err) = conn.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", err);
    }

    let socket = SockRef::from(conn);
    if let Err(err) = socket.set_keepalive(true) {
        warn!("failed to enable TCP keepalive: {}", err);
        return;
    }
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(TCP_KEEPALIVE)
        .with_interval(TCP_KEEPALIVE / 2);
    if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
        warn!("failed to configure TCP keepalive: {}", err);
    }
}
