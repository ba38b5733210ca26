//! Prometheus metrics for the proxy.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::errors::ProxyError;

/// Connections accepted by the listener.
pub static ACCEPTED_CONNS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatehouse_accepted_connections_total",
        "Total connections accepted by the proxy listener"
    )
    .unwrap()
});

/// Connections that made it through authentication.
pub static SUCCESSFUL_CONNS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatehouse_successful_connections_total",
        "Total connections that authenticated and began relaying"
    )
    .unwrap()
});

/// Currently open client connections.
pub static CURRENT_CONNS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gatehouse_current_connections",
        "Client connections currently open"
    )
    .unwrap()
});

/// Terminal connection errors by wire code.
pub static CONNECTION_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gatehouse_connection_errors_total",
        "Terminal connection errors by code",
        &["code"]
    )
    .unwrap()
});

/// Backend dial attempts that found the pod down.
pub static BACKEND_DOWN_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gatehouse_backend_down_retries_total",
        "Dial attempts retried because the backend was down"
    )
    .unwrap()
});

/// Bump the per-code error counter for a terminal error.
pub fn update_for_error(err: &ProxyError) {
    CONNECTION_ERRORS.with_label_values(&[err.code.label()]).inc();
}

/// Force registration of every metric so they show up scraped-at-zero.
pub fn init() {
    Lazy::force(&ACCEPTED_CONNS);
    Lazy::force(&SUCCESSFUL_CONNS);
    Lazy::force(&CURRENT_CONNS);
    Lazy::force(&CONNECTION_ERRORS);
    Lazy::force(&BACKEND_DOWN_RETRIES);
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::error!("encoding metrics: {}", err);
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn test_update_for_error_and_gather() {
        init();
        update_for_error(&ProxyError::new(ErrorCode::BackendDown, "down"));
        let text = gather();
        assert!(text.contains("gatehouse_connection_errors_total"));
    }
}
