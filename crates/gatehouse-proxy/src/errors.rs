//! Wire-visible error codes and client error delivery.
//!
//! Every terminal failure of a proxied session carries one of these codes.
//! The code is part of the error message sent to the client, so operators
//! can grep client-side logs against proxy metrics.

use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Classification of a proxied-session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Authentication between client and backend failed.
    AuthFailed,
    /// The backend could not be reached; assumed transient.
    BackendDown,
    /// The backend declined the TLS upgrade.
    BackendRefusedTls,
    /// Dialing the backend failed for a non-transient reason.
    BackendDial,
    /// The backend dropped the connection mid-session.
    BackendDisconnected,
    /// The client dropped the connection mid-session.
    ClientDisconnected,
    /// Routing parameters were missing or invalid.
    ParamsRoutingFailed,
    /// The client connection was terminated by the proxy.
    ExpiredClientConnection,
    /// The session sat idle against a draining backend for too long.
    IdleDisconnect,
    /// The proxy refused the connection before dialing a backend.
    ProxyRefusedConnection,
    /// The client attempted a plaintext exchange where TLS was required,
    /// or requested TLS where none is configured.
    UnexpectedInsecureStartupMessage,
    /// The startup packet was malformed or of an unsupported kind.
    UnexpectedStartupMessage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "codeAuthFailed",
            ErrorCode::BackendDown => "codeBackendDown",
            ErrorCode::BackendRefusedTls => "codeBackendRefusedTLS",
            ErrorCode::BackendDial => "codeBackendDial",
            ErrorCode::BackendDisconnected => "codeBackendDisconnected",
            ErrorCode::ClientDisconnected => "codeClientDisconnected",
            ErrorCode::ParamsRoutingFailed => "codeParamsRoutingFailed",
            ErrorCode::ExpiredClientConnection => "codeExpiredClientConnection",
            ErrorCode::IdleDisconnect => "codeIdleDisconnect",
            ErrorCode::ProxyRefusedConnection => "codeProxyRefusedConnection",
            ErrorCode::UnexpectedInsecureStartupMessage => "codeUnexpectedInsecureStartupMessage",
            ErrorCode::UnexpectedStartupMessage => "codeUnexpectedStartupMessage",
        }
    }

    /// Metric label for the per-code error counter.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::BackendDown => "backend_down",
            ErrorCode::BackendRefusedTls => "backend_refused_tls",
            ErrorCode::BackendDial => "backend_dial",
            ErrorCode::BackendDisconnected => "backend_disconnected",
            ErrorCode::ClientDisconnected => "client_disconnected",
            ErrorCode::ParamsRoutingFailed => "params_routing_failed",
            ErrorCode::ExpiredClientConnection => "expired_client_connection",
            ErrorCode::IdleDisconnect => "idle_disconnect",
            ErrorCode::ProxyRefusedConnection => "refused_connection",
            ErrorCode::UnexpectedInsecureStartupMessage => "unexpected_insecure_startup",
            ErrorCode::UnexpectedStartupMessage => "unexpected_startup",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session-terminating error: a code plus a user-facing message and an
/// optional hint. Messages never include stack details or directory
/// endpoint specifics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProxyError {
    pub code: ErrorCode,
    pub message: String,
    pub hint: Option<String>,
}

impl ProxyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// SQLSTATE class 08: the server rejected the connection.
const SQLSTATE_REJECTED_CONNECTION: &str = "08004";

/// Send a pgwire ErrorResponse describing `err` to the client.
pub async fn send_err_to_client<S>(socket: &mut S, err: &ProxyError) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut fields = Vec::new();

    // Severity (localized and not)
    fields.push(b'S');
    fields.extend_from_slice(b"ERROR");
    fields.push(0);
    fields.push(b'V');
    fields.extend_from_slice(b"ERROR");
    fields.push(0);

    // SQLSTATE
    fields.push(b'C');
    fields.extend_from_slice(SQLSTATE_REJECTED_CONNECTION.as_bytes());
    fields.push(0);

    // Message
    fields.push(b'M');
    fields.extend_from_slice(err.to_string().as_bytes());
    fields.push(0);

    if let Some(hint) = &err.hint {
        fields.push(b'H');
        fields.extend_from_slice(hint.as_bytes());
        fields.push(0);
    }

    // Terminator
    fields.push(0);

    let mut buf = Vec::with_capacity(5 + fields.len());
    buf.push(b'E');
    buf.extend_from_slice(&((4 + fields.len()) as u32).to_be_bytes());
    buf.extend_from_slice(&fields);

    socket.write_all(&buf).await?;
    socket.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_code() {
        let err = ProxyError::new(
            ErrorCode::ParamsRoutingFailed,
            "cluster happy-koala-3 not found",
        );
        assert_eq!(
            err.to_string(),
            "codeParamsRoutingFailed: cluster happy-koala-3 not found"
        );
    }

    #[tokio::test]
    async fn test_send_err_to_client_wire_format() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let err = ProxyError::new(ErrorCode::ProxyRefusedConnection, "connection refused")
            .with_hint("try again later");
        send_err_to_client(&mut cursor, &err).await.unwrap();
        let buf = cursor.into_inner();

        assert_eq!(buf[0], b'E');
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len, buf.len() - 1);
        let body = String::from_utf8_lossy(&buf[5..]);
        assert!(body.contains("08004"));
        assert!(body.contains("codeProxyRefusedConnection: connection refused"));
        assert!(body.contains("try again later"));
    }
}
