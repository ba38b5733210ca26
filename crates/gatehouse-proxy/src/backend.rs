//! Backend dialing and the authentication relay.
//!
//! `backend_dial` opens the TCP connection, upgrades to TLS when
//! configured, and forwards the rewritten startup message. `authenticate`
//! then proxies the authentication sub-protocol verbatim between client
//! and backend, reporting the outcome to the throttler.

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::admit::{Conn, StartupMessage, SSL_REQUEST_CODE};
use crate::errors::{send_err_to_client, ErrorCode, ProxyError, ProxyResult};
use crate::throttler::AttemptStatus;

/// Backend messages are small during authentication; larger frames mean a
/// confused peer.
const MAX_AUTH_MESSAGE_SIZE: usize = 1 << 20;

/// AuthenticationOk.
const AUTH_TYPE_OK: u32 = 0;
/// AuthenticationSASLFinal: informational, the client sends no reply.
const AUTH_TYPE_SASL_FINAL: u32 = 12;

/// TLS material for dialing a backend.
pub struct BackendTls {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Dial the backend at `addr` and forward the rewritten startup message.
/// Connection failures are `codeBackendDown` so the caller retries them.
pub async fn backend_dial(
    msg: &StartupMessage,
    addr: &str,
    tls: Option<&BackendTls>,
) -> ProxyResult<Conn> {
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        ProxyError::new(
            ErrorCode::BackendDown,
            format!("unable to reach backend SQL server at {}: {}", addr, e),
        )
    })?;
    let _ = stream.set_nodelay(true);

    let mut conn: Conn = match tls {
        Some(tls) => {
            let mut stream = stream;
            request_backend_tls(&mut stream).await?;
            let connector = TlsConnector::from(Arc::clone(&tls.config));
            let tls_stream = connector
                .connect(tls.server_name.clone(), stream)
                .await
                .map_err(|e| {
                    ProxyError::new(
                        ErrorCode::BackendDown,
                        format!("backend TLS handshake with {}: {}", addr, e),
                    )
                })?;
            Box::new(tls_stream)
        }
        None => Box::new(stream),
    };

    conn.write_all(&msg.encode()).await.map_err(|e| {
        ProxyError::new(
            ErrorCode::BackendDown,
            format!("relaying startup message to {}: {}", addr, e),
        )
    })?;
    conn.flush().await.map_err(|e| {
        ProxyError::new(
            ErrorCode::BackendDown,
            format!("relaying startup message to {}: {}", addr, e),
        )
    })?;
    Ok(conn)
}

async fn request_backend_tls(stream: &mut TcpStream) -> ProxyResult<()> {
    let mut request = Vec::with_capacity(8);
    request.extend_from_slice(&8u32.to_be_bytes());
    request.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    stream.write_all(&request).await.map_err(|e| {
        ProxyError::new(ErrorCode::BackendDown, format!("requesting backend TLS: {}", e))
    })?;

    let mut response = [0u8; 1];
    stream.read_exact(&mut response).await.map_err(|e| {
        ProxyError::new(ErrorCode::BackendDown, format!("requesting backend TLS: {}", e))
    })?;
    if response[0] != b'S' {
        return Err(ProxyError::new(
            ErrorCode::BackendRefusedTls,
            "backend refused the TLS upgrade",
        ));
    }
    Ok(())
}

/// Read one framed pgwire message: type byte plus big-endian length
/// (which counts itself but not the type byte).
async fn read_message<S>(conn: &mut S) -> io::Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if !(4..=MAX_AUTH_MESSAGE_SIZE).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {} out of range", len),
        ));
    }
    let mut payload = vec![0u8; len - 4];
    conn.read_exact(&mut payload).await?;
    Ok((header[0], payload))
}

fn frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(msg_type);
    out.extend_from_slice(&((4 + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Pull a field (by type byte) out of an ErrorResponse payload.
fn error_field(payload: &[u8], wanted: u8) -> Option<String> {
    let mut rest = payload;
    while let Some((&field_type, tail)) = rest.split_first() {
        if field_type == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0)?;
        if field_type == wanted {
            return Some(String::from_utf8_lossy(&tail[..end]).into_owned());
        }
        rest = &tail[end + 1..];
    }
    None
}

/// Proxy the authentication sub-protocol. The backend drives: every
/// authentication request that expects data is answered with the client's
/// next message, forwarded verbatim. Terminates on ReadyForQuery
/// (success) or the backend's ErrorResponse (failure, surfaced to the
/// client unchanged). The outcome is reported through `throttle_hook`; a
/// hook refusal after a successful handshake still fails the session.
pub async fn authenticate<F>(
    client: &mut Conn,
    backend: &mut Conn,
    mut throttle_hook: F,
) -> ProxyResult<()>
where
    F: FnMut(AttemptStatus) -> Result<(), ProxyError>,
{
    loop {
        let (msg_type, payload) = read_message(backend).await.map_err(|e| {
            ProxyError::new(
                ErrorCode::BackendDisconnected,
                format!("reading auth response: {}", e),
            )
        })?;

        match msg_type {
            b'R' => {
                client
                    .write_all(&frame(msg_type, &payload))
                    .await
                    .map_err(client_write_err)?;
                client.flush().await.map_err(client_write_err)?;

                if payload.len() < 4 {
                    return Err(ProxyError::new(
                        ErrorCode::AuthFailed,
                        "malformed authentication request from backend",
                    ));
                }
                let auth_type =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if auth_type == AUTH_TYPE_OK || auth_type == AUTH_TYPE_SASL_FINAL {
                    continue;
                }

                // The backend wants a response (password, SASL, ...).
                let (client_type, client_payload) =
                    read_message(client).await.map_err(|e| {
                        ProxyError::new(
                            ErrorCode::ClientDisconnected,
                            format!("reading auth reply: {}", e),
                        )
                    })?;
                backend
                    .write_all(&frame(client_type, &client_payload))
                    .await
                    .map_err(backend_write_err)?;
                backend.flush().await.map_err(backend_write_err)?;
            }
            // Session parameters, cancel keys, and notices flow straight
            // through.
            b'S' | b'K' | b'N' => {
                client
                    .write_all(&frame(msg_type, &payload))
                    .await
                    .map_err(client_write_err)?;
            }
            b'E' => {
                let _ = throttle_hook(AttemptStatus::InvalidCredentials);
                client
                    .write_all(&frame(msg_type, &payload))
                    .await
                    .map_err(client_write_err)?;
                let _ = client.flush().await;
                let message = error_field(&payload, b'M')
                    .unwrap_or_else(|| "authentication failed".to_string());
                return Err(ProxyError::new(ErrorCode::AuthFailed, message));
            }
            b'Z' => {
                if let Err(err) = throttle_hook(AttemptStatus::Ok) {
                    let _ = send_err_to_client(client, &err).await;
                    return Err(err);
                }
                client
                    .write_all(&frame(msg_type, &payload))
                    .await
                    .map_err(client_write_err)?;
                client.flush().await.map_err(client_write_err)?;
                return Ok(());
            }
            other => {
                return Err(ProxyError::new(
                    ErrorCode::AuthFailed,
                    format!(
                        "unexpected message type '{}' during authentication",
                        other as char
                    ),
                ));
            }
        }
    }
}

fn client_write_err(err: io::Error) -> ProxyError {
    ProxyError::new(
        ErrorCode::ClientDisconnected,
        format!("writing to client: {}", err),
    )
}

fn backend_write_err(err: io::Error) -> ProxyError {
    ProxyError::new(
        ErrorCode::BackendDisconnected,
        format!("writing to backend: {}", err),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn conn_pair() -> (Conn, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(4096);
        (Box::new(a), b)
    }

    fn auth_request(auth_type: u32) -> Vec<u8> {
        frame(b'R', &auth_type.to_be_bytes())
    }

    fn ready_for_query() -> Vec<u8> {
        frame(b'Z', b"I")
    }

    fn error_response(message: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.push(b'S');
        payload.extend_from_slice(b"ERROR");
        payload.push(0);
        payload.push(b'M');
        payload.extend_from_slice(message.as_bytes());
        payload.push(0);
        payload.push(0);
        frame(b'E', &payload)
    }

    #[test]
    fn test_error_field_extraction() {
        let framed = error_response("password authentication failed");
        assert_eq!(
            error_field(&framed[5..], b'M').as_deref(),
            Some("password authentication failed")
        );
        assert_eq!(error_field(&framed[5..], b'H'), None);
    }

    #[tokio::test]
    async fn test_authenticate_cleartext_success() {
        let (mut client, mut client_app) = conn_pair();
        let (mut backend, mut backend_app) = conn_pair();

        let backend_script = tokio::spawn(async move {
            // Backend asks for a cleartext password.
            backend_app.write_all(&auth_request(3)).await.unwrap();
            // Read the client's password message off the backend side.
            let (msg_type, payload) = read_message(&mut backend_app).await.unwrap();
            assert_eq!(msg_type, b'p');
            assert_eq!(&payload, b"hunter2\0");
            // Accept and hand the session over.
            backend_app.write_all(&auth_request(0)).await.unwrap();
            backend_app
                .write_all(&frame(b'S', b"server_version\016.0\0"))
                .await
                .unwrap();
            backend_app.write_all(&ready_for_query()).await.unwrap();
        });

        let client_script = tokio::spawn(async move {
            // The client answers the password prompt.
            let (msg_type, _) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'R');
            client_app
                .write_all(&frame(b'p', b"hunter2\0"))
                .await
                .unwrap();

            // And sees the rest of the handshake.
            let (msg_type, _) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'R');
            let (msg_type, _) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'S');
            let (msg_type, _) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'Z');
        });

        let mut statuses = Vec::new();
        authenticate(&mut client, &mut backend, |status| {
            statuses.push(status);
            Ok(())
        })
        .await
        .unwrap();
        backend_script.await.unwrap();
        client_script.await.unwrap();
        assert_eq!(statuses, vec![AttemptStatus::Ok]);
    }

    #[tokio::test]
    async fn test_authenticate_failure_surfaces_backend_error() {
        let (mut client, mut client_app) = conn_pair();
        let (mut backend, mut backend_app) = conn_pair();

        let script = tokio::spawn(async move {
            backend_app
                .write_all(&error_response("password authentication failed"))
                .await
                .unwrap();
            // The client sees the backend's error verbatim.
            let (msg_type, payload) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'E');
            assert!(String::from_utf8_lossy(&payload).contains("password authentication failed"));
        });

        let mut statuses = Vec::new();
        let err = authenticate(&mut client, &mut backend, |status| {
            statuses.push(status);
            Ok(())
        })
        .await
        .unwrap_err();
        script.await.unwrap();

        assert_eq!(err.code, ErrorCode::AuthFailed);
        assert!(err.message.contains("password authentication failed"));
        assert_eq!(statuses, vec![AttemptStatus::InvalidCredentials]);
    }

    #[tokio::test]
    async fn test_authenticate_post_auth_throttle_refusal() {
        let (mut client, mut client_app) = conn_pair();
        let (mut backend, mut backend_app) = conn_pair();

        let script = tokio::spawn(async move {
            backend_app.write_all(&auth_request(0)).await.unwrap();
            backend_app.write_all(&ready_for_query()).await.unwrap();
            // AuthenticationOk, then the throttler's refusal.
            let (msg_type, _) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'R');
            let (msg_type, payload) = read_message(&mut client_app).await.unwrap();
            assert_eq!(msg_type, b'E');
            assert!(String::from_utf8_lossy(&payload).contains("throttled"));
        });

        let err = authenticate(&mut client, &mut backend, |_| {
            Err(crate::throttler::throttled_error())
        })
        .await
        .unwrap_err();
        script.await.unwrap();
        assert_eq!(err.code, ErrorCode::ProxyRefusedConnection);
    }
}
