//! Bidirectional byte relay between client and backend.
//!
//! Once authentication completes the proxy stops interpreting the wire
//! protocol entirely: each direction is a plain byte copy, chunked by the
//! underlying read buffering. The first direction to finish decides the
//! session outcome; the caller closes both connections, which tears down
//! the other half.

use crate::admit::Conn;
use crate::errors::{ErrorCode, ProxyError};

/// Copy bytes in both directions until EOF or the first error. A clean
/// EOF in either direction is a normal close; errors are wrapped to
/// distinguish which side hung up.
pub async fn connection_copy(client: Conn, backend: Conn) -> Result<(), ProxyError> {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let client_to_backend = tokio::io::copy(&mut client_read, &mut backend_write);
    let backend_to_client = tokio::io::copy(&mut backend_read, &mut client_write);
    tokio::pin!(client_to_backend, backend_to_client);

    tokio::select! {
        result = &mut client_to_backend => match result {
            Ok(_) => Ok(()),
            Err(err) => Err(ProxyError::new(
                ErrorCode::ClientDisconnected,
                format!("copying from client: {}", err),
            )),
        },
        result = &mut backend_to_client => match result {
            Ok(_) => Ok(()),
            Err(err) => Err(ProxyError::new(
                ErrorCode::BackendDisconnected,
                format!("copying from backend: {}", err),
            )),
        },
    }
}
