//! Frontend admission: the PostgreSQL startup handshake.
//!
//! Reads the client's first packet, negotiates the optional TLS upgrade,
//! and returns the parsed startup message. GSSAPI encryption is declined;
//! cancel requests are surfaced as `None` so the caller closes silently.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::errors::{ErrorCode, ProxyError, ProxyResult};

/// pgwire protocol 3.0.
pub const PROTOCOL_VERSION: u32 = 196608;
/// Magic version requesting a TLS upgrade.
pub const SSL_REQUEST_CODE: u32 = 80877103;
/// Magic version requesting GSSAPI encryption.
pub const GSSENC_REQUEST_CODE: u32 = 80877104;
/// Magic version of a query cancel request.
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Startup packets are small; anything larger is hostile or corrupt.
const MAX_STARTUP_PACKET_SIZE: usize = 16 * 1024;

/// Object-safe bound for the streams the proxy shuffles around: plain TCP,
/// TLS-wrapped, or idle-monitored.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// A client- or backend-facing connection.
pub type Conn = Box<dyn ProxyStream>;

/// The client's startup message: protocol version plus the parameter map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: u32,
    pub parameters: HashMap<String, String>,
}

impl StartupMessage {
    /// Decode the body of a startup packet (version + NUL-terminated
    /// key/value pairs, closed by an empty key).
    pub fn decode(payload: &[u8]) -> ProxyResult<Self> {
        if payload.len() < 4 {
            return Err(malformed("startup packet too short"));
        }
        let protocol_version =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

        let mut parameters = HashMap::new();
        let mut rest = &payload[4..];
        loop {
            let Some(key_end) = rest.iter().position(|&b| b == 0) else {
                return Err(malformed("unterminated startup parameter"));
            };
            if key_end == 0 {
                break;
            }
            let key = std::str::from_utf8(&rest[..key_end])
                .map_err(|_| malformed("startup parameter is not valid UTF-8"))?;
            rest = &rest[key_end + 1..];

            let Some(value_end) = rest.iter().position(|&b| b == 0) else {
                return Err(malformed("startup parameter missing value"));
            };
            let value = std::str::from_utf8(&rest[..value_end])
                .map_err(|_| malformed("startup parameter is not valid UTF-8"))?;
            rest = &rest[value_end + 1..];

            parameters.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            protocol_version,
            parameters,
        })
    }

    /// Encode the full startup packet, length prefix included. Parameters
    /// are emitted in sorted order so the encoding is deterministic.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(&self.protocol_version.to_be_bytes());

        let mut keys: Vec<&String> = self.parameters.keys().collect();
        keys.sort();
        for key in keys {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(self.parameters[key].as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

#[derive(Debug)]
enum FirstPacket {
    Startup(StartupMessage),
    SslRequest,
    GssEncRequest,
    Cancel,
}

async fn read_startup_packet<S>(conn: &mut S) -> ProxyResult<FirstPacket>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf)
        .await
        .map_err(|e| client_io_err("reading startup packet", e))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(8..=MAX_STARTUP_PACKET_SIZE).contains(&len) {
        return Err(malformed(format!("invalid startup packet length {}", len)));
    }

    let mut payload = vec![0u8; len - 4];
    conn.read_exact(&mut payload)
        .await
        .map_err(|e| client_io_err("reading startup packet", e))?;

    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    match code {
        SSL_REQUEST_CODE if len == 8 => Ok(FirstPacket::SslRequest),
        GSSENC_REQUEST_CODE if len == 8 => Ok(FirstPacket::GssEncRequest),
        CANCEL_REQUEST_CODE => Ok(FirstPacket::Cancel),
        PROTOCOL_VERSION => Ok(FirstPacket::Startup(StartupMessage::decode(&payload)?)),
        other => Err(malformed(format!("unsupported protocol version {}", other))),
    }
}

/// A connection that made it through admission.
pub struct Admitted {
    pub conn: Conn,
    /// `None` for cancel requests: the caller closes without a reply.
    pub msg: Option<StartupMessage>,
}

/// An admission failure. The connection is carried along when it is still
/// in a state where an error can be written to it.
pub struct AdmitError {
    pub conn: Option<Conn>,
    pub error: ProxyError,
}

/// Perform the startup handshake on a freshly accepted connection,
/// upgrading to TLS when the client asks for it and `tls` is configured.
pub async fn frontend_admit(
    mut conn: TcpStream,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Result<Admitted, AdmitError> {
    let mut first = match read_startup_packet(&mut conn).await {
        Ok(p) => p,
        Err(error) => {
            return Err(AdmitError {
                conn: Some(Box::new(conn)),
                error,
            })
        }
    };

    // GSSAPI encryption is not supported; decline and let the client retry.
    if matches!(first, FirstPacket::GssEncRequest) {
        debug!("declining GSSAPI encryption request");
        if let Err(e) = conn.write_all(b"N").await {
            return Err(AdmitError {
                conn: None,
                error: client_io_err("declining GSSENC request", e),
            });
        }
        first = match read_startup_packet(&mut conn).await {
            Ok(p) => p,
            Err(error) => {
                return Err(AdmitError {
                    conn: Some(Box::new(conn)),
                    error,
                })
            }
        };
    }

    match first {
        FirstPacket::Cancel => Ok(Admitted {
            conn: Box::new(conn),
            msg: None,
        }),
        FirstPacket::Startup(msg) => {
            if tls.is_some() {
                // A listen cert is configured, so plaintext startup is
                // rejected before any parameters are inspected.
                return Err(AdmitError {
                    conn: Some(Box::new(conn)),
                    error: ProxyError::new(
                        ErrorCode::UnexpectedInsecureStartupMessage,
                        "server requires encryption",
                    ),
                });
            }
            Ok(Admitted {
                conn: Box::new(conn),
                msg: Some(msg),
            })
        }
        FirstPacket::SslRequest => {
            let Some(config) = tls else {
                return Err(AdmitError {
                    conn: Some(Box::new(conn)),
                    error: ProxyError::new(
                        ErrorCode::UnexpectedInsecureStartupMessage,
                        "SSL encryption is not configured on this server",
                    ),
                });
            };

            if let Err(e) = conn.write_all(b"S").await {
                return Err(AdmitError {
                    conn: None,
                    error: client_io_err("accepting SSL request", e),
                });
            }

            let acceptor = TlsAcceptor::from(config);
            let mut tls_conn = match acceptor.accept(conn).await {
                Ok(c) => c,
                Err(e) => {
                    // The raw socket is gone; nothing to reply to.
                    return Err(AdmitError {
                        conn: None,
                        error: ProxyError::new(
                            ErrorCode::ClientDisconnected,
                            format!("TLS handshake failed: {}", e),
                        ),
                    });
                }
            };

            match read_startup_packet(&mut tls_conn).await {
                Ok(FirstPacket::Startup(msg)) => Ok(Admitted {
                    conn: Box::new(tls_conn),
                    msg: Some(msg),
                }),
                Ok(FirstPacket::Cancel) => Ok(Admitted {
                    conn: Box::new(tls_conn),
                    msg: None,
                }),
                Ok(_) => Err(AdmitError {
                    conn: Some(Box::new(tls_conn)),
                    error: ProxyError::new(
                        ErrorCode::UnexpectedStartupMessage,
                        "unsupported startup message after TLS negotiation",
                    ),
                }),
                Err(error) => Err(AdmitError {
                    conn: Some(Box::new(tls_conn)),
                    error,
                }),
            }
        }
        FirstPacket::GssEncRequest => Err(AdmitError {
            conn: Some(Box::new(conn)),
            error: ProxyError::new(
                ErrorCode::UnexpectedStartupMessage,
                "repeated GSSAPI encryption request",
            ),
        }),
    }
}

fn malformed(message: impl Into<String>) -> ProxyError {
    ProxyError::new(ErrorCode::UnexpectedStartupMessage, message)
}

fn client_io_err(context: &str, err: std::io::Error) -> ProxyError {
    ProxyError::new(
        ErrorCode::ClientDisconnected,
        format!("{}: {}", context, err),
    )
}
