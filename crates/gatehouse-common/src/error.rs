//! Error types for Gatehouse services

/// Result type alias using GatehouseError
pub type Result<T> = std::result::Result<T, GatehouseError>;

/// Main error type for Gatehouse services
#[derive(Debug, thiserror::Error)]
pub enum GatehouseError {
    /// TLS/Certificate error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// gRPC transport error
    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::transport::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatehouseError {
    /// Create an internal error from any error type
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        GatehouseError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for GatehouseError {
    fn from(err: std::io::Error) -> Self {
        GatehouseError::Internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatehouseError::ConfigError("bad listen address".into());
        assert_eq!(err.to_string(), "Configuration error: bad listen address");
    }
}
