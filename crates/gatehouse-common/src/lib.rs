//! Gatehouse Common Library
//!
//! Shared error types, TLS utilities, and gRPC definitions for the
//! Gatehouse proxy and its companion services.

pub mod error;
pub mod proto;
pub mod tls;

pub use error::{GatehouseError, Result};
