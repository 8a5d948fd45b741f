//! guest-bridge library
//!
//! Host/guest action bridge for VM sandboxes:
//! - Host meta-service tracking actions and shell sessions, served over HTTP
//! - Offset-indexed byte streams emulating pipes over request/response
//! - Guest agent polling for actions and pumping process I/O back
//! - Host-side pipe adapters presenting sessions as `AsyncRead`/`AsyncWrite`

pub mod agent;
pub mod config;
pub mod error;
pub mod metaservice;
pub mod resolver;
pub mod session;
pub mod shell;
pub mod stream;
pub mod transport;

pub use error::BridgeError;
