//! Hostgate - a multi-tenant reverse proxy
//!
//! Requests are routed by hostname to HTTP, HTTPS, h2c or Unix socket
//! backends. Each domain carries its own TLS keypair (or delegates to an
//! autocert store), timeouts and request limits. Configuration reloads swap
//! the whole routing table atomically; a bad configuration never replaces a
//! good one.

pub mod backend;
pub mod certs;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod health;
pub mod limits;
pub mod logging;
pub mod metrics;
pub mod router;
pub mod server;
