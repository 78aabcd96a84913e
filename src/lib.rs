//! Portico - a multi-port HTTP(S) server framework with automatic TLS.
//!
//! Portico lets one process serve several ports at once, each with its own
//! routes, static file roots, and TLS settings, while certificates for
//! every TLS host are obtained and renewed automatically through ACME.
//! It focuses on correctness, observability, and ergonomic configuration.
//!
//! # Features
//! - One listener per port, assembled from composable route groups
//! - Automatic certificates via TLS-ALPN-01, with inline challenge
//!   answering on the ports the server already owns and fallback
//!   responders on 80/443 otherwise
//! - Static file fallback across ordered location roots, with an optional
//!   HTML 404 page for browser-facing misses
//! - Status-coded JSON response envelope and a tagged reply union for
//!   handlers
//! - Pluggable per-group authentication and background workers
//! - Supervised tasks: a panicking listener or worker becomes an error
//!   without taking its siblings down
//! - Graceful shutdown & structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use portico::{Server, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = load_config("config.yaml")?;
//! let server = Server::new(cfg);
//! server.get("/status", || async { "ok" });
//! server.run().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. End
//! users should prefer the re-exports documented below instead of
//! reaching into internal modules directly.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error
//! type. A custom error context is always attached using `WrapErr` for
//! debuggability.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{Listener, ListenerError, StaticFallback},
    core::{
        CertificateAuthority, Message, Middleware, Phase, Reply, RouteGroup, Server, TlsManager,
    },
    ports::{AuthStrategy, Principal, Worker},
    utils::{GracefulShutdown, ShutdownReason},
};
