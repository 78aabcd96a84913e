//! One listener per port: builds the routing engine from a merged route
//! group, serves it over plain HTTP/1.1 or TLS (ALPN h2 + http/1.1), and
//! stops on a watch signal.
//!
//! TLS listeners register their hosts and port with the certificate
//! authority at construction time, strictly before anything is bound or
//! spawned. On ports 80 and 443 a TLS listener also intercepts ACME
//! challenge handshakes by dropping them once completed.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::Method;
use axum::middleware::{Next, from_fn};
use axum::response::IntoResponse;
use axum::routing::MethodRouter;
use futures_util::StreamExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tls_listener::TlsListener;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;

use crate::adapters::fallback::StaticFallback;
use crate::adapters::middleware::default_stack;
use crate::config::models::PortConfig;
use crate::core::authority::{AuthorityError, CertificateAuthority};
use crate::core::group::{RouteBinding, RouteGroup, RouteTree};
use crate::core::reply::Message;
use crate::ports::auth::{AuthStrategy, Principal};
use crate::utils::supervise::panic_message;

/// Upper bound on request head size, in bytes.
const MAX_HEADER_BYTES: usize = 8192;
/// How long a connection may take to deliver the request head.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on an entire request, body included.
const FULL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Error type for listener construction and serving
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate route {method} {path} on port {port}")]
    DuplicateRoute {
        port: u16,
        method: Method,
        path: String,
    },

    #[error("Invalid route registration on port {port}: {detail}")]
    InvalidRoute { port: u16, detail: String },

    #[error("No routes bound for port {port}")]
    NotBound { port: u16 },

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

/// Serves one port with the routing engine built from its merged group.
pub struct Listener {
    config: PortConfig,
    authority: Arc<CertificateAuthority>,
    engine: Mutex<Option<Router>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.config.port)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// TLS hosts and the port itself register with the authority here,
    /// before any socket exists.
    pub fn new(config: PortConfig, authority: Arc<CertificateAuthority>) -> Self {
        if config.ssl_enabled() {
            for host in &config.ssl.hosts {
                authority.add_host(host);
            }
            authority.add_port(config.port);
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            authority,
            engine: Mutex::new(None),
            shutdown,
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Build the routing engine for a merged group.
    ///
    /// Every binding is attached (a duplicate method+path pair is an
    /// error), protected bindings are wrapped with the group's
    /// authentication strategy, group middleware is applied with the
    /// first-declared middleware outermost, and the static fallback plus
    /// the default stack close the engine. Route defects the group
    /// recorded at registration time surface here.
    pub fn bind_routes(&self, group: RouteGroup) -> Result<(), ListenerError> {
        let port = self.config.port;
        let RouteGroup {
            bindings,
            auth,
            middleware: chain,
            defects,
            ..
        } = group;

        if !defects.is_empty() {
            return Err(ListenerError::InvalidRoute {
                port,
                detail: defects.join("; "),
            });
        }

        let mut tree = RouteTree::default();
        for binding in &bindings {
            if tree.contains(binding.method(), binding.path()) {
                return Err(ListenerError::DuplicateRoute {
                    port,
                    method: binding.method().clone(),
                    path: binding.path().to_string(),
                });
            }
            tree.insert(binding.method().clone(), binding.path());
        }

        // The routing engine panics on malformed path patterns and on
        // overlapping wildcard captures; convert those into errors.
        let fallback = StaticFallback::from_config(&self.config);
        let built = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let mut engine = Router::new();
            for binding in bindings {
                let RouteBinding {
                    path,
                    handler,
                    protected,
                    ..
                } = binding;
                let handler = if protected {
                    protect(handler, auth.clone())
                } else {
                    handler
                };
                engine = engine.route(&path, handler);
            }
            engine = engine.fallback(move |req: Request| {
                let fallback = fallback.clone();
                async move { fallback.serve(req).await }
            });
            for middleware in chain.into_iter().rev() {
                engine = middleware.apply(engine);
            }
            default_stack(engine).layer(TimeoutLayer::new(FULL_REQUEST_TIMEOUT))
        }))
        .map_err(|panic| ListenerError::InvalidRoute {
            port,
            detail: panic_message(&panic),
        })?;

        *self.lock_engine() = Some(built);
        Ok(())
    }

    /// Bind the socket and serve until closed.
    ///
    /// A listener closed before it ever ran returns immediately with
    /// success. Certificate problems on a TLS listener surface per
    /// handshake, not here.
    pub async fn run(&self) -> Result<(), ListenerError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        let engine = self
            .lock_engine()
            .clone()
            .ok_or(ListenerError::NotBound {
                port: self.config.port,
            })?;

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                port: self.config.port,
                source,
            })?;

        tracing::info!(
            port = self.config.port,
            tls = self.config.ssl_enabled(),
            "listener started"
        );
        let result = if self.config.ssl_enabled() {
            self.serve_tls(tcp, engine, &mut shutdown).await
        } else {
            serve_plain(tcp, engine, &mut shutdown).await
        };
        tracing::info!(port = self.config.port, "listener stopped");
        result
    }

    /// Signal the accept loop to stop. Idempotent. In-flight requests on
    /// already-spawned connection tasks are left to finish.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn serve_tls(
        &self,
        tcp: TcpListener,
        engine: Router,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        let manager = self.authority.manager()?;
        let acceptor = TlsAcceptor::from(manager.server_config());
        let intercept = self.config.port == 80 || self.config.port == 443;
        let mut incoming = TlsListener::new(acceptor, tcp);

        loop {
            tokio::select! {
                accepted = incoming.next() => match accepted {
                    Some(Ok((stream, peer))) => {
                        if intercept && is_challenge_handshake(&stream) {
                            tracing::debug!(%peer, "dropping completed acme challenge connection");
                            drop(stream);
                        } else {
                            spawn_tls_connection(stream, peer, engine.clone());
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!("TLS accept error: {}", err);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<Router>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn serve_plain(
    tcp: TcpListener,
    engine: Router,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ListenerError> {
    loop {
        tokio::select! {
            accepted = tcp.accept() => match accepted {
                Ok((stream, peer)) => spawn_plain_connection(stream, peer, engine.clone()),
                Err(err) => {
                    tracing::debug!("Accept error: {}", err);
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn spawn_plain_connection(stream: TcpStream, peer: SocketAddr, engine: Router) {
    tokio::spawn(async move {
        let socket = TokioIo::new(stream);
        let service = service_fn(move |request: hyper::Request<Incoming>| {
            engine.clone().oneshot(request.map(Body::new))
        });
        let connection = http1::Builder::new()
            .timer(TokioTimer::new())
            .max_buf_size(MAX_HEADER_BYTES)
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(socket, service);
        if let Err(err) = connection.await {
            tracing::debug!(%peer, error = %err, "connection ended with error");
        }
    });
}

fn spawn_tls_connection(stream: TlsStream<TcpStream>, peer: SocketAddr, engine: Router) {
    tokio::spawn(async move {
        let socket = TokioIo::new(stream);
        let service = service_fn(move |request: hyper::Request<Incoming>| {
            engine.clone().oneshot(request.map(Body::new))
        });
        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .max_buf_size(MAX_HEADER_BYTES)
            .header_read_timeout(HEADER_READ_TIMEOUT);
        builder.http2().timer(TokioTimer::new());
        if let Err(err) = builder.serve_connection(socket, service).await {
            tracing::debug!(%peer, error = %err, "tls connection ended with error");
        }
    });
}

fn is_challenge_handshake(stream: &TlsStream<TcpStream>) -> bool {
    stream.get_ref().1.alpn_protocol() == Some(rustls_acme::acme::ACME_TLS_ALPN_NAME)
}

/// Wrap a handler with the group's authentication strategy. A missing
/// strategy rejects every request, the same as a failed check.
fn protect(handler: MethodRouter, auth: Option<Arc<dyn AuthStrategy>>) -> MethodRouter {
    handler.layer(from_fn(move |req: Request, next: Next| {
        let auth = auth.clone();
        async move {
            let Some(strategy) = auth else {
                return Message::unauthorized("unauthorized").into_response();
            };
            let (mut parts, body) = req.into_parts();
            match strategy.authenticate(&parts).await {
                Some(principal) => {
                    parts.extensions.insert(Principal(principal));
                    next.run(Request::from_parts(parts, body)).await
                }
                None => Message::unauthorized("unauthorized").into_response(),
            }
        }
    }))
}
