//! Certificate authority: the shared registry of TLS hosts and ports.
//!
//! Listeners register their TLS hosts and port at construction time; the
//! authority lazily builds one TLS manager over the accumulated host set
//! and, once every registration is in, spawns best-effort challenge
//! responders on ports 80/443 when no listener claimed them itself.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Redirect, Response};
use futures_util::{FutureExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls_acme::AcmeConfig;
use rustls_acme::caches::DirCache;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::models::AcmeSettings;
use crate::utils::supervise::panic_message;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

static DOMAIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$")
        .expect("invalid domain pattern")
});

/// Whether a certificate could plausibly be issued for this name: dotted
/// labels with a purely alphabetic top-level domain. IP literals and
/// dotless names fail the check.
pub(crate) fn is_domain(host: &str) -> bool {
    DOMAIN_PATTERN.is_match(host)
}

/// Error type for certificate authority operations
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Failed to create certificate cache directory '{path}': {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to assemble TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// The TLS manager handed to listeners.
///
/// For an authority without registered hosts the manager resolves no
/// certificate at all: handshakes fail at handshake time and no ACME
/// order is ever placed, which lets non-TLS deployments share the TLS
/// code path safely.
#[derive(Debug, Clone)]
pub struct TlsManager {
    server_config: Arc<ServerConfig>,
    challenge_config: Option<Arc<ServerConfig>>,
}

impl TlsManager {
    /// TLS config for serving requests: resolves certificates for the
    /// registered hosts and answers inline TLS-ALPN challenges.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// TLS config that only answers TLS-ALPN challenges, used by the
    /// dedicated port-443 responder.
    pub fn challenge_config(&self) -> Option<Arc<ServerConfig>> {
        self.challenge_config.clone()
    }

    /// False for the no-op manager of a hostless authority.
    pub fn is_managing(&self) -> bool {
        self.challenge_config.is_some()
    }
}

/// Certificate resolver that never produces a certificate.
#[derive(Debug)]
struct NullResolver;

impl ResolvesServerCert for NullResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<rustls::sign::CertifiedKey>> {
        None
    }
}

#[derive(Default)]
struct AuthorityState {
    hosts: Vec<String>,
    ports: Vec<u16>,
    manager: Option<TlsManager>,
}

/// Accumulates TLS registrations and produces the shared [`TlsManager`].
pub struct CertificateAuthority {
    settings: AcmeSettings,
    state: Mutex<AuthorityState>,
}

impl CertificateAuthority {
    pub fn new(settings: AcmeSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(AuthorityState::default()),
        }
    }

    /// Register a host for certificate provisioning. The entry is stripped
    /// of any `:port` suffix, trimmed and lowercased; anything that is not
    /// domain-shaped is silently ignored. Duplicates collapse, first-seen
    /// order is preserved.
    pub fn add_host(&self, raw: &str) {
        let host = raw.split(':').next().unwrap_or_default();
        let host = host.trim().to_lowercase();
        if !is_domain(&host) {
            tracing::debug!(host = %raw, "ignoring non-domain TLS host");
            return;
        }
        let mut state = self.lock_state();
        if !state.hosts.iter().any(|existing| existing == &host) {
            state.hosts.push(host);
        }
    }

    /// Register a port a TLS listener claims for itself. Zero is ignored;
    /// duplicates collapse.
    pub fn add_port(&self, port: u16) {
        if port == 0 {
            return;
        }
        let mut state = self.lock_state();
        if !state.ports.contains(&port) {
            state.ports.push(port);
        }
    }

    /// Registered hosts in first-seen order.
    pub fn hosts(&self) -> Vec<String> {
        self.lock_state().hosts.clone()
    }

    /// Registered ports in first-seen order.
    pub fn ports(&self) -> Vec<u16> {
        self.lock_state().ports.clone()
    }

    /// Obtain the TLS manager, building it on first use.
    ///
    /// Safe to call concurrently; the ACME state and its driver task are
    /// created at most once per authority. Only local failures (cache
    /// directory creation, TLS config assembly) surface here; certificate
    /// acquisition problems show up at handshake time.
    pub fn manager(&self) -> Result<TlsManager, AuthorityError> {
        let mut state = self.lock_state();
        if state.hosts.is_empty() {
            return Ok(TlsManager {
                server_config: Arc::new(Self::null_server_config()?),
                challenge_config: None,
            });
        }
        if let Some(manager) = &state.manager {
            return Ok(manager.clone());
        }
        let manager = self.build_manager(state.hosts.clone())?;
        state.manager = Some(manager.clone());
        Ok(manager)
    }

    /// Spawn the fallback responders for ports 80 and 443 that no listener
    /// claimed. Best effort: bind and serve failures are logged, panics
    /// are caught. Returns the spawned task handles so the orchestrator
    /// can count and abort them. A hostless authority spawns nothing.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let (hosts_empty, claimed) = {
            let state = self.lock_state();
            (state.hosts.is_empty(), state.ports.clone())
        };
        if hosts_empty {
            return Vec::new();
        }

        let mut responders = Vec::new();
        if !claimed.contains(&80) {
            let authority = Arc::clone(self);
            responders.push(tokio::spawn(async move {
                let serving = AssertUnwindSafe(authority.serve_redirects(80)).catch_unwind();
                if let Err(panic) = serving.await {
                    tracing::error!(payload = %panic_message(&panic), "redirect responder panicked");
                }
            }));
        }
        if !claimed.contains(&443) {
            let authority = Arc::clone(self);
            responders.push(tokio::spawn(async move {
                let serving = AssertUnwindSafe(authority.serve_challenges(443)).catch_unwind();
                if let Err(panic) = serving.await {
                    tracing::error!(payload = %panic_message(&panic), "challenge responder panicked");
                }
            }));
        }
        responders
    }

    fn lock_state(&self) -> MutexGuard<'_, AuthorityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn base_tls_builder()
    -> Result<rustls::ConfigBuilder<ServerConfig, rustls::server::WantsServerCert>, rustls::Error>
    {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?;
        Ok(builder.with_no_client_auth())
    }

    fn null_server_config() -> Result<ServerConfig, AuthorityError> {
        let mut config = Self::base_tls_builder()?.with_cert_resolver(Arc::new(NullResolver));
        config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()];
        Ok(config)
    }

    fn build_manager(&self, hosts: Vec<String>) -> Result<TlsManager, AuthorityError> {
        let cache_dir = &self.settings.cache_dir;
        if !cache_dir.exists() {
            std::fs::create_dir_all(cache_dir).map_err(|source| AuthorityError::CacheDir {
                path: cache_dir.clone(),
                source,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                if let Err(err) = std::fs::set_permissions(cache_dir, perms) {
                    tracing::warn!(
                        path = %cache_dir.display(),
                        error = %err,
                        "could not restrict certificate cache permissions"
                    );
                }
            }
        }

        let mut acme_config = AcmeConfig::new(hosts)
            .cache_option(Some(DirCache::new(cache_dir.clone())));
        acme_config = match &self.settings.directory {
            Some(url) => acme_config.directory(url),
            None => acme_config.directory_lets_encrypt(self.settings.production),
        };
        if let Some(contact) = &self.settings.contact {
            acme_config = acme_config.contact([format!("mailto:{contact}")]);
        }
        let mut acme_state = acme_config.state();

        let resolver = acme_state.resolver();
        let challenge_config = acme_state.challenge_rustls_config();

        let mut server_config = Self::base_tls_builder()?.with_cert_resolver(resolver);
        server_config.alpn_protocols = vec![
            ALPN_H2.to_vec(),
            ALPN_HTTP1.to_vec(),
            rustls_acme::acme::ACME_TLS_ALPN_NAME.to_vec(),
        ];

        // Order placement and renewals happen on this driver task.
        tokio::spawn(async move {
            loop {
                match acme_state.next().await {
                    Some(Ok(event)) => tracing::info!(event = ?event, "acme event"),
                    Some(Err(err)) => tracing::error!(error = ?err, "acme error"),
                    None => break,
                }
            }
        });

        Ok(TlsManager {
            server_config: Arc::new(server_config),
            challenge_config: Some(challenge_config),
        })
    }

    async fn serve_redirects(&self, port: u16) {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(%port, error = %err, "redirect responder could not bind");
                return;
            }
        };
        tracing::info!(%port, "serving http-to-https redirects");
        if let Err(err) = axum::serve(listener, redirect_router()).await {
            tracing::warn!(%port, error = %err, "redirect responder stopped");
        }
    }

    async fn serve_challenges(&self, port: u16) {
        let manager = match self.manager() {
            Ok(manager) => manager,
            Err(err) => {
                tracing::error!(error = %err, "challenge responder could not obtain TLS manager");
                return;
            }
        };
        let Some(challenge_config) = manager.challenge_config() else {
            return;
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(%port, error = %err, "challenge responder could not bind");
                return;
            }
        };
        tracing::info!(%port, "answering tls-alpn certificate challenges");
        let acceptor = TlsAcceptor::from(challenge_config);
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        // Completing the handshake is the whole exchange.
                        let _ = acceptor.accept(stream).await;
                    });
                }
                Err(err) => {
                    tracing::debug!(error = %err, "challenge accept error");
                }
            }
        }
    }
}

/// Router answering every request with a permanent redirect to the same
/// host and path over HTTPS, with any port stripped from the host.
fn redirect_router() -> Router {
    Router::new().fallback(|headers: HeaderMap, uri: Uri| async move {
        redirect_to_https(&headers, &uri)
    })
}

fn redirect_to_https(headers: &HeaderMap, uri: &Uri) -> Response {
    let Some(host) = headers.get(header::HOST).and_then(|value| value.to_str().ok()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let host = host.split(':').next().unwrap_or_default();
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Redirect::permanent(&format!("https://{host}{path}")).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use tower::ServiceExt;

    use super::*;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::new(AcmeSettings::default())
    }

    #[test]
    fn is_domain_accepts_dotted_names_with_alphabetic_tld() {
        assert!(is_domain("example.com"));
        assert!(is_domain("sub.example.co.uk"));
        assert!(is_domain("xn--bcher-kva.example"));
    }

    #[test]
    fn is_domain_rejects_ips_and_dotless_names() {
        assert!(!is_domain("127.0.0.1"));
        assert!(!is_domain("localhost"));
        assert!(!is_domain("example.c"));
        assert!(!is_domain("-bad.example.com"));
        assert!(!is_domain(""));
        let oversized_label = format!("{}.com", "a".repeat(64));
        assert!(!is_domain(&oversized_label));
    }

    #[test]
    fn add_host_normalizes_and_deduplicates() {
        let authority = authority();
        authority.add_host("Example.com:8443");
        authority.add_host("example.com");
        authority.add_host("  API.Example.com  ");

        assert_eq!(authority.hosts(), vec!["example.com", "api.example.com"]);
    }

    #[test]
    fn add_host_ignores_non_domains() {
        let authority = authority();
        authority.add_host("127.0.0.1");
        authority.add_host("[::1]:443");
        authority.add_host("localhost");
        authority.add_host("");

        assert!(authority.hosts().is_empty());
    }

    #[test]
    fn add_port_ignores_zero_and_deduplicates() {
        let authority = authority();
        authority.add_port(0);
        authority.add_port(8443);
        authority.add_port(8443);
        authority.add_port(443);

        assert_eq!(authority.ports(), vec![8443, 443]);
    }

    #[tokio::test]
    async fn hostless_authority_hands_out_a_noop_manager() {
        let authority = authority();
        let manager = authority.manager().unwrap();
        assert!(!manager.is_managing());
        assert!(manager.challenge_config().is_none());
    }

    #[tokio::test]
    async fn hostless_authority_spawns_no_responders() {
        let authority = Arc::new(authority());
        assert!(authority.start().is_empty());
    }

    #[tokio::test]
    async fn manager_is_safe_to_request_concurrently() {
        let authority = Arc::new(authority());
        let a = {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.manager().map(|m| m.is_managing()) })
        };
        let b = {
            let authority = Arc::clone(&authority);
            tokio::spawn(async move { authority.manager().map(|m| m.is_managing()) })
        };

        assert!(!a.await.unwrap().unwrap());
        assert!(!b.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn manager_surfaces_cache_directory_failures() {
        let blocking_file = tempfile::NamedTempFile::new().unwrap();
        let settings = AcmeSettings {
            cache_dir: blocking_file.path().join("certs"),
            directory: Some("https://127.0.0.1:14000/dir".to_string()),
            ..AcmeSettings::default()
        };

        let authority = CertificateAuthority::new(settings);
        authority.add_host("api.example.com");

        let err = authority.manager().unwrap_err();
        assert!(matches!(err, AuthorityError::CacheDir { .. }));
    }

    #[tokio::test]
    async fn redirects_preserve_path_and_query() {
        let request = axum::http::Request::builder()
            .uri("/dashboard?tab=1")
            .header(header::HOST, "app.example.com:8080")
            .body(Body::empty())
            .unwrap();

        let response = redirect_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://app.example.com/dashboard?tab=1"
        );
    }

    #[tokio::test]
    async fn redirects_without_host_are_rejected() {
        let request = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = redirect_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
