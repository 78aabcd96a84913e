//! Route groups: ordered route bindings plus the port-level attributes
//! they carry (TLS config, authentication strategy, middleware chain).
//!
//! Groups targeting the same port are merged before a listener is built
//! for that port. Merging is deliberately permissive: bindings and
//! middleware concatenate, the first authentication strategy wins, and a
//! TLS-enabled config anywhere promotes the whole port to TLS.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{MethodFilter, MethodRouter, Route, on};
use tower::{Layer, Service};

use crate::config::models::PortConfig;
use crate::ports::auth::AuthStrategy;

/// One route registration: method, path and the handler to run.
pub struct RouteBinding {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) handler: MethodRouter,
    pub(crate) protected: bool,
}

impl RouteBinding {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }
}

/// A deferred transformation of the routing engine, applied in
/// declaration order when the listener builds its router.
pub struct Middleware {
    apply: Box<dyn FnOnce(Router) -> Router + Send>,
}

impl Middleware {
    /// Wrap an arbitrary router transformation.
    pub fn new(apply: impl FnOnce(Router) -> Router + Send + 'static) -> Self {
        Self {
            apply: Box::new(apply),
        }
    }

    /// Wrap a tower layer (the common case).
    pub fn from_layer<L>(layer: L) -> Self
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        Self::new(move |router| router.layer(layer))
    }

    pub(crate) fn apply(self, router: Router) -> Router {
        (self.apply)(router)
    }
}

/// Method-to-paths bookkeeping used to reject duplicate registrations
/// before they reach the routing engine.
#[derive(Debug, Default)]
pub struct RouteTree {
    routes: HashMap<Method, Vec<String>>,
}

impl RouteTree {
    pub fn contains(&self, method: &Method, path: &str) -> bool {
        self.routes
            .get(method)
            .is_some_and(|paths| paths.iter().any(|p| p == path))
    }

    pub fn insert(&mut self, method: Method, path: &str) {
        self.routes.entry(method).or_default().push(path.to_string());
    }
}

/// An ordered collection of route bindings targeting one port.
///
/// Port 0 means "use the process default port"; the sentinel is resolved
/// exactly once, when the orchestrator folds groups into its port map.
pub struct RouteGroup {
    pub(crate) port: u16,
    pub(crate) bindings: Vec<RouteBinding>,
    pub(crate) auth: Option<Arc<dyn AuthStrategy>>,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) port_config: Option<PortConfig>,
    pub(crate) defects: Vec<String>,
}

impl RouteGroup {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bindings: Vec::new(),
            auth: None,
            middleware: Vec::new(),
            port_config: None,
            defects: Vec::new(),
        }
    }

    /// A group carrying a full port record (port, static roots, TLS).
    pub fn with_config(port_config: PortConfig) -> Self {
        let mut group = Self::new(port_config.port);
        group.port_config = Some(port_config);
        group
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn port_config(&self) -> Option<&PortConfig> {
        self.port_config.as_ref()
    }

    pub fn bindings(&self) -> &[RouteBinding] {
        &self.bindings
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Register a handler for an arbitrary method. Methods the routing
    /// engine cannot filter on (e.g. CONNECT) are recorded as defects and
    /// reported when the listener binds its routes.
    pub fn route<H, T>(&mut self, method: Method, path: &str, handler: H) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.push_route(method, path, handler, false)
    }

    /// Like [`route`](Self::route), but enforced by the group's
    /// authentication strategy.
    pub fn route_protected<H, T>(&mut self, method: Method, path: &str, handler: H) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.push_route(method, path, handler, true)
    }

    pub fn get<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::POST, path, handler)
    }

    pub fn get_protected<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.route_protected(Method::GET, path, handler)
    }

    pub fn post_protected<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.route_protected(Method::POST, path, handler)
    }

    fn push_route<H, T>(&mut self, method: Method, path: &str, handler: H, protected: bool) -> &mut Self
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        match MethodFilter::try_from(method.clone()) {
            Ok(filter) => self.bindings.push(RouteBinding {
                method,
                path: path.to_string(),
                handler: on(filter, handler),
                protected,
            }),
            Err(err) => self
                .defects
                .push(format!("route {method} {path}: {err}")),
        }
        self
    }

    /// Append a middleware to the chain. The first middleware declared
    /// ends up outermost when the router is built.
    pub fn middleware(&mut self, middleware: Middleware) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Set the authentication strategy unless one is already present.
    pub fn authentication(&mut self, strategy: impl AuthStrategy + 'static) -> &mut Self {
        if self.auth.is_none() {
            self.auth = Some(Arc::new(strategy));
        }
        self
    }

    /// Resolve the port-0 sentinel against the process default.
    pub fn resolve_port(&mut self, default_port: u16) {
        if self.port == 0 {
            self.port = default_port;
        }
    }

    /// Fold another group into this one:
    ///
    /// 1. bindings concatenate, this group's first;
    /// 2. the first non-null authentication strategy wins;
    /// 3. a port of 0 adopts the incoming group's port;
    /// 4. an unset port config takes the incoming one, and a set config
    ///    without TLS yields to an incoming TLS-enabled one;
    /// 5. middleware chains concatenate in merge order.
    pub fn merge(&mut self, other: RouteGroup) {
        let RouteGroup {
            port,
            bindings,
            auth,
            middleware,
            port_config,
            defects,
        } = other;

        self.bindings.extend(bindings);
        if self.auth.is_none() {
            self.auth = auth;
        }
        if self.port == 0 {
            self.port = port;
        }
        let take_incoming = match (&self.port_config, &port_config) {
            (None, Some(_)) => true,
            (Some(current), Some(incoming)) => {
                !current.ssl_enabled() && incoming.ssl_enabled()
            }
            _ => false,
        };
        if take_incoming {
            self.port_config = port_config;
        }
        self.middleware.extend(middleware);
        self.defects.extend(defects);
    }
}
