//! Baseline middleware carried by every listener engine.
//!
//! Each engine gets the same stack regardless of its route groups:
//! request IDs, request timing logs, mirror-origin CORS with credentials,
//! and panic recovery. Group-declared middleware runs inside this stack,
//! closest to the handlers.

use std::any::Any;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::Request,
    http::{HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::core::reply::Message;
use crate::utils::supervise::panic_message;

const CORS_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Generate a per-request UUID and expose it via tracing plus `X-Request-ID`.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();

    let span = tracing::info_span!("request", request_id = %request_id);
    let _enter = span.enter();

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", header_value);
    }

    response
}

/// Log each completed request with its latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;

    tracing::info!(
        %method,
        %uri,
        status = %response.status(),
        elapsed = ?start.elapsed(),
        "request completed"
    );

    response
}

/// Mirror-origin CORS with credentials. The caller's origin is echoed
/// instead of a wildcard so credentialed requests stay allowed.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .max_age(CORS_MAX_AGE)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_message(&panic);
    tracing::error!(payload = %message, "request handler panicked");
    Message::error("internal server error").into_response()
}

/// Wrap a fully routed engine in the baseline stack. Request flow is
/// request id, then timing, then CORS, then panic recovery, then the
/// group middleware and handlers.
pub fn default_stack(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors_layer())
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{StatusCode, header},
        routing::get,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn ok_router() -> Router {
        Router::new().route("/", get(|| async { "ok" }))
    }

    #[tokio::test]
    async fn requests_are_tagged_with_an_id() {
        let app = ok_router().layer(middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let request_id = response
            .headers()
            .get("X-Request-ID")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn cors_echoes_the_request_origin_with_credentials() {
        let app = ok_router().layer(cors_layer());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(header::ORIGIN, "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn handler_panics_become_enveloped_errors() {
        async fn explode() {
            panic!("kaboom");
        }
        let app = default_stack(Router::new().route("/explode", get(explode)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/explode")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let message: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(message.code, 500);
        assert_eq!(message.msg, "internal server error");
    }
}
