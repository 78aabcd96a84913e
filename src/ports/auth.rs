use async_trait::async_trait;
use http::request::Parts;
use serde_json::Value;

/// Trait for authentication strategies carried by route groups.
///
/// A group's strategy is consulted only for bindings registered as
/// protected. Returning `None` rejects the request with a 401 envelope
/// before the handler runs; returning a principal makes it available to
/// the handler through the request extensions as [`Principal`].
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Authenticate a request from its head, returning the authenticated
    /// principal or `None`.
    async fn authenticate(&self, parts: &Parts) -> Option<Value>;
}

/// The authenticated principal inserted into request extensions by the
/// protection wrapper.
#[derive(Debug, Clone)]
pub struct Principal(pub Value);

#[cfg(test)]
mod tests {
    use super::*;

    struct HeaderToken;

    #[async_trait]
    impl AuthStrategy for HeaderToken {
        async fn authenticate(&self, parts: &Parts) -> Option<Value> {
            let token = parts.headers.get("x-api-token")?.to_str().ok()?;
            (token == "open-sesame").then(|| Value::String("user-1".to_string()))
        }
    }

    fn parts_with_token(token: Option<&str>) -> Parts {
        let mut builder = http::Request::builder().uri("/private");
        if let Some(token) = token {
            builder = builder.header("x-api-token", token);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[tokio::test]
    async fn accepts_the_right_token() {
        let strategy = HeaderToken;
        let principal = strategy.authenticate(&parts_with_token(Some("open-sesame"))).await;
        assert_eq!(principal, Some(Value::String("user-1".to_string())));
    }

    #[tokio::test]
    async fn rejects_missing_and_wrong_tokens() {
        let strategy = HeaderToken;
        assert!(strategy.authenticate(&parts_with_token(None)).await.is_none());
        assert!(
            strategy
                .authenticate(&parts_with_token(Some("wrong")))
                .await
                .is_none()
        );
    }
}
