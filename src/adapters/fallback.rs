//! Static-file fallback for unrouted requests.
//!
//! Every path no handler claimed is probed against the listener's
//! configured locations in declared order; the first location containing
//! the file (or a directory with an index page) serves it. Misses get
//! either the configured HTML error page or a plain-text 404.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::config::models::PortConfig;

const PLAIN_NOT_FOUND: &str = "404 page not found";

/// Requests for these extensions never receive the HTML error page.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "ico", "svg", "webp", "bmp"];

/// Serves static files from an ordered list of root directories, with an
/// optional HTML error page for browser-facing misses.
#[derive(Debug, Clone, Default)]
pub struct StaticFallback {
    locations: Vec<PathBuf>,
    page_404: Option<PathBuf>,
}

impl StaticFallback {
    pub fn from_config(config: &PortConfig) -> Self {
        Self {
            locations: config.locations.clone(),
            page_404: config.page_404.clone(),
        }
    }

    /// Serve the request from the first location containing its path, or
    /// produce the 404 response.
    pub async fn serve(&self, req: Request<Body>) -> Response {
        let path = req.uri().path().to_string();
        match self.locate(&path) {
            Some(root) => serve_from(root, req).await,
            None => self.not_found(req).await,
        }
    }

    /// First configured location containing the path, either as a file or
    /// as a directory with an index page. Parent-directory segments never
    /// match.
    fn locate(&self, path: &str) -> Option<&Path> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return None;
        }
        self.locations.iter().map(PathBuf::as_path).find(|root| {
            let candidate = root.join(relative);
            match std::fs::metadata(&candidate) {
                Ok(meta) if meta.is_file() => true,
                Ok(meta) if meta.is_dir() => candidate.join("index.html").is_file(),
                _ => false,
            }
        })
    }

    async fn not_found(&self, req: Request<Body>) -> Response {
        if wants_error_page(&req) {
            if let Some(page) = &self.page_404 {
                match tokio::fs::read(page).await {
                    Ok(bytes) => {
                        return (
                            StatusCode::NOT_FOUND,
                            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                            bytes,
                        )
                            .into_response();
                    }
                    Err(err) => {
                        tracing::warn!(
                            page = %page.display(),
                            error = %err,
                            "could not read configured 404 page"
                        );
                    }
                }
            }
        }
        (StatusCode::NOT_FOUND, PLAIN_NOT_FOUND).into_response()
    }
}

async fn serve_from(root: &Path, req: Request<Body>) -> Response {
    let serve_dir = ServeDir::new(root).append_index_html_on_directories(true);
    match serve_dir.oneshot(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            let body = Body::new(body.map_err(axum::Error::new));
            Response::from_parts(parts, body)
        }
        Err(err) => {
            tracing::error!(error = %err, "static file serving failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The HTML error page is only for interactive navigation: GET or HEAD,
/// an Accept header naming text/html, and a path that is not an image.
fn wants_error_page(req: &Request<Body>) -> bool {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return false;
    }
    let accepts_html = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    if !accepts_html {
        return false;
    }
    !has_image_extension(req.uri().path())
}

fn has_image_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn create_test_file(dir: &TempDir, path: &str, content: &str) -> std::io::Result<()> {
        let full_path = dir.path().join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full_path, content).await
    }

    fn fallback_over(dirs: &[&TempDir]) -> StaticFallback {
        StaticFallback {
            locations: dirs.iter().map(|dir| dir.path().to_path_buf()).collect(),
            page_404: None,
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn first_location_shadows_later_ones() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        create_test_file(&first, "site.css", "body { color: red }")
            .await
            .unwrap();
        create_test_file(&second, "site.css", "body { color: blue }")
            .await
            .unwrap();

        let fallback = fallback_over(&[&first, &second]);
        let response = fallback.serve(get("/site.css")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "body { color: red }");
    }

    #[tokio::test]
    async fn later_locations_fill_gaps() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        create_test_file(&second, "app.js", "console.log(1)")
            .await
            .unwrap();

        let fallback = fallback_over(&[&first, &second]);
        let response = fallback.serve(get("/app.js")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "console.log(1)");
    }

    #[tokio::test]
    async fn directories_serve_their_index_page() {
        let root = TempDir::new().unwrap();
        create_test_file(&root, "index.html", "<h1>home</h1>")
            .await
            .unwrap();

        let fallback = fallback_over(&[&root]);
        let response = fallback.serve(get("/")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<h1>home</h1>");
    }

    #[tokio::test]
    async fn misses_get_plain_not_found_without_a_page() {
        let root = TempDir::new().unwrap();
        let fallback = fallback_over(&[&root]);

        let response = fallback.serve(get("/missing.txt")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, PLAIN_NOT_FOUND);
    }

    #[tokio::test]
    async fn browser_misses_get_the_configured_error_page() {
        let root = TempDir::new().unwrap();
        create_test_file(&root, "404.html", "<h1>nope</h1>")
            .await
            .unwrap();
        let fallback = StaticFallback {
            locations: vec![root.path().to_path_buf()],
            page_404: Some(root.path().join("404.html")),
        };

        let request = Request::builder()
            .uri("/missing")
            .header(header::ACCEPT, "text/html,application/xhtml+xml")
            .body(Body::empty())
            .unwrap();
        let response = fallback.serve(request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "<h1>nope</h1>");
    }

    #[tokio::test]
    async fn image_misses_never_get_the_error_page() {
        let root = TempDir::new().unwrap();
        create_test_file(&root, "404.html", "<h1>nope</h1>")
            .await
            .unwrap();
        let fallback = StaticFallback {
            locations: vec![root.path().to_path_buf()],
            page_404: Some(root.path().join("404.html")),
        };

        let request = Request::builder()
            .uri("/missing.PNG")
            .header(header::ACCEPT, "text/html")
            .body(Body::empty())
            .unwrap();
        let response = fallback.serve(request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, PLAIN_NOT_FOUND);
    }

    #[tokio::test]
    async fn non_get_misses_never_get_the_error_page() {
        let root = TempDir::new().unwrap();
        create_test_file(&root, "404.html", "<h1>nope</h1>")
            .await
            .unwrap();
        let fallback = StaticFallback {
            locations: vec![root.path().to_path_buf()],
            page_404: Some(root.path().join("404.html")),
        };

        let request = Request::builder()
            .method(Method::POST)
            .uri("/missing")
            .header(header::ACCEPT, "text/html")
            .body(Body::empty())
            .unwrap();
        let response = fallback.serve(request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, PLAIN_NOT_FOUND);
    }

    #[tokio::test]
    async fn parent_directory_segments_never_match() {
        let root = TempDir::new().unwrap();
        create_test_file(&root, "secret.txt", "classified")
            .await
            .unwrap();
        create_test_file(&root, "inner/visible.txt", "data")
            .await
            .unwrap();

        let fallback = StaticFallback {
            locations: vec![root.path().join("inner")],
            page_404: None,
        };
        let response = fallback.serve(get("/../secret.txt")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
