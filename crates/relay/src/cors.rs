// CORS layer for the relay's HTTP routes and websocket upgrades.
//
// Origins come from `RelayConfig::cors_origins`: `"*"` allows any origin,
// anything else is read as a comma-separated allow list.

use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

pub fn cors_layer(origins: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .max_age(Duration::from_secs(3600));

    match origins.trim() {
        "" | "*" => base.allow_origin(AllowOrigin::any()),
        list => base.allow_origin(parse_origins(list)).allow_credentials(true),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::IntoResponse, routing::get, Router};
    use tower::ServiceExt;

    async fn ok_handler() -> impl IntoResponse {
        "ok"
    }

    fn test_app(origins: &str) -> Router {
        Router::new().route("/test", get(ok_handler)).layer(cors_layer(origins))
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/test")
            .header("origin", origin)
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .expect("preflight request should build")
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin_without_credentials() {
        let response = test_app("*")
            .oneshot(preflight("https://anything.example.com"))
            .await
            .expect("preflight should respond");

        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
        assert_eq!(response.headers()["access-control-max-age"], "3600");
    }

    #[tokio::test]
    async fn listed_origin_is_echoed() {
        let response = test_app("http://localhost:3000, https://flow.example")
            .oneshot(preflight("https://flow.example"))
            .await
            .expect("preflight should respond");

        assert_eq!(response.headers()["access-control-allow-origin"], "https://flow.example");
        assert_eq!(response.headers()["access-control-allow-credentials"], "true");
    }

    #[tokio::test]
    async fn unlisted_origin_gets_no_cors_headers() {
        let response = test_app("http://localhost:3000")
            .oneshot(preflight("https://evil.example.com"))
            .await
            .expect("preflight should respond");

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://a.com");
        assert_eq!(origins[1], "https://b.com");
    }
}
