use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::Span;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();

    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Proxied and relayed paths are forwarded verbatim; a trailing slash
/// may be meaningful to the agent runtime behind the sandbox.
fn forwarded_verbatim(path: &str) -> bool {
    path.contains("/proxy/") || path.contains("/stream/")
}

pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();

    if forwarded_verbatim(uri.path()) {
        return next.run(req).await;
    }

    match uri.path().strip_suffix('/') {
        Some(path) if !path.is_empty() => {
            let target = match uri.query() {
                Some(query) => format!("{path}?{query}"),
                None => path.to_string(),
            };
            Redirect::permanent(&target).into_response()
        }
        _ => next.run(req).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_forwarding_paths_are_left_verbatim() {
        assert!(forwarded_verbatim("/api/sandboxes/sbx-1/proxy/v1/files/"));
        assert!(forwarded_verbatim("/api/sandboxes/sbx-1/stream/v1/events/"));
        assert!(!forwarded_verbatim("/api/sandboxes/"));
        assert!(!forwarded_verbatim("/health/"));
    }
}
