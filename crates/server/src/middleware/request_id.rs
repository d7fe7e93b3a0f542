//! Request ID middleware.
//!
//! Reuses an `x-request-id` set by an upstream proxy, otherwise generates a
//! UUID v4. The id is recorded on the request span, tagged on the Sentry
//! scope and echoed back in the response.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Span;
use uuid::Uuid;

/// The HTTP header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest inbound request id accepted before a fresh one is generated.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Ensure every request and response carries a request id.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let header = HeaderName::from_static(REQUEST_ID_HEADER);

    let request_id = request
        .headers()
        .get(&header)
        .and_then(|h| h.to_str().ok())
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map_or_else(|| Uuid::new_v4().to_string(), String::from);

    Span::current().record("request_id", request_id.as_str());

    sentry::configure_scope(|scope| {
        scope.set_tag("request_id", &request_id);
    });

    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &value {
        request.headers_mut().insert(header.clone(), value.clone());
    }

    let mut response = next.run(request).await;

    if let Some(value) = value {
        response.headers_mut().insert(header, value);
    }

    response
}
