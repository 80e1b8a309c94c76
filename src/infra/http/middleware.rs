use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{application::error::ErrorReport, domain::language::Language};

const SOURCE: &str = "qrverse::http::response";

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// What the daily verse handler resolved, carried on the response for the
/// access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerseOutcome {
    pub language: Language,
    pub identity_known: bool,
    /// `None` when no verse was produced.
    pub is_new: Option<bool>,
}

impl VerseOutcome {
    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }

    fn identity(&self) -> &'static str {
        if self.identity_known {
            "known"
        } else {
            "bypass"
        }
    }
}

/// Tags each request with an id and echoes it in `x-request-id`. A non-blank
/// upstream `x-request-id` of reasonable length is reused.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    let outcome = response.extensions().get::<VerseOutcome>().cloned();
    let language = outcome.as_ref().map_or("-", |outcome| outcome.language.tag());
    let identity = outcome.as_ref().map_or("-", VerseOutcome::identity);

    if !status.is_client_error() && !status.is_server_error() {
        if let Some(is_new) = outcome.as_ref().and_then(|outcome| outcome.is_new) {
            info!(
                target = SOURCE,
                status = status.as_u16(),
                path = %path,
                elapsed_ms = elapsed_ms,
                language = language,
                identity = identity,
                is_new = is_new,
                request_id = %request_id,
                "daily verse served",
            );
        }
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = SOURCE,
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms = elapsed_ms,
            language = language,
            identity = identity,
            source = source,
            detail = %detail,
            chain = ?messages,
            request_id = %request_id,
            "request failed",
        );
    } else {
        warn!(
            target = SOURCE,
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms = elapsed_ms,
            language = language,
            identity = identity,
            source = source,
            detail = %detail,
            request_id = %request_id,
            "request rejected",
        );
    }

    response
}
