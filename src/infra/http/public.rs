use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::CACHE_CONTROL},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    application::{
        daily_verse::DailyVerseService, error::HttpError, identity::IdentityResolver,
    },
    domain::language::Language,
};

use super::middleware::{VerseOutcome, log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub daily_verse: Arc<DailyVerseService>,
    pub identity: Arc<IdentityResolver>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/{lang}/daily-verse", get(daily_verse))
        .route("/_health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn daily_verse(
    State(state): State<HttpState>,
    Path(lang): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut response = match lang.parse::<Language>() {
        Ok(language) => {
            let identity = state.identity.resolve(&headers);
            let result = state.daily_verse.daily_verse(&identity, language).await;
            let outcome = VerseOutcome {
                language,
                identity_known: identity.is_known(),
                is_new: result.as_ref().ok().map(|daily| daily.is_new),
            };
            let mut response = match result {
                Ok(daily) => Json(daily).into_response(),
                Err(err) => HttpError::from(err).into_response(),
            };
            outcome.attach(&mut response);
            response
        }
        Err(err) => HttpError::from(err).into_response(),
    };
    set_no_store(&mut response);
    response
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// The body depends on who asks, so shared caches must not keep it.
fn set_no_store(response: &mut Response) {
    let value = HeaderValue::from_static("no-store");
    response.headers_mut().insert(CACHE_CONTROL, value);
}
