//! HTTP handlers.
//!
//! Parameters arrive as query strings or urlencoded forms; both are folded
//! into one [`RequestParameters`] map, with form fields taking precedence.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    extract::{Form, Query, State, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use sigbroker::{
    Dispatcher, ErrorKind, FireError, FireResponse, InboundRequest, RequestParameters,
    RetrieveError, error::ErrorBody,
};

/// Header carrying the caller's client certificates, base64 DER, comma separated.
pub const CLIENT_CERT_HEADER: &str = "x-client-cert";

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Shared application state
pub struct AppState {
    pub dispatcher: Dispatcher,
}

/// Protocol error rendered as JSON.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub Json<ErrorBody>);

impl From<FireError> for ApiError {
    fn from(err: FireError) -> Self {
        let status = match err.kind() {
            ErrorKind::Request => StatusCode::BAD_REQUEST,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::Infrastructure | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, Json(err.body()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

type Params = HashMap<String, String>;

fn merge(query: Params, form: Result<Form<Params>, FormRejection>) -> Result<Params, ApiError> {
    let Form(form) = form.map_err(|e| {
        tracing::warn!(error = %e, "unreadable form body");
        ApiError::from(FireError::ReadingParameters)
    })?;
    let mut params = query;
    params.extend(form);
    Ok(params)
}

fn inbound(headers: &HeaderMap, params: Params) -> InboundRequest {
    let mut request = InboundRequest::new(RequestParameters::new(params));
    if let Some(value) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        request = request.with_user_agent(value);
    }
    for value in headers.get_all(CLIENT_CERT_HEADER) {
        request = request.with_certificate(String::from_utf8_lossy(value.as_bytes()));
    }
    request
}

// ==================== Health Check ====================

pub async fn health(State(state): State<Arc<AppState>>) -> StatusCode {
    let Ok(context) = state.dispatcher.context().await else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    match context.health_check().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        },
    }
}

// ==================== Signature protocol ====================

async fn dispatch(state: &AppState, request: InboundRequest) -> Result<Response, ApiError> {
    let response = state.dispatcher.dispatch(request).await?;
    Ok(match &response {
        FireResponse::Signature(signature) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
            signature.clone(),
        )
            .into_response(),
        other => match other.json() {
            Some(json) => Json(json).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
    })
}

pub async fn fire_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    dispatch(&state, inbound(&headers, params)).await
}

pub async fn fire_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    form: Result<Form<Params>, FormRejection>,
) -> Result<Response, ApiError> {
    let params = merge(query, form)?;
    dispatch(&state, inbound(&headers, params)).await
}

// ==================== Choose origin ====================

async fn choose_origin(state: &AppState, request: InboundRequest) -> Result<Response, ApiError> {
    let chosen = state.dispatcher.choose_origin(request).await?;
    Ok(Json(chosen).into_response())
}

pub async fn choose_origin_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    choose_origin(&state, inbound(&headers, params)).await
}

pub async fn choose_origin_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<Params>,
    form: Result<Form<Params>, FormRejection>,
) -> Result<Response, ApiError> {
    let params = merge(query, form)?;
    choose_origin(&state, inbound(&headers, params)).await
}

// ==================== Document retrieval ====================

fn retrieval_response(result: Result<Bytes, RetrieveError>) -> Response {
    let cors = (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    let no_cache = (header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    match result {
        Ok(data) => (
            [
                cors,
                no_cache,
                (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            ],
            data,
        )
            .into_response(),
        // Pollers read the body; the status stays 200 and the line starts with "ERR-".
        Err(err) => (
            [cors, no_cache, (header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
            err.to_string(),
        )
            .into_response(),
    }
}

pub async fn retrieve_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Response {
    let params = RequestParameters::new(params);
    retrieval_response(state.dispatcher.retrieve(&params).await)
}

pub async fn retrieve_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<Params>,
    form: Result<Form<Params>, FormRejection>,
) -> Response {
    let params = match merge(query, form) {
        Ok(params) => RequestParameters::new(params),
        Err(_) => return retrieval_response(Err(RetrieveError::OperationNeeded)),
    };
    retrieval_response(state.dispatcher.retrieve(&params).await)
}
