//! Dispatches admin HTTP requests to scheduler operations and translates
//! `SchedulerError` into a status code. Handlers never panic.

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use tracing::warn;

use crate::error::SchedulerError;
use crate::http::strip_prefix;

use super::state::AdminState;

type Body = Full<Bytes>;

fn respond(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("building a response from static parts never fails")
}

fn method_not_allowed() -> Response<Body> {
    respond(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn scheduler_error_status(e: &SchedulerError) -> StatusCode {
    match e {
        SchedulerError::Unregistered(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::NotAvailable => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::Specialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::StatusTransition | SchedulerError::StatusPending => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::Busying => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::Io(_) | SchedulerError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_str<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers().get(name)?.to_str().ok().map(str::to_string)
}

pub async fn route(state: Arc<AdminState>, req: Request<Incoming>) -> Response<Body> {
    let path = req.uri().path().to_string();

    if path == "/_/health" {
        return health(&state, &req);
    }
    if path.starts_with("/_/ready") || header_str(&req, "X-FE-PORT").is_some() {
        return ready(&state, &req, &path).await;
    }
    if path.starts_with("/_/serve") {
        return serve(&state, &req, &path).await;
    }
    if path.starts_with("/_/share") {
        return share(&state, &req, &path).await;
    }
    if path.starts_with("/_/unshare") {
        return unshare(&state, &req).await;
    }
    if path.starts_with("/_/swap") {
        return swap(&state, &req, &path).await;
    }
    if path.starts_with("/_/promote") {
        return promote(&state, &req).await;
    }

    respond(StatusCode::NOT_FOUND, "not found")
}

fn health(state: &AdminState, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::GET {
        return method_not_allowed();
    }
    if state.is_healthy() {
        respond(StatusCode::OK, "OK")
    } else {
        respond(StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

async fn ready(state: &AdminState, req: &Request<Incoming>, path: &str) -> Response<Body> {
    let port = header_str(req, "X-FE-PORT")
        .or_else(|| {
            let suffix = strip_prefix(path, "/_/ready/");
            (!suffix.is_empty()).then(|| suffix.to_string())
        })
        .and_then(|s| s.parse::<u16>().ok());

    let Some(port) = port else {
        return respond(StatusCode::BAD_REQUEST, "missing or invalid port");
    };

    match state.scheduler.register_fe(port) {
        Ok(()) => respond(StatusCode::OK, "OK"),
        Err(e) => {
            warn!(port, error = %e, "failed to register worker");
            respond(scheduler_error_status(&e), "registration failed")
        }
    }
}

fn function_name(req: &Request<Incoming>, path: &str, prefix: &str) -> Option<String> {
    if let Some(name) = header_str(req, "X-FUNCTION") {
        return Some(name);
    }
    let suffix = strip_prefix(path, prefix);
    (!suffix.is_empty()).then(|| suffix.trim_start_matches('/').to_string())
}

async fn serve(state: &AdminState, req: &Request<Incoming>, path: &str) -> Response<Body> {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    let Some(function) = function_name(req, path, "/_/serve/") else {
        return respond(StatusCode::BAD_REQUEST, "missing function name");
    };
    match state.scheduler.serve(function).await_result().await {
        Ok(()) => respond(StatusCode::OK, "OK"),
        Err(e) => respond(scheduler_error_status(&e), "serve failed"),
    }
}

async fn share(state: &AdminState, req: &Request<Incoming>, path: &str) -> Response<Body> {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    let Some(function) = function_name(req, path, "/_/share/") else {
        return respond(StatusCode::BAD_REQUEST, "missing function name");
    };
    match state.scheduler.share(function).await_result().await {
        Ok(()) => respond(StatusCode::OK, "OK"),
        Err(e) => respond(scheduler_error_status(&e), "share failed"),
    }
}

async fn unshare(state: &AdminState, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    match state.scheduler.unshare().await_result().await {
        Ok(()) => respond(StatusCode::OK, "OK"),
        Err(e) => respond(scheduler_error_status(&e), "unshare failed"),
    }
}

async fn swap(state: &AdminState, req: &Request<Incoming>, path: &str) -> Response<Body> {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    let function = function_name(req, path, "/_/swap/");
    match state.scheduler.swap(function).await_result().await {
        Ok(()) => respond(StatusCode::OK, "OK"),
        Err(e) => respond(scheduler_error_status(&e), "swap failed"),
    }
}

async fn promote(state: &AdminState, req: &Request<Incoming>) -> Response<Body> {
    if req.method() != Method::POST {
        return method_not_allowed();
    }
    match state.scheduler.promote().await_result().await {
        Ok(()) => respond(StatusCode::OK, "OK"),
        Err(e) => respond(scheduler_error_status(&e), "promote failed"),
    }
}
