//! HTTP Gateway
//!
//! `GET /healthz` and `POST /publish`, served by hyper over HTTP/1.1.

mod handlers;
mod middleware;
mod response;
mod server;


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Body;
use hyper::Request;

use crate::pool::ConnectionPool;

pub use handlers::{healthz, publish, route, PublishRequest};
pub use middleware::install_panic_hook;
pub use response::{decode_valid, empty, encode, error, HttpResponse, Problems, Validator};
pub use server::HttpServer;

/// Shared by every request
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ConnectionPool>,
    /// Ceiling on the whole handling of one request
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(pool: Arc<ConnectionPool>, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }
}

/// Run a request through the middleware stack and the router
pub async fn dispatch<B>(state: AppState, req: Request<B>) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    let method = req.method().clone();
    let uri = req.uri().clone();
    let limit = state.request_timeout;

    middleware::recover(middleware::access_log(
        &method,
        &uri,
        middleware::cors(&method, middleware::timeout(limit, route(state, req))),
    ))
    .await
}
