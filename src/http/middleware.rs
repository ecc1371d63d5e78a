//! Request middleware
//!
//! Each layer wraps the future of the layer inside it. [`super::dispatch`]
//! stacks them as recover -> access log -> CORS -> timeout -> router.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use hyper::body::Body;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::{Method, StatusCode, Uri};
use tracing::{error, info};

use super::response::{self, HttpResponse};

/// Turn a panic inside `inner` into a 500
pub async fn recover<F>(inner: F) -> HttpResponse
where
    F: Future<Output = HttpResponse>,
{
    match AssertUnwindSafe(inner).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!("Panic recovered: {}", panic_message(&*panic));
            response::error(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Log panics with the backtrace of the panicking thread
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        error!("{}\nstack trace:\n{}", panic_info, backtrace);
    }));
}

/// Log one line per request
pub async fn access_log<F>(method: &Method, uri: &Uri, inner: F) -> HttpResponse
where
    F: Future<Output = HttpResponse>,
{
    let start = Instant::now();
    let response = inner.await;
    let size = response.body().size_hint().exact().unwrap_or(0);
    info!(
        "{} {} {} {}B {:?}",
        method,
        uri,
        response.status().as_u16(),
        size,
        start.elapsed()
    );
    response
}

/// Allow cross-origin callers and answer preflight requests
pub async fn cors<F>(method: &Method, inner: F) -> HttpResponse
where
    F: Future<Output = HttpResponse>,
{
    let mut response = if method == Method::OPTIONS {
        response::empty(StatusCode::OK)
    } else {
        inner.await
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

/// Answer 503 if `inner` takes longer than `limit`
pub async fn timeout<F>(limit: Duration, inner: F) -> HttpResponse
where
    F: Future<Output = HttpResponse>,
{
    match tokio::time::timeout(limit, inner).await {
        Ok(response) => response,
        Err(_) => response::error(StatusCode::SERVICE_UNAVAILABLE, "timeout"),
    }
}
