//! JSON request and response helpers

use std::collections::BTreeMap;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

/// Response type produced by every handler
pub type HttpResponse = Response<Full<Bytes>>;

/// Field name -> problem description
pub type Problems = BTreeMap<String, String>;

/// A request body that can check itself after decoding
pub trait Validator {
    /// Problems with the value; empty when valid
    fn valid(&self) -> Problems;
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// Serialize `value` as the JSON body of a `status` response.
///
/// Serialization happens before the status is chosen, so an unencodable
/// value becomes a 500 instead of a truncated body.
pub fn encode<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => json(status, body),
        Err(e) => {
            error!("Could not encode response: {}", e);
            let message = e.to_string();
            let body = serde_json::to_vec(&ErrorBody { error: &message })
                .unwrap_or_else(|_| b"{\"error\":\"internal server error\"}".to_vec());
            json(StatusCode::INTERNAL_SERVER_ERROR, body)
        }
    }
}

/// `{"error": message}` with the given status
pub fn error(status: StatusCode, message: &str) -> HttpResponse {
    encode(status, &ErrorBody { error: message })
}

/// A response with no body
pub fn empty(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, body: Vec<u8>) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Decode a JSON body and validate it.
///
/// On failure the problems map always carries an `error` entry.
pub fn decode_valid<T>(body: &[u8]) -> Result<T, Problems>
where
    T: DeserializeOwned + Validator,
{
    let value: T = serde_json::from_slice(body).map_err(|e| {
        let mut problems = Problems::new();
        problems.insert("error".to_string(), format!("decode json: {}", e));
        problems
    })?;

    let mut problems = value.valid();
    if !problems.is_empty() {
        problems.insert("error".to_string(), "invalid request".to_string());
        return Err(problems);
    }
    Ok(value)
}
