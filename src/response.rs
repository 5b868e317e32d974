//! Stored forms of HTTP responses and requests.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::response::Parts;
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

/// A fully materialized response as kept in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Captures the response head and its drained body.
    pub fn from_parts(parts: &Parts, body: Bytes) -> Self {
        Self {
            status: parts.status.as_u16(),
            version: version_to_u8(parts.version),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect(),
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or_default()
    }

    /// Replays the entry as a complete, non-streaming response.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or_default();
        *response.version_mut() = version_from_u8(self.version);

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) {
                headers.append(name, value);
            }
        }

        response
    }
}

/// What a worker needs to replay a request out of process.
///
/// Only the headers the cache key varies on are kept, so the snapshot never
/// carries credentials the key does not already depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestSnapshot {
    /// Captures `req`, keeping only the headers named in `header_names`.
    pub fn from_request_with_headers<B>(req: &Request<B>, header_names: &[String]) -> Self {
        let headers = req
            .headers()
            .iter()
            .filter(|(name, _)| {
                header_names
                    .iter()
                    .any(|h| h.eq_ignore_ascii_case(name.as_str()))
            })
            .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
            .collect();

        Self {
            method: req.method().as_str().to_owned(),
            uri: req.uri().to_string(),
            headers,
        }
    }

    /// Rebuilds the request with an empty body.
    ///
    /// Returns `None` if the method or URI no longer parse.
    pub fn try_into_request<B: Default>(&self) -> Option<Request<B>> {
        let method = Method::from_bytes(self.method.as_bytes()).ok()?;
        let uri: Uri = self.uri.parse().ok()?;
        let mut builder = Request::builder().method(method).uri(uri);

        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                builder = builder.header(name, value);
            }
        }

        builder.body(B::default()).ok()
    }
}

fn version_to_u8(version: Version) -> u8 {
    match version {
        Version::HTTP_09 => 0,
        Version::HTTP_10 => 1,
        Version::HTTP_11 => 2,
        Version::HTTP_2 => 3,
        Version::HTTP_3 => 4,
        _ => 2,
    }
}

fn version_from_u8(value: u8) -> Version {
    match value {
        0 => Version::HTTP_09,
        1 => Version::HTTP_10,
        3 => Version::HTTP_2,
        4 => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}
