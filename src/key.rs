//! Cache key derivation.
//!
//! Keys are `<prefix>:<sha256 hex>` strings computed over a canonical
//! rendering of the inputs. Function arguments are rendered through
//! `serde_json::Value`, whose object maps are ordered, so two semantically
//! equal argument sets produce the same key regardless of map iteration order.
//! Request keys sort the query parameters for the same reason.

use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Derives stable cache keys for function calls and requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyBuilder;

impl KeyBuilder {
    /// Key for calling the function registered as `identity` with `args`.
    pub fn function<A>(identity: &str, args: &A) -> Result<String, CacheError>
    where
        A: Serialize + ?Sized,
    {
        let value =
            serde_json::to_value(args).map_err(|err| CacheError::Codec(err.to_string()))?;
        Self::function_value(identity, &value)
    }

    /// Same as [`KeyBuilder::function`], for arguments already rendered to JSON.
    pub fn function_value(identity: &str, value: &serde_json::Value) -> Result<String, CacheError> {
        let canonical =
            serde_json::to_vec(value).map_err(|err| CacheError::Codec(err.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update([0u8]);
        hasher.update(&canonical);
        Ok(format!("{}:{}", identity, hex::encode(hasher.finalize())))
    }

    /// Key for a request, from its method, path and sorted query parameters.
    pub fn request(method: &Method, uri: &Uri) -> String {
        let path = match uri.path() {
            "" => "/",
            path => path,
        };

        let mut params: Vec<&str> = uri
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .collect();
        params.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.join("&").as_bytes());
        format!("response:{}:{}", method.as_str(), hex::encode(hasher.finalize()))
    }

    /// Folds the values of the `vary` headers in `headers` into `base`.
    ///
    /// Returns `base` unchanged when the response never declared a variance.
    /// A header missing from the request contributes an empty value.
    pub fn varied(base: &str, vary: &[String], headers: &HeaderMap) -> String {
        if vary.is_empty() {
            return base.to_owned();
        }

        let mut hasher = Sha256::new();
        for name in vary {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            for value in headers.get_all(name.as_str()) {
                hasher.update(value.as_bytes());
                hasher.update(b",");
            }
            hasher.update([0u8]);
        }
        format!("{}:{}", base, hex::encode(hasher.finalize()))
    }

    /// Key under which the learned `Vary` header names for `base` are kept.
    pub fn vary_record(base: &str) -> String {
        format!("vary:{base}")
    }
}

/// Normalizes a `Vary` header list: lowercase, sorted, deduplicated.
///
/// Returns `None` for `Vary: *`, which makes a response uncacheable.
pub fn parse_vary(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for value in headers.get_all(http::header::VARY) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for name in value.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name == "*" {
                return None;
            }
            if !name.is_empty() {
                names.push(name);
            }
        }
    }
    names.sort();
    names.dedup();
    Some(names)
}
