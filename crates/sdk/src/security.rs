//! Request signing and security credentials.
//!
//! Signing is a pure function of its inputs so that the discovery path and the
//! streaming request path produce byte-identical signatures:
//!
//! ```text
//! resource  = tenant + "+" + group      (group present)
//!           = ""                        (otherwise)
//! signature = base64(HMAC-SHA1(secret, resource + "+" + timestamp))
//!           = base64(HMAC-SHA1(secret, timestamp))   (empty resource)
//! ```
//!
//! Access tokens come from a [`SecurityProvider`]. The SDK only reads the
//! current token; refreshing it is the provider's concern.

use std::{collections::HashMap, fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

/// Header carrying the request timestamp in milliseconds.
pub const TIMESTAMP_HEADER: &str = "Timestamp";
/// Header carrying the HMAC-SHA1 signature.
pub const SIGNATURE_HEADER: &str = "Spas-Signature";
/// Header carrying the access key.
pub const ACCESS_KEY_HEADER: &str = "Spas-AccessKey";
/// Parameter carrying the access token.
pub const ACCESS_TOKEN_PARAM: &str = "accessToken";

type HmacSha1 = Hmac<Sha1>;

/// Computes `base64(HMAC-SHA1(secret_key, data))`.
#[must_use]
pub fn hmac_sha1_base64(data: &str, secret_key: &str) -> String {
    // new_from_slice accepts keys of any length for HMAC
    let mut mac = match HmacSha1::new_from_slice(secret_key.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(data.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Signs `resource` at `timestamp` with `secret_key`.
///
/// An empty resource signs the timestamp alone.
#[must_use]
pub fn sign(resource: &str, timestamp: &str, secret_key: &str) -> String {
    if resource.is_empty() {
        hmac_sha1_base64(timestamp, secret_key)
    } else {
        hmac_sha1_base64(&format!("{resource}+{timestamp}"), secret_key)
    }
}

/// Builds the signing resource for a tenant/group pair.
#[must_use]
pub fn sign_resource(tenant: &str, group: &str) -> String {
    if group.is_empty() { String::new() } else { format!("{tenant}+{group}") }
}

/// Returns the `Timestamp` and `Spas-Signature` headers for one call.
#[must_use]
pub fn sign_headers(
    tenant: &str,
    group: &str,
    secret_key: &str,
    timestamp_ms: i64,
) -> HashMap<String, String> {
    let timestamp = timestamp_ms.to_string();
    let signature = sign(&sign_resource(tenant, group), &timestamp, secret_key);
    HashMap::from([
        (TIMESTAMP_HEADER.to_owned(), timestamp),
        (SIGNATURE_HEADER.to_owned(), signature),
    ])
}

/// Lightweight request token: lowercase hex MD5 of `timestamp + app_key`.
#[must_use]
pub fn request_token(timestamp: &str, app_key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(app_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn current_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Source of credentials injected into outbound calls.
///
/// Implementations must be cheap to call; they are consulted on every request.
pub trait SecurityProvider: Send + Sync + fmt::Debug {
    /// Returns the current access token, if logged in.
    fn access_token(&self) -> Option<String> {
        None
    }

    /// Returns the access key, if configured.
    fn access_key(&self) -> Option<String> {
        None
    }

    /// Returns the secret key, if configured.
    fn secret_key(&self) -> Option<String> {
        None
    }

    /// Adds the access token to `params` under `accessToken`.
    fn inject_access_token(&self, params: &mut HashMap<String, String>) {
        if let Some(token) = self.access_token().filter(|t| !t.is_empty()) {
            params.insert(ACCESS_TOKEN_PARAM.to_owned(), token);
        }
    }

    /// Adds the `Spas-AccessKey` header when an access key is configured.
    fn inject_access_key(&self, headers: &mut HashMap<String, String>) {
        if let Some(key) = self.access_key().filter(|k| !k.is_empty()) {
            headers.insert(ACCESS_KEY_HEADER.to_owned(), key);
        }
    }
}

/// Provider that never injects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSecurityProvider;

impl SecurityProvider for NoopSecurityProvider {}

/// Provider backed by static keys and a replaceable access token.
///
/// An external login task calls [`set_access_token`](Self::set_access_token)
/// whenever it obtains a new token; readers never block on that refresh.
#[derive(Debug, Default)]
pub struct StaticSecurityProvider {
    access_key: Option<String>,
    secret_key: Option<String>,
    token: ArcSwapOption<String>,
}

impl StaticSecurityProvider {
    /// Creates a provider from optional access/secret keys.
    #[must_use]
    pub fn new(access_key: Option<String>, secret_key: Option<String>) -> Self {
        Self { access_key, secret_key, token: ArcSwapOption::empty() }
    }

    /// Replaces the current access token.
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.token.store(Some(Arc::new(token.into())));
    }

    /// Drops the current access token.
    pub fn clear_access_token(&self) {
        self.token.store(None);
    }
}

impl SecurityProvider for StaticSecurityProvider {
    fn access_token(&self) -> Option<String> {
        self.token.load_full().map(|t| t.as_ref().clone())
    }

    fn access_key(&self) -> Option<String> {
        self.access_key.clone()
    }

    fn secret_key(&self) -> Option<String> {
        self.secret_key.clone()
    }
}
