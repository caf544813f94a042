//! HTTP agent used for discovery and auth-style calls.
//!
//! The streaming RPC channel never goes through this path. The registry talks
//! to an [`HttpAgent`] so tests can script responses without a network.

use std::{collections::HashMap, fmt, time::Duration};

use crate::error::{ConfigInvalidSnafu, HttpRequestSnafu, Result};

/// HTTP method of an agent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`: parameters go to the query string.
    Get,
    /// `POST`: parameters go to a form body.
    Post,
    /// `PUT`: parameters go to a form body.
    Put,
    /// `DELETE`: parameters go to the query string.
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One outbound HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Query or form parameters, depending on the method.
    pub params: HashMap<String, String>,
    /// Per-call timeout.
    pub timeout: Duration,
}

/// Status and body of a completed HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// Returns true for status 200.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Executes HTTP calls on behalf of the SDK.
#[async_trait::async_trait]
pub trait HttpAgent: Send + Sync + fmt::Debug {
    /// Performs the call and returns whatever status the server answered with.
    ///
    /// # Errors
    ///
    /// Returns an error only when no response was received at all.
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpAgent`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestHttpAgent {
    client: reqwest::Client,
}

impl ReqwestHttpAgent {
    /// Creates an agent whose connections time out after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::ConfigInvalid`](crate::SdkError::ConfigInvalid) if the
    /// TLS backend cannot be initialized.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConfigInvalidSnafu { message: format!("http client: {e}") }.build())?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HttpAgent for ReqwestHttpAgent {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest { method, url, headers, params, timeout } = request;
        let builder = match method {
            HttpMethod::Get => self.client.get(&url).query(&params),
            HttpMethod::Delete => self.client.delete(&url).query(&params),
            HttpMethod::Post => self.client.post(&url).form(&params),
            HttpMethod::Put => self.client.put(&url).form(&params),
        };
        let builder = headers.iter().fold(builder.timeout(timeout), |b, (k, v)| b.header(k, v));

        let response = builder
            .send()
            .await
            .map_err(|e| HttpRequestSnafu { url: url.clone(), message: e.to_string() }.build())?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HttpRequestSnafu { url: url.clone(), message: e.to_string() }.build())?;
        Ok(HttpResponse { status, body })
    }
}
