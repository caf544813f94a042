//! Normalized backend server addresses.

use std::fmt;

use crate::config::{
    DEFAULT_CONTEXT_PATH, DEFAULT_SCHEME, DEFAULT_SERVER_PORT, GRPC_PORT_OFFSET, ServerConfig,
};

/// One backend server, normalized at construction.
///
/// Equality is structural: two descriptors naming the same scheme, host,
/// ports and context path are the same server. The registry relies on this
/// to detect changes in discovered lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerDescriptor {
    scheme: String,
    host: String,
    port: u16,
    context_path: String,
    grpc_port: u16,
}

impl ServerDescriptor {
    /// Creates a descriptor with the default scheme and context path.
    ///
    /// The gRPC port defaults to `port + 1000`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_owned(),
            host: host.into().trim().to_owned(),
            port,
            context_path: DEFAULT_CONTEXT_PATH.to_owned(),
            grpc_port: default_grpc_port(port),
        }
    }

    /// Replaces the scheme; a blank value keeps the default.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        let scheme = scheme.into();
        if !scheme.trim().is_empty() {
            self.scheme = scheme.trim().to_owned();
        }
        self
    }

    /// Replaces the context path; a blank value keeps the default.
    #[must_use]
    pub fn with_context_path(mut self, context_path: impl Into<String>) -> Self {
        let context_path = context_path.into();
        if !context_path.trim().is_empty() {
            self.context_path = context_path.trim().to_owned();
        }
        self
    }

    /// Sets an explicit gRPC port.
    #[must_use]
    pub fn with_grpc_port(mut self, grpc_port: u16) -> Self {
        self.grpc_port = grpc_port;
        self
    }

    /// Returns the scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host, exactly as configured.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the HTTP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the context path.
    #[must_use]
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Returns the gRPC port.
    #[must_use]
    pub fn grpc_port(&self) -> u16 {
        self.grpc_port
    }

    /// Renders `scheme://host:port`.
    ///
    /// A scheme embedded in the host (`http://` or `https://`) wins over the
    /// configured scheme.
    #[must_use]
    pub fn address(&self) -> String {
        if has_scheme(&self.host) {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Renders the URL of an HTTP API path under this server's context path.
    #[must_use]
    pub fn api_url(&self, api: &str) -> String {
        format!("{}{}{}", self.address(), self.context_path, api)
    }

    /// Renders the gRPC endpoint, `scheme://host:grpc_port`.
    #[must_use]
    pub fn grpc_endpoint(&self) -> String {
        let (scheme, host) = self.split_host();
        format!("{scheme}://{host}:{}", self.grpc_port)
    }

    fn split_host(&self) -> (&str, &str) {
        for scheme in ["https", "http"] {
            if let Some(rest) = self.host.strip_prefix(scheme).and_then(|r| r.strip_prefix("://")) {
                return (scheme, rest);
            }
        }
        (&self.scheme, &self.host)
    }
}

impl From<&ServerConfig> for ServerDescriptor {
    fn from(config: &ServerConfig) -> Self {
        let descriptor = Self::new(config.ip_addr.clone(), config.port)
            .with_scheme(config.scheme.clone())
            .with_context_path(config.context_path.clone());
        match config.grpc_port {
            Some(port) => descriptor.with_grpc_port(port),
            None => descriptor,
        }
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

fn has_scheme(host: &str) -> bool {
    host.starts_with("http://") || host.starts_with("https://")
}

fn default_grpc_port(port: u16) -> u16 {
    port.checked_add(GRPC_PORT_OFFSET).unwrap_or(DEFAULT_SERVER_PORT + GRPC_PORT_OFFSET)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn address_uses_configured_scheme() {
        let server = ServerDescriptor::new("console.example.io", 80).with_scheme("https");
        assert_eq!(server.address(), "https://console.example.io:80");
    }

    #[test]
    fn address_prefers_scheme_embedded_in_host() {
        let server = ServerDescriptor::new("http://console.example.io", 80);
        assert_eq!(server.address(), "http://console.example.io:80");

        let server = ServerDescriptor::new("http://console.example.io", 80).with_scheme("https");
        assert_eq!(server.address(), "http://console.example.io:80");
    }

    #[test]
    fn defaults_are_applied_at_creation() {
        let server = ServerDescriptor::new(" 10.0.0.1 ", 8848).with_scheme("").with_context_path(" ");
        assert_eq!(server.host(), "10.0.0.1");
        assert_eq!(server.scheme(), "http");
        assert_eq!(server.context_path(), "/xgrpc");
        assert_eq!(server.grpc_port(), 9848);
    }

    #[test]
    fn api_url_appends_context_path() {
        let server = ServerDescriptor::new("10.0.0.1", 8848);
        assert_eq!(server.api_url("/v1/cs/configs"), "http://10.0.0.1:8848/xgrpc/v1/cs/configs");
    }

    #[test]
    fn grpc_endpoint_strips_embedded_scheme() {
        let server = ServerDescriptor::new("https://secure.example.io", 443).with_grpc_port(9443);
        assert_eq!(server.grpc_endpoint(), "https://secure.example.io:9443");

        let server = ServerDescriptor::new("10.0.0.1", 8848);
        assert_eq!(server.grpc_endpoint(), "http://10.0.0.1:9848");
    }

    #[test]
    fn grpc_port_offset_saturates_to_default() {
        let server = ServerDescriptor::new("10.0.0.1", 65000);
        assert_eq!(server.grpc_port(), 9848);
    }

    #[test]
    fn structural_equality() {
        let a = ServerDescriptor::new("10.0.0.1", 8848);
        let b = ServerDescriptor::new("10.0.0.1", 8848);
        let c = ServerDescriptor::new("10.0.0.1", 8849);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn from_server_config() {
        let config = ServerConfig::builder()
            .ip_addr("127.0.0.1")
            .port(8848)
            .context_path("/custom")
            .grpc_port(9999)
            .build()
            .unwrap();
        let server = ServerDescriptor::from(&config);
        assert_eq!(server.context_path(), "/custom");
        assert_eq!(server.grpc_port(), 9999);
        assert_eq!(server.to_string(), "http://127.0.0.1:8848");
    }
}
