//! Proxy configuration.
//!
//! [`ProxySettings`] describes how to reach a proxy and authenticate
//! against it; the [`ProxyClient`](crate::proxy::negotiator::ProxyClient)
//! state machine consumes it to drive the actual handshake.

use url::Url;
use zeroize::Zeroizing;

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// No proxy: connect directly.
    None,
    /// HTTP proxy (CONNECT tunnel).
    Http,
    /// SOCKS4 proxy.
    Socks4,
    /// SOCKS5 proxy.
    Socks5,
}

/// Proxy location and credentials.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g. `socks5://proxy.example:1080`).
    pub url: Url,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password (zeroized on drop).
    pub password: Option<Zeroizing<String>>,
}

impl ProxySettings {
    /// Create proxy settings from a URL string.
    pub fn new(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str).ok()?;
        Some(Self { url, username: None, password: None })
    }

    /// Add authentication credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Proxy kind from the URL scheme.
    pub fn kind(&self) -> ProxyKind {
        match self.url.scheme() {
            "socks5" | "socks5h" => ProxyKind::Socks5,
            "socks4" | "socks4a" => ProxyKind::Socks4,
            "http" | "https" => ProxyKind::Http,
            _ => ProxyKind::None,
        }
    }

    /// `Proxy-Authorization` header value for HTTP proxies.
    pub fn auth_header(&self) -> Option<String> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            use base64::{engine::general_purpose, Engine as _};
            let creds = format!("{}:{}", u, p.as_str());
            Some(format!("Basic {}", general_purpose::STANDARD.encode(creds)))
        } else {
            None
        }
    }

    /// `(username, password)` when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// Whether credentials are configured.
    pub fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Proxy host and port (scheme-default port when omitted).
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let host = self.url.host_str()?;
        let port = self.url.port().unwrap_or(match self.kind() {
            ProxyKind::Http => 8080,
            ProxyKind::Socks4 | ProxyKind::Socks5 => 1080,
            ProxyKind::None => return None,
        });
        Some((host, port))
    }
}

/// Builder for [`ProxySettings`].
#[derive(Default)]
pub struct ProxyBuilder {
    url: Option<Url>,
    username: Option<String>,
    password: Option<String>,
}

impl ProxyBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the proxy URL.
    pub fn url(mut self, url: &str) -> Self {
        self.url = Url::parse(url).ok();
        self
    }

    /// Set an HTTP CONNECT proxy.
    pub fn http(self, url: &str) -> Self {
        self.url(&format!("http://{}", url.trim_start_matches("http://")))
    }

    /// Set a SOCKS4 proxy.
    pub fn socks4(self, url: &str) -> Self {
        self.url(&format!("socks4://{}", url.trim_start_matches("socks4://")))
    }

    /// Set a SOCKS5 proxy.
    pub fn socks5(self, url: &str) -> Self {
        self.url(&format!("socks5://{}", url.trim_start_matches("socks5://")))
    }

    /// Set authentication.
    pub fn auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Build [`ProxySettings`].
    pub fn build(self) -> Option<ProxySettings> {
        Some(ProxySettings {
            url: self.url?,
            username: self.username,
            password: self.password.map(Zeroizing::new),
        })
    }
}
