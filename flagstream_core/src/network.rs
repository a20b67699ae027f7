//! Shared network provisioning: the header set sent on every request and
//! construction of the HTTP client used by the event sender.
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};

use crate::Result;

/// Identifies this SDK to the control plane.
pub const SDK_USER_AGENT: &str = "flagstream-rust-server-sdk";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Network options applied to outbound connections.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// PEM-encoded additional root certificate.
    pub ca_certificate: Option<Vec<u8>>,
    /// Proxy URL for HTTP traffic.
    pub proxy: Option<String>,
}

/// Headers attached to both the streaming handshake and event POSTs:
/// the raw env secret as authorization plus the SDK identifier.
pub fn default_headers(env_secret: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(env_secret) {
        headers.insert(AUTHORIZATION, value);
    }
    headers.insert(USER_AGENT, HeaderValue::from_static(SDK_USER_AGENT));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Build the HTTP client for event delivery, honoring the optional CA
/// certificate and proxy.
pub fn build_http_client(config: &NetworkConfig) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(pem) = &config.ca_certificate {
        let certificate = reqwest::Certificate::from_pem(pem)?;
        builder = builder.add_root_certificate(certificate);
    }
    if let Some(proxy) = &config.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}
