use crate::config::{KeySource, RateLimitConfig};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::HeaderName;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::IpAddr;
use thiserror::Error;

/// Resolves to the rate limit key, or [None] if the request should not be rate limited.
pub type InputFuture = Ready<Result<Option<String>, actix_web::Error>>;

/// Utility to create an input function that extracts the rate limit key according to a
/// [KeySource].
///
/// For [KeySource::Address] the key is the client's address with any port removed. For
/// [KeySource::Header] the key is the header value, with bytes outside printable ASCII escaped;
/// requests that do not carry the header, or carry it empty, are not rate limited at all.
pub struct InputFunctionBuilder {
    key_source: KeySource,
    real_ip: bool,
}

impl InputFunctionBuilder {
    pub fn new(key_source: KeySource) -> Self {
        Self {
            key_source,
            real_ip: false,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.key_source.clone())
    }

    /// Use the client's real IP rather than the connection peer for [KeySource::Address].
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    pub fn real_ip(mut self) -> Self {
        self.real_ip = true;
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> InputFuture + 'static {
        move |req| ready(self.key(req))
    }

    fn key(&self, req: &ServiceRequest) -> Result<Option<String>, actix_web::Error> {
        match &self.key_source {
            KeySource::Address => {
                let info = req.connection_info();
                let addr = if self.real_ip {
                    info.realip_remote_addr()
                } else {
                    info.peer_addr()
                };
                let addr = addr.ok_or(Error::MissingPeerAddress)?;
                Ok(Some(host(addr).to_owned()))
            }
            KeySource::Header(name) => Ok(header_key(req, name)),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to determine the client address")]
    MissingPeerAddress,
}

impl ResponseError for Error {}

// Printable ASCII values are used as is. Any other byte, and the quote and backslash characters,
// are escaped so that distinct values never share a key.
fn header_key(req: &ServiceRequest, name: &HeaderName) -> Option<String> {
    let value = req.headers().get(name)?;
    if value.is_empty() {
        return None;
    }
    Some(value.as_bytes().escape_ascii().to_string())
}

// Accepts "host", "host:port", "[v6]" and "[v6]:port"; bare IPv6 addresses are left alone.
fn host(addr: &str) -> &str {
    if addr.parse::<IpAddr>().is_ok() {
        return addr;
    }
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => addr,
    }
}
