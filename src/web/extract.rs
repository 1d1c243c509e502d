//! Client key extraction strategies.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::header::{HeaderName, FORWARDED};
use http::request::Parts;

use crate::admission::ClientKey;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Derives the [`ClientKey`] a request is attributed to.
///
/// Returning `None` sends the request to the shared
/// [`ClientKey::unknown`] bucket.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, parts: &Parts) -> Option<ClientKey>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Parts) -> Option<ClientKey> + Send + Sync,
{
    fn extract(&self, parts: &Parts) -> Option<ClientKey> {
        self(parts)
    }
}

/// Key by the socket peer address.
///
/// Requires the server to be run with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddr;

impl KeyExtractor for PeerAddr {
    fn extract(&self, parts: &Parts) -> Option<ClientKey> {
        peer_addr(parts).map(ClientKey::from)
    }
}

/// Key by the originating client reported by a reverse proxy.
///
/// Checks `X-Forwarded-For` (leftmost entry), then `X-Real-IP`, then the
/// `for=` parameter of `Forwarded`, then falls back to the peer address.
/// Only use this behind a proxy that overwrites these headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedFor;

impl KeyExtractor for ForwardedFor {
    fn extract(&self, parts: &Parts) -> Option<ClientKey> {
        let headers = &parts.headers;

        let forwarded_ip = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(parse_ip)
            .or_else(|| {
                headers
                    .get(X_REAL_IP)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_ip)
            })
            .or_else(|| {
                headers
                    .get(FORWARDED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(forwarded_for_param)
            });

        match forwarded_ip {
            Some(ip) => Some(ClientKey::from(ip)),
            None => peer_addr(parts).map(ClientKey::from),
        }
    }
}

/// Key by the value of a request header, e.g. an API key.
#[derive(Debug, Clone)]
pub struct HeaderKey(HeaderName);

impl HeaderKey {
    pub fn new(name: HeaderName) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &HeaderName {
        &self.0
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, parts: &Parts) -> Option<ClientKey> {
        parts
            .headers
            .get(&self.0)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ClientKey::new)
    }
}

fn peer_addr(parts: &Parts) -> Option<SocketAddr> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Accepts a bare IP or an `ip:port` / `[v6]:port` socket address.
fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"');
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
        .or_else(|| {
            value
                .strip_prefix('[')
                .and_then(|v| v.strip_suffix(']'))
                .and_then(|v| v.parse().ok())
        })
}

/// First `for=` node in an RFC 7239 `Forwarded` header.
fn forwarded_for_param(value: &str) -> Option<IpAddr> {
    value
        .split(',')
        .next()?
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("for"))
        .and_then(|(_, node)| parse_ip(node))
}
