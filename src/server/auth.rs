//! Producer admission
//!
//! Viewers are never authenticated. Producers may be required to present a
//! shared secret, either as the `key` query parameter or the `x-key` header.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::HeaderMap;

use crate::registry::ChannelId;

/// Query parameter carrying the producer key
pub const KEY_PARAM: &str = "key";

/// Header carrying the producer key
pub const KEY_HEADER: &str = "x-key";

/// What a producer presented when connecting
#[derive(Debug, Clone)]
pub struct AuthRequest<'a> {
    pub channel: &'a ChannelId,
    pub peer_addr: Option<SocketAddr>,
    pub query: &'a HashMap<String, String>,
    pub headers: &'a HeaderMap,
}

impl<'a> AuthRequest<'a> {
    /// Key from the query string, falling back to the header
    pub fn presented_key(&self) -> Option<&'a str> {
        self.query
            .get(KEY_PARAM)
            .map(String::as_str)
            .or_else(|| self.headers.get(KEY_HEADER).and_then(|v| v.to_str().ok()))
    }
}

/// Admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Accept,
    Reject(String),
}

impl AuthResult {
    pub fn is_accept(&self) -> bool {
        matches!(self, AuthResult::Accept)
    }
}

/// Decides whether a producer may publish to a channel
pub trait AuthPolicy: Send + Sync + 'static {
    fn authorize(&self, request: &AuthRequest<'_>) -> AuthResult;
}

/// Admits every producer
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AuthPolicy for AllowAll {
    fn authorize(&self, _request: &AuthRequest<'_>) -> AuthResult {
        AuthResult::Accept
    }
}

/// Admits producers presenting one shared secret
#[derive(Clone)]
pub struct SharedSecret {
    key: String,
}

impl SharedSecret {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl AuthPolicy for SharedSecret {
    fn authorize(&self, request: &AuthRequest<'_>) -> AuthResult {
        match request.presented_key() {
            Some(key) if constant_time_eq(key.as_bytes(), self.key.as_bytes()) => {
                AuthResult::Accept
            }
            Some(_) => AuthResult::Reject("invalid key".into()),
            None => AuthResult::Reject("missing key".into()),
        }
    }
}

/// Compare without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
