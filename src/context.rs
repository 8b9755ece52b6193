//! Handshake snapshot handed to services when a session is accepted.

use std::net::SocketAddr;

use ahash::AHashMap;
use hyper::header::{HeaderMap, COOKIE};
use hyper::Uri;

/// Immutable view of the upgrade request a session was born from.
///
/// Captured once while the request is still on the wire; behaviors hold it
/// for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub uri: Uri,
    /// Raw request path, before registry normalization.
    pub path: String,
    pub headers: HeaderMap,
    pub query: AHashMap<String, String>,
    pub cookies: AHashMap<String, String>,
    /// User name established by the authentication gate, if any.
    pub identity: Option<String>,
    pub peer_addr: SocketAddr,
    pub secure: bool,
}

impl ConnectionContext {
    pub fn new(
        uri: Uri,
        headers: HeaderMap,
        identity: Option<String>,
        peer_addr: SocketAddr,
        secure: bool,
    ) -> Self {
        let path = uri.path().to_owned();
        let query = parse_query(uri.query());
        let cookies = parse_cookies(&headers);
        Self {
            uri,
            path,
            headers,
            query,
            cookies,
            identity,
            peer_addr,
            secure,
        }
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn parse_query(query: Option<&str>) -> AHashMap<String, String> {
    let mut map = AHashMap::new();
    let Some(q) = query else {
        return map;
    };
    for pair in q.split('&').filter(|p| !p.is_empty()) {
        match pair.find('=') {
            Some(idx) => {
                let key = crate::utils::percent_decode(&pair[..idx]);
                let value = crate::utils::percent_decode(&pair[idx + 1..]);
                map.insert(key, value);
            }
            None => {
                map.insert(crate::utils::percent_decode(pair), String::new());
            }
        }
    }
    map
}

fn parse_cookies(headers: &HeaderMap) -> AHashMap<String, String> {
    let mut map = AHashMap::new();
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some(idx) = pair.find('=') {
                map.insert(pair[..idx].to_owned(), pair[idx + 1..].to_owned());
            }
        }
    }
    map
}
