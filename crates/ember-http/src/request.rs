use ember_utils::percent_decode_in_place;

use crate::{Body, CookieJar, HeaderMap};

/// Where a parsed request routes next.
#[derive(Debug, PartialEq, Eq)]
pub enum Upgrade {
    None,
    /// `Upgrade: websocket` with a valid key and a `Connection: Upgrade`
    /// token.
    WebSocket { key: String },
    /// `Accept: text/event-stream`.
    Sse,
}

/// One parsed HTTP/1.1 request, body fully buffered.
#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    /// Raw request-target path, percent-encoded as received.
    pub raw_path: String,
    /// Decoded path used for routing and static file lookup.
    pub path: String,
    pub query: Option<String>,
    /// Minor HTTP version: 0 or 1.
    pub version_minor: u8,
    pub headers: HeaderMap,
    pub body: Body,
    cookies: CookieJar,
}

impl Request {
    pub fn new(method: String, target: &str, version_minor: u8, headers: HeaderMap) -> Self {
        let (raw_path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        // Path decoding is %XX-only: `+` is a space in queries, not in
        // path segments.
        let mut path_bytes = raw_path.clone().into_bytes();
        let decoded_len = percent_decode_in_place(&mut path_bytes);
        path_bytes.truncate(decoded_len);
        let path = String::from_utf8_lossy(&path_bytes).into_owned();
        Self {
            method,
            raw_path,
            path,
            query,
            version_minor,
            headers,
            body: Body::default(),
            cookies: CookieJar::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookie(&mut self, name: &str) -> Option<&str> {
        self.cookies.get(&self.headers, name)
    }

    /// Decoded query pairs, in order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = &self.query else { return Vec::new() };
        form_urlencoded::parse(query.as_bytes()).into_owned().collect()
    }

    /// Keep-alive policy: on by default for 1.1, opt-in for 1.0, and a
    /// `Connection: close` always wins.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        if self.version_minor == 0 {
            return self.headers.has_token("connection", "keep-alive");
        }
        true
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Upgrade detection per the listener's routing rules.
    pub fn upgrade(&self) -> Upgrade {
        if self.headers.get("upgrade").is_some_and(|u| u.eq_ignore_ascii_case("websocket"))
            && self.headers.has_token("connection", "upgrade")
            && let Some(key) = self.headers.get("sec-websocket-key")
            && ws_key_shape(key)
        {
            return Upgrade::WebSocket { key: key.trim().to_string() };
        }
        if self
            .headers
            .get("accept")
            .is_some_and(|a| a.split(',').any(|m| m.trim().starts_with("text/event-stream")))
        {
            return Upgrade::Sse;
        }
        Upgrade::None
    }
}

/// Cheap shape check; the WebSocket crate does the real base64 validation
/// during the handshake.
fn ws_key_shape(key: &str) -> bool {
    let key = key.trim();
    (20..=28).contains(&key.len()) && key.ends_with("==")
}
