use std::collections::HashMap;

/// Header multimap: keys are ASCII-lowercased on store, values kept
/// verbatim, insertion order preserved, repeated names preserved as
/// multiple entries.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Replaces every entry of `name` with one value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let lower = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != lower);
        self.entries.push((lower, value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries.iter().find(|(n, _)| *n == lower).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let lower = name.to_ascii_lowercase();
        self.entries.iter().filter(move |(n, _)| *n == lower).map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when any value of `name` lists `token` in its comma-separated
    /// form, case-insensitive (`Connection: keep-alive, Upgrade`).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serialises as wire header lines (no terminating blank line).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Cookie map, parsed lazily from the `Cookie` header on first access.
#[derive(Default, Debug)]
pub struct CookieJar {
    parsed: Option<HashMap<String, String>>,
}

impl CookieJar {
    pub fn get<'a>(&'a mut self, headers: &HeaderMap, name: &str) -> Option<&'a str> {
        let map = self.parsed.get_or_insert_with(|| parse_cookies(headers));
        map.get(name).map(String::as_str)
    }

    pub fn all<'a>(&'a mut self, headers: &HeaderMap) -> &'a HashMap<String, String> {
        self.parsed.get_or_insert_with(|| parse_cookies(headers))
    }
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for value in headers.get_all("cookie") {
        for pair in value.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                map.entry(name.trim().to_string()).or_insert_with(|| value.trim().to_string());
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup_preserves_values() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Type", "Text/HTML");
        assert_eq!(headers.get("content-type"), Some("Text/HTML"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("Text/HTML"));
    }

    #[test]
    fn multi_value_order_preserved() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("X-Other", "x");
        headers.append("Set-Cookie", "b=2");
        let all: Vec<&str> = headers.get_all("set-cookie").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
        assert_eq!(headers.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn serialise_then_reparse_preserves_order_and_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append("Accept", "text/html");
        headers.append("Via", "a");
        headers.append("Via", "b");

        let mut wire = Vec::new();
        headers.write_to(&mut wire);

        let mut reparsed = HeaderMap::new();
        for line in std::str::from_utf8(&wire).unwrap().split("\r\n").filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once(": ").unwrap();
            reparsed.append(name, value);
        }
        assert_eq!(headers, reparsed);
    }

    #[test]
    fn connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", "keep-alive, Upgrade");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("connection", "keep-alive"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn cookies_parse_lazily() {
        let mut headers = HeaderMap::new();
        headers.append("Cookie", "sid=abc123; theme=dark");
        let mut jar = CookieJar::default();
        assert_eq!(jar.get(&headers, "sid"), Some("abc123"));
        assert_eq!(jar.get(&headers, "theme"), Some("dark"));
        assert_eq!(jar.get(&headers, "missing"), None);
    }
}
