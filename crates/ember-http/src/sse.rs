//! Server-Sent Events framing, per the W3C event-stream format.

use crate::HeaderMap;

/// Comment frame sent on the ping interval to keep intermediaries from
/// timing the stream out.
pub const SSE_KEEPALIVE: &[u8] = b": ping\n\n";

/// Encodes one event: optional `id:`, optional `event:`, one `data:` line
/// per payload line, blank-line terminated.
pub fn encode_event(id: Option<&str>, event: Option<&str>, data: &[u8], out: &mut Vec<u8>) {
    if let Some(id) = id {
        out.extend_from_slice(b"id: ");
        out.extend_from_slice(strip_newlines(id).as_bytes());
        out.push(b'\n');
    }
    if let Some(event) = event {
        out.extend_from_slice(b"event: ");
        out.extend_from_slice(strip_newlines(event).as_bytes());
        out.push(b'\n');
    }
    for line in data.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out.push(b'\n');
}

/// Encodes the reconnection-delay hint.
pub fn encode_retry(ms: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(format!("retry: {ms}\n\n").as_bytes());
}

/// `Last-Event-ID` from a reconnecting client, if present.
pub fn parse_last_event_id(headers: &HeaderMap) -> Option<&str> {
    headers.get("last-event-id").map(str::trim).filter(|id| !id.is_empty())
}

fn strip_newlines(field: &str) -> String {
    field.replace(['\r', '\n'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_event() {
        let mut out = Vec::new();
        encode_event(Some("7"), Some("update"), b"hello", &mut out);
        assert_eq!(out, b"id: 7\nevent: update\ndata: hello\n\n");
    }

    #[test]
    fn data_only_event() {
        let mut out = Vec::new();
        encode_event(None, None, b"ping", &mut out);
        assert_eq!(out, b"data: ping\n\n");
    }

    #[test]
    fn multiline_data_splits_into_data_lines() {
        let mut out = Vec::new();
        encode_event(None, None, b"line1\nline2\r\nline3", &mut out);
        assert_eq!(out, b"data: line1\ndata: line2\ndata: line3\n\n");
    }

    #[test]
    fn field_injection_is_neutralised() {
        let mut out = Vec::new();
        encode_event(Some("1\nevent: forged"), None, b"x", &mut out);
        assert_eq!(out, b"id: 1event: forged\ndata: x\n\n");
    }

    #[test]
    fn retry_field() {
        let mut out = Vec::new();
        encode_retry(1500, &mut out);
        assert_eq!(out, b"retry: 1500\n\n");
    }

    #[test]
    fn last_event_id() {
        let mut headers = HeaderMap::new();
        headers.append("Last-Event-ID", " 42 ");
        assert_eq!(parse_last_event_id(&headers), Some("42"));
        assert_eq!(parse_last_event_id(&HeaderMap::new()), None);
    }
}
