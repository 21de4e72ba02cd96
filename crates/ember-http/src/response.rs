use std::time::SystemTime;

use crate::HeaderMap;

pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Framing {
    /// Content-Length body, emitted in one piece.
    Simple,
    /// Transfer-Encoding: chunked, written incrementally.
    Streamed,
}

/// One response being built for one request.
///
/// The header section commits exactly once: the first body write (or an
/// explicit `finish`) freezes it, after which `write_header` returns false.
/// `Content-Length` and chunked framing are mutually exclusive by
/// construction: the commit picks one based on how the body is produced.
pub struct Response {
    status: u16,
    headers: HeaderMap,
    committed: bool,
    finished: bool,
    framing: Option<Framing>,
    keep_alive: bool,
    head_only: bool,
}

impl Response {
    pub fn new(keep_alive: bool, head_only: bool) -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            committed: false,
            finished: false,
            framing: None,
            keep_alive,
            head_only,
        }
    }

    #[inline]
    pub fn committed(&self) -> bool {
        self.committed
    }

    #[inline]
    pub fn finished(&self) -> bool {
        self.finished
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Pre-commit only; later calls are ignored.
    pub fn set_status(&mut self, status: u16) -> bool {
        if self.committed {
            return false;
        }
        self.status = status;
        true
    }

    /// Appends a header. Returns false (and does nothing) once the head was
    /// committed to the wire.
    pub fn write_header(&mut self, name: &str, value: &str) -> bool {
        if self.committed {
            return false;
        }
        self.headers.append(name, value);
        true
    }

    /// Simple mode: the whole body is known. Emits head plus body with
    /// `Content-Length`.
    pub fn send_simple(&mut self, body: &[u8]) -> Vec<u8> {
        debug_assert!(!self.committed, "simple responses commit exactly once");
        self.framing = Some(Framing::Simple);
        let mut wire = self.encode_head(Some(body.len() as u64));
        if !self.head_only {
            wire.extend_from_slice(body);
        }
        self.finished = true;
        wire
    }

    /// Streamed mode: commits the head with chunked framing and returns the
    /// wire bytes for it plus the first chunk, if any.
    pub fn stream(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut wire = if self.committed {
            Vec::new()
        } else {
            self.framing = Some(Framing::Streamed);
            self.encode_head(None)
        };
        if !chunk.is_empty() && !self.head_only {
            encode_chunk(chunk, &mut wire);
        }
        wire
    }

    /// Ends a streamed response (`0\r\n\r\n`), or emits an empty simple
    /// response when nothing was written yet.
    pub fn finish(&mut self, last_chunk: Option<&[u8]>) -> Vec<u8> {
        if self.finished {
            return Vec::new();
        }
        match self.framing {
            None => {
                let body = last_chunk.unwrap_or(b"");
                self.send_simple(body)
            }
            Some(Framing::Streamed) => {
                let mut wire = Vec::new();
                if let Some(chunk) = last_chunk
                    && !chunk.is_empty()
                    && !self.head_only
                {
                    encode_chunk(chunk, &mut wire);
                }
                if !self.head_only {
                    wire.extend_from_slice(b"0\r\n\r\n");
                }
                self.finished = true;
                wire
            }
            Some(Framing::Simple) => Vec::new(),
        }
    }

    /// Static-file mode: head with `Content-Length` for a payload that
    /// follows as a file packet (sendfile). Returns the head bytes.
    pub fn send_file_head(&mut self, len: u64) -> Vec<u8> {
        debug_assert!(!self.committed);
        self.framing = Some(Framing::Simple);
        let wire = self.encode_head(Some(len));
        self.finished = true;
        wire
    }

    /// Commits the head with no body framing at all: the payload (if any)
    /// is delimited by the connection. Used for SSE streams.
    pub fn send_raw_head(&mut self) -> Vec<u8> {
        debug_assert!(!self.committed);
        self.framing = Some(Framing::Simple);
        let wire = self.encode_head(None);
        self.finished = true;
        wire
    }

    /// 101 Switching Protocols head for WebSocket upgrades; no body framing.
    pub fn send_upgrade_head(&mut self) -> Vec<u8> {
        self.status = 101;
        self.send_raw_head()
    }

    fn encode_head(&mut self, content_length: Option<u64>) -> Vec<u8> {
        self.committed = true;

        let mut wire = Vec::with_capacity(256);
        wire.extend_from_slice(b"HTTP/1.1 ");
        wire.extend_from_slice(self.status.to_string().as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(status_reason(self.status).as_bytes());
        wire.extend_from_slice(b"\r\n");

        if !self.headers.contains("date") {
            self.headers.set("date", httpdate::fmt_http_date(SystemTime::now()));
        }
        match content_length {
            Some(len) if self.status != 101 && self.status != 304 && self.status != 204 => {
                self.headers.set("content-length", len.to_string());
            }
            None if self.framing == Some(Framing::Streamed) => {
                self.headers.set("transfer-encoding", "chunked");
            }
            _ => {}
        }
        if self.status != 101 {
            let value = if self.keep_alive { "keep-alive" } else { "close" };
            if !self.headers.contains("connection") {
                self.headers.set("connection", value);
            }
        }
        self.headers.write_to(&mut wire);
        wire.extend_from_slice(b"\r\n");
        wire
    }
}

fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Canned error response (400/413/431/500 and friends), connection-closing.
pub fn error_response(status: u16) -> Vec<u8> {
    let mut response = Response::new(false, false);
    response.set_status(status);
    response.write_header("content-type", "text/plain; charset=utf-8");
    let body = format!("{} {}\n", status, status_reason(status));
    response.send_simple(body.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(wire: &[u8]) -> String {
        String::from_utf8_lossy(wire).into_owned()
    }

    #[test]
    fn simple_response_has_content_length() {
        let mut response = Response::new(true, false);
        response.write_header("content-type", "text/plain");
        let wire = text(&response.send_simple(b"hello"));
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-length: 5\r\n"));
        assert!(wire.contains("connection: keep-alive\r\n"));
        assert!(!wire.contains("transfer-encoding"), "framings are mutually exclusive");
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn status_line_precedes_body() {
        let mut response = Response::new(true, false);
        let wire = response.send_simple(b"payload");
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        assert!(wire[..head_end].starts_with(b"HTTP/1.1 200 OK"));
        assert_eq!(&wire[head_end + 4..], b"payload");
    }

    #[test]
    fn header_commit_is_one_shot() {
        let mut response = Response::new(true, false);
        assert!(response.write_header("x-early", "1"));
        let _ = response.stream(b"chunk");
        assert!(!response.write_header("x-late", "2"));
        assert!(!response.set_status(500));
    }

    #[test]
    fn streamed_response_uses_chunked_framing() {
        let mut response = Response::new(true, false);
        let first = text(&response.stream(b"hello"));
        assert!(first.contains("transfer-encoding: chunked\r\n"));
        assert!(!first.contains("content-length"));
        assert!(first.ends_with("5\r\nhello\r\n"));

        let more = text(&response.stream(b"!"));
        assert_eq!(more, "1\r\n!\r\n");
        let end = text(&response.finish(None));
        assert_eq!(end, "0\r\n\r\n");
        assert!(response.finished());
    }

    #[test]
    fn finish_without_writes_is_an_empty_simple_response() {
        let mut response = Response::new(false, false);
        response.set_status(404);
        let wire = text(&response.finish(None));
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("content-length: 0\r\n"));
        assert!(wire.contains("connection: close\r\n"));
    }

    #[test]
    fn head_requests_omit_the_body() {
        let mut response = Response::new(true, true);
        let wire = text(&response.send_simple(b"invisible"));
        assert!(wire.contains("content-length: 9\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upgrade_head_has_no_framing_headers() {
        let mut response = Response::new(true, false);
        response.write_header("upgrade", "websocket");
        response.write_header("connection", "Upgrade");
        let wire = text(&response.send_upgrade_head());
        assert!(wire.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(!wire.contains("content-length"));
        assert!(!wire.contains("transfer-encoding"));
    }
}
