use tracing::trace;

use crate::{Body, HeaderMap, Request};

const MAX_PARSED_HEADERS: usize = 96;

/// Per-listener parser limits.
#[derive(Clone, Copy, Debug)]
pub struct HttpLimits {
    /// Request-line and per-header-line byte cap.
    pub max_line_len: usize,
    /// Total head (request line + headers) byte cap.
    pub max_header_size: usize,
    pub max_header_count: usize,
    pub max_body_size: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_line_len: 8 * 1024,
            max_header_size: 32 * 1024,
            max_header_count: 64,
            max_body_size: 32 * 1024 * 1024,
        }
    }
}

/// Parse failure, carrying the HTTP status the connection replies with
/// before closing.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request")]
    Malformed,
    #[error("request URI too long")]
    UriTooLong,
    #[error("header section too large")]
    HeadersTooLarge,
    #[error("body exceeds the configured limit")]
    BodyTooLarge,
    #[error("unsupported transfer encoding")]
    UnsupportedEncoding,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
}

impl ParseError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Malformed => 400,
            Self::UriTooLong => 414,
            Self::HeadersTooLarge => 431,
            Self::BodyTooLarge => 413,
            Self::UnsupportedEncoding => 501,
            Self::UnsupportedVersion => 505,
        }
    }
}

enum ChunkPhase {
    /// Reading a `<hex-size>\r\n` line.
    Size,
    /// Reading `remaining` payload bytes of the current chunk.
    Data { remaining: usize },
    /// Reading the CRLF that terminates a chunk's data.
    DataEnd,
    /// Reading (and discarding) trailer lines after the zero chunk.
    Trailers,
}

enum State {
    Head,
    FixedBody { request: Box<Request>, body: Vec<u8>, remaining: usize },
    ChunkedBody { request: Box<Request>, body: Vec<u8>, phase: ChunkPhase },
}

/// Incremental HTTP/1.1 request parser.
///
/// Feed the connection's unconsumed inbound buffer through [`advance`];
/// complete requests pop out with their body fully buffered, and consumed
/// bytes are drained from the buffer in place. One parser instance serves
/// the whole keep-alive session.
///
/// [`advance`]: Self::advance
pub struct RequestParser {
    limits: HttpLimits,
    state: State,
}

impl RequestParser {
    pub fn new(limits: HttpLimits) -> Self {
        Self { limits, state: State::Head }
    }

    /// Consumes as much of `buf` as possible. Returns a complete request,
    /// or `None` when more bytes are needed.
    pub fn advance(&mut self, buf: &mut Vec<u8>) -> Result<Option<Request>, ParseError> {
        loop {
            match std::mem::replace(&mut self.state, State::Head) {
                State::Head => match self.parse_head(buf)? {
                    HeadOutcome::Incomplete => return Ok(None),
                    HeadOutcome::NoBody(request) => return Ok(Some(*request)),
                    HeadOutcome::Fixed(request, len) => {
                        self.state = State::FixedBody {
                            request,
                            body: Vec::with_capacity(len.min(64 * 1024)),
                            remaining: len,
                        };
                    }
                    HeadOutcome::Chunked(request) => {
                        self.state = State::ChunkedBody {
                            request,
                            body: Vec::new(),
                            phase: ChunkPhase::Size,
                        };
                    }
                },

                State::FixedBody { mut request, mut body, remaining } => {
                    let take = remaining.min(buf.len());
                    body.extend_from_slice(&buf[..take]);
                    buf.drain(..take);
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = State::FixedBody { request, body, remaining };
                        return Ok(None);
                    }
                    request.body = Body::new(body);
                    return Ok(Some(*request));
                }

                State::ChunkedBody { mut request, mut body, mut phase } => {
                    match drive_chunked(buf, &mut body, &mut phase, self.limits.max_body_size)? {
                        ChunkOutcome::NeedMore => {
                            self.state = State::ChunkedBody { request, body, phase };
                            return Ok(None);
                        }
                        ChunkOutcome::Done => {
                            request.body = Body::new(body);
                            return Ok(Some(*request));
                        }
                    }
                }
            }
        }
    }

    fn parse_head(&self, buf: &mut Vec<u8>) -> Result<HeadOutcome, ParseError> {
        let (request, head_len) = {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
            let mut parsed = httparse::Request::new(&mut header_storage);

            let status = parsed.parse(buf).map_err(|_| ParseError::Malformed)?;
            let head_len = match status {
                httparse::Status::Complete(n) => n,
                httparse::Status::Partial => {
                    self.check_partial_limits(buf)?;
                    return Ok(HeadOutcome::Incomplete);
                }
            };

            if head_len > self.limits.max_header_size {
                return Err(ParseError::HeadersTooLarge);
            }
            let request_line_len =
                buf.iter().position(|b| *b == b'\n').map_or(head_len, |at| at + 1);
            if request_line_len > self.limits.max_line_len + 2 {
                return Err(ParseError::UriTooLong);
            }
            if parsed.headers.len() > self.limits.max_header_count {
                return Err(ParseError::HeadersTooLarge);
            }

            let method = parsed.method.ok_or(ParseError::Malformed)?.to_string();
            let target = parsed.path.ok_or(ParseError::Malformed)?;
            let version_minor = match parsed.version {
                Some(v @ (0 | 1)) => v,
                Some(_) => return Err(ParseError::UnsupportedVersion),
                None => return Err(ParseError::Malformed),
            };

            let mut headers = HeaderMap::new();
            for header in parsed.headers.iter() {
                if header.name.len() + header.value.len() + 4 > self.limits.max_line_len {
                    return Err(ParseError::HeadersTooLarge);
                }
                let value =
                    std::str::from_utf8(header.value).map_err(|_| ParseError::Malformed)?;
                headers.append(header.name, value);
            }

            (Box::new(Request::new(method, target, version_minor, headers)), head_len)
        };
        trace!(method = %request.method, path = %request.path, "http: head parsed");
        buf.drain(..head_len);

        if request.headers.has_token("transfer-encoding", "chunked") {
            return Ok(HeadOutcome::Chunked(request));
        }
        if request.headers.get("transfer-encoding").is_some_and(|v| !v.trim().is_empty()) {
            // Anything other than plain chunked is not understood.
            return Err(ParseError::UnsupportedEncoding);
        }
        match request.headers.get("content-length") {
            Some(value) => {
                let len: usize = value.trim().parse().map_err(|_| ParseError::Malformed)?;
                if len > self.limits.max_body_size {
                    // Fails before any handler runs.
                    return Err(ParseError::BodyTooLarge);
                }
                if len == 0 {
                    Ok(HeadOutcome::NoBody(request))
                } else {
                    Ok(HeadOutcome::Fixed(request, len))
                }
            }
            None => Ok(HeadOutcome::NoBody(request)),
        }
    }

    /// Bounds an incomplete head: an overlong first line fails with 414,
    /// an overlong header section with 431, before more bytes are buffered.
    fn check_partial_limits(&self, buf: &[u8]) -> Result<(), ParseError> {
        match buf.iter().position(|b| *b == b'\n') {
            None if buf.len() > self.limits.max_line_len + 2 => {
                return Err(ParseError::UriTooLong);
            }
            Some(at) if at + 1 > self.limits.max_line_len + 2 => {
                return Err(ParseError::UriTooLong);
            }
            _ => {}
        }
        if buf.len() > self.limits.max_header_size {
            return Err(ParseError::HeadersTooLarge);
        }
        Ok(())
    }
}

enum HeadOutcome {
    Incomplete,
    NoBody(Box<Request>),
    Fixed(Box<Request>, usize),
    Chunked(Box<Request>),
}

enum ChunkOutcome {
    NeedMore,
    Done,
}

fn drive_chunked(
    buf: &mut Vec<u8>,
    body: &mut Vec<u8>,
    phase: &mut ChunkPhase,
    max_body: usize,
) -> Result<ChunkOutcome, ParseError> {
    loop {
        match phase {
            ChunkPhase::Size => {
                let Some(line_end) = find_crlf(buf) else {
                    if buf.len() > 18 {
                        // A hex size line can't legitimately be this long.
                        return Err(ParseError::Malformed);
                    }
                    return Ok(ChunkOutcome::NeedMore);
                };
                let line = &buf[..line_end];
                let size_part = line.split(|b| *b == b';').next().unwrap_or(line);
                let text = std::str::from_utf8(size_part).map_err(|_| ParseError::Malformed)?;
                let size =
                    usize::from_str_radix(text.trim(), 16).map_err(|_| ParseError::Malformed)?;
                buf.drain(..line_end + 2);
                if body.len() + size > max_body {
                    return Err(ParseError::BodyTooLarge);
                }
                *phase =
                    if size == 0 { ChunkPhase::Trailers } else { ChunkPhase::Data { remaining: size } };
            }

            ChunkPhase::Data { remaining } => {
                let take = (*remaining).min(buf.len());
                body.extend_from_slice(&buf[..take]);
                buf.drain(..take);
                *remaining -= take;
                if *remaining > 0 {
                    return Ok(ChunkOutcome::NeedMore);
                }
                *phase = ChunkPhase::DataEnd;
            }

            ChunkPhase::DataEnd => {
                if buf.len() < 2 {
                    return Ok(ChunkOutcome::NeedMore);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(ParseError::Malformed);
                }
                buf.drain(..2);
                *phase = ChunkPhase::Size;
            }

            ChunkPhase::Trailers => {
                let Some(line_end) = find_crlf(buf) else { return Ok(ChunkOutcome::NeedMore) };
                let empty = line_end == 0;
                buf.drain(..line_end + 2);
                if empty {
                    return Ok(ChunkOutcome::Done);
                }
                // Trailer headers are tolerated and discarded.
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new(HttpLimits::default())
    }

    fn feed(parser: &mut RequestParser, bytes: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut buf = bytes.to_vec();
        parser.advance(&mut buf)
    }

    #[test]
    fn simple_get() {
        let mut p = parser();
        let request = feed(&mut p, b"GET /index?x=1 HTTP/1.1\r\nHost: here\r\n\r\n")
            .unwrap()
            .expect("complete");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/index");
        assert_eq!(request.query.as_deref(), Some("x=1"));
        assert_eq!(request.header("host"), Some("here"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn fixed_body_across_reads() {
        let mut p = parser();
        let mut buf = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel".to_vec();
        assert!(p.advance(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo");
        let request = p.advance(&mut buf).unwrap().expect("complete");
        assert_eq!(request.body.as_bytes(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn pipelined_requests_leave_the_next_in_the_buffer() {
        let mut p = parser();
        let mut buf = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n".to_vec();
        let first = p.advance(&mut buf).unwrap().expect("first");
        assert_eq!(first.path, "/a");
        let second = p.advance(&mut buf).unwrap().expect("second");
        assert_eq!(second.path, "/b");
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_body() {
        let mut p = parser();
        let request = feed(
            &mut p,
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap()
        .expect("complete");
        assert_eq!(request.body.as_bytes(), b"Wikipedia");
    }

    #[test]
    fn chunked_with_extension_and_trailer() {
        let mut p = parser();
        let request = feed(
            &mut p,
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nabc\r\n0\r\nX-Trailer: v\r\n\r\n",
        )
        .unwrap()
        .expect("complete");
        assert_eq!(request.body.as_bytes(), b"abc");
    }

    #[test]
    fn body_limit_boundary() {
        let limits = HttpLimits { max_body_size: 4, ..HttpLimits::default() };
        let mut p = RequestParser::new(limits);
        let ok = feed(&mut p, b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd")
            .unwrap()
            .expect("at the limit");
        assert_eq!(ok.body.len(), 4);

        let mut p = RequestParser::new(limits);
        let err =
            feed(&mut p, b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde").unwrap_err();
        assert_eq!(err, ParseError::BodyTooLarge);
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn chunked_body_limit() {
        let limits = HttpLimits { max_body_size: 4, ..HttpLimits::default() };
        let mut p = RequestParser::new(limits);
        let err = feed(
            &mut p,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nabcde\r\n0\r\n\r\n",
        )
        .unwrap_err();
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn request_line_limit_boundary() {
        let limits = HttpLimits { max_line_len: 64, ..HttpLimits::default() };

        // Exactly at the limit parses.
        let path_len = 64 - "GET  HTTP/1.1".len();
        let path: String = std::iter::once('/').chain(std::iter::repeat_n('a', path_len - 1)).collect();
        let wire = format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut p = RequestParser::new(limits);
        assert!(feed(&mut p, wire.as_bytes()).unwrap().is_some());

        // One byte more: 414, detected even before the head completes.
        let long = format!("GET /{} HTTP/1.1\r\n", "a".repeat(80));
        let mut p = RequestParser::new(limits);
        let err = feed(&mut p, long.as_bytes()).unwrap_err();
        assert_eq!(err, ParseError::UriTooLong);
        assert_eq!(err.status(), 414);
    }

    #[test]
    fn oversized_headers_are_431() {
        let limits = HttpLimits { max_header_size: 128, ..HttpLimits::default() };
        let mut p = RequestParser::new(limits);
        let wire = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "v".repeat(256));
        let err = feed(&mut p, wire.as_bytes()).unwrap_err();
        assert_eq!(err, ParseError::HeadersTooLarge);
        assert_eq!(err.status(), 431);
    }

    #[test]
    fn garbage_is_400() {
        let mut p = parser();
        let err = feed(&mut p, b"\x00\x01\x02garbage\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
