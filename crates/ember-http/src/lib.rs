//! HTTP/1.1 codec: incremental request parser, header multimap, seekable
//! body, response builder (simple / streamed / static file), static file
//! service with conditional and range support, SSE framing, and a generic
//! longest-prefix router.

mod body;
mod headers;
mod parser;
mod request;
mod response;
mod router;
mod sse;
mod static_files;

pub use body::Body;
pub use headers::{CookieJar, HeaderMap};
pub use parser::{HttpLimits, ParseError, RequestParser};
pub use request::{Request, Upgrade};
pub use response::{Response, error_response, status_reason};
pub use router::Router;
pub use sse::{SSE_KEEPALIVE, encode_event, encode_retry, parse_last_event_id};
pub use static_files::{StaticOutcome, StaticSettings, serve_static};
