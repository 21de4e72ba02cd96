//! RFC 6455 WebSocket engine: frame codec, fragmentation and control-frame
//! state machine, close handshake, idle ping policy.
//!
//! The crate is transport-free; the protocol glue feeds inbound bytes into
//! [`WsSession::receive`] and writes whatever the session hands back.

mod frame;
mod handshake;
mod session;

pub use frame::{Frame, FrameError, MAX_CONTROL_PAYLOAD, Opcode, decode, encode};
pub use handshake::{accept_key, is_valid_client_key};
pub use session::{
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_INVALID_DATA, CLOSE_NORMAL, CLOSE_NO_STATUS,
    CLOSE_PROTOCOL_ERROR, CLOSE_TOO_LARGE, IdleAction, Reception, Violation, WsConfig, WsMessage,
    WsSession, encode_data_frames,
};
