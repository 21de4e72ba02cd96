use tracing::trace;

use crate::frame::{self, Frame, FrameError, Opcode};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Reserved "no status present" code; never sent on the wire.
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_INVALID_DATA: u16 = 1007;
pub const CLOSE_TOO_LARGE: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Protocol violation that terminates the session. The caller sends a close
/// frame with [`Violation::close_code`] and drops the connection.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("frame violates RFC 6455: {0}")]
    BadFrame(FrameError),
    #[error("client frame was not masked")]
    UnmaskedInput,
    #[error("server frame was masked")]
    MaskedInput,
    #[error("continuation frame without an open message")]
    StrayContinuation,
    #[error("new data message interleaved inside a fragmented message")]
    NestedMessage,
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
    #[error("message exceeds the size limit")]
    MessageTooLarge,
}

impl Violation {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::InvalidUtf8 => CLOSE_INVALID_DATA,
            Self::MessageTooLarge | Self::BadFrame(FrameError::TooLarge) => CLOSE_TOO_LARGE,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

/// A complete data message ready for the handler.
#[derive(Debug, PartialEq, Eq)]
pub struct WsMessage {
    pub data: Vec<u8>,
    pub is_text: bool,
}

/// Result of feeding inbound bytes through the session.
#[derive(Debug, Default)]
pub struct Reception {
    /// Complete data messages, in arrival order.
    pub messages: Vec<WsMessage>,
    /// Wire bytes the engine owes the peer (pongs, close echo).
    pub replies: Vec<u8>,
    /// Close handshake finished; the connection should flush and close.
    pub close_done: Option<u16>,
    /// At least one pong arrived in this batch.
    pub pong_seen: bool,
}

/// Outcome of the idle-timeout tick.
#[derive(Debug, PartialEq, Eq)]
pub enum IdleAction {
    /// A ping was appended to the output; wait one more interval.
    PingSent,
    /// The previous ping was never answered; close with 1011.
    TimedOut,
}

#[derive(Clone, Copy, Debug)]
pub struct WsConfig {
    /// Assembled-message cap; one byte more closes with 1009.
    pub max_message_size: usize,
    /// Server mode: inbound frames must be masked, outbound must not be.
    pub server: bool,
    /// Outbound messages above this size are split into continuation frames.
    pub fragment_threshold: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self { max_message_size: 1 << 18, server: true, fragment_threshold: 64 * 1024 }
    }
}

struct Assembly {
    is_text: bool,
    data: Vec<u8>,
}

/// Per-connection WebSocket state machine.
///
/// Control frames are consumed here and never reach the handler; data
/// messages surface only once fully assembled (a partially received message
/// is never delivered).
pub struct WsSession {
    config: WsConfig,
    assembly: Option<Assembly>,
    close_sent: bool,
    close_received: bool,
    awaiting_pong: bool,
}

impl WsSession {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            assembly: None,
            close_sent: false,
            close_received: false,
            awaiting_pong: false,
        }
    }

    #[inline]
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Consumes complete frames from the front of `input` and reports what
    /// the caller must deliver and write. On violation the caller emits the
    /// close code and terminates; the session is then unusable.
    pub fn receive(&mut self, input: &mut Vec<u8>) -> Result<Reception, Violation> {
        let mut out = Reception::default();
        let mut consumed = 0usize;

        loop {
            let frame = match frame::decode(&input[consumed..], self.config.max_message_size as u64)
            {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    frame
                }
                Ok(None) => break,
                Err(err) => {
                    input.drain(..consumed);
                    return Err(Violation::BadFrame(err));
                }
            };
            if let Err(violation) = self.accept_frame(frame, &mut out) {
                input.drain(..consumed);
                return Err(violation);
            }
            if out.close_done.is_some() {
                break;
            }
        }

        input.drain(..consumed);
        Ok(out)
    }

    fn accept_frame(&mut self, frame: Frame, out: &mut Reception) -> Result<(), Violation> {
        if self.config.server && !frame.masked {
            return Err(Violation::UnmaskedInput);
        }
        if !self.config.server && frame.masked {
            return Err(Violation::MaskedInput);
        }

        match frame.opcode {
            // Control frames interleave between fragments and are handled
            // here, synchronously.
            Opcode::Ping => {
                frame::encode(Opcode::Pong, true, self.mask(), &frame.payload, &mut out.replies);
            }
            Opcode::Pong => {
                self.awaiting_pong = false;
                out.pong_seen = true;
            }
            Opcode::Close => {
                let code = parse_close_code(&frame.payload);
                if self.close_sent {
                    out.close_done = Some(code);
                } else {
                    // Reciprocate with the peer's code; an absent code is
                    // echoed as an empty close payload.
                    let echo: Vec<u8> =
                        if frame.payload.len() >= 2 { frame.payload[..2].to_vec() } else { Vec::new() };
                    frame::encode(Opcode::Close, true, self.mask(), &echo, &mut out.replies);
                    self.close_sent = true;
                    out.close_done = Some(code);
                }
                self.close_received = true;
            }

            Opcode::Text | Opcode::Binary => {
                if self.assembly.is_some() {
                    return Err(Violation::NestedMessage);
                }
                let is_text = frame.opcode == Opcode::Text;
                if frame.fin {
                    self.finish_message(is_text, frame.payload, out)?;
                } else {
                    self.push_fragment(Some(is_text), frame.payload)?;
                }
            }
            Opcode::Continuation => {
                if self.assembly.is_none() {
                    return Err(Violation::StrayContinuation);
                }
                self.push_fragment(None, frame.payload)?;
                if frame.fin {
                    let assembly = self.assembly.take().expect("assembly checked above");
                    self.finish_message(assembly.is_text, assembly.data, out)?;
                }
            }
        }
        Ok(())
    }

    fn push_fragment(&mut self, start: Option<bool>, chunk: Vec<u8>) -> Result<(), Violation> {
        match start {
            Some(is_text) => {
                if chunk.len() > self.config.max_message_size {
                    return Err(Violation::MessageTooLarge);
                }
                self.assembly = Some(Assembly { is_text, data: chunk });
            }
            None => {
                let assembly = self.assembly.as_mut().expect("caller checked the open message");
                if assembly.data.len() + chunk.len() > self.config.max_message_size {
                    return Err(Violation::MessageTooLarge);
                }
                assembly.data.extend_from_slice(&chunk);
            }
        }
        Ok(())
    }

    fn finish_message(
        &mut self,
        is_text: bool,
        data: Vec<u8>,
        out: &mut Reception,
    ) -> Result<(), Violation> {
        if data.len() > self.config.max_message_size {
            return Err(Violation::MessageTooLarge);
        }
        if is_text && std::str::from_utf8(&data).is_err() {
            return Err(Violation::InvalidUtf8);
        }
        trace!(len = data.len(), is_text, "ws: message assembled");
        out.messages.push(WsMessage { data, is_text });
        Ok(())
    }

    /// Encodes an outbound data message, splitting it into continuation
    /// frames above the configured threshold.
    pub fn send(&self, data: &[u8], is_text: bool, out: &mut Vec<u8>) {
        if self.close_sent {
            return;
        }
        encode_data_frames(data, is_text, self.config.fragment_threshold, self.mask(), out);
    }

    /// Initiates the close handshake from this side.
    pub fn send_close(&mut self, code: u16, out: &mut Vec<u8>) {
        if self.close_sent {
            return;
        }
        let payload: Vec<u8> =
            if code == CLOSE_NO_STATUS { Vec::new() } else { code.to_be_bytes().to_vec() };
        frame::encode(Opcode::Close, true, self.mask(), &payload, out);
        self.close_sent = true;
    }

    /// Idle-timeout policy: first expiry pings, an unanswered ping times the
    /// connection out with 1011.
    pub fn idle_tick(&mut self, out: &mut Vec<u8>) -> IdleAction {
        if self.awaiting_pong {
            return IdleAction::TimedOut;
        }
        frame::encode(Opcode::Ping, true, self.mask(), b"", out);
        self.awaiting_pong = true;
        IdleAction::PingSent
    }

    /// Servers never mask; client sessions use a fixed key only in tests.
    fn mask(&self) -> Option<[u8; 4]> {
        if self.config.server { None } else { Some([0x12, 0x34, 0x56, 0x78]) }
    }
}

/// Server-side data-message encoder, shared by the session and by writers
/// that live on other threads. Splits into continuation frames above
/// `threshold`.
pub fn encode_data_frames(
    data: &[u8],
    is_text: bool,
    threshold: usize,
    mask: Option<[u8; 4]>,
    out: &mut Vec<u8>,
) {
    let first_opcode = if is_text { Opcode::Text } else { Opcode::Binary };
    let threshold = threshold.max(1);

    if data.len() <= threshold {
        frame::encode(first_opcode, true, mask, data, out);
        return;
    }

    let mut chunks = data.chunks(threshold).peekable();
    let mut opcode = first_opcode;
    while let Some(chunk) = chunks.next() {
        let fin = chunks.peek().is_none();
        frame::encode(opcode, fin, mask, chunk, out);
        opcode = Opcode::Continuation;
    }
}

fn parse_close_code(payload: &[u8]) -> u16 {
    if payload.len() >= 2 {
        u16::from_be_bytes([payload[0], payload[1]])
    } else {
        CLOSE_NO_STATUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> WsSession {
        WsSession::new(WsConfig::default())
    }

    fn masked(opcode: Opcode, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        frame::encode(opcode, fin, Some([9, 8, 7, 6]), payload, &mut wire);
        wire
    }

    #[test]
    fn echo_text_message() {
        let mut session = server();
        let mut input = masked(Opcode::Text, true, b"hello");
        let got = session.receive(&mut input).unwrap();
        assert_eq!(got.messages, vec![WsMessage { data: b"hello".to_vec(), is_text: true }]);
        assert!(input.is_empty());
    }

    #[test]
    fn unmasked_client_frame_is_1002() {
        let mut session = server();
        let mut wire = Vec::new();
        frame::encode(Opcode::Text, true, None, b"hi", &mut wire);
        let violation = session.receive(&mut wire).unwrap_err();
        assert_eq!(violation, Violation::UnmaskedInput);
        assert_eq!(violation.close_code(), CLOSE_PROTOCOL_ERROR);
    }

    #[test]
    fn fragmented_message_with_interleaved_ping() {
        let mut session = server();
        let mut input = masked(Opcode::Text, false, b"hel");
        input.extend(masked(Opcode::Ping, true, b"probe"));
        input.extend(masked(Opcode::Continuation, true, b"lo"));

        let got = session.receive(&mut input).unwrap();
        // The ping was answered without surfacing to the handler, and the
        // message arrived whole.
        assert_eq!(got.messages, vec![WsMessage { data: b"hello".to_vec(), is_text: true }]);
        let (pong, _) = frame::decode(&got.replies, u64::MAX).unwrap().unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"probe");
    }

    #[test]
    fn partial_message_is_never_delivered() {
        let mut session = server();
        let mut input = masked(Opcode::Binary, false, b"partial");
        let got = session.receive(&mut input).unwrap();
        assert!(got.messages.is_empty());
    }

    #[test]
    fn invalid_utf8_is_1007() {
        let mut session = server();
        let mut input = masked(Opcode::Text, true, &[0xff, 0xfe]);
        let violation = session.receive(&mut input).unwrap_err();
        assert_eq!(violation.close_code(), CLOSE_INVALID_DATA);
    }

    #[test]
    fn utf8_checked_on_completion_not_per_fragment() {
        let mut session = server();
        // "é" split across fragments: 0xc3 | 0xa9.
        let mut input = masked(Opcode::Text, false, &[0xc3]);
        input.extend(masked(Opcode::Continuation, true, &[0xa9]));
        let got = session.receive(&mut input).unwrap();
        assert_eq!(got.messages[0].data, "é".as_bytes());
    }

    #[test]
    fn size_boundary() {
        let config = WsConfig { max_message_size: 8, ..WsConfig::default() };
        let mut session = WsSession::new(config);
        let mut input = masked(Opcode::Binary, true, &[0u8; 8]);
        assert_eq!(session.receive(&mut input).unwrap().messages.len(), 1);

        let mut session = WsSession::new(config);
        let mut input = masked(Opcode::Binary, true, &[0u8; 9]);
        let violation = session.receive(&mut input).unwrap_err();
        assert_eq!(violation.close_code(), CLOSE_TOO_LARGE);
    }

    #[test]
    fn fragment_total_bounded() {
        let config = WsConfig { max_message_size: 8, ..WsConfig::default() };
        let mut session = WsSession::new(config);
        let mut input = masked(Opcode::Binary, false, &[0u8; 6]);
        input.extend(masked(Opcode::Continuation, true, &[0u8; 6]));
        let violation = session.receive(&mut input).unwrap_err();
        assert_eq!(violation, Violation::MessageTooLarge);
    }

    #[test]
    fn peer_close_is_echoed_with_same_code() {
        let mut session = server();
        let mut input = masked(Opcode::Close, true, &CLOSE_GOING_AWAY.to_be_bytes());
        let got = session.receive(&mut input).unwrap();
        assert_eq!(got.close_done, Some(CLOSE_GOING_AWAY));
        let (echo, _) = frame::decode(&got.replies, u64::MAX).unwrap().unwrap();
        assert_eq!(echo.opcode, Opcode::Close);
        assert_eq!(echo.payload, CLOSE_GOING_AWAY.to_be_bytes());
    }

    #[test]
    fn codeless_close_maps_to_1005_and_echoes_empty() {
        let mut session = server();
        let mut input = masked(Opcode::Close, true, b"");
        let got = session.receive(&mut input).unwrap();
        assert_eq!(got.close_done, Some(CLOSE_NO_STATUS));
        let (echo, _) = frame::decode(&got.replies, u64::MAX).unwrap().unwrap();
        assert!(echo.payload.is_empty());
    }

    #[test]
    fn our_close_then_peer_ack_finishes() {
        let mut session = server();
        let mut out = Vec::new();
        session.send_close(CLOSE_NORMAL, &mut out);
        assert!(session.close_sent());

        let mut ack = masked(Opcode::Close, true, &CLOSE_NORMAL.to_be_bytes());
        let got = session.receive(&mut ack).unwrap();
        assert_eq!(got.close_done, Some(CLOSE_NORMAL));
        // No second close frame goes out.
        assert!(got.replies.is_empty());
    }

    #[test]
    fn outbound_fragmentation_above_threshold() {
        let config = WsConfig { fragment_threshold: 4, ..WsConfig::default() };
        let session = WsSession::new(config);
        let mut wire = Vec::new();
        session.send(b"abcdefghij", false, &mut wire);

        let mut offset = 0;
        let mut frames = Vec::new();
        while offset < wire.len() {
            let (frame, used) = frame::decode(&wire[offset..], u64::MAX).unwrap().unwrap();
            offset += used;
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, Opcode::Binary);
        assert!(!frames[0].fin);
        assert_eq!(frames[1].opcode, Opcode::Continuation);
        assert!(!frames[1].fin);
        assert_eq!(frames[2].opcode, Opcode::Continuation);
        assert!(frames[2].fin);
        let whole: Vec<u8> = frames.into_iter().flat_map(|f| f.payload).collect();
        assert_eq!(whole, b"abcdefghij");
    }

    #[test]
    fn idle_tick_pings_then_times_out() {
        let mut session = server();
        let mut out = Vec::new();
        assert_eq!(session.idle_tick(&mut out), IdleAction::PingSent);
        assert_eq!(session.idle_tick(&mut out), IdleAction::TimedOut);

        // A pong in between resets the policy.
        let mut session = server();
        let mut out = Vec::new();
        assert_eq!(session.idle_tick(&mut out), IdleAction::PingSent);
        let mut pong = masked(Opcode::Pong, true, b"");
        assert!(session.receive(&mut pong).unwrap().pong_seen);
        assert_eq!(session.idle_tick(&mut out), IdleAction::PingSent);
    }
}
