use bytes::Bytes;

/// Sanity cap on one record's payload; a peer breaching it is dropped.
pub const MAX_RECORD_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Record kinds on the IPC channel. Values 1..=7 are the base protocol;
/// 8 and 9 carry the ROOT and SIBLINGS publish scopes, and 10/11 the
/// connect handshake, all in the same record layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RecordKind {
    Subscribe = 1,
    Unsubscribe = 2,
    PSubscribe = 3,
    PUnsubscribe = 4,
    Publish = 5,
    Ping = 6,
    Pong = 7,
    PublishRoot = 8,
    PublishSiblings = 9,
    /// Master → worker: authentication challenge in the payload.
    Hello = 10,
    /// Worker → master: HMAC over the challenge in the payload.
    Auth = 11,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Subscribe),
            2 => Some(Self::Unsubscribe),
            3 => Some(Self::PSubscribe),
            4 => Some(Self::PUnsubscribe),
            5 => Some(Self::Publish),
            6 => Some(Self::Ping),
            7 => Some(Self::Pong),
            8 => Some(Self::PublishRoot),
            9 => Some(Self::PublishSiblings),
            10 => Some(Self::Hello),
            11 => Some(Self::Auth),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    #[error("record payload exceeds the sanity cap")]
    PayloadTooLarge,
}

/// One length-prefixed IPC record:
/// `{kind:u8, channel_len:u16, filter:i16, payload_len:u32}` little-endian,
/// then channel bytes, then payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub filter: i16,
    pub channel: Bytes,
    pub payload: Bytes,
}

impl Record {
    pub fn control(kind: RecordKind, payload: impl Into<Bytes>) -> Self {
        Self { kind, filter: 0, channel: Bytes::new(), payload: payload.into() }
    }

    pub fn channel_op(kind: RecordKind, channel: Bytes, filter: i16) -> Self {
        Self { kind, filter, channel, payload: Bytes::new() }
    }

    pub fn publish(kind: RecordKind, channel: Bytes, filter: i16, payload: Bytes) -> Self {
        Self { kind, filter, channel, payload }
    }
}

const HEADER_LEN: usize = 1 + 2 + 2 + 4;

pub fn encode(record: &Record, out: &mut Vec<u8>) {
    out.push(record.kind as u8);
    out.extend_from_slice(&(record.channel.len() as u16).to_le_bytes());
    out.extend_from_slice(&record.filter.to_le_bytes());
    out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&record.channel);
    out.extend_from_slice(&record.payload);
}

/// Decodes one record from the front of `buf`; `Ok(None)` needs more bytes.
pub fn decode(buf: &[u8]) -> Result<Option<(Record, usize)>, WireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let kind = RecordKind::from_u8(buf[0]).ok_or(WireError::UnknownKind(buf[0]))?;
    let channel_len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    let filter = i16::from_le_bytes([buf[3], buf[4]]);
    let payload_len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
    if payload_len > MAX_RECORD_PAYLOAD {
        return Err(WireError::PayloadTooLarge);
    }
    let payload_len = payload_len as usize;

    let total = HEADER_LEN + channel_len + payload_len;
    if buf.len() < total {
        return Ok(None);
    }
    let channel = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + channel_len]);
    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN + channel_len..total]);
    Ok(Some((Record { kind, filter, channel, payload }, total)))
}

impl Record {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.channel.len() + self.payload.len());
        encode(self, &mut out);
        out
    }
}
