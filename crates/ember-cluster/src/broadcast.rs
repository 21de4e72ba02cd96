//! Cross-host UDP broadcast datagrams: `[hmac:32][record bytes]`, signed
//! with the cluster secret. Delivery between hosts is best-effort and
//! unordered; anything that fails verification is silently dropped.

use tracing::debug;

use crate::{
    Record,
    auth::{ClusterSecret, MAC_LEN},
    wire,
};

pub fn encode_datagram(secret: &ClusterSecret, record: &Record) -> Vec<u8> {
    let body = record.to_bytes();
    let tag = secret.sign(&body);
    let mut datagram = Vec::with_capacity(MAC_LEN + body.len());
    datagram.extend_from_slice(&tag);
    datagram.extend_from_slice(&body);
    datagram
}

/// Verifies and decodes one datagram; `None` for anything malformed or
/// carrying a bad signature.
pub fn decode_datagram(secret: &ClusterSecret, datagram: &[u8]) -> Option<Record> {
    if datagram.len() <= MAC_LEN {
        return None;
    }
    let (tag, body) = datagram.split_at(MAC_LEN);
    if !secret.verify(body, tag) {
        debug!("cluster: broadcast datagram failed verification");
        return None;
    }
    match wire::decode(body) {
        Ok(Some((record, used))) if used == body.len() => Some(record),
        _ => None,
    }
}
