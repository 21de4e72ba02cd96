use std::fs::File;

/// A unit of outbound data queued on a connection.
///
/// Packets form a FIFO per connection. A packet is consumed once its offset
/// reaches its length; partial writes update the offset in place. Buffer
/// packets own their bytes, file packets own the file handle and drop it
/// (closing the fd) when fully sent.
pub enum Packet {
    Buf { data: Vec<u8>, offset: usize },
    File { file: File, offset: u64, remaining: u64 },
}

impl Packet {
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::Buf { data, offset: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn from_file(file: File, offset: u64, len: u64) -> Self {
        Self::File { file, offset, remaining: len }
    }

    /// Bytes still to be sent.
    #[inline]
    pub fn remaining(&self) -> u64 {
        match self {
            Self::Buf { data, offset } => (data.len() - offset) as u64,
            Self::File { remaining, .. } => *remaining,
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buf { data, offset } => {
                f.debug_struct("Packet::Buf").field("len", &data.len()).field("offset", offset).finish()
            }
            Self::File { offset, remaining, .. } => f
                .debug_struct("Packet::File")
                .field("offset", offset)
                .field("remaining", remaining)
                .finish(),
        }
    }
}
