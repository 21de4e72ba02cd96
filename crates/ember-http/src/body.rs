/// Fully buffered request body exposed as a seekable byte cursor.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Body {
    data: Vec<u8>,
    pos: usize,
}

impl Body {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Reads up to `n` bytes from the cursor; `None` reads to the end.
    pub fn read(&mut self, n: Option<usize>) -> &[u8] {
        let start = self.pos;
        let end = match n {
            Some(n) => (start + n).min(self.data.len()),
            None => self.data.len(),
        };
        self.pos = end;
        &self.data[start..end]
    }

    /// Reads one line including its `\n`, bounded by `limit` when given.
    pub fn gets(&mut self, limit: Option<usize>) -> Option<&[u8]> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let line_end = rest.iter().position(|b| *b == b'\n').map_or(rest.len(), |at| at + 1);
        let end = match limit {
            Some(limit) => line_end.min(limit),
            None => line_end,
        };
        let start = self.pos;
        self.pos += end;
        Some(&self.data[start..start + end])
    }

    pub fn seek(&mut self, pos: usize) -> usize {
        self.pos = pos.min(self.data.len());
        self.pos
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }
}
