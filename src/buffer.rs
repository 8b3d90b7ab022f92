//! Growable byte buffer with independent read and write cursors, used for
//! per-connection input/output staging.

/// Default initial capacity of a [Buffer] in bytes.
const DEFAULT_CAPACITY: usize = 1024;

/// Byte region with a read cursor and a write cursor.
///
/// Invariant: `0 <= read <= write <= capacity`. The readable span is
/// `write - read`; writable space is the trailing free region plus the
/// leading already-consumed region, which is reclaimed by compaction before
/// the backing storage is ever grown.
#[derive(Debug)]
pub struct Buffer {
    storage: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Buffer {
    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            storage: vec![0; capacity],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_size(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// Number of bytes that can be written without growing the backing
    /// storage, counting both trailing free space and the leading consumed
    /// space reclaimable by compaction.
    pub fn writeable_size(&self) -> usize {
        self.back_size() + self.front_size()
    }

    /// Readable span of the buffer.
    pub fn read_pos(&self) -> &[u8] {
        &self.storage[self.read_idx..self.write_idx]
    }

    /// Advances the read cursor by `len` bytes. Returns `false` (and leaves
    /// the cursor untouched) if `len` exceeds the readable span.
    pub fn move_read_idx(&mut self, len: usize) -> bool {
        if self.read_idx + len > self.write_idx {
            return false;
        }
        self.read_idx += len;
        true
    }

    /// Advances the write cursor by `len` bytes. Returns `false` if `len`
    /// exceeds the trailing free space.
    pub fn move_write_idx(&mut self, len: usize) -> bool {
        if len > self.back_size() {
            return false;
        }
        self.write_idx += len;
        true
    }

    /// Copies `dst.len()` bytes from the readable span into `dst`, advancing
    /// the read cursor when `pop` is set. A request larger than the readable
    /// span (or empty) is a no-op.
    pub fn read(&mut self, dst: &mut [u8], pop: bool) {
        let len = dst.len();
        if len > self.readable_size() || len == 0 {
            return;
        }
        dst.copy_from_slice(&self.storage[self.read_idx..self.read_idx + len]);
        if pop {
            self.move_read_idx(len);
        }
    }

    /// Returns `len` bytes from the readable span as a string, advancing the
    /// read cursor when `pop` is set. A request larger than the readable span
    /// (or empty) yields an empty string.
    pub fn read_as_string(&mut self, len: usize, pop: bool) -> String {
        if len > self.readable_size() || len == 0 {
            return String::new();
        }
        let str = String::from_utf8_lossy(&self.storage[self.read_idx..self.read_idx + len])
            .into_owned();
        if pop {
            self.move_read_idx(len);
        }
        str
    }

    /// Returns the prefix of the readable span up to and including the first
    /// `\n` byte, or an empty string if no terminator is present yet.
    ///
    /// Terminator detection is a single byte; a preceding `\r` is returned
    /// as part of the line.
    pub fn read_line(&mut self, pop: bool) -> String {
        match self.read_pos().iter().position(|&b| b == b'\n') {
            Some(idx) => self.read_as_string(idx + 1, pop),
            None => String::new(),
        }
    }

    /// Appends `data` to the buffer, compacting or growing as needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_writeable(data.len());
        self.storage[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.move_write_idx(data.len());
    }

    /// Appends the readable span of `other` to the buffer.
    pub fn write_buf(&mut self, other: &Buffer) {
        self.write(other.read_pos());
    }

    /// Resets both cursors to zero. The backing storage is not shrunk.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    /// Current capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn front_size(&self) -> usize {
        self.read_idx
    }

    fn back_size(&self) -> usize {
        self.storage.len() - self.write_idx
    }

    /// Makes room for `len` more bytes at the write cursor: compacts when the
    /// combined free space suffices, otherwise grows the backing storage by
    /// at least `len` bytes.
    fn ensure_writeable(&mut self, len: usize) {
        if len <= self.back_size() {
            return;
        }
        if len > self.writeable_size() {
            let new_len = self.storage.len() + len;
            self.storage.resize(new_len, 0);
        } else {
            self.storage.copy_within(self.read_idx..self.write_idx, 0);
            self.write_idx -= self.front_size();
            self.read_idx = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_across_split_writes() {
        let mut buf = Buffer::new();
        buf.write(b"hello ");
        buf.write(b"wor");
        buf.write(b"ld");

        let mut out = [0u8; 11];
        buf.read(&mut out[..5], true);
        buf.read(&mut out[5..], true);

        assert_eq!(&out, b"hello world");
        assert_eq!(buf.readable_size(), 0);
    }

    #[test]
    fn read_peek_does_not_consume() {
        let mut buf = Buffer::new();
        buf.write(b"abcd");

        let mut out = [0u8; 4];
        buf.read(&mut out, false);
        assert_eq!(&out, b"abcd");
        assert_eq!(buf.readable_size(), 4);

        buf.read(&mut out, true);
        assert_eq!(buf.readable_size(), 0);
    }

    #[test]
    fn oversized_read_is_a_noop() {
        let mut buf = Buffer::new();
        buf.write(b"ab");

        let mut out = [7u8; 4];
        buf.read(&mut out, true);
        assert_eq!(out, [7u8; 4]);
        assert_eq!(buf.readable_size(), 2);
    }

    #[test]
    fn compaction_reclaims_consumed_space_without_growing() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcdef");
        assert_eq!(buf.read_as_string(4, true), "abcd");

        // 2 trailing + 4 leading bytes free; room for 5 without growing.
        buf.write(b"01234");
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.read_as_string(buf.readable_size(), true), "ef01234");
    }

    #[test]
    fn growth_when_free_space_insufficient() {
        let mut buf = Buffer::with_capacity(4);
        buf.write(b"abcd");

        let before = buf.capacity();
        buf.write(b"efgh");
        assert!(buf.capacity() >= before + 4);
        assert_eq!(buf.read_as_string(8, true), "abcdefgh");
    }

    #[test]
    fn read_line_waits_for_terminator() {
        let mut buf = Buffer::new();
        buf.write(b"partial");
        assert_eq!(buf.read_line(true), "");

        buf.write(b" line\nrest");
        assert_eq!(buf.read_line(true), "partial line\n");
        assert_eq!(buf.read_as_string(4, true), "rest");
    }

    #[test]
    fn read_line_stops_at_first_terminator() {
        let mut buf = Buffer::new();
        buf.write(b"a\nb\n");
        assert_eq!(buf.read_line(true), "a\n");
        assert_eq!(buf.read_line(true), "b\n");
        assert_eq!(buf.read_line(true), "");
    }

    #[test]
    fn clear_resets_cursors() {
        let mut buf = Buffer::new();
        buf.write(b"data");
        buf.clear();
        assert_eq!(buf.readable_size(), 0);
        assert_eq!(buf.read_line(true), "");
    }
}
