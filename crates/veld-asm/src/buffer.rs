//! Append-only section buffers with an explicit lifecycle.
//!
//! Every byte the compiler produces flows through a [`SectionBuffer`]: the
//! text stream, the two data streams, and the final container. A buffer is
//! either `Open` (writes and patches allowed) or `Committed` (reads only).
//! `reset` clears a committed buffer back to `Open`, which is how the driver
//! discards pass-one code before re-emitting with final addresses.
//!
//! Writing to a committed buffer is a compiler bug, not a user error, and
//! panics with the buffer's name so the failing stage is obvious in the
//! abort message.

use std::fmt;

/// Lifecycle state of a [`SectionBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Writes and in-place patches are allowed.
    Open,
    /// Contents are frozen; any write panics.
    Committed,
}

/// A named, append-only byte stream.
pub struct SectionBuffer {
    name: &'static str,
    bytes: Vec<u8>,
    state: BufferState,
}

impl SectionBuffer {
    /// Create an empty, open buffer.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            bytes: Vec::new(),
            state: BufferState::Open,
        }
    }

    /// Create an open buffer with a capacity hint.
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            bytes: Vec::with_capacity(capacity),
            state: BufferState::Open,
        }
    }

    /// The buffer's section name (for diagnostics).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Current length in bytes. Valid in any state.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read access to the contents. Valid in any state.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the buffer and return its contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Freeze the buffer. Idempotent.
    pub fn commit(&mut self) {
        self.state = BufferState::Committed;
    }

    /// Clear the buffer and reopen it for writing.
    ///
    /// This is the only sanctioned way back from `Committed`; the two-pass
    /// driver resets the text stream between passes.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.state = BufferState::Open;
    }

    fn check_open(&self, op: &str) {
        if self.state == BufferState::Committed {
            panic!(
                "section buffer {:?}: {} after commit (compiler bug: a stage wrote to a frozen section)",
                self.name, op
            );
        }
    }

    // ── Appends ──────────────────────────────────────────────────────

    /// Append a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.check_open("write_u8");
        self.bytes.push(value);
    }

    /// Append a 16-bit little-endian value.
    pub fn write_u16(&mut self, value: u16) {
        self.check_open("write_u16");
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a 32-bit little-endian value.
    pub fn write_u32(&mut self, value: u32) {
        self.check_open("write_u32");
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a 64-bit little-endian value.
    pub fn write_u64(&mut self, value: u64) {
        self.check_open("write_u64");
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a raw byte slice.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.check_open("write_bytes");
        self.bytes.extend_from_slice(bytes);
    }

    /// Append `count` zero bytes.
    pub fn write_zeros(&mut self, count: usize) {
        self.check_open("write_zeros");
        self.bytes.resize(self.bytes.len() + count, 0);
    }

    /// Pad with zeros until the length is a multiple of `align`.
    pub fn align_to(&mut self, align: usize) {
        self.check_open("align_to");
        let rem = self.bytes.len() % align;
        if rem != 0 {
            self.write_zeros(align - rem);
        }
    }

    // ── In-place patches ─────────────────────────────────────────────

    /// Overwrite bytes at `at`. The range must already exist.
    pub fn patch_bytes(&mut self, at: usize, bytes: &[u8]) {
        self.check_open("patch_bytes");
        assert!(
            at + bytes.len() <= self.bytes.len(),
            "section buffer {:?}: patch of {} bytes at {} past end {}",
            self.name,
            bytes.len(),
            at,
            self.bytes.len()
        );
        self.bytes[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Overwrite a 32-bit little-endian value at `at`.
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.patch_bytes(at, &value.to_le_bytes());
    }

    /// Overwrite a 64-bit little-endian value at `at`.
    pub fn patch_u64(&mut self, at: usize, value: u64) {
        self.patch_bytes(at, &value.to_le_bytes());
    }

    /// Read a 32-bit little-endian value at `at`. Valid in any state.
    pub fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap())
    }

    /// Read a 64-bit little-endian value at `at`. Valid in any state.
    pub fn read_u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.bytes[at..at + 8].try_into().unwrap())
    }
}

impl fmt::Debug for SectionBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionBuffer")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let mut buf = SectionBuffer::new("text");
        buf.write_u8(0x90);
        buf.write_u32(0xdeadbeef);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.bytes()[0], 0x90);
        assert_eq!(buf.read_u32(1), 0xdeadbeef);
    }

    #[test]
    fn test_patch_in_place() {
        let mut buf = SectionBuffer::new("text");
        buf.write_u32(0x12345678);
        buf.patch_u32(0, 0x11223344);
        assert_eq!(buf.read_u32(0), 0x11223344);
    }

    #[test]
    fn test_align_to() {
        let mut buf = SectionBuffer::new("rodata");
        buf.write_bytes(b"abc");
        buf.align_to(8);
        assert_eq!(buf.len(), 8);
        buf.align_to(8);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_reads_allowed_after_commit() {
        let mut buf = SectionBuffer::new("rodata");
        buf.write_bytes(b"hello");
        buf.commit();
        assert_eq!(buf.bytes(), b"hello");
        assert_eq!(buf.state(), BufferState::Committed);
    }

    #[test]
    #[should_panic(expected = "after commit")]
    fn test_write_after_commit_panics() {
        let mut buf = SectionBuffer::new("text");
        buf.write_u8(0xc3);
        buf.commit();
        buf.write_u8(0x90);
    }

    #[test]
    #[should_panic(expected = "after commit")]
    fn test_patch_after_commit_panics() {
        let mut buf = SectionBuffer::new("text");
        buf.write_u32(0);
        buf.commit();
        buf.patch_u32(0, 1);
    }

    #[test]
    fn test_reset_reopens_and_clears() {
        let mut buf = SectionBuffer::new("text");
        buf.write_bytes(&[1, 2, 3]);
        buf.commit();
        buf.reset();
        assert_eq!(buf.state(), BufferState::Open);
        assert!(buf.is_empty());
        buf.write_u8(7);
        assert_eq!(buf.bytes(), &[7]);
    }
}
