use tracing::debug;

/// Byte written over unused arena space. Executing it is a fault.
pub const TRAP_BYTE: u8 = 0xCC;

/// Byte used to pad re-emitted code to its original length.
pub const NOP_BYTE: u8 = 0x90;

/// Write cursor over a slice of host code.
///
/// `base` is the arena offset of `bytes[0]`, so `host_offset()` always names
/// the arena position of the next byte written.
pub struct CodeBuffer<'a> {
    bytes: &'a mut [u8],
    pos: usize,
    base: u32,
}

impl<'a> CodeBuffer<'a> {
    pub fn new(bytes: &'a mut [u8], base: u32) -> Self {
        Self { bytes, pos: 0, base }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        assert!(pos <= self.bytes.len());
        self.pos = pos;
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Arena offset of the next byte.
    pub fn host_offset(&self) -> u32 {
        self.base + self.pos as u32
    }

    pub fn push_u8(&mut self, value: u8) {
        assert!(self.pos < self.bytes.len(), "code buffer overflow at {:#x}", self.host_offset());
        self.bytes[self.pos] = value;
        self.pos += 1;
    }

    pub fn push_u16(&mut self, value: u16) {
        for b in value.to_le_bytes() {
            self.push_u8(b);
        }
    }

    pub fn push_u32(&mut self, value: u32) {
        for b in value.to_le_bytes() {
            self.push_u8(b);
        }
    }

    /// Copy the written part of `other` in.
    pub fn append(&mut self, other: &CodeBuffer<'_>) {
        let len = other.pos;
        assert!(len <= self.remaining(), "code buffer overflow at {:#x}", self.host_offset());
        self.bytes[self.pos..self.pos + len].copy_from_slice(&other.bytes[..len]);
        self.pos += len;
    }

    /// Fill from the cursor to the end with `value`.
    pub fn fill_to_end(&mut self, value: u8) {
        self.bytes[self.pos..].fill(value);
        self.pos = self.bytes.len();
    }

    pub fn written(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }
}

/// Fixed-size arena holding all host code.
///
/// Space is handed out in windows from a monotonic cursor. Nothing is ever
/// freed individually; when the arena cannot fit another window everything
/// is discarded at once and `generation` advances.
pub struct CodeArena {
    bytes: Box<[u8]>,
    cursor: usize,
    generation: u64,
}

impl CodeArena {
    pub fn with_size(size: usize) -> Self {
        Self {
            bytes: vec![TRAP_BYTE; size].into_boxed_slice(),
            cursor: 0,
            generation: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn code_size(&self) -> usize {
        self.cursor
    }

    pub fn space_remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    /// Incremented on every `clear`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Writable window of `size` bytes at the cursor.
    pub fn window(&mut self, size: usize) -> CodeBuffer<'_> {
        assert!(size <= self.space_remaining(), "arena window of {} bytes does not fit", size);
        let base = self.cursor as u32;
        CodeBuffer::new(&mut self.bytes[self.cursor..self.cursor + size], base)
    }

    /// Writable view of already emitted code, for patching in place.
    pub fn patch(&mut self, offset: u32, len: usize) -> CodeBuffer<'_> {
        let start = offset as usize;
        assert!(start + len <= self.cursor + self.space_remaining());
        CodeBuffer::new(&mut self.bytes[start..start + len], offset)
    }

    /// Move the cursor past `used` bytes of the current window.
    pub fn commit(&mut self, used: usize) {
        assert!(used <= self.space_remaining());
        self.cursor += used;
    }

    /// Discard all code.
    pub fn clear(&mut self) {
        debug!(used = self.cursor, generation = self.generation, "clearing code arena");
        self.bytes[..self.cursor].fill(TRAP_BYTE);
        self.cursor = 0;
        self.generation += 1;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
