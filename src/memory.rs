use std::ops::RangeInclusive;

/// Size of the 6502 address space.
pub const ADDR_SPACE_SIZE: usize = 0x10000;

/// Guest memory as seen by the compiler, compiled code and the interpreter.
///
/// `read`/`write` are plain accesses with no side effects beyond the store
/// itself (ROM may ignore writes). The `*_callback` variants are the
/// side-effecting path for memory-mapped devices. The predicates are only
/// consulted by the compiler when it decides how to translate an access.
pub trait MemoryAccess {
    /// Plain read of one byte.
    fn read(&self, addr: u16) -> u8;

    /// Plain write of one byte.
    fn write(&mut self, addr: u16, value: u8);

    /// Side-effecting read for addresses where `read_needs_callback` holds.
    fn read_callback(&mut self, addr: u16) -> u8 {
        self.read(addr)
    }

    /// Side-effecting write for addresses where `write_needs_callback` holds.
    fn write_callback(&mut self, addr: u16, value: u8) {
        self.write(addr, value)
    }

    /// Whether a read at `addr` must go through `read_callback`.
    fn read_needs_callback(&self, addr: u16) -> bool;

    /// Whether a write at `addr` must go through `write_callback`.
    fn write_needs_callback(&self, addr: u16) -> bool;

    /// Lowest address for which `read_needs_callback` may hold.
    fn read_needs_callback_above(&self) -> u16;

    /// Lowest address for which `write_needs_callback` may hold.
    fn write_needs_callback_above(&self) -> u16;

    /// Whether `addr` is plain RAM for the whole run (never ROM, never paged).
    fn is_always_ram(&self, addr: u16) -> bool;
}

/// How a 256-byte page of `FlatMemory` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Ram,
    /// Readable; writes are dropped.
    Rom,
    /// Memory-mapped device; all accesses go through the callback path.
    Io,
}

/// Device behind the I/O pages of a `FlatMemory`.
pub trait IoHandler {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
}

/// Flat 64K memory with page-granular ROM and I/O regions.
///
/// Callback accesses to I/O pages go to the registered `IoHandler`; without
/// one the pages store bytes like RAM. `with_io_log` additionally records
/// every I/O access until it is drained with `take_io_log`.
pub struct FlatMemory {
    bytes: Box<[u8]>,
    pages: [PageKind; 256],
    io_handler: Option<Box<dyn IoHandler>>,
    log_io: bool,
    io_reads: Vec<u16>,
    io_writes: Vec<(u16, u8)>,
}

impl FlatMemory {
    /// All-RAM memory filled with zeros.
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; ADDR_SPACE_SIZE].into_boxed_slice(),
            pages: [PageKind::Ram; 256],
            io_handler: None,
            log_io: false,
            io_reads: Vec::new(),
            io_writes: Vec::new(),
        }
    }

    /// Record I/O accesses from now on.
    pub fn with_io_log(mut self) -> Self {
        self.log_io = true;
        self
    }

    /// Mark the pages covering `range` with `kind`.
    pub fn set_pages(&mut self, range: RangeInclusive<u16>, kind: PageKind) {
        let first = (*range.start() >> 8) as usize;
        let last = (*range.end() >> 8) as usize;
        for page in first..=last {
            self.pages[page] = kind;
        }
    }

    pub fn set_io_handler(&mut self, handler: Option<Box<dyn IoHandler>>) {
        self.io_handler = handler;
    }

    pub fn page_kind(&self, addr: u16) -> PageKind {
        self.pages[(addr >> 8) as usize]
    }

    /// Store bytes without ROM protection (used to load programs and ROM images).
    pub fn load(&mut self, addr: u16, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u16) as usize;
            self.bytes[a] = b;
        }
    }

    /// Store a little-endian 16-bit vector without ROM protection.
    pub fn set_vector(&mut self, addr: u16, target: u16) {
        self.load(addr, &target.to_le_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn io_reads(&self) -> &[u16] {
        &self.io_reads
    }

    pub fn io_writes(&self) -> &[(u16, u8)] {
        &self.io_writes
    }

    /// Drain the logged I/O reads and writes.
    pub fn take_io_log(&mut self) -> (Vec<u16>, Vec<(u16, u8)>) {
        (std::mem::take(&mut self.io_reads), std::mem::take(&mut self.io_writes))
    }

    fn lowest_io_addr(&self) -> u16 {
        self.pages
            .iter()
            .position(|&kind| kind == PageKind::Io)
            .map(|page| (page as u16) << 8)
            .unwrap_or(0xFFFF)
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAccess for FlatMemory {
    fn read(&self, addr: u16) -> u8 {
        self.bytes[addr as usize]
    }

    fn write(&mut self, addr: u16, value: u8) {
        if self.page_kind(addr) != PageKind::Rom {
            self.bytes[addr as usize] = value;
        }
    }

    fn read_callback(&mut self, addr: u16) -> u8 {
        if self.page_kind(addr) != PageKind::Io {
            return self.read(addr);
        }
        if self.log_io {
            self.io_reads.push(addr);
        }
        match self.io_handler.as_mut() {
            Some(handler) => handler.read(addr),
            None => self.bytes[addr as usize],
        }
    }

    fn write_callback(&mut self, addr: u16, value: u8) {
        if self.page_kind(addr) != PageKind::Io {
            return self.write(addr, value);
        }
        if self.log_io {
            self.io_writes.push((addr, value));
        }
        match self.io_handler.as_mut() {
            Some(handler) => handler.write(addr, value),
            None => self.bytes[addr as usize] = value,
        }
    }

    fn read_needs_callback(&self, addr: u16) -> bool {
        self.page_kind(addr) == PageKind::Io
    }

    fn write_needs_callback(&self, addr: u16) -> bool {
        self.page_kind(addr) == PageKind::Io
    }

    fn read_needs_callback_above(&self) -> u16 {
        self.lowest_io_addr()
    }

    fn write_needs_callback_above(&self) -> u16 {
        self.lowest_io_addr()
    }

    fn is_always_ram(&self, addr: u16) -> bool {
        self.page_kind(addr) == PageKind::Ram
    }
}
