use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::trace;

use crate::memory::ADDR_SPACE_SIZE;

/// Pointer-table value for an address with no compiled code.
const NO_CODE: u64 = u64::MAX;

/// Entry-table value for an address that must be compiled before running.
const COMPILE_TRAMPOLINE: u32 = u32::MAX;

/// Where the host code for one guest address lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitPtr {
    /// Guest address of the block that covers this address.
    pub block: u16,
    /// Arena offset of the covering instruction's host code.
    pub host_offset: u32,
}

impl JitPtr {
    fn pack(self) -> u64 {
        ((self.block as u64) << 32) | self.host_offset as u64
    }

    fn unpack(raw: u64) -> Option<Self> {
        if raw == NO_CODE {
            return None;
        }
        Some(Self { block: (raw >> 32) as u16, host_offset: raw as u32 })
    }
}

/// Per-address code tables.
///
/// `jit_ptrs` maps every guest address covered by compiled code to the
/// host code of the instruction covering it and the block it belongs to.
/// `entries` is the jump table used by compiled code and the dispatcher: a
/// block start maps to its host entry, every other address to the compile
/// trampoline. Invalidating a block is a single store into `entries`, so
/// it is safe to do while code from that block is running.
pub struct BlockCache {
    jit_ptrs: Box<[AtomicU64]>,
    entries: Box<[AtomicU32]>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            jit_ptrs: (0..ADDR_SPACE_SIZE).map(|_| AtomicU64::new(NO_CODE)).collect(),
            entries: (0..ADDR_SPACE_SIZE).map(|_| AtomicU32::new(COMPILE_TRAMPOLINE)).collect(),
        }
    }

    pub fn jit_ptr(&self, addr: u16) -> Option<JitPtr> {
        JitPtr::unpack(self.jit_ptrs[addr as usize].load(Ordering::Relaxed))
    }

    pub fn set_jit_ptr(&self, addr: u16, ptr: JitPtr) {
        self.jit_ptrs[addr as usize].store(ptr.pack(), Ordering::Relaxed);
    }

    pub fn set_no_code(&self, addr: u16) {
        self.jit_ptrs[addr as usize].store(NO_CODE, Ordering::Relaxed);
    }

    /// Whether compiled code covers `addr`.
    pub fn has_code(&self, addr: u16) -> bool {
        self.jit_ptrs[addr as usize].load(Ordering::Relaxed) != NO_CODE
    }

    /// Host entry for a jump to `addr`; `None` means compile first.
    pub fn entry(&self, addr: u16) -> Option<u32> {
        match self.entries[addr as usize].load(Ordering::Acquire) {
            COMPILE_TRAMPOLINE => None,
            offset => Some(offset),
        }
    }

    pub fn set_entry(&self, addr: u16, host_offset: u32) {
        debug_assert_ne!(host_offset, COMPILE_TRAMPOLINE);
        self.entries[addr as usize].store(host_offset, Ordering::Release);
    }

    /// Route jumps to `addr` through the compile trampoline.
    pub fn reset_entry(&self, addr: u16) {
        self.entries[addr as usize].store(COMPILE_TRAMPOLINE, Ordering::Release);
    }

    /// Invalidate the block covering `addr`. O(1) and idempotent.
    ///
    /// Returns the start of the block that was invalidated, if any.
    pub fn invalidate(&self, addr: u16) -> Option<u16> {
        let ptr = self.jit_ptr(addr)?;
        trace!(addr, block = ptr.block, "invalidate");
        self.reset_entry(ptr.block);
        Some(ptr.block)
    }

    /// Forget everything.
    pub fn clear(&self) {
        for p in self.jit_ptrs.iter() {
            p.store(NO_CODE, Ordering::Relaxed);
        }
        for e in self.entries.iter() {
            e.store(COMPILE_TRAMPOLINE, Ordering::Release);
        }
    }

    /// Guest addresses with a live block entry.
    pub fn live_blocks(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.load(Ordering::Relaxed) != COMPILE_TRAMPOLINE)
            .map(|(addr, _)| addr as u16)
    }

    pub fn len(&self) -> usize {
        self.live_blocks().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}
