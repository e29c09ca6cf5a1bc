use tracing::{debug, trace, warn};

use crate::backend::block_cache::{BlockCache, JitPtr};
use crate::backend::block_of_code::{CodeArena, CodeBuffer};
use crate::backend::emit::CodeEmitter;
use crate::frontend::m6502::decompose::{decompose, TranslationOptions};
use crate::frontend::m6502::tables::BranchClass;
use crate::ir::opcode_record::{fixup_countdowns, OpcodeRecord};
use crate::ir::opt;
use crate::ir::uop::Uop;
use crate::jit_config::{JitConfig, OptimizationFlag};
use crate::memory::{MemoryAccess, ADDR_SPACE_SIZE};

/// Most guest instructions considered by one compile.
pub const MAX_OPCODES_PER_COMPILE: usize = 256;

/// Scratch space for one instruction's host code.
const SINGLE_OPCODE_BUFFER_SIZE: usize = 128;

/// Per-address facts kept alongside compiled code.
struct AddrMetadata {
    /// Opcode byte at compile time, on the first byte of each compiled instruction.
    opcode: Box<[Option<u8>]>,
    /// Cycles to refund when leaving a countdown run at this instruction.
    cycles_fixup: Box<[Option<u32>]>,
    is_block_start: Box<[bool]>,
    /// Marked where a compile ran out of window space; the next block here
    /// continues that one.
    is_block_continuation: Box<[bool]>,
}

impl AddrMetadata {
    fn new() -> Self {
        Self {
            opcode: vec![None; ADDR_SPACE_SIZE].into_boxed_slice(),
            cycles_fixup: vec![None; ADDR_SPACE_SIZE].into_boxed_slice(),
            is_block_start: vec![false; ADDR_SPACE_SIZE].into_boxed_slice(),
            is_block_continuation: vec![false; ADDR_SPACE_SIZE].into_boxed_slice(),
        }
    }

    fn clear_addr(&mut self, addr: u16) {
        let i = addr as usize;
        self.opcode[i] = None;
        self.cycles_fixup[i] = None;
        self.is_block_start[i] = false;
        self.is_block_continuation[i] = false;
    }

    fn clear(&mut self) {
        self.opcode.fill(None);
        self.cycles_fixup.fill(None);
        self.is_block_start.fill(false);
        self.is_block_continuation.fill(false);
    }
}

/// Counters for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub blocks_compiled: u64,
    pub blocks_truncated: u64,
    pub arena_flushes: u64,
}

/// Turns guest code into host code, one block per call.
///
/// A block starts at the requested address and runs until an instruction
/// that always leaves, an existing block start, or one of the size limits.
/// Host code goes into a fixed window of the arena; if it does not fit,
/// the block is cut at an instruction boundary and the remainder becomes a
/// continuation compiled on demand.
pub struct BlockCompiler<E: CodeEmitter> {
    emitter: E,
    options: TranslationOptions,
    max_ops_per_block: u32,
    optimizations: OptimizationFlag,
    window_size: usize,
    needs_callback_above: u16,
    meta: AddrMetadata,
    stats: CompileStats,
}

impl<E: CodeEmitter> BlockCompiler<E> {
    pub fn new<M: MemoryAccess + ?Sized>(emitter: E, config: &JitConfig, memory: &M) -> Self {
        let needs_callback_above = memory.read_needs_callback_above().min(memory.write_needs_callback_above());
        Self {
            emitter,
            options: TranslationOptions {
                debug: config.debug,
                accurate_timings: config.accurate_timings,
                compile_for_code_in_zero_page: config.compile_for_code_in_zero_page,
            },
            max_ops_per_block: config.effective_max_ops_per_block(),
            optimizations: config.optimizations,
            window_size: config.compile_window_size,
            needs_callback_above,
            meta: AddrMetadata::new(),
            stats: CompileStats::default(),
        }
    }

    /// Lowest address at which runtime-computed accesses take the callback path.
    pub fn needs_callback_above(&self) -> u16 {
        self.needs_callback_above
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    pub fn cached_opcode(&self, addr: u16) -> Option<u8> {
        self.meta.opcode[addr as usize]
    }

    pub fn cycles_fixup(&self, addr: u16) -> Option<u32> {
        self.meta.cycles_fixup[addr as usize]
    }

    pub fn is_block_start(&self, addr: u16) -> bool {
        self.meta.is_block_start[addr as usize]
    }

    pub fn is_block_continuation(&self, addr: u16) -> bool {
        self.meta.is_block_continuation[addr as usize]
    }

    /// Give back the unexecuted part of a countdown run when leaving at `pc`.
    pub fn fixup_state(&self, pc: u16, countdown: i64) -> i64 {
        let Some(fixup) = self.meta.cycles_fixup[pc as usize] else {
            panic!("no cycle fixup recorded for {:#06x}", pc);
        };
        assert!(fixup > 0, "zero cycle fixup at {:#06x}", pc);
        countdown + fixup as i64
    }

    pub fn compile_for_code_in_zero_page(&self) -> bool {
        self.options.compile_for_code_in_zero_page
    }

    /// Only affects blocks compiled from now on.
    pub fn set_compile_for_code_in_zero_page(&mut self, on: bool) {
        self.options.compile_for_code_in_zero_page = on;
    }

    /// Drop every block and all metadata.
    pub fn flush(&mut self, arena: &mut CodeArena, cache: &BlockCache) {
        debug!(used = arena.code_size(), "flushing all blocks");
        arena.clear();
        cache.clear();
        self.meta.clear();
        self.stats.arena_flushes += 1;
    }

    /// Forget compiled code for `len` bytes from `start`.
    ///
    /// Blocks overlapping the range are invalidated first, so nothing keeps
    /// running stale code for it.
    pub fn memory_range_invalidate(&mut self, start: u16, len: u32, cache: &BlockCache) {
        debug!(start, len, "invalidate range");
        for i in 0..len.min(ADDR_SPACE_SIZE as u32) {
            let addr = start.wrapping_add(i as u16);
            cache.invalidate(addr);
            cache.set_no_code(addr);
            cache.reset_entry(addr);
            self.meta.clear_addr(addr);
        }
    }

    /// Compile the block at `start`; returns its host entry offset.
    pub fn compile<M: MemoryAccess + ?Sized>(
        &mut self,
        start: u16,
        memory: &M,
        arena: &mut CodeArena,
        cache: &BlockCache,
    ) -> u32 {
        let mut window_size = arena.space_remaining().min(self.window_size);
        if window_size < JitConfig::MIN_COMPILE_WINDOW_SIZE {
            warn!(used = arena.code_size(), "code arena exhausted");
            self.flush(arena, cache);
            window_size = arena.space_remaining().min(self.window_size);
        }

        // A jump into the middle of a block splits it.
        cache.invalidate(start);
        self.meta.is_block_start[start as usize] = !self.meta.is_block_continuation[start as usize];

        let mut records = self.discover(start, memory);
        fixup_countdowns(&mut records);
        if cfg!(debug_assertions) {
            opt::verification_pass(&records);
        }
        if self.optimizations.contains(OptimizationFlag::PEEPHOLE) {
            opt::peephole(&mut records);
        }

        let total_ops = records.len();
        let used = {
            let mut window = arena.window(window_size);
            let emitted = self.emit_records(&mut records, &mut window, memory);
            records.truncate(emitted);
            let used = window.pos();
            self.emitter.fill_traps(&mut window);
            used
        };

        if records.len() < total_ops {
            self.stats.blocks_truncated += 1;
            let cut = records[records.len() - 1].next_addr();
            debug!(start, kept = records.len(), total = total_ops, continuation = cut, "block truncated");
            self.refixup_countdowns(&mut records, arena, memory);
        }

        arena.commit(used);
        self.commit_metadata(start, &records, cache);
        self.stats.blocks_compiled += 1;

        let entry = records[0].host_offset.unwrap_or_default();
        debug!(start, ops = records.len(), host_offset = entry, host_len = used, "compiled block");
        entry
    }

    fn discover<M: MemoryAccess + ?Sized>(&self, start: u16, memory: &M) -> Vec<OpcodeRecord> {
        let mut records: Vec<OpcodeRecord> = Vec::new();
        let mut addr = start;
        let mut needs_countdown = true;
        let mut block_ended = false;

        loop {
            let mut rec = decompose(memory, &self.options, addr);
            if needs_countdown {
                rec.cycles_run_start = Some(0);
                rec.prepend(Uop::Countdown { addr, cycles: 0 });
                needs_countdown = false;
            }
            addr = rec.next_addr();
            let ends_block = rec.ends_block;
            let branches = rec.branches;
            records.push(rec);

            if ends_block {
                block_ended = true;
                break;
            }
            if self.meta.is_block_start[addr as usize] {
                break;
            }
            if records.len() == MAX_OPCODES_PER_COMPILE || records.len() as u32 >= self.max_ops_per_block {
                break;
            }
            // A branch target may land on the next instruction.
            if branches == BranchClass::Maybe {
                needs_countdown = true;
            }
        }

        // Covered bytes, allowing for the wrap from $FFFF to $0000.
        let covered = addr.wrapping_sub(start);
        assert!(covered > 0, "block at {:#06x} made no forward progress", start);

        if !block_ended {
            if let Some(last) = records.last_mut() {
                last.push(Uop::Jmp { target: addr });
                last.ends_block = true;
            }
        }
        records
    }

    /// Emit records into `window`; returns how many fit.
    fn emit_records<M: MemoryAccess + ?Sized>(
        &mut self,
        records: &mut [OpcodeRecord],
        window: &mut CodeBuffer<'_>,
        memory: &M,
    ) -> usize {
        let mut scratch = [0u8; SINGLE_OPCODE_BUFFER_SIZE];
        for i in 0..records.len() {
            let host_offset = window.host_offset();
            let mut single = CodeBuffer::new(&mut scratch, host_offset);
            for uop_rec in records[i].uops.iter_mut() {
                uop_rec.host_len = self.emitter.emit_uop(&mut single, &uop_rec.uop, memory) as u32;
            }

            let mut needed = single.pos();
            if !records[i].ends_block {
                needed += self.emitter.jmp_len();
            }

            if needed > window.remaining() {
                assert!(i > 0, "first instruction at {:#06x} does not fit a compile window", records[i].addr);
                // Room for this jump was reserved by the previous instruction.
                let addr = records[i].addr;
                trace!(addr, "out of window space, jumping to continuation");
                self.meta.is_block_continuation[addr as usize] = true;
                records[i].prepend(Uop::Jmp { target: addr });
                single.set_pos(0);
                records[i].uops[0].host_len =
                    self.emitter.emit_uop(&mut single, &records[i].uops[0].uop, memory) as u32;
                window.append(&single);
                return i;
            }

            window.append(&single);
            records[i].host_offset = Some(host_offset);
        }
        records.len()
    }

    /// Countdowns in a truncated block overstate their run; patch them in place.
    fn refixup_countdowns<M: MemoryAccess + ?Sized>(
        &self,
        records: &mut [OpcodeRecord],
        arena: &mut CodeArena,
        memory: &M,
    ) {
        fixup_countdowns(records);
        for rec in records.iter_mut() {
            let Some(host_offset) = rec.host_offset else { continue };
            let addr = rec.addr;
            let Some(countdown) = rec.countdown_mut() else { continue };
            let old_len = countdown.host_len as usize;
            let mut patch = arena.patch(host_offset, old_len);
            let new_len = self.emitter.emit_uop(&mut patch, &countdown.uop, memory);
            assert!(new_len <= old_len, "re-emitted countdown grew at {:#06x}", addr);
            self.emitter.pad_nops(&mut patch);
        }
    }

    fn commit_metadata(&mut self, start: u16, records: &[OpcodeRecord], cache: &BlockCache) {
        let mut cycles = 0u32;
        for rec in records {
            if let Some(total) = rec.cycles_run_start {
                cycles = total;
            }
            let Some(host_offset) = rec.host_offset else {
                panic!("committing unemitted instruction at {:#06x}", rec.addr);
            };
            for i in 0..rec.len as u16 {
                let addr = rec.addr.wrapping_add(i);
                let a = addr as usize;
                cache.set_jit_ptr(addr, JitPtr { block: start, host_offset });
                if addr != start {
                    cache.reset_entry(addr);
                    self.meta.is_block_start[a] = false;
                }
                self.meta.is_block_continuation[a] = false;
                if i == 0 {
                    self.meta.opcode[a] = Some(rec.opcode);
                    self.meta.cycles_fixup[a] = Some(cycles);
                } else {
                    self.meta.opcode[a] = None;
                    self.meta.cycles_fixup[a] = None;
                }
            }
            cycles = cycles.saturating_sub(rec.max_cycles as u32);
        }
        if let Some(entry) = records.first().and_then(|r| r.host_offset) {
            cache.set_entry(start, entry);
        }
    }
}
