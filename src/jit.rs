use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, trace};

use crate::backend::block_cache::{BlockCache, JitPtr};
use crate::backend::block_compiler::{BlockCompiler, CompileStats};
use crate::backend::block_of_code::CodeArena;
use crate::backend::jit_state::MachineState;
use crate::backend::threaded::executor::ResumePoint;
use crate::backend::threaded::ThreadedEmitter;
use crate::error::JitError;
use crate::frontend::m6502::tables::VECTOR_RESET;
use crate::halt_reason::HaltReason;
use crate::interpreter::{take_irq, Bus, Interpreter, Nmos6502Interpreter};
use crate::jit_config::{DebugHook, JitConfig};
use crate::memory::MemoryAccess;

/// Cycle budget per slice when running from `enter`; IRQs are checked between slices.
const ENTER_SLICE_CYCLES: i64 = 100_000;

/// Public 6502 JIT.
///
/// Owns the guest memory, the machine state and all compiled code. Create
/// one per emulated CPU, then call `enter` or `execute`.
pub struct Jit6502<M: MemoryAccess> {
    inner: Box<JitInner<M>>,
}

/// Internal JIT state shared by the executor and the public surface.
pub(crate) struct JitInner<M: MemoryAccess> {
    pub(crate) state: MachineState,
    pub(crate) memory: M,
    pub(crate) arena: CodeArena,
    pub(crate) cache: BlockCache,
    pub(crate) compiler: BlockCompiler<ThreadedEmitter>,
    pub(crate) interpreter: Box<dyn Interpreter>,
    pub(crate) debug_hook: Option<Box<dyn DebugHook>>,
    /// Runtime-computed accesses at or above this address use the callback path.
    pub(crate) callback_above: u16,
    pub(crate) resume: Option<ResumePoint>,
    pub(crate) halt_reason: AtomicU32,
    pub(crate) is_executing: bool,
}

/// Bus handed to the interpreter: writes retire compiled code they touch.
pub(crate) struct JitBus<'a, M: MemoryAccess> {
    pub(crate) memory: &'a mut M,
    pub(crate) cache: &'a BlockCache,
    pub(crate) callback_above: u16,
}

impl<M: MemoryAccess> Bus for JitBus<'_, M> {
    fn read(&mut self, addr: u16) -> u8 {
        if addr >= self.callback_above {
            self.memory.read_callback(addr)
        } else {
            self.memory.read(addr)
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        if self.cache.has_code(addr) {
            self.cache.invalidate(addr);
        }
        if addr >= self.callback_above {
            self.memory.write_callback(addr, value);
        } else {
            self.memory.write(addr, value);
        }
    }
}

impl<M: MemoryAccess> Jit6502<M> {
    /// Create a JIT over `memory` with the reference interpreter.
    pub fn new(memory: M, config: JitConfig) -> Result<Self, JitError> {
        Self::with_interpreter(memory, config, Box::new(Nmos6502Interpreter::new()))
    }

    /// Create a JIT with a custom interpreter for the instructions compiled code bounces.
    pub fn with_interpreter(
        memory: M,
        config: JitConfig,
        interpreter: Box<dyn Interpreter>,
    ) -> Result<Self, JitError> {
        config.validate()?;
        let compiler = BlockCompiler::new(ThreadedEmitter::new(), &config, &memory);
        let callback_above = compiler.needs_callback_above();
        debug!(
            arena = config.code_arena_size,
            window = config.compile_window_size,
            callback_above,
            "creating jit"
        );
        let inner = Box::new(JitInner {
            state: MachineState::new(),
            memory,
            arena: CodeArena::with_size(config.code_arena_size),
            cache: BlockCache::new(),
            compiler,
            interpreter,
            debug_hook: None,
            callback_above,
            resume: None,
            halt_reason: AtomicU32::new(0),
            is_executing: false,
        });
        Ok(Self { inner })
    }

    /// Reset to power-on state, jump through the little-endian vector at
    /// `vector_address` and run until the guest deliberately stops.
    pub fn enter(&mut self, vector_address: u16) -> Result<HaltReason, JitError> {
        self.inner.state.reset();
        self.inner.resume = None;
        let lo = self.inner.memory.read(vector_address);
        let hi = self.inner.memory.read(vector_address.wrapping_add(1));
        self.inner.state.pc = u16::from_le_bytes([lo, hi]);
        debug!(vector = vector_address, pc = self.inner.state.pc, "enter");

        loop {
            self.inner.state.countdown = ENTER_SLICE_CYCLES;
            let reason = self.run()?;
            if reason != HaltReason::COUNTDOWN {
                return Ok(reason);
            }
        }
    }

    /// Enter through the reset vector.
    pub fn reset(&mut self) -> Result<HaltReason, JitError> {
        self.enter(VECTOR_RESET)
    }

    /// Run from `pc` with a budget of `cycles`.
    ///
    /// Returns `HaltReason::COUNTDOWN` when the budget runs out; the
    /// remaining budget (never below the last run's refund point) stays in
    /// `countdown()`.
    pub fn execute(&mut self, pc: u16, cycles: i64) -> Result<HaltReason, JitError> {
        self.inner.state.pc = pc;
        self.inner.state.countdown = cycles;
        self.run()
    }

    /// Continue from the current PC with the current budget.
    pub fn run(&mut self) -> Result<HaltReason, JitError> {
        assert!(!self.inner.is_executing, "Recursive JIT execution not allowed");
        self.inner.is_executing = true;
        self.inner.service_irq();
        let result = self.inner.run_code();
        self.inner.is_executing = false;
        match &result {
            Ok(reason) => trace!(pc = self.inner.state.pc, ?reason, "run finished"),
            Err(err) => debug!(pc = self.inner.state.pc, %err, "run failed"),
        }
        result
    }

    /// Request a halt; takes effect at the next countdown check.
    pub fn halt_execution(&self, reason: HaltReason) {
        self.inner.halt_reason.fetch_or(reason.bits(), Ordering::Release);
    }

    /// Clear specific halt reason bits.
    pub fn clear_halt(&self, reason: HaltReason) {
        self.inner.halt_reason.fetch_and(!reason.bits(), Ordering::Release);
    }

    /// Drive the level-triggered IRQ line.
    pub fn set_irq(&mut self, asserted: bool) {
        self.inner.state.irq_asserted = asserted;
    }

    pub fn set_debug_hook(&mut self, hook: Option<Box<dyn DebugHook>>) {
        self.inner.debug_hook = hook;
    }

    pub fn compile_for_code_in_zero_page(&self) -> bool {
        self.inner.compiler.compile_for_code_in_zero_page()
    }

    /// Track stores into zero page as possible code writes. Turning this on
    /// drops every compiled block.
    pub fn set_compile_for_code_in_zero_page(&mut self, on: bool) {
        let inner = &mut *self.inner;
        if on == inner.compiler.compile_for_code_in_zero_page() {
            return;
        }
        debug!(on, "compile for code in zero page");
        inner.compiler.set_compile_for_code_in_zero_page(on);
        if on {
            inner.compiler.flush(&mut inner.arena, &inner.cache);
            inner.resume = None;
        }
    }

    // ---- Invalidation ----

    /// Retire the block covering `addr`. Cheap; a no-op when nothing covers it.
    pub fn invalidate(&self, addr: u16) {
        self.inner.cache.invalidate(addr);
    }

    /// Forget all compiled code for `len` bytes from `start`.
    pub fn invalidate_range(&mut self, start: u16, len: u32) {
        let inner = &mut *self.inner;
        inner.compiler.memory_range_invalidate(start, len, &inner.cache);
        inner.resume = None;
    }

    /// Write guest memory from the host, retiring any code at `addr`.
    pub fn write_memory(&mut self, addr: u16, value: u8) {
        self.inner.cache.invalidate(addr);
        self.inner.memory.write(addr, value);
    }

    pub fn read_memory(&self, addr: u16) -> u8 {
        self.inner.memory.read(addr)
    }

    pub fn memory(&self) -> &M {
        &self.inner.memory
    }

    /// Give the guest memory back, dropping all compiled code.
    pub fn into_memory(self) -> M {
        self.inner.memory
    }

    /// Mutable access to guest memory. Code the caller overwrites must be
    /// retired with `invalidate` or `invalidate_range`.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.inner.memory
    }

    // ---- Register accessors ----

    pub fn state(&self) -> &MachineState {
        &self.inner.state
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        self.inner.resume = None;
        &mut self.inner.state
    }

    pub fn a(&self) -> u8 {
        self.inner.state.a
    }

    pub fn set_a(&mut self, value: u8) {
        self.state_mut().a = value;
    }

    pub fn x(&self) -> u8 {
        self.inner.state.x
    }

    pub fn set_x(&mut self, value: u8) {
        self.state_mut().x = value;
    }

    pub fn y(&self) -> u8 {
        self.inner.state.y
    }

    pub fn set_y(&mut self, value: u8) {
        self.state_mut().y = value;
    }

    pub fn s(&self) -> u8 {
        self.inner.state.s
    }

    pub fn set_s(&mut self, value: u8) {
        self.state_mut().s = value;
    }

    pub fn pc(&self) -> u16 {
        self.inner.state.pc
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.state_mut().pc = pc;
    }

    /// Packed status register.
    pub fn flags(&self) -> u8 {
        self.inner.state.flags()
    }

    pub fn set_flags(&mut self, p: u8) {
        self.state_mut().set_flags(p);
    }

    pub fn countdown(&self) -> i64 {
        self.inner.state.countdown
    }

    // ---- Introspection ----

    pub fn jit_ptr(&self, addr: u16) -> Option<JitPtr> {
        self.inner.cache.jit_ptr(addr)
    }

    /// Host entry of the block starting at `addr`, if live.
    pub fn block_entry(&self, addr: u16) -> Option<u32> {
        self.inner.cache.entry(addr)
    }

    pub fn is_block_start(&self, addr: u16) -> bool {
        self.inner.compiler.is_block_start(addr)
    }

    pub fn is_block_continuation(&self, addr: u16) -> bool {
        self.inner.compiler.is_block_continuation(addr)
    }

    pub fn cycles_fixup(&self, addr: u16) -> Option<u32> {
        self.inner.compiler.cycles_fixup(addr)
    }

    /// Number of live blocks.
    pub fn num_blocks(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn compile_stats(&self) -> CompileStats {
        self.inner.compiler.stats()
    }

    /// Host code bytes in use.
    pub fn code_size(&self) -> usize {
        self.inner.arena.code_size()
    }
}

impl<M: MemoryAccess> JitInner<M> {
    /// Take a pending IRQ if the I flag allows it.
    pub(crate) fn service_irq(&mut self) {
        if !self.state.irq_pending() {
            return;
        }
        let from = self.state.pc;
        let mut bus = JitBus { memory: &mut self.memory, cache: &self.cache, callback_above: self.callback_above };
        let cycles = take_irq(&mut self.state, &mut bus);
        self.state.countdown -= cycles as i64;
        self.resume = None;
        debug!(from, handler = self.state.pc, "irq taken");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlatMemory, PageKind};
    use crate::jit_config::OptimizationFlag;

    fn setup_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn jit_with(program: &[u8], config: JitConfig) -> Jit6502<FlatMemory> {
        setup_tracing();
        let mut mem = FlatMemory::new();
        mem.load(0x1000, program);
        mem.set_vector(VECTOR_RESET, 0x1000);
        Jit6502::new(mem, config).unwrap()
    }

    fn new_jit(program: &[u8]) -> Jit6502<FlatMemory> {
        jit_with(program, JitConfig { code_arena_size: 1024 * 1024, ..JitConfig::default() })
    }

    #[test]
    fn test_lda_zero_sta_end_to_end() {
        // LDA #$00; STA $2000; exit
        let mut jit = new_jit(&[0xA9, 0x00, 0x8D, 0x00, 0x20, 0x02]);
        jit.write_memory(0x2000, 0x55);
        assert_eq!(jit.reset().unwrap(), HaltReason::EXIT);
        assert_eq!(jit.read_memory(0x2000), 0);
        assert_eq!(jit.a(), 0);
        let state = jit.state();
        assert!(state.flag_z);
        assert!(!state.flag_n);
        assert_eq!(jit.pc(), 0x1005);
    }

    #[test]
    fn test_exit_consumes_exact_cycles() {
        let mut jit = new_jit(&[0xA9, 0x00, 0x8D, 0x00, 0x20, 0x02]);
        assert_eq!(jit.execute(0x1000, 100).unwrap(), HaltReason::EXIT);
        assert_eq!(100 - jit.countdown(), 6);
    }

    #[test]
    fn test_hang_opcodes() {
        let mut jit = new_jit(&[0x12]);
        assert_eq!(jit.execute(0x1000, 100).unwrap(), HaltReason::DEBUG_BREAK);

        let mut jit = new_jit(&[0xEA, 0xF2]);
        assert_eq!(jit.execute(0x1000, 100), Err(JitError::DeliberateFault { addr: 0x1001 }));

        let mut jit = new_jit(&[0xEA, 0x03]);
        assert_eq!(jit.execute(0x1000, 100), Err(JitError::UndefinedOpcode { opcode: 0x03, addr: 0x1001 }));
        assert_eq!(jit.pc(), 0x1001);
    }

    #[test]
    fn test_countdown_expiry_and_resume() {
        // LDX #$00; loop: INX; BNE loop; exit
        let mut jit = new_jit(&[0xA2, 0x00, 0xE8, 0xD0, 0xFD, 0x02]);
        let reason = jit.execute(0x1000, 50).unwrap();
        assert_eq!(reason, HaltReason::COUNTDOWN);
        assert!(jit.countdown() >= 0);
        assert!(jit.x() > 0);

        let mut total = 50 - jit.countdown();
        loop {
            let before = 1000;
            let pc = jit.pc();
            let reason = jit.execute(pc, before).unwrap();
            total += before - jit.countdown();
            if reason == HaltReason::EXIT {
                break;
            }
        }
        assert_eq!(jit.x(), 0);
        // 2 + 255 * (2 + 3) + (2 + 2)
        assert_eq!(total, 2 + 255 * 5 + 4);
    }

    #[test]
    fn test_self_modifying_store_recompiles() {
        // LDA #$42; STA $1006; LDA #$00; exit
        // The store patches the immediate of the next instruction in the same block.
        let mut jit = new_jit(&[0xA9, 0x42, 0x8D, 0x06, 0x10, 0xA9, 0x00, 0x02]);
        assert_eq!(jit.reset().unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x42);
        assert!(!jit.state().flag_z);
    }

    #[test]
    fn test_invalidate_forces_recompile() {
        let mut jit = new_jit(&[0xA9, 0x01, 0x02]);
        jit.execute(0x1000, 100).unwrap();
        assert_eq!(jit.a(), 1);
        let entry = jit.block_entry(0x1000);
        assert!(entry.is_some());

        jit.write_memory(0x1001, 0x07);
        assert_eq!(jit.block_entry(0x1000), None);
        jit.execute(0x1000, 100).unwrap();
        assert_eq!(jit.a(), 7);
        assert!(jit.block_entry(0x1000).is_some());
        assert_ne!(jit.block_entry(0x1000), entry);
    }

    #[test]
    fn test_invalidate_range_clears_pointers() {
        let mut jit = new_jit(&[0xEA, 0xEA, 0x02]);
        jit.execute(0x1000, 100).unwrap();
        assert!(jit.jit_ptr(0x1001).is_some());
        jit.invalidate_range(0x1000, 3);
        assert_eq!(jit.jit_ptr(0x1001), None);
        assert_eq!(jit.block_entry(0x1000), None);
        assert_eq!(jit.num_blocks(), 0);
    }

    #[test]
    fn test_decimal_mode_bounces_to_interpreter() {
        // SED; CLC; LDA #$19; ADC #$28; exit
        let mut jit = new_jit(&[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x28, 0x02]);
        assert_eq!(jit.reset().unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x47);
    }

    #[test]
    fn test_io_read_goes_through_callback() {
        // LDA $FE40; LDY #$00; LDA ($70),Y; exit
        let mut mem = FlatMemory::new();
        mem.set_pages(0xFE00..=0xFEFF, PageKind::Io);
        mem.load(0x1000, &[0xAD, 0x40, 0xFE, 0xA0, 0x00, 0xB1, 0x70, 0x02]);
        mem.load(0x0070, &[0x41, 0xFE]);
        mem.load(0xFE40, &[0x99, 0x55]);
        let mut jit = Jit6502::new(mem.with_io_log(), JitConfig::default()).unwrap();
        assert_eq!(jit.execute(0x1000, 100).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x55);
        let (reads, writes) = jit.memory_mut().take_io_log();
        assert_eq!(reads, vec![0xFE40, 0xFE41]);
        assert!(writes.is_empty());
        assert!(jit.memory().io_reads().is_empty());
    }

    #[test]
    fn test_register_change_drops_resume_point() {
        // LDA #$05; BEQ +0; STA $2000; exit
        let mut jit = new_jit(&[0xA9, 0x05, 0xF0, 0x00, 0x8D, 0x00, 0x20, 0x02]);
        assert_eq!(jit.execute(0x1000, 6).unwrap(), HaltReason::COUNTDOWN);
        assert_eq!(jit.pc(), 0x1004);
        jit.set_a(0x77);
        assert_eq!(jit.execute(0x1004, 100).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.read_memory(0x2000), 0x77);
    }

    #[test]
    fn test_flag_change_drops_resume_point() {
        // CLC; BCC +0; ADC #$01; STA $2000; exit
        let mut jit = new_jit(&[0x18, 0x90, 0x00, 0x69, 0x01, 0x8D, 0x00, 0x20, 0x02]);
        assert_eq!(jit.execute(0x1000, 5).unwrap(), HaltReason::COUNTDOWN);
        assert_eq!(jit.pc(), 0x1003);
        jit.set_flags(jit.flags() | 0x01);
        assert_eq!(jit.execute(0x1003, 100).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.read_memory(0x2000), 0x02);
    }

    #[test]
    fn test_zero_page_toggle_at_runtime() {
        // $1000: JSR $0080; exit.  $1010: STX $81; JSR $0080; exit.  $0080: LDA #$11; RTS
        let mut jit = new_jit(&[0x20, 0x80, 0x00, 0x02]);
        jit.memory_mut().load(0x1010, &[0x86, 0x81, 0x20, 0x80, 0x00, 0x02]);
        jit.memory_mut().load(0x0080, &[0xA9, 0x11, 0x60]);
        jit.set_s(0xFF);
        assert_eq!(jit.execute(0x1000, 1000).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x11);

        // Zero-page stores are not tracked yet, so the old routine runs.
        jit.set_x(0x22);
        assert_eq!(jit.execute(0x1010, 1000).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.read_memory(0x0081), 0x22);
        assert_eq!(jit.a(), 0x11);

        jit.set_compile_for_code_in_zero_page(true);
        assert!(jit.compile_for_code_in_zero_page());
        assert_eq!(jit.num_blocks(), 0);
        assert_eq!(jit.execute(0x1000, 1000).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x22);

        jit.set_x(0x33);
        assert_eq!(jit.execute(0x1010, 1000).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x33);

        // Turning it off keeps compiled code.
        let blocks = jit.num_blocks();
        jit.set_compile_for_code_in_zero_page(false);
        assert_eq!(jit.num_blocks(), blocks);
    }

    #[test]
    fn test_irq_serviced_after_cli() {
        // CLI; NOP; exit.  IRQ handler at 0x3000: LDA #$77; exit
        let mut jit = new_jit(&[0x58, 0xEA, 0x02]);
        jit.memory_mut().load(0x3000, &[0xA9, 0x77, 0x02]);
        jit.memory_mut().set_vector(0xFFFE, 0x3000);
        jit.state_mut().s = 0xFF;
        jit.state_mut().set_flag_i(true);
        jit.set_irq(true);
        assert_eq!(jit.execute(0x1000, 1000).unwrap(), HaltReason::EXIT);
        assert_eq!(jit.a(), 0x77);
        assert!(jit.state().flag_i());
        // Return address is the NOP after CLI.
        assert_eq!(jit.read_memory(0x01FF), 0x10);
        assert_eq!(jit.read_memory(0x01FE), 0x01);
    }

    #[test]
    fn test_external_halt() {
        let mut jit = new_jit(&[0xEA, 0x4C, 0x00, 0x10]);
        jit.halt_execution(HaltReason::EXTERNAL_HALT);
        assert_eq!(jit.execute(0x1000, 1000).unwrap(), HaltReason::EXTERNAL_HALT);
        jit.clear_halt(HaltReason::EXTERNAL_HALT);
        assert_eq!(jit.execute(0x1000, 30).unwrap(), HaltReason::COUNTDOWN);
    }

    #[test]
    fn test_debug_hook_sees_every_instruction() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Recorder(Rc<RefCell<Vec<u16>>>);
        impl DebugHook for Recorder {
            fn on_instruction(&mut self, addr: u16, _state: &MachineState) -> bool {
                self.0.borrow_mut().push(addr);
                addr == 0x1003
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        let config = JitConfig { debug: true, optimizations: OptimizationFlag::NO_OPTIMIZATIONS, ..JitConfig::default() };
        let mut jit = jit_with(&[0xEA, 0xA9, 0x05, 0xE8, 0x02], config);
        jit.set_debug_hook(Some(Box::new(Recorder(seen.clone()))));
        assert_eq!(jit.execute(0x1000, 100).unwrap(), HaltReason::EXTERNAL_HALT);
        assert_eq!(*seen.borrow(), vec![0x1000, 0x1001, 0x1003]);
        assert_eq!(jit.pc(), 0x1003);
        assert_eq!(100 - jit.countdown(), 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = JitConfig { compile_window_size: 8, ..JitConfig::default() };
        assert!(matches!(Jit6502::new(FlatMemory::new(), config), Err(JitError::InvalidConfig(_))));
    }
}
