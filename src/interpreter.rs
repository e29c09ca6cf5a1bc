//! Reference NMOS 6502 interpreter.
//!
//! Compiled code hands single instructions to an [`Interpreter`] whenever it
//! cannot translate them statically: decimal-mode arithmetic, RTI, accesses
//! that need device callbacks, and instructions that unmask a pending IRQ.

use crate::backend::jit_state::{MachineState, FLAG_B, FLAG_UNUSED};
use crate::frontend::m6502::tables::{opcode_info, OpMem, OpMode, OpType, VECTOR_IRQ};

/// Memory as seen by the interpreter.
pub trait Bus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
}

/// Why an instruction stopped execution instead of completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// 0x02
    Exit,
    /// 0x12
    DebugBreak,
    /// 0xF2
    Crash,
    Undefined(u8),
}

/// Outcome of one interpreted instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Cycles the instruction took, penalties included. Zero on exit.
    pub cycles: u32,
    pub exit: Option<StepExit>,
}

pub trait Interpreter {
    /// Execute the single instruction at `state.pc` and leave `state.pc` at the next one.
    ///
    /// On an exit, `state.pc` still names the exiting instruction.
    fn run_one_instruction(&mut self, state: &mut MachineState, bus: &mut dyn Bus) -> Step;
}

/// Cycles taken to service an IRQ.
pub const IRQ_CYCLES: u32 = 7;

pub fn push(state: &mut MachineState, bus: &mut dyn Bus, value: u8) {
    bus.write(0x0100 | state.s as u16, value);
    state.s = state.s.wrapping_sub(1);
}

pub fn pull(state: &mut MachineState, bus: &mut dyn Bus) -> u8 {
    state.s = state.s.wrapping_add(1);
    bus.read(0x0100 | state.s as u16)
}

/// Push PC and flags, mask interrupts and jump through the IRQ vector.
pub fn take_irq(state: &mut MachineState, bus: &mut dyn Bus) -> u32 {
    let pc = state.pc;
    push(state, bus, (pc >> 8) as u8);
    push(state, bus, pc as u8);
    let p = (state.flags() & !FLAG_B) | FLAG_UNUSED;
    push(state, bus, p);
    state.set_flag_i(true);
    let lo = bus.read(VECTOR_IRQ);
    let hi = bus.read(VECTOR_IRQ.wrapping_add(1));
    state.pc = u16::from_le_bytes([lo, hi]);
    IRQ_CYCLES
}

/// Straightforward table-driven interpreter with exact NMOS timings.
#[derive(Debug, Default, Clone, Copy)]
pub struct Nmos6502Interpreter;

impl Nmos6502Interpreter {
    pub fn new() -> Self {
        Self
    }
}

fn adc_binary(state: &mut MachineState, m: u8) {
    let a = state.a;
    let sum = a as u16 + m as u16 + state.flag_c as u16;
    let result = sum as u8;
    state.flag_v = (a ^ result) & (m ^ result) & 0x80 != 0;
    state.flag_c = sum > 0xFF;
    state.a = result;
    state.set_zn(result);
}

fn adc_decimal(state: &mut MachineState, m: u8) {
    let a = state.a as u16;
    let m16 = m as u16;
    let c = state.flag_c as u16;
    state.flag_z = (a + m16 + c) & 0xFF == 0;
    let mut lo = (a & 0x0F) + (m16 & 0x0F) + c;
    if lo > 9 {
        lo += 6;
    }
    let mut hi = (a >> 4) + (m16 >> 4) + (lo > 0x0F) as u16;
    state.flag_n = hi & 0x08 != 0;
    state.flag_v = (a ^ m16) & 0x80 == 0 && (a ^ (hi << 4)) & 0x80 != 0;
    if hi > 9 {
        hi += 6;
    }
    state.flag_c = hi > 0x0F;
    state.a = ((hi << 4) | (lo & 0x0F)) as u8;
}

fn sbc_binary(state: &mut MachineState, m: u8) {
    let a = state.a;
    let borrow = !state.flag_c as i16;
    let diff = a as i16 - m as i16 - borrow;
    let result = diff as u8;
    state.flag_v = (a ^ m) & (a ^ result) & 0x80 != 0;
    state.flag_c = diff >= 0;
    state.a = result;
    state.set_zn(result);
}

fn sbc_decimal(state: &mut MachineState, m: u8) {
    let a = state.a;
    let borrow = !state.flag_c as i16;
    let diff = a as i16 - m as i16 - borrow;
    let result = diff as u8;
    state.flag_v = (a ^ m) & (a ^ result) & 0x80 != 0;
    state.flag_c = diff >= 0;
    state.set_zn(result);

    let mut lo = (a & 0x0F) as i16 - (m & 0x0F) as i16 - borrow;
    let mut hi = (a >> 4) as i16 - (m >> 4) as i16;
    if lo < 0 {
        lo -= 6;
        hi -= 1;
    }
    if hi < 0 {
        hi -= 6;
    }
    state.a = (((hi << 4) | (lo & 0x0F)) & 0xFF) as u8;
}

fn compare(state: &mut MachineState, reg: u8, m: u8) {
    state.flag_c = reg >= m;
    state.set_zn(reg.wrapping_sub(m));
}

/// Shift/rotate on a value; returns the result and updates C, Z and N.
fn shift(state: &mut MachineState, optype: OpType, v: u8) -> u8 {
    let carry_in = state.flag_c as u8;
    let (result, carry_out) = match optype {
        OpType::Asl | OpType::Slo => (v << 1, v & 0x80 != 0),
        OpType::Lsr => (v >> 1, v & 0x01 != 0),
        OpType::Rol => ((v << 1) | carry_in, v & 0x80 != 0),
        OpType::Ror => ((v >> 1) | (carry_in << 7), v & 0x01 != 0),
        _ => unreachable!("{optype} is not a shift"),
    };
    state.flag_c = carry_out;
    state.set_zn(result);
    result
}

impl Interpreter for Nmos6502Interpreter {
    fn run_one_instruction(&mut self, state: &mut MachineState, bus: &mut dyn Bus) -> Step {
        let addr = state.pc;
        let opcode = bus.read(addr);
        let info = opcode_info(opcode);
        let optype = info.optype;
        let mode = info.mode;
        let mut cycles = info.cycles as u32;

        let op1 = if info.len() >= 2 { bus.read(addr.wrapping_add(1)) } else { 0 };
        let op2 = if info.len() >= 3 { bus.read(addr.wrapping_add(2)) } else { 0 };
        let word = u16::from_le_bytes([op1, op2]);
        let next = addr.wrapping_add(info.len() as u16);

        let read_ptr = |bus: &mut dyn Bus, ptr: u16| -> u16 {
            let lo = bus.read(ptr);
            let hi = bus.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF));
            u16::from_le_bytes([lo, hi])
        };

        let mut base = 0u16;
        let ea = match mode {
            OpMode::Nil | OpMode::Acc | OpMode::Imm => 0,
            OpMode::Zpg => op1 as u16,
            OpMode::Zpx => op1.wrapping_add(state.x) as u16,
            OpMode::Zpy => op1.wrapping_add(state.y) as u16,
            OpMode::Abs => word,
            OpMode::Abx => {
                base = word;
                word.wrapping_add(state.x as u16)
            }
            OpMode::Aby => {
                base = word;
                word.wrapping_add(state.y as u16)
            }
            OpMode::Ind => read_ptr(bus, word),
            OpMode::Idx => read_ptr(bus, op1.wrapping_add(state.x) as u16),
            OpMode::Idy => {
                base = read_ptr(bus, op1 as u16);
                base.wrapping_add(state.y as u16)
            }
            OpMode::Rel => next.wrapping_add(op1 as i8 as u16),
        };

        if info.mem() == OpMem::Read
            && matches!(mode, OpMode::Abx | OpMode::Aby | OpMode::Idy)
            && (base ^ ea) & 0xFF00 != 0
        {
            cycles += 1;
        }

        let load = |bus: &mut dyn Bus| -> u8 {
            if mode == OpMode::Imm {
                op1
            } else {
                bus.read(ea)
            }
        };

        let mut pc = next;
        let branch = |taken: bool, cycles: &mut u32, pc: &mut u16| {
            if taken {
                *cycles += 1;
                if (next ^ ea) & 0xFF00 != 0 {
                    *cycles += 1;
                }
                *pc = ea;
            }
        };

        match optype {
            OpType::Adc => {
                let m = load(bus);
                if state.flag_d() {
                    adc_decimal(state, m);
                } else {
                    adc_binary(state, m);
                }
            }
            OpType::Sbc => {
                let m = load(bus);
                if state.flag_d() {
                    sbc_decimal(state, m);
                } else {
                    sbc_binary(state, m);
                }
            }
            OpType::And => {
                state.a &= load(bus);
                state.set_zn(state.a);
            }
            OpType::Ora => {
                state.a |= load(bus);
                state.set_zn(state.a);
            }
            OpType::Eor => {
                state.a ^= load(bus);
                state.set_zn(state.a);
            }
            OpType::Alr => {
                let v = state.a & load(bus);
                state.flag_c = v & 1 != 0;
                state.a = v >> 1;
                state.set_zn(state.a);
            }
            OpType::Bit => {
                let m = load(bus);
                state.flag_z = state.a & m == 0;
                state.flag_n = m & 0x80 != 0;
                state.flag_v = m & 0x40 != 0;
            }
            OpType::Cmp => {
                let (reg, m) = (state.a, load(bus));
                compare(state, reg, m);
            }
            OpType::Cpx => {
                let (reg, m) = (state.x, load(bus));
                compare(state, reg, m);
            }
            OpType::Cpy => {
                let (reg, m) = (state.y, load(bus));
                compare(state, reg, m);
            }
            OpType::Lda => {
                state.a = load(bus);
                state.set_zn(state.a);
            }
            OpType::Ldx => {
                state.x = load(bus);
                state.set_zn(state.x);
            }
            OpType::Ldy => {
                state.y = load(bus);
                state.set_zn(state.y);
            }
            OpType::Nop => {
                if mode != OpMode::Nil && mode != OpMode::Imm {
                    load(bus);
                }
            }
            OpType::Sta => bus.write(ea, state.a),
            OpType::Stx => bus.write(ea, state.x),
            OpType::Sty => bus.write(ea, state.y),
            OpType::Sax => bus.write(ea, state.a & state.x),
            OpType::Asl | OpType::Lsr | OpType::Rol | OpType::Ror | OpType::Slo => {
                if mode == OpMode::Acc {
                    let a = state.a;
                    state.a = shift(state, optype, a);
                } else {
                    let v = bus.read(ea);
                    bus.write(ea, v);
                    let result = shift(state, optype, v);
                    bus.write(ea, result);
                    if optype == OpType::Slo {
                        state.a |= result;
                        state.set_zn(state.a);
                    }
                }
            }
            OpType::Inc | OpType::Dec => {
                let v = bus.read(ea);
                bus.write(ea, v);
                let result = if optype == OpType::Inc { v.wrapping_add(1) } else { v.wrapping_sub(1) };
                state.set_zn(result);
                bus.write(ea, result);
            }
            OpType::Inx => {
                state.x = state.x.wrapping_add(1);
                state.set_zn(state.x);
            }
            OpType::Iny => {
                state.y = state.y.wrapping_add(1);
                state.set_zn(state.y);
            }
            OpType::Dex => {
                state.x = state.x.wrapping_sub(1);
                state.set_zn(state.x);
            }
            OpType::Dey => {
                state.y = state.y.wrapping_sub(1);
                state.set_zn(state.y);
            }
            OpType::Tax => {
                state.x = state.a;
                state.set_zn(state.x);
            }
            OpType::Tay => {
                state.y = state.a;
                state.set_zn(state.y);
            }
            OpType::Txa => {
                state.a = state.x;
                state.set_zn(state.a);
            }
            OpType::Tya => {
                state.a = state.y;
                state.set_zn(state.a);
            }
            OpType::Tsx => {
                state.x = state.s;
                state.set_zn(state.x);
            }
            OpType::Txs => state.s = state.x,
            OpType::Clc => state.flag_c = false,
            OpType::Sec => state.flag_c = true,
            OpType::Clv => state.flag_v = false,
            OpType::Cli => state.set_flag_i(false),
            OpType::Sei => state.set_flag_i(true),
            OpType::Cld => state.set_flag_d(false),
            OpType::Sed => state.set_flag_d(true),
            OpType::Pha => {
                let a = state.a;
                push(state, bus, a);
            }
            OpType::Php => {
                let p = state.flags() | FLAG_B | FLAG_UNUSED;
                push(state, bus, p);
            }
            OpType::Pla => {
                state.a = pull(state, bus);
                state.set_zn(state.a);
            }
            OpType::Plp => {
                let p = pull(state, bus);
                state.set_flags(p);
            }
            OpType::Bcc => branch(!state.flag_c, &mut cycles, &mut pc),
            OpType::Bcs => branch(state.flag_c, &mut cycles, &mut pc),
            OpType::Bne => branch(!state.flag_z, &mut cycles, &mut pc),
            OpType::Beq => branch(state.flag_z, &mut cycles, &mut pc),
            OpType::Bpl => branch(!state.flag_n, &mut cycles, &mut pc),
            OpType::Bmi => branch(state.flag_n, &mut cycles, &mut pc),
            OpType::Bvc => branch(!state.flag_v, &mut cycles, &mut pc),
            OpType::Bvs => branch(state.flag_v, &mut cycles, &mut pc),
            OpType::Jmp => pc = ea,
            OpType::Jsr => {
                let ret = addr.wrapping_add(2);
                push(state, bus, (ret >> 8) as u8);
                push(state, bus, ret as u8);
                pc = ea;
            }
            OpType::Rts => {
                let lo = pull(state, bus);
                let hi = pull(state, bus);
                pc = u16::from_le_bytes([lo, hi]).wrapping_add(1);
            }
            OpType::Rti => {
                let p = pull(state, bus);
                state.set_flags(p);
                let lo = pull(state, bus);
                let hi = pull(state, bus);
                pc = u16::from_le_bytes([lo, hi]);
            }
            OpType::Brk => {
                let ret = addr.wrapping_add(2);
                push(state, bus, (ret >> 8) as u8);
                push(state, bus, ret as u8);
                let p = state.flags() | FLAG_B | FLAG_UNUSED;
                push(state, bus, p);
                state.set_flag_i(true);
                pc = read_ptr(bus, VECTOR_IRQ);
            }
            OpType::Exit | OpType::Break | OpType::Crash | OpType::Unknown => {
                let exit = match optype {
                    OpType::Exit => StepExit::Exit,
                    OpType::Break => StepExit::DebugBreak,
                    OpType::Crash => StepExit::Crash,
                    _ => StepExit::Undefined(opcode),
                };
                return Step { cycles: 0, exit: Some(exit) };
            }
        }

        state.pc = pc;
        Step { cycles, exit: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBus {
        mem: Vec<u8>,
        writes: Vec<(u16, u8)>,
    }

    impl TestBus {
        fn with(addr: u16, code: &[u8]) -> Self {
            let mut mem = vec![0u8; 0x10000];
            mem[addr as usize..addr as usize + code.len()].copy_from_slice(code);
            Self { mem, writes: Vec::new() }
        }
    }

    impl Bus for TestBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, value: u8) {
            self.writes.push((addr, value));
            self.mem[addr as usize] = value;
        }
    }

    fn step(state: &mut MachineState, bus: &mut TestBus) -> Step {
        Nmos6502Interpreter.run_one_instruction(state, bus)
    }

    #[test]
    fn test_lda_abx_page_cross_timing() {
        let mut bus = TestBus::with(0x1000, &[0xBD, 0xF0, 0x20, 0xBD, 0x00, 0x20]);
        let mut state = MachineState::new();
        state.pc = 0x1000;
        state.x = 0x20;
        assert_eq!(step(&mut state, &mut bus).cycles, 5);
        assert_eq!(step(&mut state, &mut bus).cycles, 4);
        assert_eq!(state.pc, 0x1006);
    }

    #[test]
    fn test_branch_timing() {
        // BNE +0 not taken, taken same page, taken cross page.
        let mut bus = TestBus::with(0x10F0, &[0xD0, 0x00]);
        let mut state = MachineState::new();
        state.pc = 0x10F0;
        state.flag_z = true;
        assert_eq!(step(&mut state, &mut bus).cycles, 2);

        state.pc = 0x10F0;
        state.flag_z = false;
        assert_eq!(step(&mut state, &mut bus).cycles, 3);
        assert_eq!(state.pc, 0x10F2);

        bus.mem[0x10FD] = 0xD0;
        bus.mem[0x10FE] = 0x10;
        state.pc = 0x10FD;
        assert_eq!(step(&mut state, &mut bus).cycles, 4);
        assert_eq!(state.pc, 0x110F);
    }

    #[test]
    fn test_decimal_adc_and_sbc() {
        let mut bus = TestBus::with(0x1000, &[0x69, 0x28, 0xE9, 0x09]);
        let mut state = MachineState::new();
        state.pc = 0x1000;
        state.set_flag_d(true);
        state.a = 0x19;
        step(&mut state, &mut bus);
        assert_eq!(state.a, 0x47);
        assert!(!state.flag_c);

        state.flag_c = true;
        step(&mut state, &mut bus);
        assert_eq!(state.a, 0x38);
        assert!(state.flag_c);
    }

    #[test]
    fn test_binary_sbc_borrow_and_overflow() {
        let mut bus = TestBus::with(0x1000, &[0xE9, 0x01]);
        let mut state = MachineState::new();
        state.pc = 0x1000;
        state.a = 0x80;
        state.flag_c = true;
        step(&mut state, &mut bus);
        assert_eq!(state.a, 0x7F);
        assert!(state.flag_v);
        assert!(state.flag_c);
    }

    #[test]
    fn test_rmw_double_write() {
        let mut bus = TestBus::with(0x1000, &[0xEE, 0x00, 0x20]);
        bus.mem[0x2000] = 0x41;
        let mut state = MachineState::new();
        state.pc = 0x1000;
        assert_eq!(step(&mut state, &mut bus).cycles, 6);
        assert_eq!(bus.writes, vec![(0x2000, 0x41), (0x2000, 0x42)]);
    }

    #[test]
    fn test_jsr_rts_round_trip() {
        let mut bus = TestBus::with(0x1000, &[0x20, 0x00, 0x30]);
        bus.mem[0x3000] = 0x60;
        let mut state = MachineState::new();
        state.pc = 0x1000;
        state.s = 0xFF;
        assert_eq!(step(&mut state, &mut bus).cycles, 6);
        assert_eq!(state.pc, 0x3000);
        assert_eq!(bus.mem[0x01FF], 0x10);
        assert_eq!(bus.mem[0x01FE], 0x02);
        step(&mut state, &mut bus);
        assert_eq!(state.pc, 0x1003);
        assert_eq!(state.s, 0xFF);
    }

    #[test]
    fn test_jmp_indirect_page_bug() {
        let mut bus = TestBus::with(0x1000, &[0x6C, 0xFF, 0x20]);
        bus.mem[0x20FF] = 0x34;
        bus.mem[0x2000] = 0x12;
        bus.mem[0x2100] = 0x56;
        let mut state = MachineState::new();
        state.pc = 0x1000;
        step(&mut state, &mut bus);
        assert_eq!(state.pc, 0x1234);
    }

    #[test]
    fn test_brk_and_rti() {
        let mut bus = TestBus::with(0x1000, &[0x00]);
        bus.mem[0xFFFE] = 0x00;
        bus.mem[0xFFFF] = 0x40;
        bus.mem[0x4000] = 0x40;
        let mut state = MachineState::new();
        state.pc = 0x1000;
        state.s = 0xFF;
        state.flag_c = true;
        step(&mut state, &mut bus);
        assert_eq!(state.pc, 0x4000);
        assert!(state.flag_i());
        assert_eq!(bus.mem[0x01FD], 0x31);

        state.flag_c = false;
        step(&mut state, &mut bus);
        assert_eq!(state.pc, 0x1002);
        assert!(state.flag_c);
        assert!(!state.flag_i());
    }

    #[test]
    fn test_exit_opcodes_report() {
        let mut bus = TestBus::with(0x1000, &[0x02, 0x12, 0xF2, 0x03]);
        let mut state = MachineState::new();
        for (addr, exit) in [
            (0x1000, StepExit::Exit),
            (0x1001, StepExit::DebugBreak),
            (0x1002, StepExit::Crash),
            (0x1003, StepExit::Undefined(0x03)),
        ] {
            state.pc = addr;
            let result = Nmos6502Interpreter.run_one_instruction(&mut state, &mut bus);
            assert_eq!(result, Step { cycles: 0, exit: Some(exit) });
            assert_eq!(state.pc, addr);
        }
    }

    #[test]
    fn test_take_irq_pushes_without_b() {
        let mut bus = TestBus::with(0xFFFE, &[0x00, 0x50]);
        let mut state = MachineState::new();
        state.pc = 0x1234;
        state.s = 0xFF;
        assert_eq!(take_irq(&mut state, &mut bus), IRQ_CYCLES);
        assert_eq!(state.pc, 0x5000);
        assert_eq!(bus.mem[0x01FD], 0x20);
        assert!(state.flag_i());
    }
}
