//! Runs threaded host code against the machine state.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::backend::threaded::emit_threaded::{decode, HostInsn};
use crate::error::JitError;
use crate::frontend::m6502::tables::{opcode_info, OpMode, OpType};
use crate::halt_reason::HaltReason;
use crate::interpreter::{take_irq, StepExit};
use crate::ir::uop::Uop;
use crate::jit::{JitBus, JitInner};
use crate::memory::MemoryAccess;

/// Position inside a live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    ip: usize,
    /// Guest address the block was entered at.
    block: u16,
    /// Host entry of that block when it was entered.
    entry: u32,
}

/// Where a countdown exit left off, so the next run can pick up in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumePoint {
    pc: u16,
    cursor: Cursor,
    generation: u64,
}

/// Result of one uop.
enum Flow {
    Next,
    Jump(u16),
    Halt(HaltReason),
    /// The running block was invalidated by a store from the instruction at `pc`.
    Stale { pc: u16 },
}

impl<M: MemoryAccess> JitInner<M> {
    /// Run compiled code from `state.pc` until something stops it.
    pub(crate) fn run_code(&mut self) -> Result<HaltReason, JitError> {
        let mut cur = match self.take_resume() {
            Some(cur) => cur,
            None => self.dispatch(self.state.pc),
        };
        // Set when the running block goes stale: leave at this host offset for this guest address.
        let mut leave_at: Option<(usize, u16)> = None;

        loop {
            if let Some((ip, pc)) = leave_at {
                if cur.ip == ip {
                    leave_at = None;
                    if !self.is_run_head(ip) {
                        self.state.countdown = self.compiler.fixup_state(pc, self.state.countdown);
                    }
                    trace!(pc, "leaving stale block");
                    cur = self.dispatch(pc);
                    continue;
                }
            }

            let (insn, len) = decode(self.arena.bytes(), cur.ip)?;
            let flow = match insn {
                HostInsn::Nop => Flow::Next,
                HostInsn::Trap => return Err(JitError::StrayTrap { offset: cur.ip }),
                HostInsn::RmwChecked { opcode, operand } => self.exec_opcode(opcode, operand, true)?,
                HostInsn::Uop(Uop::Countdown { addr, cycles }) => {
                    let halt = self.halt_reason.load(Ordering::Acquire);
                    if halt != 0 {
                        self.state.pc = addr;
                        return Ok(HaltReason::from_bits_truncate(halt));
                    }
                    self.state.countdown -= cycles as i64;
                    if self.state.countdown < 0 {
                        self.state.countdown += cycles as i64;
                        self.state.pc = addr;
                        self.resume = Some(ResumePoint { pc: addr, cursor: cur, generation: self.arena.generation() });
                        return Ok(HaltReason::COUNTDOWN);
                    }
                    Flow::Next
                }
                HostInsn::Uop(uop) => self.exec_uop(uop)?,
            };

            match flow {
                Flow::Next => cur.ip += len,
                Flow::Jump(target) => {
                    leave_at = None;
                    cur = self.dispatch(target);
                }
                Flow::Halt(reason) => return Ok(reason),
                Flow::Stale { pc } => {
                    cur.ip += len;
                    if self.cache.entry(cur.block) != Some(cur.entry) {
                        leave_at = self.stale_exit(pc, cur).or(leave_at);
                    }
                }
            }
        }
    }

    fn take_resume(&mut self) -> Option<Cursor> {
        let resume = self.resume.take()?;
        let valid = resume.pc == self.state.pc
            && resume.generation == self.arena.generation()
            && self.cache.entry(resume.cursor.block) == Some(resume.cursor.entry);
        valid.then_some(resume.cursor)
    }

    /// Resolve `target` through the entry table, compiling on a miss.
    fn dispatch(&mut self, target: u16) -> Cursor {
        let entry = match self.cache.entry(target) {
            Some(entry) => entry,
            None => self.compiler.compile(target, &self.memory, &mut self.arena, &self.cache),
        };
        Cursor { ip: entry as usize, block: target, entry }
    }

    /// Host offset of the instruction after `pc` when it is still inside the current block.
    fn stale_exit(&self, pc: u16, cur: Cursor) -> Option<(usize, u16)> {
        let opcode = self.compiler.cached_opcode(pc)?;
        let next = pc.wrapping_add(opcode_info(opcode).len() as u16);
        let ptr = self.cache.jit_ptr(next)?;
        if ptr.block != cur.block || (ptr.host_offset as usize) < cur.ip {
            return None;
        }
        Some((ptr.host_offset as usize, next))
    }

    fn is_run_head(&self, ip: usize) -> bool {
        matches!(decode(self.arena.bytes(), ip), Ok((HostInsn::Uop(Uop::Countdown { .. }), _)))
    }

    fn load(&mut self, addr: u16) -> u8 {
        if addr >= self.callback_above {
            self.memory.read_callback(addr)
        } else {
            self.memory.read(addr)
        }
    }

    fn store(&mut self, addr: u16, value: u8) {
        if addr >= self.callback_above {
            self.memory.write_callback(addr, value);
        } else {
            self.memory.write(addr, value);
        }
    }

    // Stack pushes skip invalidation.
    fn push(&mut self, value: u8) {
        self.memory.write(0x0100 | self.state.s as u16, value);
        self.state.s = self.state.s.wrapping_sub(1);
    }

    fn pull(&mut self) -> u8 {
        self.state.s = self.state.s.wrapping_add(1);
        self.memory.read(0x0100 | self.state.s as u16)
    }

    /// 16-bit pointer at `addr`; the high byte comes from the same page.
    fn read_pointer(&mut self, addr: u16) -> u16 {
        let lo = self.load(addr);
        let hi = self.load((addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF));
        u16::from_le_bytes([lo, hi])
    }

    fn refund_cycle_if_same_page(&mut self, base: u16, index: u8) {
        if (base ^ base.wrapping_add(index as u16)) & 0xFF00 == 0 {
            self.state.countdown += 1;
        }
    }

    fn invalidate_write(&mut self, addr: u16, pc: u16) -> Flow {
        match self.cache.invalidate(addr) {
            Some(_) => Flow::Stale { pc },
            None => Flow::Next,
        }
    }

    /// Leave the current run at `addr` and let the interpreter execute that instruction.
    fn interpret_at(&mut self, addr: u16) -> Result<Flow, JitError> {
        self.state.countdown = self.compiler.fixup_state(addr, self.state.countdown);
        self.state.pc = addr;
        let mut bus = JitBus { memory: &mut self.memory, cache: &self.cache, callback_above: self.callback_above };
        let step = self.interpreter.run_one_instruction(&mut self.state, &mut bus);
        trace!(addr, cycles = step.cycles, "interpreted");
        if let Some(exit) = step.exit {
            return match exit {
                StepExit::Exit => Ok(Flow::Halt(HaltReason::EXIT)),
                StepExit::DebugBreak => Ok(Flow::Halt(HaltReason::DEBUG_BREAK)),
                StepExit::Crash => Err(JitError::DeliberateFault { addr }),
                StepExit::Undefined(opcode) => Err(JitError::UndefinedOpcode { opcode, addr }),
            };
        }
        self.state.countdown -= step.cycles as i64;
        if self.state.irq_pending() {
            let cycles = take_irq(&mut self.state, &mut bus);
            self.state.countdown -= cycles as i64;
            debug!(after = addr, handler = self.state.pc, "irq taken");
        }
        Ok(Flow::Jump(self.state.pc))
    }

    /// Stop at `addr` without executing it.
    fn exit_at(&mut self, addr: u16) {
        self.state.countdown = self.compiler.fixup_state(addr, self.state.countdown);
        self.state.pc = addr;
    }

    fn exec_uop(&mut self, uop: Uop) -> Result<Flow, JitError> {
        let state = &mut self.state;
        let flow = match uop {
            Uop::Countdown { .. } => unreachable!("countdown handled by the run loop"),
            Uop::Debug { addr } => {
                if let Some(hook) = self.debug_hook.as_mut() {
                    state.pc = addr;
                    if hook.on_instruction(addr, state) {
                        self.exit_at(addr);
                        return Ok(Flow::Halt(HaltReason::EXTERNAL_HALT));
                    }
                }
                Flow::Next
            }
            Uop::Interp { addr } => return self.interpret_at(addr),
            Uop::CheckBcd { addr } => {
                if state.flag_d() {
                    return self.interpret_at(addr);
                }
                Flow::Next
            }
            Uop::CheckPendingIrq { addr } => {
                if state.irq_asserted {
                    return self.interpret_at(addr);
                }
                Flow::Next
            }
            Uop::AbxCheckPageCrossing { base } => {
                let x = state.x;
                self.refund_cycle_if_same_page(base, x);
                Flow::Next
            }
            Uop::AbyCheckPageCrossing { base } => {
                let y = state.y;
                self.refund_cycle_if_same_page(base, y);
                Flow::Next
            }
            Uop::IdyCheckPageCrossing => {
                let (base, y) = (state.scratch, state.y);
                self.refund_cycle_if_same_page(base, y);
                Flow::Next
            }
            Uop::AddCycles { cycles } => {
                state.countdown += cycles as i64;
                Flow::Next
            }
            Uop::AddImm { value } => {
                let a = state.a;
                let sum = a as u16 + value as u16;
                let result = sum as u8;
                state.host_carry = sum > 0xFF;
                state.host_overflow = (a ^ result) & (value ^ result) & 0x80 != 0;
                state.a = result;
                state.set_zn(result);
                Flow::Next
            }
            Uop::SubImm { value } => {
                let a = state.a;
                let result = a.wrapping_sub(value);
                state.host_carry = a < value;
                state.host_overflow = (a ^ value) & (a ^ result) & 0x80 != 0;
                state.a = result;
                state.set_zn(result);
                Flow::Next
            }
            Uop::FlagA => {
                state.set_zn(state.a);
                Flow::Next
            }
            Uop::FlagX => {
                state.set_zn(state.x);
                Flow::Next
            }
            Uop::FlagY => {
                state.set_zn(state.y);
                Flow::Next
            }
            Uop::IncScratch => {
                state.scratch = state.scratch.wrapping_add(1);
                Flow::Next
            }
            Uop::JmpScratch => Flow::Jump(state.scratch),
            Uop::LdaZero => {
                state.a = 0;
                state.set_zn(0);
                Flow::Next
            }
            Uop::LdxZero => {
                state.x = 0;
                state.set_zn(0);
                Flow::Next
            }
            Uop::LdyZero => {
                state.y = 0;
                state.set_zn(0);
                Flow::Next
            }
            Uop::LoadCarry => {
                state.host_carry = state.flag_c;
                Flow::Next
            }
            Uop::LoadCarryInv => {
                state.host_carry = !state.flag_c;
                Flow::Next
            }
            Uop::LoadOverflow => {
                state.host_overflow = state.flag_v;
                Flow::Next
            }
            Uop::SaveCarry => {
                state.flag_c = state.host_carry;
                Flow::Next
            }
            Uop::SaveCarryInv => {
                state.flag_c = !state.host_carry;
                Flow::Next
            }
            Uop::SaveOverflow => {
                state.flag_v = state.host_overflow;
                Flow::Next
            }
            Uop::ModeAbx { base } => {
                state.scratch = base.wrapping_add(state.x as u16);
                Flow::Next
            }
            Uop::ModeAby { base } => {
                state.scratch = base.wrapping_add(state.y as u16);
                Flow::Next
            }
            Uop::ModeInd { addr } => {
                self.state.scratch = self.read_pointer(addr);
                Flow::Next
            }
            Uop::ModeIndScratch => {
                let ptr = state.scratch;
                self.state.scratch = self.read_pointer(ptr);
                Flow::Next
            }
            Uop::ModeZpx { base } => {
                state.scratch = base.wrapping_add(state.x) as u16;
                Flow::Next
            }
            Uop::ModeZpy { base } => {
                state.scratch = base.wrapping_add(state.y) as u16;
                Flow::Next
            }
            Uop::Pull16 => {
                let lo = self.pull();
                let hi = self.pull();
                self.state.scratch = u16::from_le_bytes([lo, hi]);
                Flow::Next
            }
            Uop::Push16 { value } => {
                self.push((value >> 8) as u8);
                self.push(value as u8);
                Flow::Next
            }
            Uop::StoreImm { addr, value } => {
                self.store(addr, value);
                Flow::Next
            }
            Uop::WriteInvAbs { addr, pc } => self.invalidate_write(addr, pc),
            Uop::WriteInvScratch { pc } => {
                let addr = state.scratch;
                self.invalidate_write(addr, pc)
            }
            Uop::WriteInvScratchY { pc } => {
                let addr = state.scratch.wrapping_add(state.y as u16);
                self.invalidate_write(addr, pc)
            }
            Uop::Jmp { target } => Flow::Jump(target),
            Uop::Opcode { opcode, operand } => return self.exec_opcode(opcode, operand, false),
            Uop::Undefined { opcode, addr } => {
                self.exit_at(addr);
                debug!(opcode, addr, "undefined opcode");
                return Err(JitError::UndefinedOpcode { opcode, addr });
            }
        };
        Ok(flow)
    }

    /// Effective address of a raw opcode's memory operand.
    fn effective_addr(&self, mode: OpMode, operand: u16) -> u16 {
        let state = &self.state;
        match mode {
            OpMode::Zpg | OpMode::Abs => operand,
            OpMode::Zpx | OpMode::Zpy | OpMode::Idx => state.scratch,
            OpMode::Abx => operand.wrapping_add(state.x as u16),
            OpMode::Aby => operand.wrapping_add(state.y as u16),
            OpMode::Idy => state.scratch.wrapping_add(state.y as u16),
            _ => operand,
        }
    }

    fn read_operand(&mut self, mode: OpMode, operand: u16) -> u8 {
        if mode == OpMode::Imm {
            return operand as u8;
        }
        let ea = self.effective_addr(mode, operand);
        self.load(ea)
    }

    /// Main body of a raw opcode. Flags the decomposer moves into separate uops are left alone.
    fn exec_opcode(&mut self, opcode: u8, operand: u16, rmw_checked: bool) -> Result<Flow, JitError> {
        let info = opcode_info(opcode);
        let mode = info.mode;

        match info.optype {
            OpType::Adc => {
                let m = self.read_operand(mode, operand);
                let s = &mut self.state;
                let sum = s.a as u16 + m as u16 + s.host_carry as u16;
                let result = sum as u8;
                s.host_overflow = (s.a ^ result) & (m ^ result) & 0x80 != 0;
                s.host_carry = sum > 0xFF;
                s.a = result;
                s.set_zn(result);
            }
            OpType::Sbc => {
                let m = self.read_operand(mode, operand);
                let s = &mut self.state;
                let diff = s.a as i16 - m as i16 - s.host_carry as i16;
                let result = diff as u8;
                s.host_overflow = (s.a ^ m) & (s.a ^ result) & 0x80 != 0;
                s.host_carry = diff < 0;
                s.a = result;
                s.set_zn(result);
            }
            OpType::And | OpType::Ora | OpType::Eor => {
                let m = self.read_operand(mode, operand);
                let s = &mut self.state;
                s.a = match info.optype {
                    OpType::And => s.a & m,
                    OpType::Ora => s.a | m,
                    _ => s.a ^ m,
                };
                s.set_zn(s.a);
            }
            OpType::Alr => {
                let m = self.read_operand(mode, operand);
                let s = &mut self.state;
                let v = s.a & m;
                s.host_carry = v & 1 != 0;
                s.a = v >> 1;
                s.set_zn(s.a);
            }
            OpType::Bit => {
                let m = self.read_operand(mode, operand);
                let s = &mut self.state;
                s.flag_z = s.a & m == 0;
                s.flag_n = m & 0x80 != 0;
                s.flag_v = m & 0x40 != 0;
            }
            OpType::Cmp | OpType::Cpx | OpType::Cpy => {
                let m = self.read_operand(mode, operand);
                let s = &mut self.state;
                let reg = match info.optype {
                    OpType::Cmp => s.a,
                    OpType::Cpx => s.x,
                    _ => s.y,
                };
                s.host_carry = reg < m;
                s.set_zn(reg.wrapping_sub(m));
            }
            OpType::Lda => self.state.a = self.read_operand(mode, operand),
            OpType::Ldx => self.state.x = self.read_operand(mode, operand),
            OpType::Ldy => self.state.y = self.read_operand(mode, operand),
            OpType::Nop => {
                if mode != OpMode::Nil && mode != OpMode::Imm {
                    self.read_operand(mode, operand);
                }
            }
            OpType::Sta | OpType::Stx | OpType::Sty | OpType::Sax => {
                let s = &self.state;
                let value = match info.optype {
                    OpType::Sta => s.a,
                    OpType::Stx => s.x,
                    OpType::Sty => s.y,
                    _ => s.a & s.x,
                };
                let ea = self.effective_addr(mode, operand);
                self.store(ea, value);
            }
            OpType::Asl | OpType::Lsr | OpType::Rol | OpType::Ror | OpType::Slo => {
                let (ea, v) = if mode == OpMode::Acc {
                    (None, self.state.a)
                } else {
                    let ea = self.effective_addr(mode, operand);
                    (Some(ea), self.load(ea))
                };
                let s = &mut self.state;
                let carry_in = s.host_carry as u8;
                let (result, carry_out) = match info.optype {
                    OpType::Asl | OpType::Slo => (v << 1, v & 0x80 != 0),
                    OpType::Lsr => (v >> 1, v & 0x01 != 0),
                    OpType::Rol => ((v << 1) | carry_in, v & 0x80 != 0),
                    _ => ((v >> 1) | (carry_in << 7), v & 0x01 != 0),
                };
                s.host_carry = carry_out;
                s.set_zn(result);
                match ea {
                    None => self.state.a = result,
                    Some(ea) => {
                        if rmw_checked {
                            self.store(ea, v);
                        }
                        self.store(ea, result);
                        if info.optype == OpType::Slo {
                            let s = &mut self.state;
                            s.a |= result;
                            s.set_zn(s.a);
                        }
                    }
                }
            }
            OpType::Inc | OpType::Dec => {
                let ea = self.effective_addr(mode, operand);
                let v = self.load(ea);
                let result = if info.optype == OpType::Inc { v.wrapping_add(1) } else { v.wrapping_sub(1) };
                if rmw_checked {
                    self.store(ea, v);
                }
                self.store(ea, result);
                self.state.set_zn(result);
            }
            OpType::Inx | OpType::Iny | OpType::Dex | OpType::Dey => {
                let s = &mut self.state;
                let reg = match info.optype {
                    OpType::Inx => &mut s.x,
                    OpType::Iny => &mut s.y,
                    OpType::Dex => &mut s.x,
                    _ => &mut s.y,
                };
                *reg = if matches!(info.optype, OpType::Inx | OpType::Iny) {
                    reg.wrapping_add(1)
                } else {
                    reg.wrapping_sub(1)
                };
                let value = *reg;
                s.set_zn(value);
            }
            OpType::Tax => self.state.x = self.state.a,
            OpType::Tay => self.state.y = self.state.a,
            OpType::Txa => self.state.a = self.state.x,
            OpType::Tya => self.state.a = self.state.y,
            OpType::Tsx => self.state.x = self.state.s,
            OpType::Txs => self.state.s = self.state.x,
            OpType::Clc => self.state.flag_c = false,
            OpType::Sec => self.state.flag_c = true,
            OpType::Clv => self.state.flag_v = false,
            OpType::Cli => self.state.set_flag_i(false),
            OpType::Sei => self.state.set_flag_i(true),
            OpType::Cld => self.state.set_flag_d(false),
            OpType::Sed => self.state.set_flag_d(true),
            OpType::Pha => {
                let a = self.state.a;
                self.push(a);
            }
            OpType::Php => {
                let p = self.state.flags() | 0x30;
                self.push(p);
            }
            OpType::Pla => self.state.a = self.pull(),
            OpType::Plp => {
                let p = self.pull();
                self.state.set_flags(p);
            }
            OpType::Bcc | OpType::Bcs | OpType::Beq | OpType::Bne | OpType::Bmi | OpType::Bpl | OpType::Bvc
            | OpType::Bvs => {
                let s = &self.state;
                let taken = match info.optype {
                    OpType::Bcc => !s.host_carry,
                    OpType::Bcs => s.host_carry,
                    OpType::Beq => s.flag_z,
                    OpType::Bne => !s.flag_z,
                    OpType::Bmi => s.flag_n,
                    OpType::Bpl => !s.flag_n,
                    OpType::Bvc => !s.host_overflow,
                    _ => s.host_overflow,
                };
                if taken {
                    return Ok(Flow::Jump(operand));
                }
            }
            OpType::Exit => {
                self.exit_at(operand);
                debug!(pc = operand, "exit");
                return Ok(Flow::Halt(HaltReason::EXIT));
            }
            OpType::Break => {
                self.exit_at(operand);
                debug!(pc = operand, "debug break");
                return Ok(Flow::Halt(HaltReason::DEBUG_BREAK));
            }
            OpType::Crash => {
                self.exit_at(operand);
                return Err(JitError::DeliberateFault { addr: operand });
            }
            OpType::Brk | OpType::Jmp | OpType::Jsr | OpType::Rts | OpType::Rti | OpType::Unknown => {
                unreachable!("{} is never emitted as a raw opcode", info.optype)
            }
        }
        Ok(Flow::Next)
    }
}
