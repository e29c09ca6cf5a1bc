//! Portable threaded encoding.
//!
//! Each uop is one tag byte followed by its little-endian operands. Raw
//! opcodes carry only the operand bytes their addressing mode needs.

use crate::backend::block_of_code::{CodeBuffer, NOP_BYTE, TRAP_BYTE};
use crate::backend::emit::CodeEmitter;
use crate::error::JitError;
use crate::frontend::m6502::tables::{opcode_info, OpMem, OpMode, OpType};
use crate::ir::uop::Uop;
use crate::memory::MemoryAccess;

const TAG_COUNTDOWN8: u8 = 0x01;
const TAG_COUNTDOWN32: u8 = 0x02;
const TAG_DEBUG: u8 = 0x03;
const TAG_INTERP: u8 = 0x04;
const TAG_ABX_CHECK: u8 = 0x05;
const TAG_ABY_CHECK: u8 = 0x06;
const TAG_IDY_CHECK: u8 = 0x07;
const TAG_ADD_CYCLES: u8 = 0x08;
const TAG_ADD_IMM: u8 = 0x09;
const TAG_SUB_IMM: u8 = 0x0A;
const TAG_CHECK_BCD: u8 = 0x0B;
const TAG_CHECK_PENDING_IRQ: u8 = 0x0C;
const TAG_FLAG_A: u8 = 0x0D;
const TAG_FLAG_X: u8 = 0x0E;
const TAG_FLAG_Y: u8 = 0x0F;
const TAG_INC_SCRATCH: u8 = 0x10;
const TAG_JMP_SCRATCH: u8 = 0x11;
const TAG_LDA_ZERO: u8 = 0x12;
const TAG_LDX_ZERO: u8 = 0x13;
const TAG_LDY_ZERO: u8 = 0x14;
const TAG_LOAD_CARRY: u8 = 0x15;
const TAG_LOAD_CARRY_INV: u8 = 0x16;
const TAG_LOAD_OVERFLOW: u8 = 0x17;
const TAG_SAVE_CARRY: u8 = 0x18;
const TAG_SAVE_CARRY_INV: u8 = 0x19;
const TAG_SAVE_OVERFLOW: u8 = 0x1A;
const TAG_MODE_ABX: u8 = 0x1B;
const TAG_MODE_ABY: u8 = 0x1C;
const TAG_MODE_IND: u8 = 0x1D;
const TAG_MODE_IND_SCRATCH: u8 = 0x1E;
const TAG_MODE_ZPX: u8 = 0x1F;
const TAG_MODE_ZPY: u8 = 0x20;
const TAG_PULL16: u8 = 0x21;
const TAG_PUSH16: u8 = 0x22;
const TAG_STORE_IMM: u8 = 0x23;
const TAG_WRITE_INV_ABS: u8 = 0x24;
const TAG_WRITE_INV_SCRATCH: u8 = 0x25;
const TAG_WRITE_INV_SCRATCH_Y: u8 = 0x26;
const TAG_JMP: u8 = 0x27;
const TAG_OPCODE: u8 = 0x28;
const TAG_OPCODE_RMW_CHECKED: u8 = 0x29;
const TAG_UNDEFINED: u8 = 0x2A;

const JMP_LEN: usize = 3;

/// One decoded host instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInsn {
    Uop(Uop),
    /// Read-modify-write on memory that may not be RAM: writes the original
    /// value back before the result, as the 6502 bus does.
    RmwChecked { opcode: u8, operand: u16 },
    Nop,
    Trap,
}

/// Emitter for the threaded encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedEmitter;

impl ThreadedEmitter {
    pub fn new() -> Self {
        Self
    }

    fn emit_opcode<M: MemoryAccess + ?Sized>(buf: &mut CodeBuffer<'_>, opcode: u8, operand: u16, memory: &M) {
        let info = opcode_info(opcode);
        let checked = info.mem() == OpMem::Rw
            && match info.mode {
                OpMode::Abs => !memory.is_always_ram(operand),
                OpMode::Abx => {
                    !memory.is_always_ram(operand) || !memory.is_always_ram(operand.wrapping_add(0xFF))
                }
                _ => false,
            };
        buf.push_u8(if checked { TAG_OPCODE_RMW_CHECKED } else { TAG_OPCODE });
        buf.push_u8(opcode);
        match operand_bytes(opcode) {
            0 => {}
            1 => buf.push_u8(operand as u8),
            _ => buf.push_u16(operand),
        }
    }
}

/// Operand bytes stored after a raw opcode. Hang opcodes keep their own
/// address and branches their resolved target.
fn operand_bytes(opcode: u8) -> usize {
    let info = opcode_info(opcode);
    match (info.optype, info.mode) {
        (OpType::Exit | OpType::Break | OpType::Crash, _) | (_, OpMode::Rel) => 2,
        _ => info.len() as usize - 1,
    }
}

impl CodeEmitter for ThreadedEmitter {
    fn emit_uop<M: MemoryAccess + ?Sized>(&self, buf: &mut CodeBuffer<'_>, uop: &Uop, memory: &M) -> usize {
        let start = buf.pos();
        match *uop {
            Uop::Countdown { addr, cycles } => {
                if let Ok(short) = u8::try_from(cycles) {
                    buf.push_u8(TAG_COUNTDOWN8);
                    buf.push_u16(addr);
                    buf.push_u8(short);
                } else {
                    buf.push_u8(TAG_COUNTDOWN32);
                    buf.push_u16(addr);
                    buf.push_u32(cycles);
                }
            }
            Uop::Debug { addr } => {
                buf.push_u8(TAG_DEBUG);
                buf.push_u16(addr);
            }
            Uop::Interp { addr } => {
                buf.push_u8(TAG_INTERP);
                buf.push_u16(addr);
            }
            Uop::AbxCheckPageCrossing { base } => {
                buf.push_u8(TAG_ABX_CHECK);
                buf.push_u16(base);
            }
            Uop::AbyCheckPageCrossing { base } => {
                buf.push_u8(TAG_ABY_CHECK);
                buf.push_u16(base);
            }
            Uop::IdyCheckPageCrossing => buf.push_u8(TAG_IDY_CHECK),
            Uop::AddCycles { cycles } => {
                buf.push_u8(TAG_ADD_CYCLES);
                buf.push_u8(cycles);
            }
            Uop::AddImm { value } => {
                buf.push_u8(TAG_ADD_IMM);
                buf.push_u8(value);
            }
            Uop::SubImm { value } => {
                buf.push_u8(TAG_SUB_IMM);
                buf.push_u8(value);
            }
            Uop::CheckBcd { addr } => {
                buf.push_u8(TAG_CHECK_BCD);
                buf.push_u16(addr);
            }
            Uop::CheckPendingIrq { addr } => {
                buf.push_u8(TAG_CHECK_PENDING_IRQ);
                buf.push_u16(addr);
            }
            Uop::FlagA => buf.push_u8(TAG_FLAG_A),
            Uop::FlagX => buf.push_u8(TAG_FLAG_X),
            Uop::FlagY => buf.push_u8(TAG_FLAG_Y),
            Uop::IncScratch => buf.push_u8(TAG_INC_SCRATCH),
            Uop::JmpScratch => buf.push_u8(TAG_JMP_SCRATCH),
            Uop::LdaZero => buf.push_u8(TAG_LDA_ZERO),
            Uop::LdxZero => buf.push_u8(TAG_LDX_ZERO),
            Uop::LdyZero => buf.push_u8(TAG_LDY_ZERO),
            Uop::LoadCarry => buf.push_u8(TAG_LOAD_CARRY),
            Uop::LoadCarryInv => buf.push_u8(TAG_LOAD_CARRY_INV),
            Uop::LoadOverflow => buf.push_u8(TAG_LOAD_OVERFLOW),
            Uop::SaveCarry => buf.push_u8(TAG_SAVE_CARRY),
            Uop::SaveCarryInv => buf.push_u8(TAG_SAVE_CARRY_INV),
            Uop::SaveOverflow => buf.push_u8(TAG_SAVE_OVERFLOW),
            Uop::ModeAbx { base } => {
                buf.push_u8(TAG_MODE_ABX);
                buf.push_u16(base);
            }
            Uop::ModeAby { base } => {
                buf.push_u8(TAG_MODE_ABY);
                buf.push_u16(base);
            }
            Uop::ModeInd { addr } => {
                buf.push_u8(TAG_MODE_IND);
                buf.push_u16(addr);
            }
            Uop::ModeIndScratch => buf.push_u8(TAG_MODE_IND_SCRATCH),
            Uop::ModeZpx { base } => {
                buf.push_u8(TAG_MODE_ZPX);
                buf.push_u8(base);
            }
            Uop::ModeZpy { base } => {
                buf.push_u8(TAG_MODE_ZPY);
                buf.push_u8(base);
            }
            Uop::Pull16 => buf.push_u8(TAG_PULL16),
            Uop::Push16 { value } => {
                buf.push_u8(TAG_PUSH16);
                buf.push_u16(value);
            }
            Uop::StoreImm { addr, value } => {
                buf.push_u8(TAG_STORE_IMM);
                buf.push_u16(addr);
                buf.push_u8(value);
            }
            Uop::WriteInvAbs { addr, pc } => {
                buf.push_u8(TAG_WRITE_INV_ABS);
                buf.push_u16(addr);
                buf.push_u16(pc);
            }
            Uop::WriteInvScratch { pc } => {
                buf.push_u8(TAG_WRITE_INV_SCRATCH);
                buf.push_u16(pc);
            }
            Uop::WriteInvScratchY { pc } => {
                buf.push_u8(TAG_WRITE_INV_SCRATCH_Y);
                buf.push_u16(pc);
            }
            Uop::Jmp { target } => {
                buf.push_u8(TAG_JMP);
                buf.push_u16(target);
            }
            Uop::Opcode { opcode, operand } => Self::emit_opcode(buf, opcode, operand, memory),
            Uop::Undefined { opcode, addr } => {
                buf.push_u8(TAG_UNDEFINED);
                buf.push_u8(opcode);
                buf.push_u16(addr);
            }
        }
        buf.pos() - start
    }

    fn jmp_len(&self) -> usize {
        JMP_LEN
    }

    fn pad_nops(&self, buf: &mut CodeBuffer<'_>) {
        buf.fill_to_end(NOP_BYTE);
    }

    fn fill_traps(&self, buf: &mut CodeBuffer<'_>) {
        buf.fill_to_end(TRAP_BYTE);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8, JitError> {
        let b = *self.bytes.get(self.pos).ok_or(JitError::StrayTrap { offset: self.offset })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, JitError> {
        Ok(u16::from_le_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32, JitError> {
        Ok(u32::from_le_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }
}

/// Decode the host instruction at `offset`; returns it and its length.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(HostInsn, usize), JitError> {
    let mut r = Reader { bytes, offset, pos: offset };
    let tag = r.u8()?;
    let insn = match tag {
        NOP_BYTE => HostInsn::Nop,
        TRAP_BYTE => HostInsn::Trap,
        TAG_COUNTDOWN8 => {
            let addr = r.u16()?;
            HostInsn::Uop(Uop::Countdown { addr, cycles: r.u8()? as u32 })
        }
        TAG_COUNTDOWN32 => {
            let addr = r.u16()?;
            HostInsn::Uop(Uop::Countdown { addr, cycles: r.u32()? })
        }
        TAG_DEBUG => HostInsn::Uop(Uop::Debug { addr: r.u16()? }),
        TAG_INTERP => HostInsn::Uop(Uop::Interp { addr: r.u16()? }),
        TAG_ABX_CHECK => HostInsn::Uop(Uop::AbxCheckPageCrossing { base: r.u16()? }),
        TAG_ABY_CHECK => HostInsn::Uop(Uop::AbyCheckPageCrossing { base: r.u16()? }),
        TAG_IDY_CHECK => HostInsn::Uop(Uop::IdyCheckPageCrossing),
        TAG_ADD_CYCLES => HostInsn::Uop(Uop::AddCycles { cycles: r.u8()? }),
        TAG_ADD_IMM => HostInsn::Uop(Uop::AddImm { value: r.u8()? }),
        TAG_SUB_IMM => HostInsn::Uop(Uop::SubImm { value: r.u8()? }),
        TAG_CHECK_BCD => HostInsn::Uop(Uop::CheckBcd { addr: r.u16()? }),
        TAG_CHECK_PENDING_IRQ => HostInsn::Uop(Uop::CheckPendingIrq { addr: r.u16()? }),
        TAG_FLAG_A => HostInsn::Uop(Uop::FlagA),
        TAG_FLAG_X => HostInsn::Uop(Uop::FlagX),
        TAG_FLAG_Y => HostInsn::Uop(Uop::FlagY),
        TAG_INC_SCRATCH => HostInsn::Uop(Uop::IncScratch),
        TAG_JMP_SCRATCH => HostInsn::Uop(Uop::JmpScratch),
        TAG_LDA_ZERO => HostInsn::Uop(Uop::LdaZero),
        TAG_LDX_ZERO => HostInsn::Uop(Uop::LdxZero),
        TAG_LDY_ZERO => HostInsn::Uop(Uop::LdyZero),
        TAG_LOAD_CARRY => HostInsn::Uop(Uop::LoadCarry),
        TAG_LOAD_CARRY_INV => HostInsn::Uop(Uop::LoadCarryInv),
        TAG_LOAD_OVERFLOW => HostInsn::Uop(Uop::LoadOverflow),
        TAG_SAVE_CARRY => HostInsn::Uop(Uop::SaveCarry),
        TAG_SAVE_CARRY_INV => HostInsn::Uop(Uop::SaveCarryInv),
        TAG_SAVE_OVERFLOW => HostInsn::Uop(Uop::SaveOverflow),
        TAG_MODE_ABX => HostInsn::Uop(Uop::ModeAbx { base: r.u16()? }),
        TAG_MODE_ABY => HostInsn::Uop(Uop::ModeAby { base: r.u16()? }),
        TAG_MODE_IND => HostInsn::Uop(Uop::ModeInd { addr: r.u16()? }),
        TAG_MODE_IND_SCRATCH => HostInsn::Uop(Uop::ModeIndScratch),
        TAG_MODE_ZPX => HostInsn::Uop(Uop::ModeZpx { base: r.u8()? }),
        TAG_MODE_ZPY => HostInsn::Uop(Uop::ModeZpy { base: r.u8()? }),
        TAG_PULL16 => HostInsn::Uop(Uop::Pull16),
        TAG_PUSH16 => HostInsn::Uop(Uop::Push16 { value: r.u16()? }),
        TAG_STORE_IMM => {
            let addr = r.u16()?;
            HostInsn::Uop(Uop::StoreImm { addr, value: r.u8()? })
        }
        TAG_WRITE_INV_ABS => {
            let addr = r.u16()?;
            HostInsn::Uop(Uop::WriteInvAbs { addr, pc: r.u16()? })
        }
        TAG_WRITE_INV_SCRATCH => HostInsn::Uop(Uop::WriteInvScratch { pc: r.u16()? }),
        TAG_WRITE_INV_SCRATCH_Y => HostInsn::Uop(Uop::WriteInvScratchY { pc: r.u16()? }),
        TAG_JMP => HostInsn::Uop(Uop::Jmp { target: r.u16()? }),
        TAG_OPCODE | TAG_OPCODE_RMW_CHECKED => {
            let opcode = r.u8()?;
            let operand = match operand_bytes(opcode) {
                0 => 0,
                1 => r.u8()? as u16,
                _ => r.u16()?,
            };
            if tag == TAG_OPCODE {
                HostInsn::Uop(Uop::Opcode { opcode, operand })
            } else {
                HostInsn::RmwChecked { opcode, operand }
            }
        }
        TAG_UNDEFINED => {
            let opcode = r.u8()?;
            HostInsn::Uop(Uop::Undefined { opcode, addr: r.u16()? })
        }
        _ => return Err(JitError::StrayTrap { offset }),
    };
    Ok((insn, r.pos - offset))
}
