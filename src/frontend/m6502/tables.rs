//! Static decode tables for the NMOS 6502.
//!
//! Every one of the 256 opcodes maps to an instruction type, an addressing
//! mode and a base cycle count. The per-type tables below describe how an
//! instruction touches memory, whether it can redirect control flow, which
//! register it writes and whether it disturbs the carry flag.

use std::fmt;

/// Reset vector.
pub const VECTOR_RESET: u16 = 0xFFFC;
/// IRQ/BRK vector.
pub const VECTOR_IRQ: u16 = 0xFFFE;
/// NMI vector.
pub const VECTOR_NMI: u16 = 0xFFFA;

/// Addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpMode {
    /// Implied, no operand.
    Nil,
    /// Accumulator.
    Acc,
    Imm,
    Zpg,
    Zpx,
    Zpy,
    Abs,
    Abx,
    Aby,
    /// Absolute indirect (JMP only).
    Ind,
    /// (zp,X)
    Idx,
    /// (zp),Y
    Idy,
    /// PC-relative branch.
    Rel,
}

impl OpMode {
    /// Instruction length in bytes, opcode included.
    pub const fn len(self) -> u8 {
        match self {
            OpMode::Nil | OpMode::Acc => 1,
            OpMode::Imm
            | OpMode::Zpg
            | OpMode::Zpx
            | OpMode::Zpy
            | OpMode::Idx
            | OpMode::Idy
            | OpMode::Rel => 2,
            OpMode::Abs | OpMode::Abx | OpMode::Aby | OpMode::Ind => 3,
        }
    }

    /// Zero-page family: the effective address never leaves page zero.
    pub const fn is_zero_page(self) -> bool {
        matches!(self, OpMode::Zpg | OpMode::Zpx | OpMode::Zpy)
    }
}

/// Instruction type, independent of addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum OpType {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs,
    Clc, Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny,
    Jmp, Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror,
    Rti, Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    /// Illegal: A = (A & imm) >> 1.
    Alr,
    /// Illegal: ASL memory then ORA.
    Slo,
    /// Illegal: store A & X.
    Sax,
    /// 0x02: clean exit from compiled code.
    Exit,
    /// 0x12: debug break.
    Break,
    /// 0xF2: deliberate fault.
    Crash,
    /// No implementation.
    Unknown,
}

/// How an instruction type touches its memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMem {
    None,
    Read,
    Write,
    Rw,
}

/// Whether an instruction can redirect control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchClass {
    /// Never branches.
    No,
    /// Always leaves the sequential path: ends a block.
    Yes,
    /// Conditional branch.
    Maybe,
}

/// Register written by an instruction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpReg {
    None,
    A,
    X,
    Y,
}

/// Decoded facts about one opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub optype: OpType,
    pub mode: OpMode,
    /// Base cycle count, before page-crossing or taken-branch penalties.
    pub cycles: u8,
}

impl OpcodeInfo {
    pub const fn len(&self) -> u8 {
        self.mode.len()
    }

    pub const fn mem(&self) -> OpMem {
        self.optype.mem()
    }

    pub const fn branch(&self) -> BranchClass {
        self.optype.branch()
    }

    /// Register written, with accumulator-mode shifts counted as writing A.
    pub const fn sets_register(&self) -> OpReg {
        if matches!(self.mode, OpMode::Acc) {
            OpReg::A
        } else {
            self.optype.sets_register()
        }
    }
}

impl OpType {
    pub const fn mem(self) -> OpMem {
        use OpType::*;
        match self {
            Adc | And | Bit | Cmp | Cpx | Cpy | Eor | Lda | Ldx | Ldy | Ora | Sbc | Nop | Alr => {
                OpMem::Read
            }
            Sta | Stx | Sty | Sax => OpMem::Write,
            Asl | Lsr | Rol | Ror | Inc | Dec | Slo => OpMem::Rw,
            _ => OpMem::None,
        }
    }

    pub const fn branch(self) -> BranchClass {
        use OpType::*;
        match self {
            Bcc | Bcs | Beq | Bmi | Bne | Bpl | Bvc | Bvs => BranchClass::Maybe,
            Brk | Jmp | Jsr | Rti | Rts | Exit | Break | Crash | Unknown => BranchClass::Yes,
            _ => BranchClass::No,
        }
    }

    pub const fn sets_register(self) -> OpReg {
        use OpType::*;
        match self {
            Adc | And | Eor | Ora | Lda | Pla | Sbc | Txa | Tya | Alr | Slo => OpReg::A,
            Ldx | Tax | Tsx | Inx | Dex => OpReg::X,
            Ldy | Tay | Iny | Dey => OpReg::Y,
            _ => OpReg::None,
        }
    }

    pub const fn changes_carry(self) -> bool {
        use OpType::*;
        matches!(
            self,
            Adc | Sbc | Cmp | Cpx | Cpy | Asl | Lsr | Rol | Ror | Plp | Rti | Alr | Slo | Clc | Sec
        )
    }

    pub fn mnemonic(self) -> &'static str {
        use OpType::*;
        match self {
            Adc => "ADC", And => "AND", Asl => "ASL", Bcc => "BCC", Bcs => "BCS",
            Beq => "BEQ", Bit => "BIT", Bmi => "BMI", Bne => "BNE", Bpl => "BPL",
            Brk => "BRK", Bvc => "BVC", Bvs => "BVS", Clc => "CLC", Cld => "CLD",
            Cli => "CLI", Clv => "CLV", Cmp => "CMP", Cpx => "CPX", Cpy => "CPY",
            Dec => "DEC", Dex => "DEX", Dey => "DEY", Eor => "EOR", Inc => "INC",
            Inx => "INX", Iny => "INY", Jmp => "JMP", Jsr => "JSR", Lda => "LDA",
            Ldx => "LDX", Ldy => "LDY", Lsr => "LSR", Nop => "NOP", Ora => "ORA",
            Pha => "PHA", Php => "PHP", Pla => "PLA", Plp => "PLP", Rol => "ROL",
            Ror => "ROR", Rti => "RTI", Rts => "RTS", Sbc => "SBC", Sec => "SEC",
            Sed => "SED", Sei => "SEI", Sta => "STA", Stx => "STX", Sty => "STY",
            Tax => "TAX", Tay => "TAY", Tsx => "TSX", Txa => "TXA", Txs => "TXS",
            Tya => "TYA", Alr => "ALR", Slo => "SLO", Sax => "SAX", Exit => "EXIT",
            Break => "BREAK", Crash => "CRASH", Unknown => "???",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

const fn info(optype: OpType, mode: OpMode, cycles: u8) -> OpcodeInfo {
    OpcodeInfo { optype, mode, cycles }
}

const fn decode(opcode: u8) -> OpcodeInfo {
    use OpMode::*;
    use OpType::*;
    match opcode {
        0x00 => info(Brk, Nil, 7),
        0x01 => info(Ora, Idx, 6),
        0x02 => info(Exit, Nil, 2),
        0x05 => info(Ora, Zpg, 3),
        0x06 => info(Asl, Zpg, 5),
        0x07 => info(Slo, Zpg, 5),
        0x08 => info(Php, Nil, 3),
        0x09 => info(Ora, Imm, 2),
        0x0A => info(Asl, Acc, 2),
        0x0C => info(Nop, Abs, 4),
        0x0D => info(Ora, Abs, 4),
        0x0E => info(Asl, Abs, 6),
        0x0F => info(Slo, Abs, 6),

        0x10 => info(Bpl, Rel, 2),
        0x11 => info(Ora, Idy, 5),
        0x12 => info(Break, Nil, 2),
        0x15 => info(Ora, Zpx, 4),
        0x16 => info(Asl, Zpx, 6),
        0x18 => info(Clc, Nil, 2),
        0x19 => info(Ora, Aby, 4),
        0x1A => info(Nop, Nil, 2),
        0x1D => info(Ora, Abx, 4),
        0x1E => info(Asl, Abx, 7),

        0x20 => info(Jsr, Abs, 6),
        0x21 => info(And, Idx, 6),
        0x24 => info(Bit, Zpg, 3),
        0x25 => info(And, Zpg, 3),
        0x26 => info(Rol, Zpg, 5),
        0x28 => info(Plp, Nil, 4),
        0x29 => info(And, Imm, 2),
        0x2A => info(Rol, Acc, 2),
        0x2C => info(Bit, Abs, 4),
        0x2D => info(And, Abs, 4),
        0x2E => info(Rol, Abs, 6),

        0x30 => info(Bmi, Rel, 2),
        0x31 => info(And, Idy, 5),
        0x35 => info(And, Zpx, 4),
        0x36 => info(Rol, Zpx, 6),
        0x38 => info(Sec, Nil, 2),
        0x39 => info(And, Aby, 4),
        0x3A => info(Nop, Nil, 2),
        0x3D => info(And, Abx, 4),
        0x3E => info(Rol, Abx, 7),

        0x40 => info(Rti, Nil, 6),
        0x41 => info(Eor, Idx, 6),
        0x44 => info(Nop, Zpg, 3),
        0x45 => info(Eor, Zpg, 3),
        0x46 => info(Lsr, Zpg, 5),
        0x48 => info(Pha, Nil, 3),
        0x49 => info(Eor, Imm, 2),
        0x4A => info(Lsr, Acc, 2),
        0x4B => info(Alr, Imm, 2),
        0x4C => info(Jmp, Abs, 3),
        0x4D => info(Eor, Abs, 4),
        0x4E => info(Lsr, Abs, 6),

        0x50 => info(Bvc, Rel, 2),
        0x51 => info(Eor, Idy, 5),
        0x55 => info(Eor, Zpx, 4),
        0x56 => info(Lsr, Zpx, 6),
        0x58 => info(Cli, Nil, 2),
        0x59 => info(Eor, Aby, 4),
        0x5A => info(Nop, Nil, 2),
        0x5D => info(Eor, Abx, 4),
        0x5E => info(Lsr, Abx, 7),

        0x60 => info(Rts, Nil, 6),
        0x61 => info(Adc, Idx, 6),
        0x64 => info(Nop, Zpg, 3),
        0x65 => info(Adc, Zpg, 3),
        0x66 => info(Ror, Zpg, 5),
        0x68 => info(Pla, Nil, 4),
        0x69 => info(Adc, Imm, 2),
        0x6A => info(Ror, Acc, 2),
        0x6C => info(Jmp, Ind, 5),
        0x6D => info(Adc, Abs, 4),
        0x6E => info(Ror, Abs, 6),

        0x70 => info(Bvs, Rel, 2),
        0x71 => info(Adc, Idy, 5),
        0x75 => info(Adc, Zpx, 4),
        0x76 => info(Ror, Zpx, 6),
        0x78 => info(Sei, Nil, 2),
        0x79 => info(Adc, Aby, 4),
        0x7A => info(Nop, Nil, 2),
        0x7D => info(Adc, Abx, 4),
        0x7E => info(Ror, Abx, 7),

        0x80 => info(Nop, Imm, 2),
        0x81 => info(Sta, Idx, 6),
        0x84 => info(Sty, Zpg, 3),
        0x85 => info(Sta, Zpg, 3),
        0x86 => info(Stx, Zpg, 3),
        0x87 => info(Sax, Zpg, 3),
        0x88 => info(Dey, Nil, 2),
        0x8A => info(Txa, Nil, 2),
        0x8C => info(Sty, Abs, 4),
        0x8D => info(Sta, Abs, 4),
        0x8E => info(Stx, Abs, 4),
        0x8F => info(Sax, Abs, 4),

        0x90 => info(Bcc, Rel, 2),
        0x91 => info(Sta, Idy, 6),
        0x94 => info(Sty, Zpx, 4),
        0x95 => info(Sta, Zpx, 4),
        0x96 => info(Stx, Zpy, 4),
        0x98 => info(Tya, Nil, 2),
        0x99 => info(Sta, Aby, 5),
        0x9A => info(Txs, Nil, 2),
        0x9D => info(Sta, Abx, 5),

        0xA0 => info(Ldy, Imm, 2),
        0xA1 => info(Lda, Idx, 6),
        0xA2 => info(Ldx, Imm, 2),
        0xA4 => info(Ldy, Zpg, 3),
        0xA5 => info(Lda, Zpg, 3),
        0xA6 => info(Ldx, Zpg, 3),
        0xA8 => info(Tay, Nil, 2),
        0xA9 => info(Lda, Imm, 2),
        0xAA => info(Tax, Nil, 2),
        0xAC => info(Ldy, Abs, 4),
        0xAD => info(Lda, Abs, 4),
        0xAE => info(Ldx, Abs, 4),

        0xB0 => info(Bcs, Rel, 2),
        0xB1 => info(Lda, Idy, 5),
        0xB4 => info(Ldy, Zpx, 4),
        0xB5 => info(Lda, Zpx, 4),
        0xB6 => info(Ldx, Zpy, 4),
        0xB8 => info(Clv, Nil, 2),
        0xB9 => info(Lda, Aby, 4),
        0xBA => info(Tsx, Nil, 2),
        0xBC => info(Ldy, Abx, 4),
        0xBD => info(Lda, Abx, 4),
        0xBE => info(Ldx, Aby, 4),

        0xC0 => info(Cpy, Imm, 2),
        0xC1 => info(Cmp, Idx, 6),
        0xC4 => info(Cpy, Zpg, 3),
        0xC5 => info(Cmp, Zpg, 3),
        0xC6 => info(Dec, Zpg, 5),
        0xC8 => info(Iny, Nil, 2),
        0xC9 => info(Cmp, Imm, 2),
        0xCA => info(Dex, Nil, 2),
        0xCC => info(Cpy, Abs, 4),
        0xCD => info(Cmp, Abs, 4),
        0xCE => info(Dec, Abs, 6),

        0xD0 => info(Bne, Rel, 2),
        0xD1 => info(Cmp, Idy, 5),
        0xD5 => info(Cmp, Zpx, 4),
        0xD6 => info(Dec, Zpx, 6),
        0xD8 => info(Cld, Nil, 2),
        0xD9 => info(Cmp, Aby, 4),
        0xDA => info(Nop, Nil, 2),
        0xDD => info(Cmp, Abx, 4),
        0xDE => info(Dec, Abx, 7),

        0xE0 => info(Cpx, Imm, 2),
        0xE1 => info(Sbc, Idx, 6),
        0xE4 => info(Cpx, Zpg, 3),
        0xE5 => info(Sbc, Zpg, 3),
        0xE6 => info(Inc, Zpg, 5),
        0xE8 => info(Inx, Nil, 2),
        0xE9 => info(Sbc, Imm, 2),
        0xEA => info(Nop, Nil, 2),
        0xEC => info(Cpx, Abs, 4),
        0xED => info(Sbc, Abs, 4),
        0xEE => info(Inc, Abs, 6),

        0xF0 => info(Beq, Rel, 2),
        0xF1 => info(Sbc, Idy, 5),
        0xF2 => info(Crash, Nil, 2),
        0xF5 => info(Sbc, Zpx, 4),
        0xF6 => info(Inc, Zpx, 6),
        0xF8 => info(Sed, Nil, 2),
        0xF9 => info(Sbc, Aby, 4),
        0xFA => info(Nop, Nil, 2),
        0xFD => info(Sbc, Abx, 4),
        0xFE => info(Inc, Abx, 7),

        _ => info(Unknown, Nil, 2),
    }
}

const fn build_table() -> [OpcodeInfo; 256] {
    let mut table = [info(OpType::Unknown, OpMode::Nil, 2); 256];
    let mut i = 0;
    while i < 256 {
        table[i] = decode(i as u8);
        i += 1;
    }
    table
}

/// Decode table indexed by opcode byte.
pub static OPCODES: [OpcodeInfo; 256] = build_table();

/// Look up an opcode byte.
#[inline]
pub fn opcode_info(opcode: u8) -> &'static OpcodeInfo {
    &OPCODES[opcode as usize]
}
