use std::fmt;

/// One micro-operation of a decomposed 6502 instruction.
///
/// Mode-resolution uops leave an effective address in the scratch register;
/// `Opcode` carries the main body of an instruction that has no generic
/// form and is emitted per opcode byte. Operands are the guest addresses or
/// immediates the emitter needs, resolved at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uop {
    /// Subtract `cycles` from the budget; leave to the dispatcher at `addr` if it runs out.
    Countdown { addr: u16, cycles: u32 },
    /// Invoke the debug hook for the instruction at `addr`.
    Debug { addr: u16 },
    /// Run the instruction at `addr` in the interpreter, then re-dispatch.
    Interp { addr: u16 },
    /// Refund one cycle if `base + X` stays on the same page.
    AbxCheckPageCrossing { base: u16 },
    /// Refund one cycle if `base + Y` stays on the same page.
    AbyCheckPageCrossing { base: u16 },
    /// Refund one cycle if `scratch + Y` stays on the same page.
    IdyCheckPageCrossing,
    /// Give cycles back to the budget (branch not taken).
    AddCycles { cycles: u8 },
    /// A += value, no carry in.
    AddImm { value: u8 },
    /// A -= value, no borrow in.
    SubImm { value: u8 },
    /// Bounce to the interpreter at `addr` when decimal mode is on.
    CheckBcd { addr: u16 },
    /// Bounce to the interpreter at `addr` when an IRQ is asserted.
    CheckPendingIrq { addr: u16 },
    /// Set Z and N from A.
    FlagA,
    FlagX,
    FlagY,
    IncScratch,
    /// Jump to the guest address in scratch.
    JmpScratch,
    /// Register = 0, Z set, N clear.
    LdaZero,
    LdxZero,
    LdyZero,
    /// Host carry = C.
    LoadCarry,
    /// Host carry = !C (borrow form).
    LoadCarryInv,
    /// Host overflow = V.
    LoadOverflow,
    /// C = host carry.
    SaveCarry,
    /// C = !host carry.
    SaveCarryInv,
    /// V = host overflow.
    SaveOverflow,
    /// scratch = base + X.
    ModeAbx { base: u16 },
    /// scratch = base + Y.
    ModeAby { base: u16 },
    /// scratch = 16-bit pointer at `addr`, high byte fetched within the same page.
    ModeInd { addr: u16 },
    /// scratch = 16-bit pointer at zero-page `scratch`.
    ModeIndScratch,
    /// scratch = (base + X) & 0xFF.
    ModeZpx { base: u8 },
    /// scratch = (base + Y) & 0xFF.
    ModeZpy { base: u8 },
    /// scratch = 16-bit value pulled from the stack.
    Pull16,
    /// Push a 16-bit value, high byte first.
    Push16 { value: u16 },
    /// Store a statically known byte.
    StoreImm { addr: u16, value: u8 },
    /// Invalidate compiled code at a fixed address. `pc` is the writing instruction.
    WriteInvAbs { addr: u16, pc: u16 },
    /// Invalidate compiled code at the address in scratch.
    WriteInvScratch { pc: u16 },
    /// Invalidate compiled code at scratch + Y.
    WriteInvScratchY { pc: u16 },
    /// Unconditional jump to a guest address through the block entry table.
    Jmp { target: u16 },
    /// Main body of a raw 6502 opcode.
    Opcode { opcode: u8, operand: u16 },
    /// Trap for an opcode with no implementation.
    Undefined { opcode: u8, addr: u16 },
}

impl Uop {
    pub fn is_countdown(&self) -> bool {
        matches!(self, Uop::Countdown { .. })
    }
}

impl fmt::Display for Uop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uop::Countdown { addr, cycles } => write!(f, "countdown({:#06x}, {})", addr, cycles),
            Uop::Debug { addr } => write!(f, "debug({:#06x})", addr),
            Uop::Interp { addr } => write!(f, "interp({:#06x})", addr),
            Uop::Jmp { target } => write!(f, "jmp({:#06x})", target),
            Uop::Opcode { opcode, operand } => write!(f, "op{:02x}({:#06x})", opcode, operand),
            Uop::StoreImm { addr, value } => write!(f, "stoa_imm({:#06x}, {:#04x})", addr, value),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A micro-operation plus the host bytes it occupied once emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UopRecord {
    pub uop: Uop,
    pub host_len: u32,
}

impl UopRecord {
    pub fn new(uop: Uop) -> Self {
        Self { uop, host_len: 0 }
    }
}
