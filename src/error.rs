use thiserror::Error;

/// Failures surfaced to the caller of the execution engine.
///
/// Each of these is reachable from guest code or from the host's
/// configuration. Internal invariant violations panic instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    /// An opcode with no implementation was reached; the trap keeps the byte and its address.
    #[error("undefined opcode {opcode:#04x} at {addr:#06x}")]
    UndefinedOpcode { opcode: u8, addr: u16 },

    /// The guest executed the 0xF2 crash opcode.
    #[error("deliberate fault at {addr:#06x}")]
    DeliberateFault { addr: u16 },

    /// Execution landed on a trap-fill byte outside any emitted block.
    #[error("stray trap at host offset {offset:#x}")]
    StrayTrap { offset: usize },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
