//! Dynamic binary translator for the NMOS 6502.
//!
//! Guest code is decomposed into micro-operations, optimized, emitted as
//! threaded code into a fixed arena and run from there. Instructions the
//! translator does not handle natively (decimal arithmetic, RTI, pending
//! interrupts) bounce through an interpreter one at a time.

pub mod backend;
pub mod error;
pub mod frontend;
pub mod halt_reason;
pub mod interpreter;
pub mod ir;
pub mod jit;
pub mod jit_config;
pub mod memory;

#[cfg(test)]
mod proptests;

pub use backend::jit_state::MachineState;
pub use error::JitError;
pub use halt_reason::HaltReason;
pub use interpreter::{Interpreter, Nmos6502Interpreter};
pub use jit::Jit6502;
pub use jit_config::{DebugHook, JitConfig, OptimizationFlag};
pub use memory::{FlatMemory, IoHandler, MemoryAccess, PageKind};
