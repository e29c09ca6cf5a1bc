pub mod decompose;
pub mod tables;

pub use decompose::{decompose, TranslationOptions};
pub use tables::{opcode_info, OpMode, OpType, OpcodeInfo, VECTOR_IRQ, VECTOR_NMI, VECTOR_RESET};
