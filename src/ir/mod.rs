pub mod opcode_record;
pub mod opt;
pub mod uop;
