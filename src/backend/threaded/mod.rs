pub mod emit_threaded;
pub mod executor;

pub use emit_threaded::{decode, HostInsn, ThreadedEmitter};
