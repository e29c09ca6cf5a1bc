pub mod block_cache;
pub mod block_compiler;
pub mod block_of_code;
pub mod emit;
pub mod jit_state;
pub mod threaded;
