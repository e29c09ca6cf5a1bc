pub mod peephole;
pub mod verification;

pub use peephole::peephole;
pub use verification::verification_pass;
