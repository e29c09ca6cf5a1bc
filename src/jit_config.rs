use crate::backend::jit_state::MachineState;
use crate::error::JitError;

/// Per-instruction hook invoked by compiled code when debugging is enabled.
///
/// The hook sees the guest address and a read-only view of the machine
/// state. It has no access to JIT metadata, so it cannot invalidate or
/// recompile anything from inside a block.
pub trait DebugHook {
    /// Called before the instruction at `addr` executes.
    /// Return true to stop execution with `HaltReason::EXTERNAL_HALT`.
    fn on_instruction(&mut self, addr: u16, state: &MachineState) -> bool;
}

/// Fine-grained optimization flags.
///
/// Use bitwise OR to combine flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptimizationFlag(u32);

impl OptimizationFlag {
    /// Known-value peephole rewrites (ADC/SBC immediate, store-immediate).
    pub const PEEPHOLE: Self = Self(0x0000_0001);

    /// No optimizations enabled.
    pub const NO_OPTIMIZATIONS: Self = Self(0);
    /// All optimizations enabled.
    pub const ALL_OPTIMIZATIONS: Self = Self(0x0000_0001);

    /// Returns true if `flag` is set within `self`.
    #[inline]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0 && flag.0 != 0
    }

    /// Raw bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for OptimizationFlag {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

impl std::ops::BitOrAssign for OptimizationFlag {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0; }
}

impl std::ops::BitAnd for OptimizationFlag {
    type Output = Self;
    #[inline]
    fn bitand(self, rhs: Self) -> Self { Self(self.0 & rhs.0) }
}

/// Configuration for creating a `Jit6502` instance.
#[derive(Clone, Debug)]
pub struct JitConfig {
    /// Upper bound on guest instructions compiled into one block. Values below 1 act as 1.
    pub max_ops_per_block: u32,
    /// Emit invalidation checks for zero-page writes, needed only if code runs from zero page.
    pub compile_for_code_in_zero_page: bool,
    /// Charge page-crossing and taken-branch penalties exactly.
    pub accurate_timings: bool,
    /// Call the debug hook before every compiled instruction.
    pub debug: bool,
    /// Which optimization passes are enabled.
    pub optimizations: OptimizationFlag,
    /// Code arena size in bytes (default: 16 MB).
    pub code_arena_size: usize,
    /// Bytes reserved for a single compile; a block that needs more is split.
    pub compile_window_size: usize,
}

impl JitConfig {
    /// Default code arena size: 16 MB.
    pub const DEFAULT_CODE_ARENA_SIZE: usize = 16 * 1024 * 1024;
    /// Default per-compile window.
    pub const DEFAULT_COMPILE_WINDOW_SIZE: usize = 4096;
    /// Smallest usable compile window: one fully expanded opcode plus a trailing jump.
    pub const MIN_COMPILE_WINDOW_SIZE: usize = 256;
    /// Default bound on instructions per block.
    pub const DEFAULT_MAX_OPS_PER_BLOCK: u32 = 65536;

    /// Check whether a specific optimization flag is active.
    pub fn has_optimization(&self, flag: OptimizationFlag) -> bool {
        self.optimizations.contains(flag)
    }

    /// `max_ops_per_block` clamped to its minimum of 1.
    pub fn effective_max_ops_per_block(&self) -> u32 {
        self.max_ops_per_block.max(1)
    }

    /// Reject sizes the compiler cannot work with.
    pub fn validate(&self) -> Result<(), JitError> {
        if self.compile_window_size < Self::MIN_COMPILE_WINDOW_SIZE {
            return Err(JitError::InvalidConfig(format!(
                "compile_window_size {} is below the minimum of {}",
                self.compile_window_size,
                Self::MIN_COMPILE_WINDOW_SIZE
            )));
        }
        if self.code_arena_size < self.compile_window_size {
            return Err(JitError::InvalidConfig(format!(
                "code_arena_size {} cannot hold a compile window of {}",
                self.code_arena_size, self.compile_window_size
            )));
        }
        if self.code_arena_size > u32::MAX as usize {
            return Err(JitError::InvalidConfig(format!(
                "code_arena_size {} does not fit a 32-bit host offset",
                self.code_arena_size
            )));
        }
        Ok(())
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_ops_per_block: Self::DEFAULT_MAX_OPS_PER_BLOCK,
            compile_for_code_in_zero_page: false,
            accurate_timings: true,
            debug: false,
            optimizations: OptimizationFlag::ALL_OPTIMIZATIONS,
            code_arena_size: Self::DEFAULT_CODE_ARENA_SIZE,
            compile_window_size: Self::DEFAULT_COMPILE_WINDOW_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimization_flags() {
        let flags = OptimizationFlag::NO_OPTIMIZATIONS | OptimizationFlag::PEEPHOLE;
        assert!(flags.contains(OptimizationFlag::PEEPHOLE));
        assert!(!OptimizationFlag::NO_OPTIMIZATIONS.contains(OptimizationFlag::PEEPHOLE));
        assert!(!flags.contains(OptimizationFlag::NO_OPTIMIZATIONS));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = JitConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.has_optimization(OptimizationFlag::PEEPHOLE));
        assert_eq!(config.effective_max_ops_per_block(), 65536);
    }

    #[test]
    fn test_max_ops_clamped() {
        let config = JitConfig { max_ops_per_block: 0, ..JitConfig::default() };
        assert_eq!(config.effective_max_ops_per_block(), 1);
    }

    #[test]
    fn test_small_window_rejected() {
        let config = JitConfig { compile_window_size: 16, ..JitConfig::default() };
        assert!(matches!(config.validate(), Err(JitError::InvalidConfig(_))));
    }
}
