use bitflags::bitflags;

bitflags! {
    /// Reasons the execution loop handed control back to the caller.
    ///
    /// Multiple reasons can be active simultaneously (OR'd together).
    /// Guest faults are not halt reasons; they surface as `JitError`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HaltReason: u32 {
        /// Guest executed the 0x02 exit opcode.
        const EXIT               = 1 << 0;
        /// Guest executed the 0x12 debug break opcode.
        const DEBUG_BREAK        = 1 << 1;
        /// The cycle budget ran out at a countdown check.
        const COUNTDOWN          = 1 << 2;
        /// External halt requested (e.g., from a debug hook or the host).
        const EXTERNAL_HALT      = 1 << 3;
    }
}

impl HaltReason {
    /// True if the guest itself asked to stop, as opposed to running out of budget.
    pub fn is_deliberate_exit(self) -> bool {
        self.intersects(HaltReason::EXIT | HaltReason::DEBUG_BREAK)
    }
}
