use crate::backend::block_of_code::CodeBuffer;
use crate::ir::uop::Uop;
use crate::memory::MemoryAccess;

/// Host code generator for micro-operations.
///
/// The block compiler only relies on the byte counts returned here: it
/// never inspects the encoding itself.
pub trait CodeEmitter {
    /// Encode one uop at the buffer cursor; returns the bytes written.
    ///
    /// Emitting the same uop twice yields the same length, except that a
    /// countdown may shrink when its cycle total does.
    fn emit_uop<M: MemoryAccess + ?Sized>(&self, buf: &mut CodeBuffer<'_>, uop: &Uop, memory: &M) -> usize;

    /// Bytes taken by an unconditional `Jmp`.
    fn jmp_len(&self) -> usize;

    /// Pad the rest of `buf` with no-ops.
    fn pad_nops(&self, buf: &mut CodeBuffer<'_>);

    /// Fill the rest of `buf` with bytes that fault when executed.
    fn fill_traps(&self, buf: &mut CodeBuffer<'_>);
}
