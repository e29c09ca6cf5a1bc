use crate::frontend::m6502::tables::{opcode_info, BranchClass, OpMem, OpMode, OpType, VECTOR_IRQ};
use crate::ir::opcode_record::OpcodeRecord;
use crate::ir::uop::Uop;
use crate::memory::MemoryAccess;

/// Options controlling decomposition.
#[derive(Debug, Clone, Default)]
pub struct TranslationOptions {
    /// Prefix every instruction with a debug hook call.
    pub debug: bool,
    /// Charge page-crossing and taken-branch penalties.
    pub accurate_timings: bool,
    /// Invalidate compiled code on zero-page writes.
    pub compile_for_code_in_zero_page: bool,
}

/// Decompose the instruction at `addr` into micro-operations.
///
/// Emits, in order: an optional debug uop, addressing-mode uops, write
/// invalidation uops, pre-main uops, the main uop(s) and post-main flag
/// uops. Instructions that cannot be translated statically collapse to a
/// single interpreter call and end the block.
pub fn decompose<M: MemoryAccess + ?Sized>(
    memory: &M,
    options: &TranslationOptions,
    addr: u16,
) -> OpcodeRecord {
    let opcode = memory.read(addr);
    let info = opcode_info(opcode);
    let optype = info.optype;
    let mode = info.mode;
    let opmem = info.mem();

    let op1 = memory.read(addr.wrapping_add(1));
    let op2 = memory.read(addr.wrapping_add(2));

    let mut rec = OpcodeRecord::new(addr, opcode);
    rec.len = info.len();
    rec.branches = info.branch();
    rec.ends_block = rec.branches == BranchClass::Yes;

    if options.debug {
        rec.push(Uop::Debug { addr });
    }
    let first_post_debug = rec.num_uops();

    let mut use_interp = false;
    let mut could_page_cross = true;
    let mut emit_flag_load = true;
    // Unknown opcodes keep their own address as operand.
    let mut main_value = addr;

    match mode {
        OpMode::Nil | OpMode::Acc => {}
        OpMode::Imm | OpMode::Zpg => {
            main_value = op1 as u16;
        }
        OpMode::Zpx => rec.push(Uop::ModeZpx { base: op1 }),
        OpMode::Zpy => rec.push(Uop::ModeZpy { base: op1 }),
        OpMode::Rel => {
            main_value = addr.wrapping_add(2).wrapping_add(op1 as i8 as u16);
        }
        OpMode::Abs | OpMode::Abx | OpMode::Aby => {
            main_value = u16::from_le_bytes([op1, op2]);
            if main_value & 0xFF == 0 {
                could_page_cross = false;
            }
            let range_start = main_value;
            let mut range_end = main_value;
            if mode != OpMode::Abs {
                range_end = range_end.wrapping_add(0xFF);
            }

            if options.accurate_timings && opmem == OpMem::Read && could_page_cross {
                match mode {
                    OpMode::Abx => rec.push(Uop::AbxCheckPageCrossing { base: main_value }),
                    OpMode::Aby => rec.push(Uop::AbyCheckPageCrossing { base: main_value }),
                    _ => {}
                }
            }

            // Indexed accesses past 0xFFFF wrap to page zero; leave those to the interpreter.
            if range_start > range_end {
                use_interp = true;
            }
            if matches!(opmem, OpMem::Read | OpMem::Rw)
                && (memory.read_needs_callback(range_start) || memory.read_needs_callback(range_end))
            {
                use_interp = true;
            }
            if matches!(opmem, OpMem::Write | OpMem::Rw)
                && (memory.write_needs_callback(range_start)
                    || memory.write_needs_callback(range_end))
            {
                use_interp = true;
            }
        }
        OpMode::Ind => {
            main_value = u16::from_le_bytes([op1, op2]);
            rec.push(Uop::ModeInd { addr: main_value });
        }
        OpMode::Idx => {
            rec.push(Uop::ModeZpx { base: op1 });
            rec.push(Uop::ModeIndScratch);
        }
        OpMode::Idy => {
            rec.push(Uop::ModeInd { addr: op1 as u16 });
            if options.accurate_timings && opmem == OpMem::Read {
                rec.push(Uop::IdyCheckPageCrossing);
            }
        }
    }

    rec.operand = main_value;

    rec.max_cycles = info.cycles;
    if options.accurate_timings {
        if opmem == OpMem::Read
            && matches!(mode, OpMode::Abx | OpMode::Aby | OpMode::Idy)
            && could_page_cross
        {
            rec.max_cycles += 1;
        } else if mode == OpMode::Rel {
            // Taken: +1, or +2 when the target is on another page.
            if (addr.wrapping_add(2) >> 8) != (main_value >> 8) {
                rec.max_cycles += 2;
            } else {
                rec.max_cycles += 1;
            }
        }
    }

    // RTI lands all over the place; compiling its targets would shred blocks.
    if optype == OpType::Rti {
        use_interp = true;
    }

    if use_interp {
        rec.truncate_uops(first_post_debug);
        rec.push(Uop::Interp { addr });
        rec.ends_block = true;
        return rec;
    }

    // Self-modifying code.
    if matches!(opmem, OpMem::Write | OpMem::Rw) {
        match mode {
            OpMode::Abs => rec.push(Uop::WriteInvAbs { addr: main_value, pc: addr }),
            OpMode::Abx => {
                rec.push(Uop::ModeAbx { base: main_value });
                rec.push(Uop::WriteInvScratch { pc: addr });
            }
            OpMode::Aby => {
                rec.push(Uop::ModeAby { base: main_value });
                rec.push(Uop::WriteInvScratch { pc: addr });
            }
            OpMode::Idx => rec.push(Uop::WriteInvScratch { pc: addr }),
            OpMode::Idy => rec.push(Uop::WriteInvScratchY { pc: addr }),
            OpMode::Zpg if options.compile_for_code_in_zero_page => {
                rec.push(Uop::WriteInvAbs { addr: main_value, pc: addr });
            }
            OpMode::Zpx | OpMode::Zpy if options.compile_for_code_in_zero_page => {
                rec.push(Uop::WriteInvScratch { pc: addr });
            }
            _ => {}
        }
    }

    // Pre-main.
    match optype {
        OpType::Adc => {
            rec.push(Uop::CheckBcd { addr });
            rec.push(Uop::LoadCarry);
        }
        OpType::Bcc | OpType::Bcs | OpType::Rol | OpType::Ror => rec.push(Uop::LoadCarry),
        OpType::Bvc | OpType::Bvs => rec.push(Uop::LoadOverflow),
        OpType::Cli | OpType::Plp => rec.push(Uop::CheckPendingIrq { addr }),
        OpType::Jsr => rec.push(Uop::Push16 { value: addr.wrapping_add(2) }),
        OpType::Rts => {
            rec.push(Uop::Pull16);
            rec.push(Uop::IncScratch);
        }
        OpType::Sbc => {
            rec.push(Uop::CheckBcd { addr });
            rec.push(Uop::LoadCarryInv);
        }
        _ => {}
    }

    // Main.
    match optype {
        OpType::Brk => {
            rec.push(Uop::Push16 { value: addr.wrapping_add(2) });
            rec.push(Uop::Opcode { opcode: 0x08, operand: 0 });
            rec.push(Uop::Opcode { opcode: 0x78, operand: 0 });
            rec.push(Uop::ModeInd { addr: VECTOR_IRQ });
            rec.push(Uop::JmpScratch);
        }
        OpType::Jmp if mode == OpMode::Ind => rec.push(Uop::JmpScratch),
        OpType::Jmp | OpType::Jsr => rec.push(Uop::Jmp { target: main_value }),
        OpType::Lda if mode == OpMode::Imm && main_value == 0 => {
            rec.push(Uop::LdaZero);
            emit_flag_load = false;
        }
        OpType::Ldx if mode == OpMode::Imm && main_value == 0 => {
            rec.push(Uop::LdxZero);
            emit_flag_load = false;
        }
        OpType::Ldy if mode == OpMode::Imm && main_value == 0 => {
            rec.push(Uop::LdyZero);
            emit_flag_load = false;
        }
        OpType::Rts => rec.push(Uop::JmpScratch),
        OpType::Unknown => rec.push(Uop::Undefined { opcode, addr }),
        _ => rec.push(Uop::Opcode { opcode, operand: main_value }),
    }

    // Post-main.
    match optype {
        OpType::Adc => {
            rec.push(Uop::SaveCarry);
            rec.push(Uop::SaveOverflow);
        }
        OpType::Alr | OpType::Asl | OpType::Lsr | OpType::Slo => rec.push(Uop::SaveCarry),
        OpType::Bcc
        | OpType::Bcs
        | OpType::Beq
        | OpType::Bmi
        | OpType::Bne
        | OpType::Bpl
        | OpType::Bvc
        | OpType::Bvs => {
            if options.accurate_timings {
                // Only reached when the branch falls through.
                rec.push(Uop::AddCycles { cycles: rec.max_cycles - 2 });
            }
        }
        OpType::Cmp | OpType::Cpx | OpType::Cpy => rec.push(Uop::SaveCarryInv),
        OpType::Lda | OpType::Txa | OpType::Tya | OpType::Pla => {
            if emit_flag_load {
                rec.push(Uop::FlagA);
            }
        }
        OpType::Ldx | OpType::Tax | OpType::Tsx => {
            if emit_flag_load {
                rec.push(Uop::FlagX);
            }
        }
        OpType::Ldy | OpType::Tay => {
            if emit_flag_load {
                rec.push(Uop::FlagY);
            }
        }
        OpType::Rol | OpType::Ror => {
            rec.push(Uop::SaveCarry);
            if mode == OpMode::Acc {
                rec.push(Uop::FlagA);
            }
        }
        OpType::Sbc => {
            rec.push(Uop::SaveCarryInv);
            rec.push(Uop::SaveOverflow);
        }
        _ => {}
    }

    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlatMemory, PageKind};

    fn options() -> TranslationOptions {
        TranslationOptions { debug: false, accurate_timings: true, compile_for_code_in_zero_page: false }
    }

    fn uops(rec: &OpcodeRecord) -> Vec<Uop> {
        rec.iter_uops().copied().collect()
    }

    #[test]
    fn test_lda_imm_zero_uses_load_zero() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0xA9, 0x00]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::LdaZero]);
        assert_eq!(rec.len, 2);
        assert_eq!(rec.max_cycles, 2);
        assert!(!rec.ends_block);
    }

    #[test]
    fn test_lda_imm_nonzero_sets_flags_after() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0xA9, 0x41]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Opcode { opcode: 0xA9, operand: 0x41 }, Uop::FlagA]);
    }

    #[test]
    fn test_sta_abs_invalidates_exact_address() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x8D, 0x34, 0x12]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(
            uops(&rec),
            vec![
                Uop::WriteInvAbs { addr: 0x1234, pc: 0x1000 },
                Uop::Opcode { opcode: 0x8D, operand: 0x1234 },
            ]
        );
    }

    #[test]
    fn test_sta_zpg_skips_invalidation_unless_enabled() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x85, 0x70]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Opcode { opcode: 0x85, operand: 0x70 }]);

        let zp = TranslationOptions { compile_for_code_in_zero_page: true, ..options() };
        let rec = decompose(&mem, &zp, 0x1000);
        assert_eq!(rec.uops[0].uop, Uop::WriteInvAbs { addr: 0x70, pc: 0x1000 });
    }

    #[test]
    fn test_sta_abx_invalidates_computed_address() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x9D, 0x00, 0x20]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(
            uops(&rec),
            vec![
                Uop::ModeAbx { base: 0x2000 },
                Uop::WriteInvScratch { pc: 0x1000 },
                Uop::Opcode { opcode: 0x9D, operand: 0x2000 },
            ]
        );
        assert_eq!(rec.max_cycles, 5);
    }

    #[test]
    fn test_lda_abx_page_crossing_penalty() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0xBD, 0x10, 0x20]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(rec.max_cycles, 5);
        assert_eq!(rec.uops[0].uop, Uop::AbxCheckPageCrossing { base: 0x2010 });

        // Page-aligned base cannot cross.
        mem.load(0x1000, &[0xBD, 0x00, 0x20]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(rec.max_cycles, 4);
        assert!(!rec.iter_uops().any(|u| matches!(u, Uop::AbxCheckPageCrossing { .. })));
    }

    #[test]
    fn test_inaccurate_timings_skip_penalties() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0xBD, 0x10, 0x20]);
        let opts = TranslationOptions { accurate_timings: false, ..options() };
        let rec = decompose(&mem, &opts, 0x1000);
        assert_eq!(rec.max_cycles, 4);
        assert_eq!(uops(&rec), vec![Uop::Opcode { opcode: 0xBD, operand: 0x2010 }, Uop::FlagA]);
    }

    #[test]
    fn test_branch_cycles_and_refund() {
        let mut mem = FlatMemory::new();
        // BNE +2: same page.
        mem.load(0x1000, &[0xD0, 0x02]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(rec.operand, 0x1004);
        assert_eq!(rec.max_cycles, 3);
        assert_eq!(rec.branches, BranchClass::Maybe);
        assert_eq!(rec.uops.last().map(|r| r.uop), Some(Uop::AddCycles { cycles: 1 }));

        // BCC backwards across a page.
        mem.load(0x1000, &[0x90, 0xF0]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(rec.operand, 0x0FF2);
        assert_eq!(rec.max_cycles, 4);
        assert_eq!(rec.uops[0].uop, Uop::LoadCarry);
        assert_eq!(rec.uops.last().map(|r| r.uop), Some(Uop::AddCycles { cycles: 2 }));
    }

    #[test]
    fn test_io_access_falls_back_to_interpreter() {
        let mut mem = FlatMemory::new();
        mem.set_pages(0xFE00..=0xFEFF, PageKind::Io);
        mem.load(0x1000, &[0xAD, 0x40, 0xFE]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Interp { addr: 0x1000 }]);
        assert!(rec.ends_block);

        // abx range reaching into I/O also bounces.
        mem.load(0x1000, &[0xBD, 0x80, 0xFD]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Interp { addr: 0x1000 }]);
    }

    #[test]
    fn test_address_wrap_falls_back_to_interpreter() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0xBD, 0x80, 0xFF]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Interp { addr: 0x1000 }]);
    }

    #[test]
    fn test_rti_uses_interpreter_and_keeps_debug() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x40]);
        let opts = TranslationOptions { debug: true, ..options() };
        let rec = decompose(&mem, &opts, 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Debug { addr: 0x1000 }, Uop::Interp { addr: 0x1000 }]);
    }

    #[test]
    fn test_jsr_pushes_return_address() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x20, 0x00, 0x30]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Push16 { value: 0x1002 }, Uop::Jmp { target: 0x3000 }]);
        assert!(rec.ends_block);
    }

    #[test]
    fn test_rts_and_brk_sequences() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x60]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Pull16, Uop::IncScratch, Uop::JmpScratch]);

        mem.load(0x1000, &[0x00]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(
            uops(&rec),
            vec![
                Uop::Push16 { value: 0x1002 },
                Uop::Opcode { opcode: 0x08, operand: 0 },
                Uop::Opcode { opcode: 0x78, operand: 0 },
                Uop::ModeInd { addr: VECTOR_IRQ },
                Uop::JmpScratch,
            ]
        );
    }

    #[test]
    fn test_adc_sbc_carry_plumbing() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x69, 0x01]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(
            uops(&rec),
            vec![
                Uop::CheckBcd { addr: 0x1000 },
                Uop::LoadCarry,
                Uop::Opcode { opcode: 0x69, operand: 0x01 },
                Uop::SaveCarry,
                Uop::SaveOverflow,
            ]
        );

        mem.load(0x1000, &[0xE9, 0x01]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(rec.uops[1].uop, Uop::LoadCarryInv);
        assert_eq!(rec.uops[3].uop, Uop::SaveCarryInv);
    }

    #[test]
    fn test_undefined_opcode_traps() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x03]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(uops(&rec), vec![Uop::Undefined { opcode: 0x03, addr: 0x1000 }]);
        assert!(rec.ends_block);
    }

    #[test]
    fn test_idy_store_invalidates_with_y() {
        let mut mem = FlatMemory::new();
        mem.load(0x1000, &[0x91, 0x70]);
        let rec = decompose(&mem, &options(), 0x1000);
        assert_eq!(
            uops(&rec),
            vec![
                Uop::ModeInd { addr: 0x70 },
                Uop::WriteInvScratchY { pc: 0x1000 },
                Uop::Opcode { opcode: 0x91, operand: 0x1000 },
            ]
        );
        assert_eq!(rec.max_cycles, 6);
    }
}
