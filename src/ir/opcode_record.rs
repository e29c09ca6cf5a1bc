use crate::frontend::m6502::tables::BranchClass;
use crate::ir::uop::{Uop, UopRecord};

/// Upper bound on micro-operations per guest instruction.
pub const MAX_UOPS_PER_OPCODE: usize = 16;

/// One decomposed guest instruction.
///
/// Static fields come from the decoder; `uops` may be rewritten by the
/// optimizer; `host_offset` and the countdown run total are filled in as
/// the block compiler proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeRecord {
    /// Guest address of the opcode byte.
    pub addr: u16,
    pub opcode: u8,
    /// Resolved operand: immediate, zero-page or absolute address, or branch target.
    pub operand: u16,
    /// Guest bytes covered.
    pub len: u8,
    /// Worst-case cycle cost including penalties.
    pub max_cycles: u8,
    pub branches: BranchClass,
    pub ends_block: bool,
    pub uops: Vec<UopRecord>,
    /// Arena offset of the first host byte, once emitted.
    pub host_offset: Option<u32>,
    /// Present when this instruction starts a countdown run; holds the run's cycle total.
    pub cycles_run_start: Option<u32>,
}

impl OpcodeRecord {
    pub fn new(addr: u16, opcode: u8) -> Self {
        Self {
            addr,
            opcode,
            operand: 0,
            len: 1,
            max_cycles: 0,
            branches: BranchClass::No,
            ends_block: false,
            uops: Vec::with_capacity(MAX_UOPS_PER_OPCODE),
            host_offset: None,
            cycles_run_start: None,
        }
    }

    pub fn num_uops(&self) -> usize {
        self.uops.len()
    }

    /// Append a uop at the end.
    pub fn push(&mut self, uop: Uop) {
        assert!(self.uops.len() < MAX_UOPS_PER_OPCODE, "uop list full at {:#06x}", self.addr);
        self.uops.push(UopRecord::new(uop));
    }

    /// Insert a uop before all others.
    pub fn prepend(&mut self, uop: Uop) {
        assert!(self.uops.len() < MAX_UOPS_PER_OPCODE, "uop list full at {:#06x}", self.addr);
        self.uops.insert(0, UopRecord::new(uop));
    }

    /// Drop every uop from `index` onwards.
    pub fn truncate_uops(&mut self, index: usize) {
        self.uops.truncate(index);
    }

    /// Guest address just past this instruction.
    pub fn next_addr(&self) -> u16 {
        self.addr.wrapping_add(self.len as u16)
    }

    pub fn iter_uops(&self) -> impl Iterator<Item = &Uop> {
        self.uops.iter().map(|r| &r.uop)
    }

    /// Total emitted host bytes.
    pub fn host_len(&self) -> u32 {
        self.uops.iter().map(|r| r.host_len).sum()
    }

    /// The countdown uop heading this instruction, if it starts a run.
    pub fn countdown_mut(&mut self) -> Option<&mut UopRecord> {
        self.cycles_run_start?;
        self.uops.first_mut().filter(|r| r.uop.is_countdown())
    }
}

/// Recompute every countdown value over `records`.
///
/// Each countdown is set to the sum of `max_cycles` from its instruction
/// up to (not including) the next countdown, or the end of the list.
pub fn fixup_countdowns(records: &mut [OpcodeRecord]) {
    let mut run_head: Option<usize> = None;
    for i in 0..records.len() {
        if records[i].cycles_run_start.is_some() {
            assert!(records[i].num_uops() >= 2, "countdown run at {:#06x} has no body", records[i].addr);
            assert!(
                matches!(records[i].uops[0].uop, Uop::Countdown { .. }),
                "countdown run at {:#06x} does not start with a countdown",
                records[i].addr
            );
            records[i].cycles_run_start = Some(0);
            run_head = Some(i);
        }
        let head = run_head.expect("first instruction of a block must start a countdown run");
        let cycles = records[i].max_cycles as u32;
        let total = records[head].cycles_run_start.unwrap_or(0) + cycles;
        records[head].cycles_run_start = Some(total);
        if let Uop::Countdown { cycles, .. } = &mut records[head].uops[0].uop {
            *cycles = total;
        }
    }
}
