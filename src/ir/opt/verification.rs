use crate::ir::opcode_record::OpcodeRecord;
use crate::ir::uop::Uop;

/// Verification pass over a compiled block's records.
///
/// 1. The first record starts a countdown run.
/// 2. Every countdown carries the cycle total of its run.
/// 3. Only the last record ends the block, and it does.
///
/// Panics if any invariant is violated.
pub fn verification_pass(records: &[OpcodeRecord]) {
    let Some(first) = records.first() else {
        panic!("Verification failed: empty block");
    };
    if first.cycles_run_start.is_none() {
        panic!("Verification failed: block at {:#06x} does not start a countdown run", first.addr);
    }

    let mut i = 0;
    while i < records.len() {
        let head = &records[i];
        let mut total = head.max_cycles as u32;
        let mut j = i + 1;
        while j < records.len() && records[j].cycles_run_start.is_none() {
            total += records[j].max_cycles as u32;
            j += 1;
        }
        match head.uops.first().map(|r| r.uop) {
            Some(Uop::Countdown { cycles, .. }) if cycles == total => {}
            other => panic!(
                "Verification failed: run at {:#06x} expects countdown of {}, found {:?}",
                head.addr, total, other
            ),
        }
        if head.cycles_run_start != Some(total) {
            panic!(
                "Verification failed: run at {:#06x} records total {:?}, expected {}",
                head.addr, head.cycles_run_start, total
            );
        }
        i = j;
    }

    let last = records.len() - 1;
    for (i, rec) in records.iter().enumerate() {
        if rec.ends_block != (i == last) {
            panic!(
                "Verification failed: record {} at {:#06x} has ends_block={}",
                i, rec.addr, rec.ends_block
            );
        }
    }
}
