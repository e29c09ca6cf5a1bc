use crate::frontend::m6502::tables::{opcode_info, OpReg};
use crate::ir::opcode_record::OpcodeRecord;
use crate::ir::uop::Uop;

/// Register and carry values known at a point in a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct KnownState {
    a: Option<u8>,
    x: Option<u8>,
    y: Option<u8>,
    carry: Option<bool>,
}

/// Peephole pass over one block.
///
/// Walks the records in order, tracking register and carry values that are
/// statically known. ADC/SBC immediate with a known carry become plain
/// add/subtract; stores of a known register become immediate stores.
/// Nothing is known at block entry.
pub fn peephole(records: &mut [OpcodeRecord]) {
    let mut known = KnownState::default();

    for rec in records.iter_mut() {
        for uop_rec in rec.uops.iter_mut() {
            let Uop::Opcode { opcode, operand } = uop_rec.uop else {
                continue;
            };
            let rewritten = match opcode {
                0x69 if known.carry == Some(false) => Some(Uop::AddImm { value: operand as u8 }),
                0xE9 if known.carry == Some(true) => Some(Uop::SubImm { value: operand as u8 }),
                0x84 | 0x8C => known.y.map(|value| Uop::StoreImm { addr: operand, value }),
                0x85 | 0x8D => known.a.map(|value| Uop::StoreImm { addr: operand, value }),
                0x86 | 0x8E => known.x.map(|value| Uop::StoreImm { addr: operand, value }),
                _ => None,
            };
            if let Some(uop) = rewritten {
                uop_rec.uop = uop;
            }
        }

        let info = opcode_info(rec.opcode);
        match info.sets_register() {
            OpReg::A => known.a = None,
            OpReg::X => known.x = None,
            OpReg::Y => known.y = None,
            OpReg::None => {}
        }
        if info.optype.changes_carry() {
            known.carry = None;
        }

        match rec.opcode {
            0x18 => known.carry = Some(false),
            0x38 => known.carry = Some(true),
            0xA0 => known.y = Some(rec.operand as u8),
            0xA2 => known.x = Some(rec.operand as u8),
            0xA9 => known.a = Some(rec.operand as u8),
            _ => {}
        }
    }
}
