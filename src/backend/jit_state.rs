/// Flag bits of the packed 6502 status register.
pub const FLAG_C: u8 = 0x01;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_I: u8 = 0x04;
pub const FLAG_D: u8 = 0x08;
pub const FLAG_B: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_V: u8 = 0x40;
pub const FLAG_N: u8 = 0x80;

/// Guest machine state as seen by compiled code.
///
/// C, Z, N and V live unpacked because compiled code updates them on nearly
/// every instruction; I, D and the B/unused bits stay packed in
/// `flags_other`. `scratch` holds effective addresses between uops, and the
/// `host_*` fields are the carry/overflow the arithmetic uops work on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    /// Stack pointer; the stack lives at 0x0100 + s.
    pub s: u8,
    pub pc: u16,

    pub flag_c: bool,
    pub flag_z: bool,
    pub flag_n: bool,
    pub flag_v: bool,
    /// I, D, B and bit 5 in their packed positions.
    pub flags_other: u8,

    pub scratch: u16,
    pub host_carry: bool,
    pub host_overflow: bool,

    /// Remaining cycle budget. Negative after a countdown trips.
    pub countdown: i64,
    /// Level-triggered IRQ line.
    pub irq_asserted: bool,
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            s: 0,
            pc: 0,
            flag_c: false,
            flag_z: false,
            flag_n: false,
            flag_v: false,
            flags_other: FLAG_B | FLAG_UNUSED,
            scratch: 0,
            host_carry: false,
            host_overflow: false,
            countdown: 0,
            irq_asserted: false,
        }
    }

    /// Back to power-on values.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Packed status register.
    pub fn flags(&self) -> u8 {
        let mut p = self.flags_other & (FLAG_I | FLAG_D | FLAG_B | FLAG_UNUSED);
        if self.flag_c {
            p |= FLAG_C;
        }
        if self.flag_z {
            p |= FLAG_Z;
        }
        if self.flag_v {
            p |= FLAG_V;
        }
        if self.flag_n {
            p |= FLAG_N;
        }
        p
    }

    /// Load the status register as PLP/RTI do: B and bit 5 always read back set.
    pub fn set_flags(&mut self, p: u8) {
        self.flag_c = p & FLAG_C != 0;
        self.flag_z = p & FLAG_Z != 0;
        self.flag_v = p & FLAG_V != 0;
        self.flag_n = p & FLAG_N != 0;
        self.flags_other = (p & (FLAG_I | FLAG_D)) | FLAG_B | FLAG_UNUSED;
    }

    pub fn flag_i(&self) -> bool {
        self.flags_other & FLAG_I != 0
    }

    pub fn set_flag_i(&mut self, on: bool) {
        if on {
            self.flags_other |= FLAG_I;
        } else {
            self.flags_other &= !FLAG_I;
        }
    }

    pub fn flag_d(&self) -> bool {
        self.flags_other & FLAG_D != 0
    }

    pub fn set_flag_d(&mut self, on: bool) {
        if on {
            self.flags_other |= FLAG_D;
        } else {
            self.flags_other &= !FLAG_D;
        }
    }

    /// Z and N from a result byte.
    #[inline]
    pub fn set_zn(&mut self, value: u8) {
        self.flag_z = value == 0;
        self.flag_n = value & 0x80 != 0;
    }

    /// Whether an IRQ would be taken now.
    pub fn irq_pending(&self) -> bool {
        self.irq_asserted && !self.flag_i()
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}
