//! Instruction-set plumbing shared by both ISAs.
//!
//! This module holds the pieces that do not belong to either instruction set
//! in particular:
//! - [`Reg`]: a validated register number (0–7).
//! - [`reg_field`] and [`simm`]/[`uimm`]: pure, bit-exact operand decoding.
//! - [`IsaKind`]: the decoder/executor policy a simulator instance runs with.
//! - [`FlowClass`]: call/return classification used by the debugger's
//!   step-out and step-over depth tracking.
//! - [`Exception`]: the two ISA-level exceptions, handled by redirecting
//!   through the vector table rather than by failing the host.
//!
//! The instruction sets themselves live in [`lc`] and [`tm`].

pub mod lc;
pub mod tm;

use std::num::TryFromIntError;

/// A register. Must be between 0 and 7.
///
/// Construct one by selecting a constant from [`reg_consts`] or with
/// [`Reg::try_from`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Reg(pub(crate) u8);

/// Register constants!
pub mod reg_consts {
    use super::Reg;

    /// The 0th register in the register file.
    pub const R0: Reg = Reg(0);
    /// The 1st register in the register file.
    pub const R1: Reg = Reg(1);
    /// The 2nd register in the register file.
    pub const R2: Reg = Reg(2);
    /// The 3rd register in the register file.
    pub const R3: Reg = Reg(3);
    /// The 4th register in the register file.
    pub const R4: Reg = Reg(4);
    /// The 5th register in the register file.
    pub const R5: Reg = Reg(5);
    /// The 6th register in the register file (stack pointer by convention).
    pub const R6: Reg = Reg(6);
    /// The 7th register in the register file (link register by convention).
    pub const R7: Reg = Reg(7);
}

impl Reg {
    /// Gets the register number. This is always between 0 and 7.
    pub fn reg_no(self) -> u8 {
        self.0
    }
}
impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}
impl From<Reg> for usize {
    fn from(value: Reg) -> Self {
        usize::from(value.0)
    }
}
impl TryFrom<u8> for Reg {
    type Error = TryFromIntError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=7 => Ok(Reg(value)),
            // No public constructor for the error, so manufacture one.
            _ => u8::try_from(0x100u16).map(|_| unreachable!("out of range for u8")),
        }
    }
}

/// The three fixed operand positions a register field can occupy.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RegSlot {
    /// Destination field, bits 11:9.
    Dst,
    /// First source field, bits 8:6.
    Src1,
    /// Second source field, bits 2:0.
    Src2,
}

/// Extracts the 3-bit register field at the given slot.
pub fn reg_field(word: u16, slot: RegSlot) -> Reg {
    let shift = match slot {
        RegSlot::Dst => 9,
        RegSlot::Src1 => 6,
        RegSlot::Src2 => 0,
    };
    Reg(((word >> shift) & 0b111) as u8)
}

/// Extracts the low `width` bits of `word`, sign-extended to 16 bits.
///
/// `width` must be between 1 and 16.
pub fn simm(word: u16, width: u32) -> i16 {
    debug_assert!((1..=16).contains(&width), "immediate width {width} out of range");
    let shift = 16 - width;
    ((word << shift) as i16) >> shift
}

/// Extracts the low `width` bits of `word`, zero-extended to 16 bits.
pub fn uimm(word: u16, width: u32) -> u16 {
    debug_assert!((1..=16).contains(&width), "immediate width {width} out of range");
    (u32::from(word) & ((1u32 << width) - 1)) as u16
}

/// A value representing either an immediate operand or a register operand.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ImmOrReg {
    #[allow(missing_docs)]
    Imm(i16),
    #[allow(missing_docs)]
    Reg(Reg),
}
impl std::fmt::Display for ImmOrReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImmOrReg::Imm(imm) => write!(f, "#{imm}"),
            ImmOrReg::Reg(reg) => reg.fmt(f),
        }
    }
}

/// How an instruction word affects the debugger's call-depth counter.
///
/// This classification is purely for run control (step-out/step-over); it is
/// not architectural state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FlowClass {
    /// Subroutine call or trap: entering a new frame.
    Call,
    /// Subroutine or interrupt return: leaving a frame.
    Return,
    /// Everything else.
    Other,
}

/// An ISA-level exception.
///
/// These are never fatal: the engine redirects through the exception vector
/// table, exactly like the hardware would.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Exception {
    /// A privileged instruction was executed in user mode.
    PrivilegeViolation,
    /// A reserved opcode was decoded.
    IllegalOpcode,
}
impl Exception {
    /// The exception's vector code (offset into the exception table).
    pub fn vector(self) -> u8 {
        match self {
            Exception::PrivilegeViolation => 0x00,
            Exception::IllegalOpcode => 0x01,
        }
    }
}

/// Which instruction set a simulator instance decodes and executes.
///
/// The two ISAs share the register/memory/PSW model and the trap/exception
/// stack-switch machinery, but nothing per-instruction, so the variant is a
/// policy selected per instance rather than an override of the other.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum IsaKind {
    /// The primary ISA: top-4-bit opcodes, NZP condition flags.
    #[default]
    Lc,
    /// The variant ISA: format-table encoding, NZP plus Carry/Overflow.
    Tm,
}

impl IsaKind {
    /// Classifies an instruction word for call-depth tracking.
    pub fn flow_class(self, word: u16) -> FlowClass {
        match self {
            IsaKind::Lc => lc::flow_class(word),
            IsaKind::Tm => tm::flow_class(word),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::reg_consts::*;
    use super::*;

    #[test]
    fn reg_fields_sit_at_fixed_slots() {
        // dst = 5, src1 = 3, src2 = 6
        let word = 0b0001_101_011_000_110;
        assert_eq!(reg_field(word, RegSlot::Dst), R5);
        assert_eq!(reg_field(word, RegSlot::Src1), R3);
        assert_eq!(reg_field(word, RegSlot::Src2), R6);
    }

    #[test]
    fn simm_round_trips_every_value_in_range() {
        for width in [5u32, 6, 9, 11, 13] {
            let lo = -(1i32 << (width - 1));
            let hi = (1i32 << (width - 1)) - 1;
            for v in lo..=hi {
                let mask = ((1u32 << width) - 1) as u16;
                let encoded = (v as u16) & mask;
                assert_eq!(
                    simm(encoded, width),
                    v as i16,
                    "width {width} value {v}"
                );
            }
        }
    }

    #[test]
    fn uimm_zero_extends() {
        assert_eq!(uimm(0xFFFF, 8), 0x00FF);
        assert_eq!(uimm(0xFFFF, 16), 0xFFFF);
        assert_eq!(uimm(0x0025, 8), 0x25);
    }

    #[test]
    fn reg_try_from_rejects_out_of_range() {
        assert!(Reg::try_from(7).is_ok());
        assert!(Reg::try_from(8).is_err());
    }
}
