//! The primary instruction set: 4-bit opcodes in bits 15:12.
//!
//! Every word decodes to exactly one instruction (or the reserved opcode,
//! which raises an illegal-opcode exception when executed). Operand fields
//! are taken from their fixed bit positions and any remaining bits are
//! ignored, so decoding is total and never fails.
//!
//! Opcode map:
//!
//! | Opcode | Instruction | Opcode | Instruction |
//! |--------|-------------|--------|-------------|
//! | `0x0`  | `BR`        | `0x8`  | `RTI`       |
//! | `0x1`  | `ADD`       | `0x9`  | `NOT`       |
//! | `0x2`  | `LD`        | `0xA`  | `LDI`       |
//! | `0x3`  | `ST`        | `0xB`  | `STI`       |
//! | `0x4`  | `JSR/JSRR`  | `0xC`  | `JMP/RET`   |
//! | `0x5`  | `AND`       | `0xD`  | *reserved*  |
//! | `0x6`  | `LDR`       | `0xE`  | `LEA`       |
//! | `0x7`  | `STR`       | `0xF`  | `TRAP`      |

use super::{reg_field, simm, uimm, Exception, FlowClass, ImmOrReg, Reg, RegSlot};
use crate::sim::Simulator;

/// An instruction of the primary ISA.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Instr {
    /// Conditional branch (opcode `0x0`).
    ///
    /// Adds the offset to the PC if the current condition code matches any
    /// of the flags in bits 11:9. `BR` with all flags clear is a no-op.
    Br(u8, i16),
    /// Addition (opcode `0x1`). Sets condition codes.
    Add(Reg, Reg, ImmOrReg),
    /// PC-relative load (opcode `0x2`). Sets condition codes.
    Ld(Reg, i16),
    /// PC-relative store (opcode `0x3`).
    St(Reg, i16),
    /// Subroutine call, PC-relative (opcode `0x4`, bit 11 set). Links R7.
    Jsr(i16),
    /// Subroutine call, register-indirect (opcode `0x4`, bit 11 clear).
    Jsrr(Reg),
    /// Bitwise AND (opcode `0x5`). Sets condition codes.
    And(Reg, Reg, ImmOrReg),
    /// Base+offset load (opcode `0x6`). Sets condition codes.
    Ldr(Reg, Reg, i16),
    /// Base+offset store (opcode `0x7`).
    Str(Reg, Reg, i16),
    /// Return from trap or interrupt (opcode `0x8`). Privileged.
    Rti,
    /// Bitwise complement (opcode `0x9`). Sets condition codes.
    Not(Reg, Reg),
    /// Indirect load (opcode `0xA`). Sets condition codes.
    Ldi(Reg, i16),
    /// Indirect store (opcode `0xB`).
    Sti(Reg, i16),
    /// Register jump (opcode `0xC`). `JMP R7` is the conventional `RET`.
    Jmp(Reg),
    /// The reserved opcode (opcode `0xD`).
    Reserved,
    /// Load effective address (opcode `0xE`). Does *not* set condition codes.
    Lea(Reg, i16),
    /// Trap call (opcode `0xF`). Switches to the supervisor stack.
    Trap(u8),
}

/// Decodes an instruction word. Total: every word maps to an instruction.
pub fn decode(word: u16) -> Instr {
    let dr = reg_field(word, RegSlot::Dst);
    let sr1 = reg_field(word, RegSlot::Src1);
    match word >> 12 {
        0x0 => Instr::Br(((word >> 9) & 0b111) as u8, simm(word, 9)),
        0x1 => Instr::Add(dr, sr1, imm_or_reg(word)),
        0x2 => Instr::Ld(dr, simm(word, 9)),
        0x3 => Instr::St(dr, simm(word, 9)),
        0x4 => match word & 0x0800 != 0 {
            true => Instr::Jsr(simm(word, 11)),
            false => Instr::Jsrr(sr1),
        },
        0x5 => Instr::And(dr, sr1, imm_or_reg(word)),
        0x6 => Instr::Ldr(dr, sr1, simm(word, 6)),
        0x7 => Instr::Str(dr, sr1, simm(word, 6)),
        0x8 => Instr::Rti,
        0x9 => Instr::Not(dr, sr1),
        0xA => Instr::Ldi(dr, simm(word, 9)),
        0xB => Instr::Sti(dr, simm(word, 9)),
        0xC => Instr::Jmp(sr1),
        0xD => Instr::Reserved,
        0xE => Instr::Lea(dr, simm(word, 9)),
        _ => Instr::Trap(uimm(word, 8) as u8),
    }
}

/// The second ALU operand: bit 5 selects imm5 over a register.
fn imm_or_reg(word: u16) -> ImmOrReg {
    match word & 0x0020 != 0 {
        true => ImmOrReg::Imm(simm(word, 5)),
        false => ImmOrReg::Reg(reg_field(word, RegSlot::Src2)),
    }
}

/// Classifies a word for the debugger's call-depth tracking.
pub fn flow_class(word: u16) -> FlowClass {
    match decode(word) {
        Instr::Jsr(_) | Instr::Jsrr(_) | Instr::Trap(_) => FlowClass::Call,
        Instr::Rti => FlowClass::Return,
        Instr::Jmp(r) if r.reg_no() == 7 => FlowClass::Return,
        _ => FlowClass::Other,
    }
}

/// Executes one instruction word against the simulator.
///
/// The PC has already been incremented past this word, so all PC-relative
/// arithmetic uses the incremented value.
pub fn execute(sim: &mut Simulator, word: u16) -> Result<(), Exception> {
    match decode(word) {
        Instr::Br(cc, off) => {
            if cc & sim.psw().cc() != 0 {
                sim.offset_pc(off);
            }
        }
        Instr::Add(dr, sr1, operand) => {
            let a = sim.reg(sr1);
            let b = sim.operand_value(operand);
            sim.set_reg_cc(dr, a.wrapping_add(b));
        }
        Instr::Ld(dr, off) => {
            let val = sim.read_mem(sim.pc().wrapping_add_signed(off));
            sim.set_reg_cc(dr, val);
        }
        Instr::St(sr, off) => {
            sim.write_mem(sim.pc().wrapping_add_signed(off), sim.reg(sr));
        }
        Instr::Jsr(off) => {
            sim.link_r7();
            sim.offset_pc(off);
        }
        Instr::Jsrr(base) => {
            let addr = sim.reg(base);
            sim.link_r7();
            sim.set_pc(addr);
        }
        Instr::And(dr, sr1, operand) => {
            let a = sim.reg(sr1);
            let b = sim.operand_value(operand);
            sim.set_reg_cc(dr, a & b);
        }
        Instr::Ldr(dr, base, off) => {
            let val = sim.read_mem(sim.reg(base).wrapping_add_signed(off));
            sim.set_reg_cc(dr, val);
        }
        Instr::Str(sr, base, off) => {
            sim.write_mem(sim.reg(base).wrapping_add_signed(off), sim.reg(sr));
        }
        Instr::Rti => sim.rti()?,
        Instr::Not(dr, sr) => {
            let val = !sim.reg(sr);
            sim.set_reg_cc(dr, val);
        }
        Instr::Ldi(dr, off) => {
            let ptr = sim.read_mem(sim.pc().wrapping_add_signed(off));
            let val = sim.read_mem(ptr);
            sim.set_reg_cc(dr, val);
        }
        Instr::Sti(sr, off) => {
            let ptr = sim.read_mem(sim.pc().wrapping_add_signed(off));
            sim.write_mem(ptr, sim.reg(sr));
        }
        Instr::Jmp(base) => sim.set_pc(sim.reg(base)),
        Instr::Reserved => return Err(Exception::IllegalOpcode),
        Instr::Lea(dr, off) => {
            // LEA computes an address, not a value: condition codes untouched.
            sim.set_reg(dr, sim.pc().wrapping_add_signed(off));
        }
        Instr::Trap(vect) => sim.trap(vect),
    }
    Ok(())
}
