//! The variant instruction set: a 3-bit format field in bits 15:13.
//!
//! Structurally unlike the primary ISA: register-register ALU operations
//! carry a function code in bits 5:3 instead of burning an opcode each, the
//! branch offset is 10 bits, the call instruction (`JAL`) takes a 13-bit
//! offset, and the arithmetic instructions maintain Carry and Overflow flags
//! alongside NZP.
//!
//! Format map (bits 15:13):
//!
//! | Format | Instruction                           |
//! |--------|---------------------------------------|
//! | `000`  | R-format ALU (funct in bits 5:3)      |
//! | `001`  | `ADDI rd, rs, #simm6`                 |
//! | `010`  | `LDW rd, rs, #simm6`                  |
//! | `011`  | `STW src, base, #simm6`               |
//! | `100`  | `BR nzp, #simm10`                     |
//! | `101`  | `JAL #simm13` (links R7)              |
//! | `110`  | bit 12 clear: `JALR rs`, set: `JMP rs`|
//! | `111`  | bit 12 clear: `RTI`, set: `TRAP v8`   |

use super::{reg_field, simm, uimm, Exception, FlowClass, Reg, RegSlot};
use crate::sim::Simulator;

/// An R-format ALU function code (bits 5:3).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AluOp {
    /// Function `0`. Sets NZP, Carry, and Overflow.
    Add,
    /// Function `1`. Sets NZP, Carry, and Overflow.
    Sub,
    /// Function `2`. Sets NZP only.
    And,
    /// Function `3`. Sets NZP only.
    Or,
    /// Function `4`. Sets NZP only.
    Xor,
    /// Function `5`. Unary (ignores `rt`). Sets NZP only.
    Not,
}

/// An instruction of the variant ISA.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Instr {
    /// Register-register ALU operation (format `000`).
    Alu(AluOp, Reg, Reg, Reg),
    /// Add immediate (format `001`). Sets NZP, Carry, and Overflow.
    Addi(Reg, Reg, i16),
    /// Base+offset load (format `010`). Sets NZP.
    Ldw(Reg, Reg, i16),
    /// Base+offset store (format `011`).
    Stw(Reg, Reg, i16),
    /// Conditional branch (format `100`), flags in bits 12:10.
    Br(u8, i16),
    /// PC-relative call (format `101`). Links R7.
    Jal(i16),
    /// Register-indirect call (format `110`, bit 12 clear). Links R7.
    Jalr(Reg),
    /// Register jump (format `110`, bit 12 set). `JMP R7` is the return idiom.
    Jmp(Reg),
    /// Return from trap or interrupt (format `111`, bit 12 clear). Privileged.
    Rti,
    /// Trap call (format `111`, bit 12 set).
    Trap(u8),
    /// An undefined R-format function code.
    Reserved,
}

/// Decodes an instruction word. Total: every word maps to an instruction.
pub fn decode(word: u16) -> Instr {
    let rd = reg_field(word, RegSlot::Dst);
    let rs = reg_field(word, RegSlot::Src1);
    let rt = reg_field(word, RegSlot::Src2);
    match word >> 13 {
        0b000 => {
            let op = match (word >> 3) & 0b111 {
                0 => AluOp::Add,
                1 => AluOp::Sub,
                2 => AluOp::And,
                3 => AluOp::Or,
                4 => AluOp::Xor,
                5 => AluOp::Not,
                _ => return Instr::Reserved,
            };
            Instr::Alu(op, rd, rs, rt)
        }
        0b001 => Instr::Addi(rd, rs, simm(word, 6)),
        0b010 => Instr::Ldw(rd, rs, simm(word, 6)),
        0b011 => Instr::Stw(rd, rs, simm(word, 6)),
        0b100 => Instr::Br(((word >> 10) & 0b111) as u8, simm(word, 10)),
        0b101 => Instr::Jal(simm(word, 13)),
        0b110 => match word & 0x1000 != 0 {
            false => Instr::Jalr(rs),
            true => Instr::Jmp(rs),
        },
        _ => match word & 0x1000 != 0 {
            false => Instr::Rti,
            true => Instr::Trap(uimm(word, 8) as u8),
        },
    }
}

/// Classifies a word for the debugger's call-depth tracking.
pub fn flow_class(word: u16) -> FlowClass {
    match decode(word) {
        Instr::Jal(_) | Instr::Jalr(_) | Instr::Trap(_) => FlowClass::Call,
        Instr::Rti => FlowClass::Return,
        Instr::Jmp(r) if r.reg_no() == 7 => FlowClass::Return,
        _ => FlowClass::Other,
    }
}

/// Executes one instruction word against the simulator.
pub fn execute(sim: &mut Simulator, word: u16) -> Result<(), Exception> {
    match decode(word) {
        Instr::Alu(op, rd, rs, rt) => {
            let a = sim.reg(rs);
            let b = sim.reg(rt);
            match op {
                AluOp::Add => add_with_flags(sim, rd, a, b, 0),
                // Two's complement subtraction: a + !b + 1, so borrow shows
                // up as a clear carry.
                AluOp::Sub => add_with_flags(sim, rd, a, !b, 1),
                AluOp::And => sim.set_reg_cc(rd, a & b),
                AluOp::Or => sim.set_reg_cc(rd, a | b),
                AluOp::Xor => sim.set_reg_cc(rd, a ^ b),
                AluOp::Not => sim.set_reg_cc(rd, !a),
            }
        }
        Instr::Addi(rd, rs, imm) => {
            let a = sim.reg(rs);
            add_with_flags(sim, rd, a, imm as u16, 0);
        }
        Instr::Ldw(rd, base, off) => {
            let val = sim.read_mem(sim.reg(base).wrapping_add_signed(off));
            sim.set_reg_cc(rd, val);
        }
        Instr::Stw(src, base, off) => {
            sim.write_mem(sim.reg(base).wrapping_add_signed(off), sim.reg(src));
        }
        Instr::Br(cc, off) => {
            if cc & sim.psw().cc() != 0 {
                sim.offset_pc(off);
            }
        }
        Instr::Jal(off) => {
            sim.link_r7();
            sim.offset_pc(off);
        }
        Instr::Jalr(base) => {
            let addr = sim.reg(base);
            sim.link_r7();
            sim.set_pc(addr);
        }
        Instr::Jmp(base) => sim.set_pc(sim.reg(base)),
        Instr::Rti => sim.rti()?,
        Instr::Trap(vect) => sim.trap(vect),
        Instr::Reserved => return Err(Exception::IllegalOpcode),
    }
    Ok(())
}

/// Performs `a + b + cin`, writes the result with NZP, and updates the
/// Carry and Overflow flags.
fn add_with_flags(sim: &mut Simulator, rd: Reg, a: u16, b: u16, cin: u32) {
    let wide = u32::from(a) + u32::from(b) + cin;
    let result = wide as u16;
    let carry = wide > 0xFFFF;
    // Signed overflow: operands agree in sign, result disagrees.
    let overflow = (a ^ result) & (b ^ result) & 0x8000 != 0;
    sim.set_reg_cc(rd, result);
    sim.set_carry_overflow(carry, overflow);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::isa::reg_consts::*;

    #[test]
    fn decode_r_format() {
        // ADD R1, R2, R3
        assert_eq!(decode(0x0283), Instr::Alu(AluOp::Add, R1, R2, R3));
        // SUB R1, R2, R3
        assert_eq!(decode(0x028B), Instr::Alu(AluOp::Sub, R1, R2, R3));
        // NOT R4, R5 (rt ignored)
        assert_eq!(decode(0x096A), Instr::Alu(AluOp::Not, R4, R5, R2));
        // Function codes 6 and 7 are undefined.
        assert_eq!(decode(0x0030), Instr::Reserved);
        assert_eq!(decode(0x0038), Instr::Reserved);
    }

    #[test]
    fn decode_immediate_and_memory_formats() {
        // ADDI R1, R1, #-1
        assert_eq!(decode(0x227F), Instr::Addi(R1, R1, -1));
        // LDW R2, R3, #4
        assert_eq!(decode(0x44C4), Instr::Ldw(R2, R3, 4));
        // STW R2, R3, #4
        assert_eq!(decode(0x64C4), Instr::Stw(R2, R3, 4));
    }

    #[test]
    fn decode_control_flow_formats() {
        // BR nzp, #-1
        assert_eq!(decode(0x9FFF), Instr::Br(0b111, -1));
        // JAL #5
        assert_eq!(decode(0xA005), Instr::Jal(5));
        // JALR R3
        assert_eq!(decode(0xC0C0), Instr::Jalr(R3));
        // JMP R7
        assert_eq!(decode(0xD1C0), Instr::Jmp(R7));
        assert_eq!(decode(0xE000), Instr::Rti);
        assert_eq!(decode(0xF022), Instr::Trap(0x22));
    }

    #[test]
    fn flow_classification() {
        assert_eq!(flow_class(0xA005), FlowClass::Call); // JAL
        assert_eq!(flow_class(0xC0C0), FlowClass::Call); // JALR
        assert_eq!(flow_class(0xF022), FlowClass::Call); // TRAP
        assert_eq!(flow_class(0xE000), FlowClass::Return); // RTI
        assert_eq!(flow_class(0xD1C0), FlowClass::Return); // JMP R7
        assert_eq!(flow_class(0xD040), FlowClass::Other); // JMP R1
    }
}
