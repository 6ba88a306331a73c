//! Classification of the stack-relevant Z80 opcode subset. Deliberately not
//! a disassembler: the reconstructor only needs to know how an instruction
//! moves SP and whether it transfers control through the stack.

use crate::registers::{BranchCondition, Z80Registers};

/// 16-bit register pair addressable by PUSH/POP.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegPair {
    Bc,
    De,
    Hl,
    Af,
    Ix,
    Iy,
}

impl RegPair {
    pub fn value(self, regs: &Z80Registers) -> u16 {
        match self {
            RegPair::Bc => regs.bc,
            RegPair::De => regs.de,
            RegPair::Hl => regs.hl,
            RegPair::Af => regs.af,
            RegPair::Ix => regs.ix,
            RegPair::Iy => regs.iy,
        }
    }
}

/// Stack effect of one instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StackOp {
    Call {
        target: u16,
        cond: Option<BranchCondition>,
    },
    Rst {
        vector: u8,
    },
    Ret {
        cond: Option<BranchCondition>,
    },
    /// RETI/RETN (including the undocumented ED mirrors).
    RetFromIsr,
    Push(RegPair),
    Pop(RegPair),
    LdSpImm(u16),
    /// `LD SP,(nnnn)` - the only instruction whose SP effect is unknowable
    /// without a memory snapshot.
    LdSpInd,
    LdSpReg(RegPair),
    IncSp,
    DecSp,
    Other,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Decoded {
    pub op: StackOp,
    /// Instruction length in bytes, 0 when the opcode is outside the subset.
    pub len: u8,
}

fn decoded(op: StackOp, len: u8) -> Decoded {
    Decoded { op, len }
}

/// Classify the instruction starting at `opcode[0]`.
pub fn classify(opcode: &[u8; 4]) -> Decoded {
    let b0 = opcode[0];
    let imm16 = u16::from_le_bytes([opcode[1], opcode[2]]);

    match b0 {
        0xCD => {
            return decoded(
                StackOp::Call {
                    target: imm16,
                    cond: None,
                },
                3,
            )
        }
        0xC9 => return decoded(StackOp::Ret { cond: None }, 1),
        0x31 => return decoded(StackOp::LdSpImm(imm16), 3),
        0xF9 => return decoded(StackOp::LdSpReg(RegPair::Hl), 1),
        0x33 => return decoded(StackOp::IncSp, 1),
        0x3B => return decoded(StackOp::DecSp, 1),
        0xC5 => return decoded(StackOp::Push(RegPair::Bc), 1),
        0xD5 => return decoded(StackOp::Push(RegPair::De), 1),
        0xE5 => return decoded(StackOp::Push(RegPair::Hl), 1),
        0xF5 => return decoded(StackOp::Push(RegPair::Af), 1),
        0xC1 => return decoded(StackOp::Pop(RegPair::Bc), 1),
        0xD1 => return decoded(StackOp::Pop(RegPair::De), 1),
        0xE1 => return decoded(StackOp::Pop(RegPair::Hl), 1),
        0xF1 => return decoded(StackOp::Pop(RegPair::Af), 1),
        0xED => {
            let b1 = opcode[1];
            // RETN (ED 45), RETI (ED 4D) and their undocumented mirrors all
            // match 01xx_x101
            if b1 & 0xC7 == 0x45 {
                return decoded(StackOp::RetFromIsr, 2);
            }
            if b1 == 0x7B {
                return decoded(StackOp::LdSpInd, 4);
            }
            return decoded(StackOp::Other, 0);
        }
        0xDD | 0xFD => {
            let pair = if b0 == 0xDD { RegPair::Ix } else { RegPair::Iy };
            return match opcode[1] {
                0xE5 => decoded(StackOp::Push(pair), 2),
                0xE1 => decoded(StackOp::Pop(pair), 2),
                0xF9 => decoded(StackOp::LdSpReg(pair), 2),
                _ => decoded(StackOp::Other, 0),
            };
        }
        _ => {}
    }

    if b0 & 0xC7 == 0xC4 {
        return decoded(
            StackOp::Call {
                target: imm16,
                cond: Some(BranchCondition::from_bits(b0 >> 3)),
            },
            3,
        );
    }
    if b0 & 0xC7 == 0xC0 {
        return decoded(
            StackOp::Ret {
                cond: Some(BranchCondition::from_bits(b0 >> 3)),
            },
            1,
        );
    }
    if b0 & 0xC7 == 0xC7 {
        return decoded(StackOp::Rst { vector: b0 & 0x38 }, 1);
    }

    decoded(StackOp::Other, 0)
}

/// Was the control transfer actually taken, judged by the flags at the
/// instruction?
pub fn taken(cond: Option<BranchCondition>, regs: &Z80Registers) -> bool {
    cond.map(|c| regs.condition_met(c)).unwrap_or(true)
}

/// Classify the three bytes immediately below a return address: did a
/// CALL/CALL cc (3 bytes) or an RST (1 byte) put it on the stack?
/// Returns the call target. `None` means the caller is unrecoverable -
/// an interrupt, self-modifying code or a corrupted trace.
pub fn classify_caller(below_ret: &[u8; 3]) -> Option<u16> {
    let b = below_ret[0];
    if b == 0xCD || b & 0xC7 == 0xC4 {
        return Some(u16::from_le_bytes([below_ret[1], below_ret[2]]));
    }
    let last = below_ret[2];
    if last & 0xC7 == 0xC7 {
        return Some((last & 0x38) as u16);
    }
    None
}
