use crate::error::Error;
use crate::protocol::Command;
use bytes::Buf;
use strum_macros::{Display, EnumString};

/// F-register flag bits.
pub const FLAG_C: u8 = 1 << 0;
pub const FLAG_PV: u8 = 1 << 2;
pub const FLAG_Z: u8 = 1 << 6;
pub const FLAG_S: u8 = 1 << 7;

/// Branch condition of conditional CALL/RET/JP instructions.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum BranchCondition {
    Nz,
    Z,
    Nc,
    C,
    Po,
    Pe,
    P,
    M,
}

impl BranchCondition {
    /// Condition from the `ccc` bits of an opcode (`RET cc` = `0b11_ccc_000`).
    pub fn from_bits(ccc: u8) -> Self {
        match ccc & 0b111 {
            0 => BranchCondition::Nz,
            1 => BranchCondition::Z,
            2 => BranchCondition::Nc,
            3 => BranchCondition::C,
            4 => BranchCondition::Po,
            5 => BranchCondition::Pe,
            6 => BranchCondition::P,
            _ => BranchCondition::M,
        }
    }
}

/// Register file snapshot of a Z80 core.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Z80Registers {
    pub pc: u16,
    pub sp: u16,
    pub af: u16,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
    pub ix: u16,
    pub iy: u16,
    pub af2: u16,
    pub bc2: u16,
    pub de2: u16,
    pub hl2: u16,
    pub i: u8,
    pub r: u8,
    pub im: u8,
}

impl Z80Registers {
    pub fn a(&self) -> u8 {
        (self.af >> 8) as u8
    }

    pub fn f(&self) -> u8 {
        self.af as u8
    }

    /// Evaluate a branch condition against the F register.
    pub fn condition_met(&self, cond: BranchCondition) -> bool {
        let f = self.f();
        match cond {
            BranchCondition::Nz => f & FLAG_Z == 0,
            BranchCondition::Z => f & FLAG_Z != 0,
            BranchCondition::Nc => f & FLAG_C == 0,
            BranchCondition::C => f & FLAG_C != 0,
            BranchCondition::Po => f & FLAG_PV == 0,
            BranchCondition::Pe => f & FLAG_PV != 0,
            BranchCondition::P => f & FLAG_S == 0,
            BranchCondition::M => f & FLAG_S != 0,
        }
    }
}

/// Register block as sent by a remote, decoded once at the protocol boundary.
/// The ZX Next family appends its slot configuration to the standard block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterSnapshot {
    Standard(Z80Registers),
    ZxNext { core: Z80Registers, slots: [u8; 8] },
}

/// Size of the standard register block on the wire.
pub const REGISTER_BLOCK_LEN: usize = 28;

impl RegisterSnapshot {
    pub fn core(&self) -> &Z80Registers {
        match self {
            RegisterSnapshot::Standard(core) => core,
            RegisterSnapshot::ZxNext { core, .. } => core,
        }
    }

    /// Decode a `GetRegisters` response payload:
    /// `PC SP AF BC DE HL IX IY AF' BC' DE' HL'` as little-endian words,
    /// then `I R IM` and one reserved byte; a ZX Next remote appends 8 slot bytes.
    pub fn decode(mut payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < REGISTER_BLOCK_LEN {
            return Err(Error::UnexpectedResponse(Command::GetRegisters));
        }

        let core = Z80Registers {
            pc: payload.get_u16_le(),
            sp: payload.get_u16_le(),
            af: payload.get_u16_le(),
            bc: payload.get_u16_le(),
            de: payload.get_u16_le(),
            hl: payload.get_u16_le(),
            ix: payload.get_u16_le(),
            iy: payload.get_u16_le(),
            af2: payload.get_u16_le(),
            bc2: payload.get_u16_le(),
            de2: payload.get_u16_le(),
            hl2: payload.get_u16_le(),
            i: payload.get_u8(),
            r: payload.get_u8(),
            im: payload.get_u8(),
        };
        payload.advance(1); // reserved

        if payload.len() >= 8 {
            let mut slots = [0u8; 8];
            slots.copy_from_slice(&payload[..8]);
            Ok(RegisterSnapshot::ZxNext { core, slots })
        } else {
            Ok(RegisterSnapshot::Standard(core))
        }
    }

    /// Encode back into the wire layout (used by tests and state restore).
    pub fn encode(&self) -> Vec<u8> {
        let core = self.core();
        let mut out = Vec::with_capacity(REGISTER_BLOCK_LEN + 8);
        for word in [
            core.pc, core.sp, core.af, core.bc, core.de, core.hl, core.ix, core.iy, core.af2,
            core.bc2, core.de2, core.hl2,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&[core.i, core.r, core.im, 0]);
        if let RegisterSnapshot::ZxNext { slots, .. } = self {
            out.extend_from_slice(slots);
        }
        out
    }
}

/// Settable register, with its wire number for the `SetRegister` command.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Register {
    Pc = 0,
    Sp = 1,
    Af = 2,
    Bc = 3,
    De = 4,
    Hl = 5,
    Ix = 6,
    Iy = 7,
    Af2 = 8,
    Bc2 = 9,
    De2 = 10,
    Hl2 = 11,
    I = 12,
    R = 13,
    Im = 14,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs() -> Z80Registers {
        Z80Registers {
            pc: 0x8000,
            sp: 0xFFF0,
            af: 0x12_40, // Z set
            bc: 0x1234,
            de: 0x5678,
            hl: 0x9ABC,
            ix: 0xDEF0,
            iy: 0x0FED,
            af2: 1,
            bc2: 2,
            de2: 3,
            hl2: 4,
            i: 0x3F,
            r: 0x7F,
            im: 1,
        }
    }

    #[test]
    fn snapshot_decode_standard() {
        let snap = RegisterSnapshot::Standard(regs());
        let decoded = RegisterSnapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn snapshot_decode_zx_next() {
        let snap = RegisterSnapshot::ZxNext {
            core: regs(),
            slots: [0xFF, 5, 2, 0, 4, 5, 0, 1],
        };
        let decoded = RegisterSnapshot::decode(&snap.encode()).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn snapshot_decode_short_block() {
        assert!(matches!(
            RegisterSnapshot::decode(&[0; 27]),
            Err(Error::UnexpectedResponse(Command::GetRegisters))
        ));
    }

    #[test]
    fn branch_conditions_against_flags() {
        let mut r = regs();
        r.af = 0x0000;
        assert!(r.condition_met(BranchCondition::Nz));
        assert!(r.condition_met(BranchCondition::Nc));
        assert!(r.condition_met(BranchCondition::Po));
        assert!(r.condition_met(BranchCondition::P));

        r.af = (FLAG_Z | FLAG_C | FLAG_PV | FLAG_S) as u16;
        assert!(r.condition_met(BranchCondition::Z));
        assert!(r.condition_met(BranchCondition::C));
        assert!(r.condition_met(BranchCondition::Pe));
        assert!(r.condition_met(BranchCondition::M));
    }
}
