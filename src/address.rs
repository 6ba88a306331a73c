use std::fmt::{Display, Formatter};

/// Plain address in the 64K Z80 address space.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct Address(u16);

impl Address {
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl From<u16> for Address {
    fn from(addr: u16) -> Self {
        Address(addr)
    }
}

impl From<Address> for u16 {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#06X}", self.0))
    }
}

/// Address qualified with a memory-bank number ("long address").
/// Distinguishes aliased addresses across paged memory: two breakpoints at
/// the same 16-bit address but different banks are different breakpoints.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct LongAddress {
    pub addr: Address,
    /// `None` for an unbanked (plain) address.
    pub bank: Option<u8>,
}

impl LongAddress {
    pub fn plain(addr: u16) -> Self {
        LongAddress {
            addr: addr.into(),
            bank: None,
        }
    }

    pub fn banked(addr: u16, bank: u8) -> Self {
        LongAddress {
            addr: addr.into(),
            bank: Some(bank),
        }
    }

    /// True if a stop at plain `addr` may belong to this address.
    /// A banked address still matches: whether the right bank is paged in
    /// cannot be decided from the 16-bit stop address alone.
    pub fn matches(&self, addr: u16) -> bool {
        self.addr.as_u16() == addr
    }

    /// Wire form: `u16_LE addr | u8 bank`, where bank byte 0 means unbanked
    /// and a banked address is encoded as bank + 1.
    pub fn encode(&self, out: &mut impl bytes::BufMut) {
        out.put_u16_le(self.addr.as_u16());
        out.put_u8(self.bank.map(|b| b + 1).unwrap_or(0));
    }

    pub fn decode(addr: u16, bank_byte: u8) -> Self {
        LongAddress {
            addr: addr.into(),
            bank: bank_byte.checked_sub(1),
        }
    }
}

impl From<u16> for LongAddress {
    fn from(addr: u16) -> Self {
        LongAddress::plain(addr)
    }
}

impl Display for LongAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.bank {
            Some(bank) => write!(f, "{}@bank{}", self.addr, bank),
            None => self.addr.fmt(f),
        }
    }
}
