//! DZRP-style wire protocol: command code space, break reasons and the
//! notification model. Framing lives in [`codec`], request/response
//! correlation in [`dispatcher`].

pub mod codec;
pub mod dispatcher;

use crate::error::Error;
use bytes::Buf;
use strum_macros::{Display, FromRepr};

/// Command code space. Flat enumeration shared by all remote families;
/// a given remote advertises the subset it implements in its [`Capabilities`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum Command {
    Init = 1,
    Close = 2,
    GetRegisters = 3,
    SetRegister = 4,
    WriteBank = 5,
    Continue = 6,
    Pause = 7,
    ReadMem = 8,
    WriteMem = 9,
    SetSlot = 10,
    GetTbblueReg = 11,
    SetBorder = 12,
    RestoreMem = 14,
    Loopback = 15,
    GetSpritesPalette = 16,
    GetSpritesClip = 17,
    GetSprites = 18,
    GetSpritePatterns = 19,
    ReadState = 21,
    WriteState = 22,
    ReadPort = 23,
    WritePort = 24,
    ExecAsm = 25,
    InterruptOnOff = 26,
    AddBreakpoint = 40,
    RemoveBreakpoint = 41,
    AddWatchpoint = 42,
    RemoveWatchpoint = 43,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Capability mask negotiated by `Init`. Commands outside the advertised
/// capabilities fail fast with [`Error::UnsupportedCommand`], they are never
/// transmitted.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const BREAKPOINTS: u32 = 1 << 0;
    pub const WATCHPOINTS: u32 = 1 << 1;
    pub const STATE: u32 = 1 << 2;
    pub const PORTS: u32 = 1 << 3;
    pub const EXEC_ASM: u32 = 1 << 4;
    pub const INTERRUPT_CTL: u32 = 1 << 5;
    pub const BANKS: u32 = 1 << 6;
    pub const SPRITES: u32 = 1 << 7;

    pub const CORE: u32 = Self::BREAKPOINTS;

    pub fn all() -> Self {
        Capabilities(u32::MAX)
    }

    pub fn supports(&self, cmd: Command) -> bool {
        let required = match cmd {
            Command::Init
            | Command::Close
            | Command::GetRegisters
            | Command::SetRegister
            | Command::Continue
            | Command::Pause
            | Command::ReadMem
            | Command::WriteMem
            | Command::RestoreMem
            | Command::Loopback => return true,
            Command::AddBreakpoint | Command::RemoveBreakpoint => Self::BREAKPOINTS,
            Command::AddWatchpoint | Command::RemoveWatchpoint => Self::WATCHPOINTS,
            Command::ReadState | Command::WriteState => Self::STATE,
            Command::ReadPort | Command::WritePort => Self::PORTS,
            Command::ExecAsm => Self::EXEC_ASM,
            Command::InterruptOnOff => Self::INTERRUPT_CTL,
            Command::WriteBank | Command::SetSlot => Self::BANKS,
            Command::GetTbblueReg
            | Command::SetBorder
            | Command::GetSpritesPalette
            | Command::GetSpritesClip
            | Command::GetSprites
            | Command::GetSpritePatterns => Self::SPRITES,
        };
        self.0 & required != 0
    }
}

/// Remote machine family reported by `Init`. Drives snapshot decoding and
/// the default capability mask.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum RemoteFamily {
    Unknown = 0,
    Zx16 = 1,
    Zx48 = 2,
    Zx128 = 3,
    ZxNext = 4,
}

impl RemoteFamily {
    /// Capabilities a family is known to implement. The vendor commands
    /// (sprites, TBBlue registers, banking) exist only on the ZX Next.
    pub fn capabilities(self) -> Capabilities {
        match self {
            RemoteFamily::Unknown => Capabilities(Capabilities::CORE),
            RemoteFamily::Zx16 | RemoteFamily::Zx48 => Capabilities(
                Capabilities::BREAKPOINTS
                    | Capabilities::WATCHPOINTS
                    | Capabilities::STATE
                    | Capabilities::PORTS
                    | Capabilities::EXEC_ASM
                    | Capabilities::INTERRUPT_CTL,
            ),
            RemoteFamily::Zx128 => Capabilities(
                Capabilities::BREAKPOINTS
                    | Capabilities::WATCHPOINTS
                    | Capabilities::STATE
                    | Capabilities::PORTS
                    | Capabilities::EXEC_ASM
                    | Capabilities::INTERRUPT_CTL
                    | Capabilities::BANKS,
            ),
            RemoteFamily::ZxNext => Capabilities::all(),
        }
    }
}

/// Break reason code carried by a stop notification.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum BreakCode {
    None = 0,
    Manual = 1,
    Breakpoint = 2,
    WatchRead = 3,
    WatchWrite = 4,
    Interrupt = 5,
    Assertion = 6,
    Other = 255,
}

/// Asynchronous stop notification (inbound frame with sequence number 0):
/// `u8 reason | u16_LE address | zero-or-more reason-string bytes`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StopNotification {
    pub reason: BreakCode,
    pub address: u16,
    pub text: String,
}

impl StopNotification {
    pub fn parse(mut payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 3 {
            return Err(Error::MalformedFrame("stop notification too short"));
        }
        let reason_raw = payload.get_u8();
        let reason =
            BreakCode::from_repr(reason_raw).ok_or(Error::MalformedFrame("unknown break reason"))?;
        let address = payload.get_u16_le();
        let text = String::from_utf8_lossy(payload).into_owned();
        Ok(StopNotification {
            reason,
            address,
            text,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.text.len());
        out.push(self.reason as u8);
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(self.text.as_bytes());
        out
    }
}
