//! Remote-control core of a Z80 machine-code debugger: a DZRP-style wire
//! protocol client plus an instruction-history engine that reconstructs a
//! virtual call stack from an execution trace for reverse debugging.

pub mod address;
pub mod error;
pub mod history;
pub mod oracle;
pub mod protocol;
pub mod registers;
pub mod session;

pub use address::{Address, LongAddress};
pub use error::Error;
pub use session::step::{StopOutcome, StopReason};
pub use session::{RemoteSession, SessionBuilder, SessionConfig, SessionControl};
