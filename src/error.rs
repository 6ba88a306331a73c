use crate::address::LongAddress;
use crate::protocol::Command;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("no response from remote for {0}")]
    ProtocolTimeout(Command),
    #[error("response sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("transport stalled inside a partial frame")]
    ChunkTimeout,

    // --------------------------------- command errors --------------------------------------------
    #[error("command {0} is not supported by this remote")]
    UnsupportedCommand(Command),
    #[error("unexpected payload for {0} response")]
    UnexpectedResponse(Command),
    #[error("remote rejected breakpoint at {0}")]
    BreakpointRejected(LongAddress),
    #[error("remote rejected watchpoint at {0:#06X}")]
    WatchpointRejected(u16),

    // --------------------------------- breakpoint condition errors -------------------------------
    #[error("condition evaluation: {0}")]
    ConditionEvaluation(#[source] anyhow::Error),

    // --------------------------------- history errors --------------------------------------------
    #[error("instruction history exhausted")]
    HistoryExhausted,
    #[error("not replaying instruction history")]
    NotReplaying,

    // --------------------------------- session errors --------------------------------------------
    #[error("remote is already running")]
    AlreadyRunning,
    #[error("unknown register {0}")]
    RegisterNameNotFound(String),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or drop the session.
    /// Protocol framing errors are fatal: once a frame boundary or a sequence number can no
    /// longer be trusted, every later response would be attributed to the wrong command.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::ConnectionClosed => true,
            Error::SequenceMismatch { .. } => true,
            Error::MalformedFrame(_) => true,
            Error::ChunkTimeout => true,

            Error::ProtocolTimeout(_) => false,
            Error::UnsupportedCommand(_) => false,
            Error::UnexpectedResponse(_) => false,
            Error::BreakpointRejected(_) => false,
            Error::WatchpointRejected(_) => false,
            Error::ConditionEvaluation(_) => false,
            Error::HistoryExhausted => false,
            Error::NotReplaying => false,
            Error::AlreadyRunning => false,
            Error::RegisterNameNotFound(_) => false,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
