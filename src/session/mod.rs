//! Remote session facade: connection lifecycle, per-command marshaling,
//! breakpoint/watchpoint registries and the live call stack snapshot.
//! The continue/step state machines live in [`step`].

pub mod breakpoint;
pub mod step;

use crate::address::LongAddress;
use crate::error::Error;
use crate::history::callstack::{CallStackFrame, CallStackReconstructor, VirtualCallStack};
use crate::history::opcode;
use crate::history::{HistoryEngine, HistoryEntry};
use crate::oracle::{
    AlwaysBreak, ConditionEvaluator, InstructionOracle, MemorySource, NoSymbols, StackOpOracle,
    SymbolResolver,
};
use crate::protocol::dispatcher::{Dispatcher, DispatcherConfig};
use crate::protocol::{Capabilities, Command, RemoteFamily};
use crate::registers::{Register, RegisterSnapshot, Z80Registers};
use crate::session::breakpoint::{
    BreakpointRegistry, GenericBreakpoint, TemporaryBreakpointIndex, Watchpoint,
};
use crate::session::step::ExecState;
use crate::muted_error;
use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol version announced in `Init`.
pub const PROTOCOL_VERSION: (u8, u8, u8) = (2, 0, 0);

/// Display name of the outermost live frame.
pub const ROOT_FRAME: &str = "__MAIN__";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub dispatcher: DispatcherConfig,
    /// Instruction trace capacity (entries).
    pub history_capacity: usize,
    /// Record the 2 bytes at (SP) with every trace entry. Required for
    /// recovering POPped values during backward replay.
    pub full_history: bool,
    /// Top of the machine stack; bounds the live call stack scan.
    /// `None` disables scanning, the live stack is a single root frame.
    pub stack_top: Option<u16>,
    /// Upper bound, in bytes, on the scanned stack window.
    pub max_stack_scan: u16,
    /// Name sent to the remote in `Init`.
    pub client_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            dispatcher: DispatcherConfig::default(),
            history_capacity: 4096,
            full_history: true,
            stack_top: None,
            max_stack_scan: 256,
            client_name: "z80probe".into(),
        }
    }
}

/// What the remote reported in its `Init` response.
#[derive(Clone, Debug)]
pub struct InitInfo {
    pub version: (u8, u8, u8),
    pub family: RemoteFamily,
    pub program: String,
}

impl InitInfo {
    fn decode(payload: &[u8]) -> Result<Self, Error> {
        // u8 error | u8 major | u8 minor | u8 patch | u8 family | program name
        if payload.len() < 5 || payload[0] != 0 {
            return Err(Error::UnexpectedResponse(Command::Init));
        }
        let family = RemoteFamily::from_repr(payload[4]).unwrap_or(RemoteFamily::Unknown);
        Ok(InitInfo {
            version: (payload[1], payload[2], payload[3]),
            family,
            program: String::from_utf8_lossy(&payload[5..]).into_owned(),
        })
    }
}

/// Builds a [`RemoteSession`] with injected collaborators. All of them have
/// degraded-but-working defaults, so the minimal session is
/// `SessionBuilder::new().connect(transport)`.
pub struct SessionBuilder {
    config: SessionConfig,
    oracle: Box<dyn InstructionOracle + Send + Sync>,
    symbols: Box<dyn SymbolResolver + Send + Sync>,
    evaluator: Box<dyn ConditionEvaluator + Send + Sync>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::default(),
            oracle: Box::new(StackOpOracle),
            symbols: Box::new(NoSymbols),
            evaluator: Box::new(AlwaysBreak),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_oracle(mut self, oracle: impl InstructionOracle + Send + Sync + 'static) -> Self {
        self.oracle = Box::new(oracle);
        self
    }

    pub fn with_symbols(mut self, symbols: impl SymbolResolver + Send + Sync + 'static) -> Self {
        self.symbols = Box::new(symbols);
        self
    }

    pub fn with_evaluator(mut self, evaluator: impl ConditionEvaluator + Send + Sync + 'static) -> Self {
        self.evaluator = Box::new(evaluator);
        self
    }

    /// Establish the session: spawn the dispatcher over `transport` and
    /// perform the `Init` handshake.
    pub async fn connect<T>(self, transport: T) -> Result<RemoteSession, Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let dispatcher = Dispatcher::start(transport, self.config.dispatcher);

        let mut payload = BytesMut::with_capacity(3 + self.config.client_name.len());
        payload.put_u8(PROTOCOL_VERSION.0);
        payload.put_u8(PROTOCOL_VERSION.1);
        payload.put_u8(PROTOCOL_VERSION.2);
        payload.put_slice(self.config.client_name.as_bytes());

        let response = dispatcher
            .send(
                Command::Init,
                payload.freeze(),
                self.config.dispatcher.init_timeout,
            )
            .await?;
        let info = InitInfo::decode(&response)?;
        let capabilities = info.family.capabilities();
        log::info!(
            target: "session",
            "connected to {} ({}, protocol {}.{}.{})",
            info.program, info.family, info.version.0, info.version.1, info.version.2
        );

        let control = SessionControl {
            dispatcher: dispatcher.clone(),
            capabilities,
            timeout: self.config.dispatcher.default_timeout,
            state: Arc::new(Mutex::new(ControlState {
                exec: ExecState::Idle,
                breakpoints: BreakpointRegistry::default(),
                watchpoints: IndexMap::new(),
                temp_index: TemporaryBreakpointIndex::default(),
            })),
        };
        let history = HistoryEngine::capped(self.config.history_capacity);
        Ok(RemoteSession {
            dispatcher,
            config: self.config,
            info,
            control,
            history,
            replay: None,
            live_regs: None,
            oracle: self.oracle,
            symbols: self.symbols,
            evaluator: self.evaluator,
        })
    }
}

/// Registries and run state shared between the facade and its control
/// handles. Guarded by a plain mutex, never held across an await.
pub(super) struct ControlState {
    pub exec: ExecState,
    pub breakpoints: BreakpointRegistry,
    pub watchpoints: IndexMap<u16, Watchpoint>,
    pub temp_index: TemporaryBreakpointIndex,
}

/// Cloneable control handle. A continuation borrows the session for as long
/// as the program runs, so breakpoint/watchpoint mutation and pause go
/// through this handle, which stays usable mid-run. Additions and removals
/// patch the live stop-evaluation index in place.
#[derive(Clone)]
pub struct SessionControl {
    dispatcher: Dispatcher,
    capabilities: Capabilities,
    timeout: Duration,
    state: Arc<Mutex<ControlState>>,
}

impl SessionControl {
    pub(super) fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue one command, failing fast when the remote family does not
    /// implement it.
    pub(super) async fn command(&self, command: Command, payload: Bytes) -> Result<Bytes, Error> {
        if !self.capabilities.supports(command) {
            return Err(Error::UnsupportedCommand(command));
        }
        self.dispatcher.send(command, payload, self.timeout).await
    }

    /// Register a breakpoint on the remote. A remote id of 0 means the
    /// remote rejected it (capacity, protected range); the breakpoint is
    /// kept unverified and a warning is raised, debugging continues.
    pub async fn add_breakpoint(&self, mut bp: GenericBreakpoint) -> Result<u16, Error> {
        let mut payload = BytesMut::with_capacity(3);
        bp.address.encode(&mut payload);
        if let Some(condition) = &bp.condition {
            payload.put_slice(condition.as_bytes());
        }
        let response = self.command(Command::AddBreakpoint, payload.freeze()).await?;
        if response.len() < 2 {
            return Err(Error::UnexpectedResponse(Command::AddBreakpoint));
        }
        let remote_id = u16::from_le_bytes([response[0], response[1]]);
        bp.remote_id = remote_id;

        if remote_id == 0 {
            log::warn!(
                target: "session",
                "{}, breakpoint kept unverified",
                Error::BreakpointRejected(bp.address)
            );
        }
        let mut st = self.state();
        if st.exec == ExecState::Running {
            st.temp_index.patch_add(&bp);
        }
        st.breakpoints.add(bp);
        Ok(remote_id)
    }

    pub async fn remove_breakpoint(
        &self,
        address: LongAddress,
        remote_id: u16,
    ) -> Result<(), Error> {
        {
            let mut st = self.state();
            if st.breakpoints.remove(address, remote_id).is_none() {
                log::warn!(target: "session", "no breakpoint {remote_id} at {address}");
                return Ok(());
            }
            if st.exec == ExecState::Running {
                st.temp_index.patch_remove(address, remote_id);
            }
        }
        // unverified breakpoints were never registered remotely
        if remote_id != 0 {
            let mut payload = BytesMut::with_capacity(2);
            payload.put_u16_le(remote_id);
            self.command(Command::RemoveBreakpoint, payload.freeze())
                .await?;
        }
        Ok(())
    }

    pub async fn add_watchpoint(&self, wp: Watchpoint) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(5 + wp.condition.as_deref().map_or(0, str::len));
        payload.put_u16_le(wp.address);
        payload.put_u16_le(wp.size);
        payload.put_u8(wp.access.code());
        if let Some(condition) = &wp.condition {
            payload.put_slice(condition.as_bytes());
        }
        let response = self.command(Command::AddWatchpoint, payload.freeze()).await?;
        if response.first().copied().unwrap_or(0) != 0 {
            return Err(Error::WatchpointRejected(wp.address));
        }
        self.state().watchpoints.insert(wp.address, wp);
        Ok(())
    }

    pub async fn remove_watchpoint(&self, address: u16) -> Result<(), Error> {
        let Some(wp) = self.state().watchpoints.shift_remove(&address) else {
            log::warn!(target: "session", "no watchpoint at {address:#06X}");
            return Ok(());
        };
        let mut payload = BytesMut::with_capacity(5);
        payload.put_u16_le(wp.address);
        payload.put_u16_le(wp.size);
        payload.put_u8(wp.access.code());
        self.command(Command::RemoveWatchpoint, payload.freeze())
            .await?;
        Ok(())
    }

    /// Out-of-band pause. Unblocks a running continuation even while other
    /// commands are queued; the eventual stop arrives as a notification.
    pub fn pause(&self) -> Result<(), Error> {
        self.dispatcher.send_oob(Command::Pause, Bytes::new())
    }
}

/// A connected remote CPU. All operations are sequential; the facade owns
/// the single logical control thread of the session, while registries live
/// behind the [`SessionControl`] handle so they stay reachable mid-run.
pub struct RemoteSession {
    pub(super) dispatcher: Dispatcher,
    pub(super) config: SessionConfig,
    pub(super) info: InitInfo,
    pub(super) control: SessionControl,
    pub(super) history: HistoryEngine,
    pub(super) replay: Option<CallStackReconstructor>,
    /// Register snapshot of the live position, taken when replay starts.
    pub(super) live_regs: Option<Z80Registers>,
    pub(super) oracle: Box<dyn InstructionOracle + Send + Sync>,
    pub(super) symbols: Box<dyn SymbolResolver + Send + Sync>,
    pub(super) evaluator: Box<dyn ConditionEvaluator + Send + Sync>,
}

impl RemoteSession {
    pub fn info(&self) -> &InitInfo {
        &self.info
    }

    pub fn capabilities(&self) -> Capabilities {
        self.control.capabilities
    }

    /// Handle for mutating breakpoints and pausing while this session is
    /// busy with a continuation.
    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Snapshot of the breakpoint registry.
    pub fn breakpoints(&self) -> BreakpointRegistry {
        self.control.state().breakpoints.clone()
    }

    /// Snapshot of the registered watchpoints.
    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        self.control.state().watchpoints.values().cloned().collect()
    }

    pub fn history(&self) -> &HistoryEngine {
        &self.history
    }

    /// Current virtual call stack while replaying history, if any.
    pub fn replay_call_stack(&self) -> Option<&VirtualCallStack> {
        self.replay.as_ref().map(|r| r.stack())
    }

    pub(super) async fn command(&self, command: Command, payload: Bytes) -> Result<Bytes, Error> {
        self.control.command(command, payload).await
    }

    /// Best-effort close. The remote may already be gone; a failed close is
    /// logged, never surfaced.
    pub async fn disconnect(self) {
        muted_error!(
            self.dispatcher
                .send(
                    Command::Close,
                    Bytes::new(),
                    self.config.dispatcher.init_timeout,
                )
                .await,
            "close:"
        );
    }

    // --------------------------------- registers --------------------------------------------

    pub async fn read_registers(&self) -> Result<RegisterSnapshot, Error> {
        let payload = self.command(Command::GetRegisters, Bytes::new()).await?;
        RegisterSnapshot::decode(&payload)
    }

    pub async fn set_register(&self, register: Register, value: u16) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u8(register as u8);
        payload.put_u16_le(value);
        self.command(Command::SetRegister, payload.freeze()).await?;
        Ok(())
    }

    pub async fn set_register_by_name(&self, name: &str, value: u16) -> Result<(), Error> {
        let register = Register::from_str(name)
            .map_err(|_| Error::RegisterNameNotFound(name.to_string()))?;
        self.set_register(register, value).await
    }

    // --------------------------------- memory -----------------------------------------------

    pub async fn read_memory(&self, addr: u16, len: u16) -> Result<Vec<u8>, Error> {
        let mut payload = BytesMut::with_capacity(5);
        payload.put_u8(0); // reserved
        payload.put_u16_le(addr);
        payload.put_u16_le(len);
        let response = self.command(Command::ReadMem, payload.freeze()).await?;
        if response.len() != len as usize {
            return Err(Error::UnexpectedResponse(Command::ReadMem));
        }
        Ok(response.to_vec())
    }

    pub async fn write_memory(&self, addr: u16, data: &[u8]) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(3 + data.len());
        payload.put_u8(0); // reserved
        payload.put_u16_le(addr);
        payload.put_slice(data);
        self.command(Command::WriteMem, payload.freeze()).await?;
        Ok(())
    }

    /// Restore bytes previously patched by the client, one address/value
    /// pair per entry.
    pub async fn restore_memory(&self, patches: &[(u16, u8)]) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(patches.len() * 3);
        for (addr, value) in patches {
            payload.put_u16_le(*addr);
            payload.put_u8(*value);
        }
        self.command(Command::RestoreMem, payload.freeze()).await?;
        Ok(())
    }

    pub async fn write_bank(&self, bank: u8, data: &[u8]) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(1 + data.len());
        payload.put_u8(bank);
        payload.put_slice(data);
        let response = self.command(Command::WriteBank, payload.freeze()).await?;
        if response.first().copied().unwrap_or(0) != 0 {
            return Err(Error::UnexpectedResponse(Command::WriteBank));
        }
        Ok(())
    }

    pub async fn set_slot(&self, slot: u8, bank: u8) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u8(slot);
        payload.put_u8(bank);
        let response = self.command(Command::SetSlot, payload.freeze()).await?;
        if response.first().copied().unwrap_or(0) != 0 {
            return Err(Error::UnexpectedResponse(Command::SetSlot));
        }
        Ok(())
    }

    // --------------------------------- breakpoints ------------------------------------------

    /// See [`SessionControl::add_breakpoint`].
    pub async fn add_breakpoint(&self, bp: GenericBreakpoint) -> Result<u16, Error> {
        self.control.add_breakpoint(bp).await
    }

    pub async fn remove_breakpoint(
        &self,
        address: LongAddress,
        remote_id: u16,
    ) -> Result<(), Error> {
        self.control.remove_breakpoint(address, remote_id).await
    }

    pub async fn add_watchpoint(&self, wp: Watchpoint) -> Result<(), Error> {
        self.control.add_watchpoint(wp).await
    }

    pub async fn remove_watchpoint(&self, address: u16) -> Result<(), Error> {
        self.control.remove_watchpoint(address).await
    }

    // --------------------------------- machine state ----------------------------------------

    /// Fetch the remote-specific full-state blob. Opaque: transported,
    /// never interpreted.
    pub async fn read_state(&self) -> Result<Vec<u8>, Error> {
        Ok(self.command(Command::ReadState, Bytes::new()).await?.to_vec())
    }

    pub async fn write_state(&self, blob: &[u8]) -> Result<(), Error> {
        self.command(Command::WriteState, Bytes::copy_from_slice(blob))
            .await?;
        Ok(())
    }

    pub async fn read_port(&self, port: u16) -> Result<u8, Error> {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16_le(port);
        let response = self.command(Command::ReadPort, payload.freeze()).await?;
        response
            .first()
            .copied()
            .ok_or(Error::UnexpectedResponse(Command::ReadPort))
    }

    pub async fn write_port(&self, port: u16, value: u8) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u16_le(port);
        payload.put_u8(value);
        self.command(Command::WritePort, payload.freeze()).await?;
        Ok(())
    }

    /// Execute an injected machine-code snippet on the remote and return its
    /// raw result block.
    pub async fn exec_asm(&self, code: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(self
            .command(Command::ExecAsm, Bytes::copy_from_slice(code))
            .await?
            .to_vec())
    }

    pub async fn set_interrupts_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.command(
            Command::InterruptOnOff,
            Bytes::copy_from_slice(&[enabled as u8]),
        )
        .await?;
        Ok(())
    }

    /// Echo test. The remote must return the payload unchanged.
    pub async fn loopback(&self, data: &[u8]) -> Result<(), Error> {
        let response = self
            .command(Command::Loopback, Bytes::copy_from_slice(data))
            .await?;
        if response.as_ref() != data {
            return Err(Error::UnexpectedResponse(Command::Loopback));
        }
        Ok(())
    }

    // --------------------------------- vendor commands --------------------------------------

    pub async fn get_tbblue_reg(&self, reg: u8) -> Result<u8, Error> {
        let response = self
            .command(Command::GetTbblueReg, Bytes::copy_from_slice(&[reg]))
            .await?;
        response
            .first()
            .copied()
            .ok_or(Error::UnexpectedResponse(Command::GetTbblueReg))
    }

    pub async fn set_border(&self, color: u8) -> Result<(), Error> {
        self.command(Command::SetBorder, Bytes::copy_from_slice(&[color]))
            .await?;
        Ok(())
    }

    pub async fn get_sprites_palette(&self, palette: u8) -> Result<Vec<u8>, Error> {
        Ok(self
            .command(Command::GetSpritesPalette, Bytes::copy_from_slice(&[palette]))
            .await?
            .to_vec())
    }

    pub async fn get_sprites_clip(&self) -> Result<Vec<u8>, Error> {
        Ok(self
            .command(Command::GetSpritesClip, Bytes::new())
            .await?
            .to_vec())
    }

    pub async fn get_sprites(&self, slot: u8, count: u8) -> Result<Vec<u8>, Error> {
        Ok(self
            .command(Command::GetSprites, Bytes::copy_from_slice(&[slot, count]))
            .await?
            .to_vec())
    }

    pub async fn get_sprite_patterns(&self, index: u8, count: u8) -> Result<Vec<u8>, Error> {
        Ok(self
            .command(
                Command::GetSpritePatterns,
                Bytes::copy_from_slice(&[index, count]),
            )
            .await?
            .to_vec())
    }

    // --------------------------------- call stack & history ---------------------------------

    /// Snapshot the live call stack by scanning the machine stack between SP
    /// and the configured stack top, classifying each word that the bytes
    /// below it identify as a return address. Words that do not classify
    /// become pushed values of the innermost frame above them.
    pub async fn live_call_stack(&self) -> Result<VirtualCallStack, Error> {
        let regs = *self.read_registers().await?.core();

        let Some(top) = self.config.stack_top else {
            return Ok(VirtualCallStack::with_root(
                regs.pc,
                regs.sp,
                ROOT_FRAME.to_string(),
            ));
        };
        let len = top
            .saturating_sub(regs.sp)
            .min(self.config.max_stack_scan)
            & !1;
        if len == 0 {
            return Ok(VirtualCallStack::with_root(
                regs.pc,
                regs.sp,
                ROOT_FRAME.to_string(),
            ));
        }

        let base = top - len;
        let window = self.read_memory(base, len).await?;

        let mut frames = vec![CallStackFrame {
            pc: regs.pc,
            entry: regs.pc,
            stack_base: top,
            name: ROOT_FRAME.to_string(),
            local: vec![],
        }];

        // walk from the oldest word (just under the stack top) toward SP
        let mut offset = len as usize;
        while offset >= 2 {
            offset -= 2;
            let word_addr = base + offset as u16;
            let word = u16::from_le_bytes([window[offset], window[offset + 1]]);

            let below = self.read_memory(word.wrapping_sub(3), 3).await;
            let target = match below {
                Ok(bytes) => <[u8; 3]>::try_from(bytes.as_slice())
                    .ok()
                    .and_then(|b| opcode::classify_caller(&b)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => None,
            };

            match target {
                Some(target) => {
                    // `word` is the return site of the frame below
                    if let Some(outer) = frames.last_mut() {
                        outer.pc = word;
                    }
                    frames.push(CallStackFrame {
                        pc: target,
                        entry: target,
                        stack_base: word_addr,
                        name: self.symbols.display(target),
                        local: vec![],
                    });
                }
                None => {
                    if let Some(top_frame) = frames.last_mut() {
                        top_frame.local.push(Some(word));
                    }
                }
            }
        }

        if let Some(top_frame) = frames.last_mut() {
            top_frame.pc = regs.pc;
        }
        Ok(VirtualCallStack::from_frames(frames))
    }

    /// Record one instruction snapshot into the trace: registers, the 4
    /// opcode bytes at PC and, for full history, the word at (SP).
    pub async fn record_history_entry(&mut self) -> Result<(), Error> {
        let regs = *self.read_registers().await?.core();
        let code = self.read_memory(regs.pc, 4).await?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&code[..4]);

        let sp_word = if self.config.full_history {
            let word = self.read_memory(regs.sp, 2).await?;
            Some(u16::from_le_bytes([word[0], word[1]]))
        } else {
            None
        };

        self.history.record(HistoryEntry::new(regs, bytes, sp_word));
        Ok(())
    }
}

/// Memory reads for the backward replay, routed through the live protocol.
pub(super) struct RemoteMemory {
    pub dispatcher: Dispatcher,
    pub timeout: std::time::Duration,
}

#[async_trait::async_trait]
impl MemorySource for RemoteMemory {
    async fn read_mem(&mut self, addr: u16, len: usize) -> Result<Vec<u8>, Error> {
        let mut payload = BytesMut::with_capacity(5);
        payload.put_u8(0); // reserved
        payload.put_u16_le(addr);
        payload.put_u16_le(len as u16);
        let response = self
            .dispatcher
            .send(Command::ReadMem, payload.freeze(), self.timeout)
            .await?;
        if response.len() != len {
            return Err(Error::UnexpectedResponse(Command::ReadMem));
        }
        Ok(response.to_vec())
    }
}
