//! Continue / step state machines, live and replayed. Live operations drive
//! the remote through the continuation command and classify every stop
//! notification against the temporary breakpoint index; replay operations
//! move the history cursor and delegate to the call-stack reconstructor.

use crate::error::Error;
use crate::history::opcode::{self, StackOp};
use crate::oracle::Successors;
use crate::protocol::{BreakCode, Command, StopNotification};
use crate::registers::Z80Registers;
use crate::session::breakpoint::BreakpointKind;
use crate::session::{RemoteMemory, RemoteSession};
use bytes::{BufMut, Bytes, BytesMut};
use smallvec::smallvec;
use std::fmt::{Display, Formatter};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExecState {
    Idle,
    /// Continuation command outstanding.
    Running,
    /// Stop notification received, condition/log evaluation in progress.
    EvaluatingStop,
    /// History cursor behind the live position.
    ReverseReplay,
}

/// User-visible break reason.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StopReason {
    BreakpointHit(u16),
    WatchpointRead(u16),
    WatchpointWrite(u16),
    AssertionFailed(u16),
    ManualPause,
    InterruptBreak,
    /// A step operation reached one of its landing addresses.
    StepDone,
    /// The remote stopped answering. Reported as a break, not an error:
    /// hanging forever is not acceptable in an interactive debugger.
    NoResponse,
    /// The replay cursor reached the oldest recorded entry.
    HistoryEdge,
    Other,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::BreakpointHit(addr) => write!(f, "breakpoint hit at {addr:#06X}"),
            StopReason::WatchpointRead(addr) => write!(f, "watchpoint read at {addr:#06X}"),
            StopReason::WatchpointWrite(addr) => write!(f, "watchpoint write at {addr:#06X}"),
            StopReason::AssertionFailed(addr) => write!(f, "assertion failed at {addr:#06X}"),
            StopReason::ManualPause => f.write_str("paused"),
            StopReason::InterruptBreak => f.write_str("interrupt break"),
            StopReason::StepDone => f.write_str("step complete"),
            StopReason::NoResponse => f.write_str("no response from remote"),
            StopReason::HistoryEdge => f.write_str("start of recorded history"),
            StopReason::Other => f.write_str("stopped"),
        }
    }
}

/// How a continue/step operation ended.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StopOutcome {
    pub reason: StopReason,
    pub pc: u16,
    pub text: String,
}

impl StopOutcome {
    fn new(reason: StopReason, pc: u16, text: impl Into<String>) -> Self {
        StopOutcome {
            reason,
            pc,
            text: text.into(),
        }
    }
}

enum Verdict {
    Stop(StopOutcome),
    /// The stop is invisible to the caller; the continuation is re-issued.
    Resume,
}

impl RemoteSession {
    pub fn exec_state(&self) -> ExecState {
        self.control.state().exec
    }

    /// Run until a user-visible stop. While replaying history this replays
    /// forward instead of touching the remote.
    pub async fn resume(&mut self) -> Result<StopOutcome, Error> {
        if self.history.is_replaying() {
            return self.replay_resume().await;
        }
        self.ensure_idle()?;
        {
            let mut st = self.control.state();
            let st = &mut *st;
            st.temp_index.rebuild(&st.breakpoints);
            st.temp_index.clear_landings();
        }
        self.run_until_stop().await
    }

    pub async fn step_into(&mut self) -> Result<StopOutcome, Error> {
        if self.history.is_replaying() {
            return self.replay_step_forward().await;
        }
        self.ensure_idle()?;
        let regs = *self.read_registers().await?.core();
        let code = self.opcode_at(regs.pc).await?;
        let landings = self.landing_candidates(&regs, &code, false).await?;
        {
            let mut st = self.control.state();
            let st = &mut *st;
            st.temp_index.rebuild(&st.breakpoints);
            st.temp_index.set_landings(landings.into_iter().take(2));
        }
        self.run_until_stop().await
    }

    pub async fn step_over(&mut self) -> Result<StopOutcome, Error> {
        if self.history.is_replaying() {
            return self.replay_step_forward().await;
        }
        self.ensure_idle()?;
        let regs = *self.read_registers().await?.core();
        let code = self.opcode_at(regs.pc).await?;
        let landings = self.landing_candidates(&regs, &code, true).await?;
        {
            let mut st = self.control.state();
            let st = &mut *st;
            st.temp_index.rebuild(&st.breakpoints);
            st.temp_index.set_landings(landings.into_iter().take(2));
        }
        self.run_until_stop().await
    }

    /// Step until the current subroutine returns: step over each instruction
    /// (subroutine bodies of nested calls run inside one continuation) and
    /// stop once the executed instruction was a taken return and SP has risen
    /// above its value at the start.
    pub async fn step_out(&mut self) -> Result<StopOutcome, Error> {
        if self.history.is_replaying() {
            return self.replay_step_out().await;
        }
        self.ensure_idle()?;
        let start_sp = self.read_registers().await?.core().sp;
        {
            let mut st = self.control.state();
            let st = &mut *st;
            st.temp_index.rebuild(&st.breakpoints);
        }

        loop {
            let regs = *self.read_registers().await?.core();
            let code = self.opcode_at(regs.pc).await?;
            let landings = self.landing_candidates(&regs, &code, true).await?;
            self.control
                .state()
                .temp_index
                .set_landings(landings.into_iter().take(2));

            let outcome = self.run_until_stop().await?;
            if outcome.reason != StopReason::StepDone {
                return Ok(outcome);
            }

            let decoded = opcode::classify(&code);
            let returned = match decoded.op {
                StackOp::Ret { cond } => opcode::taken(cond, &regs),
                StackOp::RetFromIsr => true,
                _ => false,
            };
            if returned {
                let sp = self.read_registers().await?.core().sp;
                if sp > start_sp {
                    return Ok(StopOutcome::new(
                        StopReason::StepDone,
                        outcome.pc,
                        "stepped out",
                    ));
                }
            }
        }
    }

    /// Out-of-band pause, delegated to the control handle.
    pub fn pause(&self) -> Result<(), Error> {
        self.control.pause()
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        if self.control.state().exec == ExecState::Running {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    async fn opcode_at(&self, pc: u16) -> Result<[u8; 4], Error> {
        let code = self.read_memory(pc, 4).await?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&code[..4]);
        Ok(bytes)
    }

    /// Landing candidates for the instruction at `regs.pc`. A taken return
    /// lands on the address stored at (SP), which no instruction-local
    /// oracle can know, so it is resolved here from the machine stack.
    async fn landing_candidates(
        &self,
        regs: &Z80Registers,
        code: &[u8; 4],
        over: bool,
    ) -> Result<Successors, Error> {
        let decoded = opcode::classify(code);
        let ret_cond = match decoded.op {
            StackOp::Ret { cond } => Some(cond),
            StackOp::RetFromIsr => Some(None),
            _ => None,
        };
        if let Some(cond) = ret_cond {
            let word = self.read_memory(regs.sp, 2).await?;
            let ret_addr = u16::from_le_bytes([word[0], word[1]]);
            let mut landings: Successors = smallvec![ret_addr];
            if cond.is_some() {
                landings.push(regs.pc.wrapping_add(decoded.len.max(1) as u16));
            }
            return Ok(landings);
        }
        Ok(if over {
            self.oracle.step_over_candidates(regs.pc, code)
        } else {
            self.oracle.step_into_candidates(regs.pc, code)
        })
    }

    /// Continuation payload: up to two landing addresses transmitted as the
    /// remote-side temporary breakpoints.
    fn continue_payload(&self) -> Bytes {
        let st = self.control.state();
        let landings = st.temp_index.landings();
        let mut payload = BytesMut::with_capacity(6);
        for slot in 0..2 {
            match landings.get(slot) {
                Some(addr) => {
                    payload.put_u8(1);
                    payload.put_u16_le(*addr);
                }
                None => {
                    payload.put_u8(0);
                    payload.put_u16_le(0);
                }
            }
        }
        payload.freeze()
    }

    async fn run_until_stop(&mut self) -> Result<StopOutcome, Error> {
        loop {
            self.control.state().exec = ExecState::Running;
            let payload = self.continue_payload();
            let notification = match self
                .dispatcher
                .send_continuation(Command::Continue, payload)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    self.control.state().exec = ExecState::Idle;
                    return timeout_as_break(e);
                }
            };

            self.control.state().exec = ExecState::EvaluatingStop;
            let verdict = match self.classify_stop(&notification).await {
                Ok(v) => v,
                Err(e) => {
                    self.control.state().exec = ExecState::Idle;
                    return timeout_as_break(e);
                }
            };
            match verdict {
                Verdict::Stop(outcome) => {
                    let mut st = self.control.state();
                    st.exec = ExecState::Idle;
                    st.temp_index.clear_landings();
                    drop(st);
                    log::info!(target: "session", "{}", outcome.reason);
                    return Ok(outcome);
                }
                Verdict::Resume => {
                    log::debug!(target: "session", "transparent stop at {:#06X}, resuming", notification.address);
                }
            }
        }
    }

    async fn classify_stop(&mut self, n: &StopNotification) -> Result<Verdict, Error> {
        let addr = n.address;
        match n.reason {
            BreakCode::Manual => Ok(Verdict::Stop(StopOutcome::new(
                StopReason::ManualPause,
                addr,
                n.text.clone(),
            ))),
            BreakCode::Interrupt => Ok(Verdict::Stop(StopOutcome::new(
                StopReason::InterruptBreak,
                addr,
                n.text.clone(),
            ))),
            BreakCode::Breakpoint | BreakCode::Assertion => self.classify_breakpoint_stop(n).await,
            BreakCode::WatchRead => self.classify_watch_stop(n, false).await,
            BreakCode::WatchWrite => self.classify_watch_stop(n, true).await,
            BreakCode::None | BreakCode::Other => Ok(Verdict::Stop(StopOutcome::new(
                StopReason::Other,
                addr,
                n.text.clone(),
            ))),
        }
    }

    async fn classify_breakpoint_stop(&mut self, n: &StopNotification) -> Result<Verdict, Error> {
        let addr = n.address;
        let (is_landing, candidates) = {
            let st = self.control.state();
            (
                st.temp_index.is_landing(addr),
                st.temp_index.matches(addr).to_vec(),
            )
        };
        if is_landing {
            return Ok(Verdict::Stop(StopOutcome::new(
                StopReason::StepDone,
                addr,
                n.text.clone(),
            )));
        }

        if candidates.is_empty() {
            // a stop this session did not place, e.g. set by another client;
            // still user-visible
            return Ok(Verdict::Stop(StopOutcome::new(
                StopReason::BreakpointHit(addr),
                addr,
                n.text.clone(),
            )));
        }

        let needs_regs = candidates.iter().any(|b| b.condition.is_some());
        let regs = if needs_regs {
            Some(*self.read_registers().await?.core())
        } else {
            None
        };

        let mut verdict = Verdict::Resume;
        for bp in &candidates {
            if let (Some(condition), Some(regs)) = (&bp.condition, regs.as_ref()) {
                if !self.condition_holds(condition, regs) {
                    continue;
                }
            }
            match bp.kind {
                BreakpointKind::Logpoint => {
                    log::info!(
                        target: "logpoint",
                        "{:#06X}: {}",
                        addr,
                        bp.log_text.as_deref().unwrap_or("")
                    );
                }
                BreakpointKind::Manual => {
                    verdict = Verdict::Stop(StopOutcome::new(
                        StopReason::BreakpointHit(addr),
                        addr,
                        n.text.clone(),
                    ));
                }
                BreakpointKind::Assertion => {
                    let text = bp.condition.clone().unwrap_or_else(|| n.text.clone());
                    return Ok(Verdict::Stop(StopOutcome::new(
                        StopReason::AssertionFailed(addr),
                        addr,
                        text,
                    )));
                }
            }
        }
        Ok(verdict)
    }

    /// A watch stop for an address no registered watchpoint covers is stale
    /// (wrong bank, removed during the run) and causes an implicit resume.
    async fn classify_watch_stop(
        &mut self,
        n: &StopNotification,
        write: bool,
    ) -> Result<Verdict, Error> {
        let addr = n.address;
        let covering = {
            let st = self.control.state();
            st.watchpoints
                .values()
                .find(|wp| wp.covers(addr, write))
                .cloned()
        };
        let Some(wp) = covering else {
            log::debug!(target: "session", "stale watchpoint stop at {addr:#06X}, resuming");
            return Ok(Verdict::Resume);
        };

        if let Some(condition) = &wp.condition {
            let regs = *self.read_registers().await?.core();
            if !self.condition_holds(condition, &regs) {
                return Ok(Verdict::Resume);
            }
        }

        let reason = if write {
            StopReason::WatchpointWrite(addr)
        } else {
            StopReason::WatchpointRead(addr)
        };
        Ok(Verdict::Stop(StopOutcome::new(reason, addr, n.text.clone())))
    }

    /// Evaluation errors are surfaced and treated as condition-true, so a
    /// broken expression can never silently skip a breakpoint.
    fn condition_holds(&self, condition: &str, regs: &Z80Registers) -> bool {
        match self.evaluator.evaluate(condition, regs) {
            Ok(holds) => holds,
            Err(e) => {
                log::warn!(target: "session", "{:#}", Error::ConditionEvaluation(e));
                true
            }
        }
    }

    // --------------------------------- reverse debugging ------------------------------------

    /// Move one instruction into the past. Entering replay for the first
    /// time seeds the virtual call stack from the live one.
    pub async fn step_back(&mut self) -> Result<StopOutcome, Error> {
        self.ensure_idle()?;
        let seeded_now = self.replay.is_none();
        self.ensure_replay_seeded().await?;

        let newer_sp = match self.history.cursor() {
            Some(k) => {
                self.history
                    .entry(k)
                    .ok_or(Error::HistoryExhausted)?
                    .regs
                    .sp
            }
            None => self.live_regs.ok_or(Error::NotReplaying)?.sp,
        };

        // a failed move at the history edge must not leave a fresh seed
        // behind: the stack and live registers would be stale by the time
        // replay is next entered
        let k = match self.history.move_back() {
            Ok(k) => k,
            Err(e) => {
                if seeded_now {
                    self.leave_replay();
                }
                return Err(e);
            }
        };
        let entry = self.history.entry(k).ok_or(Error::HistoryExhausted)?;
        self.control.state().exec = ExecState::ReverseReplay;

        let mut mem = RemoteMemory {
            dispatcher: self.dispatcher.clone(),
            timeout: self.config.dispatcher.default_timeout,
        };
        if let Some(recon) = self.replay.as_mut() {
            recon
                .replay_back(&entry, newer_sp, &mut mem, self.symbols.as_ref())
                .await;
        }
        Ok(StopOutcome::new(
            StopReason::StepDone,
            entry.regs.pc,
            "stepped back",
        ))
    }

    /// Replay backward until a breakpoint address is reached or history
    /// runs out.
    pub async fn reverse_resume(&mut self) -> Result<StopOutcome, Error> {
        self.ensure_idle()?;
        {
            let mut st = self.control.state();
            let st = &mut *st;
            st.temp_index.rebuild(&st.breakpoints);
            st.temp_index.clear_landings();
        }
        loop {
            match self.step_back().await {
                Ok(outcome) => {
                    let hit = !self.control.state().temp_index.matches(outcome.pc).is_empty();
                    if hit {
                        return Ok(StopOutcome::new(
                            StopReason::BreakpointHit(outcome.pc),
                            outcome.pc,
                            "breakpoint reached in history",
                        ));
                    }
                }
                Err(Error::HistoryExhausted) => {
                    let pc = self.replay_pc().unwrap_or(0);
                    return Ok(StopOutcome::new(
                        StopReason::HistoryEdge,
                        pc,
                        "start of recorded history",
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Abandon replay and jump straight back to the live position.
    pub fn return_to_live(&mut self) {
        self.history.return_to_live();
        self.leave_replay();
    }

    async fn ensure_replay_seeded(&mut self) -> Result<(), Error> {
        if self.replay.is_some() {
            return Ok(());
        }
        use crate::history::callstack::CallStackReconstructor;
        let stack = self.live_call_stack().await?;
        let regs = *self.read_registers().await?.core();
        self.live_regs = Some(regs);
        self.replay = Some(CallStackReconstructor::new(stack));
        Ok(())
    }

    fn leave_replay(&mut self) {
        self.replay = None;
        self.live_regs = None;
        self.control.state().exec = ExecState::Idle;
    }

    /// PC of the position the replay cursor currently points at.
    fn replay_pc(&self) -> Option<u16> {
        match self.history.cursor() {
            Some(k) => self.history.entry(k).map(|e| e.regs.pc),
            None => self.live_regs.map(|r| r.pc),
        }
    }

    /// One forward replay step. Reaching the live position leaves replay
    /// mode.
    async fn replay_step_forward(&mut self) -> Result<StopOutcome, Error> {
        let from_k = self.history.cursor().ok_or(Error::NotReplaying)?;
        let from = self.history.entry(from_k).ok_or(Error::HistoryExhausted)?;

        let moved = self.history.move_forward()?;
        let (to_pc, to_sp) = match moved {
            Some(k) => {
                let e = self.history.entry(k).ok_or(Error::HistoryExhausted)?;
                (e.regs.pc, e.regs.sp)
            }
            None => {
                let r = self.live_regs.ok_or(Error::NotReplaying)?;
                (r.pc, r.sp)
            }
        };

        if let Some(recon) = self.replay.as_mut() {
            recon.replay_forward(&from, to_pc, to_sp, self.symbols.as_ref());
        }

        if moved.is_none() {
            self.leave_replay();
            return Ok(StopOutcome::new(
                StopReason::StepDone,
                to_pc,
                "reached live state",
            ));
        }
        Ok(StopOutcome::new(
            StopReason::StepDone,
            to_pc,
            "stepped forward",
        ))
    }

    /// Forward replay until a breakpoint address or the live position.
    async fn replay_resume(&mut self) -> Result<StopOutcome, Error> {
        self.ensure_idle()?;
        {
            let mut st = self.control.state();
            let st = &mut *st;
            st.temp_index.rebuild(&st.breakpoints);
        }
        loop {
            let outcome = self.replay_step_forward().await?;
            if !self.history.is_replaying() {
                return Ok(outcome);
            }
            let hit = !self.control.state().temp_index.matches(outcome.pc).is_empty();
            if hit {
                return Ok(StopOutcome::new(
                    StopReason::BreakpointHit(outcome.pc),
                    outcome.pc,
                    "breakpoint reached in history",
                ));
            }
        }
    }

    /// Forward replay until the virtual call stack gets shallower than it
    /// was at the start, i.e. the current frame returned.
    async fn replay_step_out(&mut self) -> Result<StopOutcome, Error> {
        let start_depth = match self.replay.as_ref() {
            Some(recon) => recon.stack().depth(),
            None => return Err(Error::NotReplaying),
        };
        loop {
            let outcome = self.replay_step_forward().await?;
            if !self.history.is_replaying() {
                return Ok(outcome);
            }
            let depth = self.replay.as_ref().map(|r| r.stack().depth()).unwrap_or(0);
            if depth < start_depth {
                return Ok(outcome);
            }
        }
    }
}

/// A dispatcher timeout during continue/step is reported as a break outcome,
/// never as an error.
fn timeout_as_break(e: Error) -> Result<StopOutcome, Error> {
    match e {
        Error::ProtocolTimeout(cmd) => Ok(StopOutcome::new(
            StopReason::NoResponse,
            0,
            format!("no response from remote for {cmd}"),
        )),
        other => Err(other),
    }
}
