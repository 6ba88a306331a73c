//! Virtual call stack synthesized from the instruction trace. There is no
//! native frame metadata on a Z80: frames are inferred purely from decoded
//! opcodes and observed stack-pointer movement, replayed forward or backward
//! over consecutive history entries.

use crate::history::opcode::{self, StackOp};
use crate::history::HistoryEntry;
use crate::oracle::{MemorySource, SymbolResolver};
use crate::weak_error;

/// Display name of a frame whose caller could not be recovered - the trace
/// window started mid-subroutine, an interrupt fired, or the stack bytes do
/// not decode as any call instruction.
pub const UNKNOWN_CALLER: &str = "__UNKNOWN__";
/// Display name of a synthesized interrupt frame.
pub const INTERRUPT_FRAME: &str = "__INTERRUPT__";

/// One synthesized subroutine (or interrupt) frame.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallStackFrame {
    /// Instruction pointer the replay currently attributes to this frame.
    pub pc: u16,
    /// Subroutine entry address (CALL operand or RST/interrupt vector).
    pub entry: u16,
    /// SP value while the return address of this frame is on top.
    pub stack_base: u16,
    pub name: String,
    /// Values pushed since frame entry, oldest first. `None` marks a slot
    /// whose value cannot be recovered (e.g. POPped before the trace began).
    pub local: Vec<Option<u16>>,
}

impl CallStackFrame {
    fn synthetic_root(pc: u16, sp: u16) -> Self {
        CallStackFrame {
            pc,
            entry: pc,
            stack_base: sp,
            name: UNKNOWN_CALLER.to_string(),
            local: vec![],
        }
    }
}

/// Ordered list of frames, oldest (outermost) first. Non-empty for as long
/// as reverse-debug mode is active: a synthetic root is substituted whenever
/// replay would pop past the bottom.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VirtualCallStack {
    frames: Vec<CallStackFrame>,
}

impl VirtualCallStack {
    pub fn with_root(pc: u16, sp: u16, name: String) -> Self {
        VirtualCallStack {
            frames: vec![CallStackFrame {
                pc,
                entry: pc,
                stack_base: sp,
                name,
                local: vec![],
            }],
        }
    }

    pub fn from_frames(frames: Vec<CallStackFrame>) -> Self {
        VirtualCallStack { frames }
    }

    pub fn frames(&self) -> &[CallStackFrame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top(&self) -> Option<&CallStackFrame> {
        self.frames.last()
    }

    fn push(&mut self, frame: CallStackFrame) {
        self.frames.push(frame);
    }

    /// Top frame, synthesizing a root when the stack ran empty.
    fn ensure_top(&mut self, pc: u16, sp: u16) -> &mut CallStackFrame {
        if self.frames.is_empty() {
            self.frames.push(CallStackFrame::synthetic_root(pc, sp));
        }
        // just pushed if empty
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Remove one 2-byte unit: a local slot of the top frame when present,
    /// the frame itself otherwise.
    fn pop_unit(&mut self, pc: u16, sp: u16) {
        let top_has_slots = self
            .frames
            .last()
            .map(|top| !top.local.is_empty())
            .unwrap_or(false);
        if top_has_slots {
            if let Some(top) = self.frames.last_mut() {
                top.local.pop();
            }
            return;
        }
        self.frames.pop();
        if self.frames.is_empty() {
            self.frames.push(CallStackFrame::synthetic_root(pc, sp));
        }
    }

    /// Remove the whole top frame (a return executed), local slots included.
    fn pop_frame(&mut self, pc: u16, sp: u16) {
        self.frames.pop();
        if self.frames.is_empty() {
            self.frames.push(CallStackFrame::synthetic_root(pc, sp));
        }
    }
}

/// Replays history entries to maintain the virtual call stack.
pub struct CallStackReconstructor {
    stack: VirtualCallStack,
}

impl CallStackReconstructor {
    /// Seed from a call stack snapshot (usually the live one taken when
    /// reverse-debug mode is entered).
    pub fn new(seed: VirtualCallStack) -> Self {
        CallStackReconstructor { stack: seed }
    }

    pub fn stack(&self) -> &VirtualCallStack {
        &self.stack
    }

    /// Replay one step backward: `current` is the (older) entry the cursor
    /// moved to, `newer_sp` the stack pointer of the state being left.
    ///
    /// An executed return is undone by re-entering the callee: the caller is
    /// classified from the 3 bytes below the return address. Everything else
    /// reduces to reconciling the SP delta in 2-byte units.
    pub async fn replay_back(
        &mut self,
        current: &HistoryEntry,
        newer_sp: u16,
        mem: &mut (dyn MemorySource + Send),
        syms: &dyn SymbolResolver,
    ) {
        let decoded = opcode::classify(&current.opcode);
        let regs = &current.regs;
        let sp = regs.sp;

        let returned = match decoded.op {
            StackOp::Ret { cond } => opcode::taken(cond, regs),
            StackOp::RetFromIsr => true,
            _ => false,
        };
        if returned {
            // a plain return raises SP by exactly 2; any surplus means an
            // interrupt frame was popped along with it
            let delta = newer_sp.wrapping_sub(sp) as i16;
            if delta != 2 {
                log::debug!(target: "history", "return with sp delta {delta}, dropping interrupt frame");
                self.stack.pop_frame(regs.pc, sp);
            }

            let (entry, name) = match current.sp_word {
                Some(ret_addr) => classify_return_target(ret_addr, mem, syms).await,
                None => (regs.pc, UNKNOWN_CALLER.to_string()),
            };
            self.stack.push(CallStackFrame {
                pc: regs.pc,
                entry,
                stack_base: sp,
                name,
                local: vec![],
            });
            return;
        }

        // a POP's value is recoverable from the (SP) snapshot; account for
        // its SP effect before the general delta reconciliation
        let mut popped: Option<Option<u16>> = None;
        let mut adjusted_sp = sp;
        if let StackOp::Pop(_) = decoded.op {
            popped = Some(current.sp_word);
            adjusted_sp = sp.wrapping_add(2);
        }

        let delta = adjusted_sp.wrapping_sub(newer_sp) as i16;
        if delta > 0 {
            // SP grew going backward: pushes (CALL/PUSH/interrupt) are undone
            for _ in 0..delta / 2 {
                self.stack.pop_unit(regs.pc, sp);
            }
        } else if delta < 0 {
            // pops are undone, but the popped values are gone for good
            let top = self.stack.ensure_top(regs.pc, sp);
            for _ in 0..(-delta) / 2 {
                top.local.push(None);
            }
        }

        let top = self.stack.ensure_top(regs.pc, sp);
        top.pc = regs.pc;
        if let Some(value) = popped {
            top.local.push(value);
        }
    }

    /// Replay one step forward: `from` is the entry whose instruction is
    /// executed, `to_pc`/`to_sp` the state it leads to (the next entry, or
    /// the live position).
    pub fn replay_forward(
        &mut self,
        from: &HistoryEntry,
        to_pc: u16,
        to_sp: u16,
        syms: &dyn SymbolResolver,
    ) {
        let decoded = opcode::classify(&from.opcode);
        let regs = &from.regs;
        let sp = regs.sp;

        // closed-form SP prediction; None = unknowable (LD SP,(nnnn))
        let mut expected: Option<u16> = Some(sp);
        match decoded.op {
            StackOp::Call { target, cond } if opcode::taken(cond, regs) => {
                self.stack.push(CallStackFrame {
                    pc: target,
                    entry: target,
                    stack_base: sp.wrapping_sub(2),
                    name: syms.display(target),
                    local: vec![],
                });
                expected = Some(sp.wrapping_sub(2));
            }
            StackOp::Rst { vector } => {
                let target = vector as u16;
                self.stack.push(CallStackFrame {
                    pc: target,
                    entry: target,
                    stack_base: sp.wrapping_sub(2),
                    name: syms.display(target),
                    local: vec![],
                });
                expected = Some(sp.wrapping_sub(2));
            }
            StackOp::Push(pair) => {
                let value = pair.value(regs);
                self.stack.ensure_top(regs.pc, sp).local.push(Some(value));
                expected = Some(sp.wrapping_sub(2));
            }
            StackOp::Pop(_) => {
                self.stack.pop_unit(to_pc, to_sp);
                expected = Some(sp.wrapping_add(2));
            }
            StackOp::Ret { cond } if opcode::taken(cond, regs) => {
                self.stack.pop_frame(to_pc, to_sp);
                expected = Some(sp.wrapping_add(2));
            }
            StackOp::RetFromIsr => {
                self.stack.pop_frame(to_pc, to_sp);
                expected = Some(sp.wrapping_add(2));
            }
            StackOp::LdSpImm(value) => expected = Some(value),
            StackOp::LdSpReg(pair) => expected = Some(pair.value(regs)),
            StackOp::IncSp => expected = Some(sp.wrapping_add(1)),
            StackOp::DecSp => expected = Some(sp.wrapping_sub(1)),
            StackOp::LdSpInd => expected = None,
            // untaken conditionals and SP-neutral instructions
            _ => {}
        }

        match expected {
            Some(exp) => {
                let mut exp = exp;
                // exactly one extra return-address push beyond the decoded
                // prediction: an interrupt was accepted here (this is the
                // only available signal and is indistinguishable from some
                // corrupted traces)
                if to_sp == exp.wrapping_sub(2) {
                    self.push_interrupt_frame(to_pc, to_sp, syms);
                    exp = exp.wrapping_sub(2);
                }

                let delta = exp.wrapping_sub(to_sp) as i16;
                if delta > 0 {
                    // stack grew more than predicted: unknown pushes
                    let top = self.stack.ensure_top(to_pc, to_sp);
                    for _ in 0..delta / 2 {
                        top.local.push(None);
                    }
                } else if delta < 0 {
                    for _ in 0..(-delta) / 2 {
                        self.stack.pop_unit(to_pc, to_sp);
                    }
                }
            }
            None => {
                // SP is unpredictable; fall back to the static successor
                // address to at least catch interrupts
                let successor = regs.pc.wrapping_add(decoded.len as u16);
                if to_pc != successor {
                    self.push_interrupt_frame(to_pc, to_sp, syms);
                }
            }
        }

        let top = self.stack.ensure_top(to_pc, to_sp);
        top.pc = to_pc;
    }

    fn push_interrupt_frame(&mut self, vector: u16, sp: u16, syms: &dyn SymbolResolver) {
        log::debug!(target: "history", "interrupt inferred, vector {vector:#06X}");
        let name = syms
            .labels(vector)
            .into_iter()
            .next()
            .unwrap_or_else(|| INTERRUPT_FRAME.to_string());
        self.stack.push(CallStackFrame {
            pc: vector,
            entry: vector,
            stack_base: sp,
            name,
            local: vec![],
        });
    }
}

/// Classify the instruction that produced `ret_addr` on the stack.
/// Returns the subroutine entry address and display name.
async fn classify_return_target(
    ret_addr: u16,
    mem: &mut (dyn MemorySource + Send),
    syms: &dyn SymbolResolver,
) -> (u16, String) {
    let below = weak_error!(
        mem.read_mem(ret_addr.wrapping_sub(3), 3).await,
        "reading below return address:"
    );
    let target = below
        .as_deref()
        .and_then(|b| <[u8; 3]>::try_from(b).ok())
        .and_then(|b| opcode::classify_caller(&b));
    match target {
        Some(target) => (target, syms.display(target)),
        None => (ret_addr, UNKNOWN_CALLER.to_string()),
    }
}
