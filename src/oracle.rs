//! Collaborator seams. The core deliberately does not ship a full Z80
//! decoder, a symbol table or an expression language; hosts inject them
//! through these traits.

use crate::error::Error;
use crate::history::opcode::{self, StackOp};
use crate::registers::Z80Registers;
use smallvec::{smallvec, SmallVec};

/// Candidate next program counters of one instruction. Conditional and
/// variable-length instructions have two.
pub type Successors = SmallVec<[u16; 2]>;

/// Instruction-length/branch oracle. The default methods understand only the
/// stack-relevant subset; a host with a real disassembler should override
/// them to get correct landings for jumps, `DJNZ` and friends.
pub trait InstructionOracle {
    /// Byte length of the instruction starting at `opcode[0]`.
    fn instruction_len(&self, opcode: &[u8; 4]) -> u8;

    /// Where can execution be after stepping *into* the instruction at `pc`?
    fn step_into_candidates(&self, pc: u16, opcode: &[u8; 4]) -> Successors {
        let decoded = opcode::classify(opcode);
        let next = pc.wrapping_add(self.instruction_len(opcode) as u16);
        match decoded.op {
            StackOp::Call { target, cond } => match cond {
                Some(_) => smallvec![target, next],
                None => smallvec![target],
            },
            StackOp::Rst { vector } => smallvec![vector as u16],
            _ => smallvec![next],
        }
    }

    /// Where can execution land when stepping *over* the instruction at `pc`?
    /// Calls land on the call-site successor address.
    fn step_over_candidates(&self, pc: u16, opcode: &[u8; 4]) -> Successors {
        smallvec![pc.wrapping_add(self.instruction_len(opcode) as u16)]
    }
}

/// Symbol resolver: zero or more known labels for an address.
pub trait SymbolResolver {
    fn labels(&self, addr: u16) -> Vec<String>;

    /// First label, or the hex address when nothing is known.
    fn display(&self, addr: u16) -> String {
        self.labels(addr)
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("{addr:#06X}"))
    }
}

/// Breakpoint condition evaluator. Errors are surfaced to the user and
/// treated as condition-true by the step controller, so a broken expression
/// can never silently skip a breakpoint.
pub trait ConditionEvaluator {
    fn evaluate(&self, condition: &str, regs: &Z80Registers) -> anyhow::Result<bool>;
}

/// Byte source for the call-stack reconstructor: reads the memory below a
/// return address to classify the calling instruction.
#[async_trait::async_trait]
pub trait MemorySource {
    async fn read_mem(&mut self, addr: u16, len: usize) -> Result<Vec<u8>, Error>;
}

/// Resolver that knows nothing; every frame shows as a hex address.
#[derive(Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn labels(&self, _addr: u16) -> Vec<String> {
        vec![]
    }
}

/// Evaluator for sessions without an expression engine: every condition
/// holds, so conditional breakpoints degrade to plain ones.
#[derive(Default)]
pub struct AlwaysBreak;

impl ConditionEvaluator for AlwaysBreak {
    fn evaluate(&self, _condition: &str, _regs: &Z80Registers) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Length oracle for the stack-relevant subset only. Enough for the step
/// controller to work on code consisting of straight-line and call/ret
/// instructions; real hosts inject a full decoder.
#[derive(Default)]
pub struct StackOpOracle;

impl InstructionOracle for StackOpOracle {
    fn instruction_len(&self, opcode: &[u8; 4]) -> u8 {
        let decoded = opcode::classify(opcode);
        if decoded.len > 0 {
            decoded.len
        } else {
            1
        }
    }
}
