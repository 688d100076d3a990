//! The interface to per-architecture instruction decoders

use crate::error::Result;
use crate::node::Step;
use crate::semantics::Semantics;

/// Control-flow class of an instruction
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum InstructionType {
    Jmp,
    Jcc,
    JmpIndirect,
    Call,
    Ret,
    Rti,
    Syscall,
    Other,
}

impl InstructionType {
    /// Control never falls through to the next instruction
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            InstructionType::Jmp
                | InstructionType::JmpIndirect
                | InstructionType::Ret
                | InstructionType::Rti
        )
    }

    pub fn is_return(self) -> bool {
        matches!(self, InstructionType::Ret | InstructionType::Rti)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "jmp" => InstructionType::Jmp,
            "jcc" => InstructionType::Jcc,
            "jmp_indirect" | "jmpi" => InstructionType::JmpIndirect,
            "call" => InstructionType::Call,
            "ret" => InstructionType::Ret,
            "rti" => InstructionType::Rti,
            "syscall" => InstructionType::Syscall,
            "other" => InstructionType::Other,
            _ => return None,
        })
    }
}

/// An instruction set, as far as trace analysis needs to know it.
///
/// Decoding must be deterministic for a given program counter and code window; `code` holds up to
/// [`Self::max_instruction_length`] bytes starting at `pc`.
pub trait Architecture {
    fn name(&self) -> &str;
    fn register_count(&self) -> usize;
    /// Size of an address in bytes
    fn pointer_size(&self) -> usize;
    fn is_big_endian(&self) -> bool {
        false
    }
    /// Whether the trace covers system-level code, so that system call entry points are part of
    /// the trace
    fn is_system_level(&self) -> bool {
        false
    }
    fn register_name(&self, register: usize) -> String {
        format!("r{}", register)
    }
    fn max_instruction_length(&self) -> usize;

    /// Length of the instruction at `pc` in bytes; zero if it cannot be decoded
    fn decode_length(&self, pc: u64, code: &[u8]) -> u32;
    fn decode_type(&self, pc: u64, code: &[u8]) -> Option<InstructionType>;
    /// Static target of a direct branch or call
    fn branch_target(&self, pc: u64, code: &[u8]) -> Option<u64>;
    /// Describe the effects of the retired `step` by calling the `semantics` primitives
    fn emit_semantics(&self, step: &Step, semantics: &mut Semantics<'_>) -> Result<()>;
}
