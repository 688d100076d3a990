//! Static exploration of code reachable from an address, decoding instruction bytes as they were
//! in memory at a given step.

use crate::arch::{Architecture, InstructionType};
use crate::error::{Error, Result};
use crate::log::*;
use crate::memory_trace::{MemorySegment, MemoryTrace};
use crate::Cancel;

use std::collections::{BTreeMap, BTreeSet};

/// One decoded instruction
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CodeRange {
    pub address: u64,
    pub length: u32,
    pub insn_type: InstructionType,
}

impl CodeRange {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.length as u64
    }
}

/// What [`SubroutineAnalyzer::analyze_code`] found
#[derive(Clone, Debug, Default)]
pub struct CodeExploration {
    /// Decoded instructions by address
    pub code: BTreeMap<u64, CodeRange>,
    /// Call targets
    pub subroutines: BTreeSet<u64>,
    /// Jump targets
    pub locations: BTreeSet<u64>,
}

pub struct SubroutineAnalyzer<'a> {
    arch: &'a dyn Architecture,
    memory: &'a MemoryTrace,
    step: u64,
}

impl<'a> SubroutineAnalyzer<'a> {
    /// Decode from memory as it was at `step`
    pub fn new(arch: &'a dyn Architecture, memory: &'a MemoryTrace, step: u64) -> Self {
        Self { arch, memory, step }
    }

    fn fetch(&self, pc: u64) -> Result<Vec<u8>> {
        let mut code = vec![];
        for i in 0..self.arch.max_instruction_length() as u64 {
            match self.memory.byte_at(pc.wrapping_add(i), self.step) {
                Ok(b) => code.push(b),
                Err(e) if code.is_empty() => return Err(e),
                // The instruction may still fit before the end of the mapping
                Err(_) => break,
            }
        }
        Ok(code)
    }

    /// Decode the instruction at `pc` along with its static branch target
    pub fn decode(&self, pc: u64) -> Result<(CodeRange, Option<u64>)> {
        let code = self.fetch(pc)?;
        let length = self.arch.decode_length(pc, &code);
        let insn_type = match self.arch.decode_type(pc, &code) {
            Some(t) if length != 0 => t,
            _ => return Err(Error::DecodeFailure { pc }),
        };
        Ok((
            CodeRange {
                address: pc,
                length,
                insn_type,
            },
            self.arch.branch_target(pc, &code),
        ))
    }

    /// Decode consecutive instructions from `address` up to and including the first one that
    /// does not fall through. Stops silently on the first decode failure.
    pub fn analyze_straightline(&self, address: u64) -> Vec<CodeRange> {
        let mut result = vec![];
        let mut pc = address;
        loop {
            let insn = match self.decode(pc) {
                Ok((insn, _)) => insn,
                Err(e) => {
                    trace!("Straightline scan stopped"; "pc" => Hex(pc), "reason" => %e);
                    break;
                }
            };
            result.push(insn);
            if insn.insn_type.ends_block() {
                break;
            }
            pc = pc.wrapping_add(insn.length as u64);
        }
        result
    }

    /// Explore all code reachable from `address` through direct branches and calls. A block is
    /// cut short where it would leave the segment it started in.
    pub fn analyze_code(&self, address: u64, cancel: Cancel<'_>) -> CodeExploration {
        let mut result = CodeExploration::default();
        let mut todo: BTreeSet<u64> = std::iter::once(address).collect();
        let mut visited: BTreeSet<u64> = BTreeSet::new();

        while let Some(start) = todo.pop_first() {
            if cancel() {
                debug!("Code exploration cancelled"; "pending" => todo.len() + 1);
                break;
            }
            let segment = match self.memory.segment(start, self.step) {
                Ok(s) => s,
                Err(_) => continue,
            };
            self.explore_block(start, &segment, &mut visited, &mut todo, &mut result);
        }

        debug!("Code exploration finished";
               "start" => Hex(address),
               "instructions" => result.code.len(),
               "subroutines" => result.subroutines.len(),
               "locations" => result.locations.len());
        result
    }

    fn explore_block(
        &self,
        start: u64,
        segment: &MemorySegment,
        visited: &mut BTreeSet<u64>,
        todo: &mut BTreeSet<u64>,
        result: &mut CodeExploration,
    ) {
        let mut pc = start;
        while segment.contains(pc) && visited.insert(pc) {
            let (insn, target) = match self.decode(pc) {
                Ok(d) => d,
                Err(_) => return,
            };
            result.code.insert(pc, insn);
            let mut push = |target: Option<u64>, set: &mut BTreeSet<u64>| {
                if let Some(t) = target {
                    set.insert(t);
                    if !visited.contains(&t) {
                        todo.insert(t);
                    }
                }
            };
            match insn.insn_type {
                InstructionType::Jcc => push(target, &mut result.locations),
                InstructionType::Jmp => {
                    push(target, &mut result.locations);
                    return;
                }
                InstructionType::Call => push(target, &mut result.subroutines),
                InstructionType::JmpIndirect | InstructionType::Ret | InstructionType::Rti => {
                    return
                }
                InstructionType::Syscall | InstructionType::Other => {}
            }
            pc = pc.wrapping_add(insn.length as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_trace::Protection;
    use crate::node::Step;
    use crate::semantics::Semantics;

    /// Two byte instructions: opcode, then an 8-bit absolute target
    struct Tiny;

    impl Architecture for Tiny {
        fn name(&self) -> &str {
            "tiny"
        }
        fn register_count(&self) -> usize {
            1
        }
        fn pointer_size(&self) -> usize {
            1
        }
        fn max_instruction_length(&self) -> usize {
            2
        }
        fn decode_length(&self, _pc: u64, code: &[u8]) -> u32 {
            match code.first() {
                Some(0xff) | None => 0,
                _ => 2,
            }
        }
        fn decode_type(&self, _pc: u64, code: &[u8]) -> Option<InstructionType> {
            Some(match code.first()? {
                1 => InstructionType::Jcc,
                2 => InstructionType::Jmp,
                3 => InstructionType::Call,
                4 => InstructionType::Ret,
                5 => InstructionType::JmpIndirect,
                0xff => return None,
                _ => InstructionType::Other,
            })
        }
        fn branch_target(&self, _pc: u64, code: &[u8]) -> Option<u64> {
            match code {
                [1..=3, t] => Some(*t as u64),
                _ => None,
            }
        }
        fn emit_semantics(&self, _step: &Step, _semantics: &mut Semantics<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn memory(code: &[u8]) -> MemoryTrace {
        let mut m = MemoryTrace::new();
        m.mmap(0, code.len() as u64, Protection::parse("r-x").unwrap(), None, Some(code), 0, 0)
            .unwrap();
        m
    }

    #[test]
    fn straightline_stops_at_unconditional_transfer() {
        let m = memory(&[0, 0, 1, 0x40, 3, 0x50, 2, 0x10, 0, 0]);
        let a = SubroutineAnalyzer::new(&Tiny, &m, 0);
        let code = a.analyze_straightline(0);
        assert_eq!(
            code.iter().map(|c| c.address).collect::<Vec<_>>(),
            vec![0, 2, 4, 6]
        );
        assert_eq!(code[3].insn_type, InstructionType::Jmp);

        let m = memory(&[0, 0, 0xff, 0]);
        let a = SubroutineAnalyzer::new(&Tiny, &m, 0);
        assert_eq!(a.analyze_straightline(0).len(), 1);
        assert!(matches!(a.decode(2), Err(Error::DecodeFailure { pc: 2 })));
    }

    #[test]
    fn exploration_follows_branches_and_calls() {
        let mut code = vec![0u8; 0x40];
        code[0..8].copy_from_slice(&[1, 0x10, 3, 0x20, 4, 0, 0, 0]);
        code[0x10..0x14].copy_from_slice(&[0, 0, 2, 0x00]);
        code[0x20..0x24].copy_from_slice(&[5, 0, 0, 0]);
        let m = memory(&code);
        let a = SubroutineAnalyzer::new(&Tiny, &m, 0);
        let r = a.analyze_code(0, &|| false);
        assert_eq!(r.locations.iter().copied().collect::<Vec<_>>(), vec![0x00, 0x10]);
        assert_eq!(r.subroutines.iter().copied().collect::<Vec<_>>(), vec![0x20]);
        assert_eq!(
            r.code.keys().copied().collect::<Vec<_>>(),
            vec![0x00, 0x02, 0x04, 0x10, 0x12, 0x20]
        );

        let cancelled = a.analyze_code(0, &|| true);
        assert!(cancelled.code.is_empty());
    }

    #[test]
    fn exploration_stays_in_its_segment() {
        let mut m = memory(&[0u8; 0x1000]);
        // A second mapping right behind the first one, holding a call
        m.mmap(0x1000, 0x1000, Protection::RW, None, Some(&[3, 0x80]), 0, 0)
            .unwrap();
        let a = SubroutineAnalyzer::new(&Tiny, &m, 0);
        let r = a.analyze_code(0xffe, &|| false);
        assert_eq!(r.code.keys().copied().collect::<Vec<_>>(), vec![0xffe]);
        assert!(r.subroutines.is_empty());
        // Instruction bytes are fetched across the boundary, decoding is not cut short
        assert_eq!(a.decode(0x1000).unwrap().1, Some(0x80));
    }
}
