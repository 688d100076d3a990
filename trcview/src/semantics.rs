//! The primitives architecture decoders use to describe what an instruction does to types.
//!
//! A [`Semantics`] is handed to [`Architecture::emit_semantics`](crate::arch::Architecture) once
//! per retired step. All primitives take [`Location`]s; decoders turn their operands into
//! locations with [`Semantics::location`] first, so addressing modes are never interpreted here.

use crate::analysis_config::CONFIG;
use crate::containers::unordered::UnorderedSet;
use crate::log::*;
use crate::memory_trace::MemoryTrace;
use crate::memory_type_map::MemoryTypeMap;
use crate::operand::{Location, Operand, OperandContext};
use crate::register_type_map::{ChainTarget, CodeTypeMap, MapId};
use crate::variable_type::{VariableType, ADDSUB_BIT, MUL_BIT};

/// Machine state visible while decoding one step
pub struct StepContext<'a> {
    pub registers: &'a [u64],
    pub pointer_size: usize,
    pub big_endian: bool,
    pub step: u64,
    pub memory: Option<&'a MemoryTrace>,
}

impl<'a> OperandContext for StepContext<'a> {
    fn register(&self, r: usize) -> Option<u64> {
        self.registers.get(r).copied()
    }

    fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn read_pointer(&self, address: u64) -> Option<u64> {
        self.memory?
            .value_at(address, self.pointer_size, self.step, self.big_endian)
            .ok()
    }
}

/// Records the type effects of one step into the chain graph
pub struct Semantics<'a> {
    code: &'a mut CodeTypeMap,
    memory: &'a mut MemoryTypeMap,
    /// Per register: maps visited since the register was last read or written
    trails: &'a mut [UnorderedSet<MapId>],
    map: MapId,
    context: StepContext<'a>,
}

impl<'a> Semantics<'a> {
    pub(crate) fn new(
        code: &'a mut CodeTypeMap,
        memory: &'a mut MemoryTypeMap,
        trails: &'a mut [UnorderedSet<MapId>],
        map: MapId,
        context: StepContext<'a>,
    ) -> Self {
        let mut semantics = Self {
            code,
            memory,
            trails,
            map,
            context,
        };
        semantics.set_pc();
        semantics
    }

    fn set_pc(&mut self) {
        for trail in self.trails.iter_mut() {
            trail.insert(self.map);
        }
    }

    pub fn pc(&self) -> u64 {
        self.code.get(self.map).map_or(0, |m| m.pc())
    }

    pub fn step(&self) -> u64 {
        self.context.step
    }

    pub fn pointer_size(&self) -> usize {
        self.context.pointer_size
    }

    /// Resolve an operand to the location it denotes at this step
    pub fn location(&self, operand: &Operand) -> Option<Location> {
        operand.resolve(&self.context)
    }

    /// `register` is read here: its value at every PC since the last access is live
    pub fn read(&mut self, register: usize) {
        self.end_trail(register, true);
    }

    /// `register` is overwritten here: its value at every PC since the last access is dead
    pub fn write(&mut self, register: usize) {
        self.end_trail(register, false);
    }

    fn end_trail(&mut self, register: usize, live: bool) {
        let trail = match self.trails.get_mut(register) {
            Some(t) => t,
            None => return,
        };
        for id in trail.drain() {
            if let Some(m) = self.code.get_mut(id) {
                m.set_live(register, live);
            }
        }
    }

    fn touch(&mut self, address: u64) {
        let step = self.memory.current_step(address);
        if let Some(m) = self.code.get_mut(self.map) {
            m.record_memory_operand(address, step);
        }
    }

    fn get(&self, location: Location) -> u64 {
        match location {
            Location::Register(r) => self.code.get(self.map).map_or(0, |m| m.get(r)),
            Location::Memory(a) => self.memory.get(a, u64::MAX),
        }
    }

    /// The chain graph node for `location` at this step
    pub fn target(&mut self, location: Location) -> ChainTarget {
        match location {
            Location::Register(register) => ChainTarget::Register {
                map: self.map,
                register,
            },
            Location::Memory(address) => ChainTarget::Memory {
                address,
                step: self.memory.current_step(address),
            },
        }
    }

    fn link_forward(&mut self, location: Location, target: ChainTarget) {
        match location {
            Location::Register(r) => {
                if let Some(m) = self.code.get_mut(self.map) {
                    m.add_forward_target(r, target);
                }
            }
            Location::Memory(a) => {
                self.memory.forward_chain(a, target);
                self.touch(a);
            }
        }
    }

    fn link_reverse(&mut self, location: Location, target: ChainTarget) {
        match location {
            Location::Register(r) => {
                if let Some(m) = self.code.get_mut(self.map) {
                    m.add_reverse_target(r, target);
                }
            }
            Location::Memory(a) => {
                self.memory.reverse_chain(a, target);
                self.touch(a);
            }
        }
    }

    /// Add `ty` to the evidence for `location`
    pub fn constrain(&mut self, location: Location, ty: VariableType) {
        self.constrain_flags(location, ty.mask());
    }

    fn constrain_flags(&mut self, location: Location, flags: u64) {
        match location {
            Location::Register(r) => {
                if let Some(m) = self.code.get_mut(self.map) {
                    m.constrain(r, flags);
                }
            }
            Location::Memory(a) => {
                self.memory.constrain(a, flags);
                self.touch(a);
            }
        }
    }

    /// `location` is defined here with a value of type `ty`
    pub fn set(&mut self, location: Location, ty: VariableType) {
        self.define(location, ty.mask());
    }

    fn define(&mut self, location: Location, flags: u64) {
        match location {
            Location::Register(r) => {
                if let Some(m) = self.code.get_mut(self.map) {
                    m.set(r, flags);
                    m.break_chain(r);
                }
            }
            Location::Memory(a) => {
                self.memory.step(a, self.context.step);
                self.memory.set(a, flags);
                self.touch(a);
            }
        }
    }

    /// `location` is defined here with a value nothing is known about
    pub fn reset(&mut self, location: Location) {
        match location {
            Location::Register(r) => {
                if let Some(m) = self.code.get_mut(self.map) {
                    m.set(r, 0);
                    m.break_chain(r);
                }
            }
            Location::Memory(a) => {
                self.memory.set(a, 0);
                self.touch(a);
            }
        }
    }

    /// `dst` receives the value of `src` unchanged
    pub fn copy(&mut self, dst: Location, src: Location) {
        if dst == src {
            return;
        }
        let flags = self.get(src);
        self.define(dst, flags);
        let from = self.target(src);
        let to = self.target(dst);
        self.link_reverse(dst, from);
        self.link_forward(src, to);
    }

    /// `dst` receives a value of type `ty`, taken from `src` or from an immediate if `src` is
    /// `None`.
    ///
    /// A move between two registers of native width does not constrain the source unless
    /// [`constrain_same_width_register_moves`](crate::analysis_config::AnalysisConfig) is set:
    /// such a move says nothing about what the register holds.
    pub fn move_value(&mut self, dst: Location, src: Option<Location>, ty: VariableType) {
        let src = match src {
            Some(src) => src,
            None => return self.set(dst, ty),
        };
        let same_width_registers = matches!(
            (dst, src),
            (Location::Register(_), Location::Register(_))
        ) && VariableType::native_integer(self.context.pointer_size) == Some(ty);
        if !same_width_registers || CONFIG.constrain_same_width_register_moves {
            self.constrain(src, ty);
        } else {
            trace!("Skipping same width register move constraint";
                   "pc" => Hex(self.pc()), "src" => %src, "dst" => %dst);
        }
        self.copy(dst, src);
    }

    /// `a` and `b` are presumed to hold values of the same type, e.g. the operands of a compare
    pub fn unify(&mut self, a: Location, b: Location) {
        if a == b {
            return;
        }
        let ta = self.target(a);
        let tb = self.target(b);
        self.link_forward(a, tb);
        match (a, b) {
            (Location::Register(_), Location::Register(_)) => self.link_forward(b, ta),
            _ => self.link_reverse(b, ta),
        }
    }

    /// `location` takes part in arithmetic: multiplication, division or shift if `mul`, else
    /// addition or subtraction
    pub fn arithmetic(&mut self, location: Location, mul: bool) {
        let bit = if mul { MUL_BIT } else { ADDSUB_BIT };
        if let Location::Memory(a) = location {
            self.memory.step(a, self.context.step);
        }
        self.constrain_flags(location, bit);
    }

    /// Drop all register evidence recorded at this PC so far
    pub fn clear(&mut self) {
        if let Some(m) = self.code.get_mut(self.map) {
            m.clear();
        }
    }
}
