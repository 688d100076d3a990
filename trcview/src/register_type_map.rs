//! Per-PC register type evidence and the code side of the chain graph.
//!
//! Every distinct program counter that retires gets one [`RegisterTypeMap`], interned into a
//! [`CodeTypeMap`] and addressed by a [`MapId`]. Maps never point at each other directly: all
//! edges are ids (or [`ChainTarget`]s, which embed ids), so the graph has no ownership cycles.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::Interner;
use crate::symbol_table::RegisterSet;
use crate::variable_type::{BREAK_BIT, CHAIN_BIT};

/// Index of a [`RegisterTypeMap`] inside its [`CodeTypeMap`]
pub type MapId = usize;

/// A node of the chain graph
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum ChainTarget {
    /// Register `register` as seen at the PC of map `map`
    Register { map: MapId, register: usize },
    /// The typed memory cell at `address` that was created at `step`
    Memory { address: u64, step: u64 },
}

/// Type evidence for every register at one PC
#[derive(Clone, Debug)]
pub struct RegisterTypeMap {
    pc: u64,
    flags: Vec<u64>,
    live: Vec<bool>,
    /// The map that executed right before this one, the first time around
    chain: Option<MapId>,
    /// Other predecessors
    extra_chain: UnorderedSet<MapId>,
    /// Successors
    forward_chain: UnorderedSet<MapId>,
    forward_targets: Vec<UnorderedSet<ChainTarget>>,
    reverse_targets: Vec<UnorderedSet<ChainTarget>>,
    /// Memory operands accessed at this PC, with the step of the cell last used
    memory_operands: UnorderedMap<u64, u64>,
}

impl RegisterTypeMap {
    pub fn new(pc: u64, register_count: usize) -> Self {
        Self {
            pc,
            flags: vec![CHAIN_BIT; register_count],
            live: vec![false; register_count],
            chain: None,
            extra_chain: Default::default(),
            forward_chain: Default::default(),
            forward_targets: (0..register_count).map(|_| Default::default()).collect(),
            reverse_targets: (0..register_count).map(|_| Default::default()).collect(),
            memory_operands: Default::default(),
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn register_count(&self) -> usize {
        self.flags.len()
    }

    /// Flags of `register`; zero for registers the architecture does not have
    pub fn get(&self, register: usize) -> u64 {
        self.flags.get(register).copied().unwrap_or(0)
    }

    pub fn set(&mut self, register: usize, flags: u64) {
        if let Some(f) = self.flags.get_mut(register) {
            *f = flags;
        }
    }

    /// Accumulate `flags` into `register`
    pub fn constrain(&mut self, register: usize, flags: u64) {
        if let Some(f) = self.flags.get_mut(register) {
            *f |= flags;
        }
    }

    /// Mark `register` as defined here: the value no longer flows in from the predecessor, and
    /// precise reverse links recorded so far are dropped.
    pub fn break_chain(&mut self, register: usize) {
        if let Some(f) = self.flags.get_mut(register) {
            *f = (*f & !CHAIN_BIT) | BREAK_BIT;
        }
        if let Some(t) = self.reverse_targets.get_mut(register) {
            t.clear();
        }
    }

    pub fn break_chains(&mut self, registers: &RegisterSet) {
        for r in registers.iter() {
            self.break_chain(r);
        }
    }

    /// Forget all evidence; every register chains to the predecessor again
    pub fn clear(&mut self) {
        for f in self.flags.iter_mut() {
            *f = CHAIN_BIT;
        }
    }

    pub fn is_live(&self, register: usize) -> bool {
        self.live.get(register).copied().unwrap_or(false)
    }

    pub fn set_live(&mut self, register: usize, live: bool) {
        if let Some(l) = self.live.get_mut(register) {
            *l = live;
        }
    }

    pub fn chain(&self) -> Option<MapId> {
        self.chain
    }

    pub fn extra_chain(&self) -> &UnorderedSet<MapId> {
        &self.extra_chain
    }

    pub fn forward_chain(&self) -> &UnorderedSet<MapId> {
        &self.forward_chain
    }

    pub fn forward_targets(&self, register: usize) -> impl Iterator<Item = &ChainTarget> {
        self.forward_targets.get(register).into_iter().flatten()
    }

    pub fn reverse_targets(&self, register: usize) -> impl Iterator<Item = &ChainTarget> {
        self.reverse_targets.get(register).into_iter().flatten()
    }

    pub fn add_forward_target(&mut self, register: usize, target: ChainTarget) {
        if let Some(t) = self.forward_targets.get_mut(register) {
            t.insert(target);
        }
    }

    pub fn add_reverse_target(&mut self, register: usize, target: ChainTarget) {
        if let Some(t) = self.reverse_targets.get_mut(register) {
            t.insert(target);
        }
    }

    /// Step of the memory cell that the operand at `address` last used at this PC
    pub fn memory_operand(&self, address: u64) -> Option<u64> {
        self.memory_operands.get(&address).copied()
    }

    pub fn record_memory_operand(&mut self, address: u64, step: u64) {
        self.memory_operands.insert(address, step);
    }

    pub fn memory_operands(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.memory_operands.iter().map(|(&a, &s)| (a, s))
    }

    /// Number of precise links, for statistics
    fn link_count(&self) -> usize {
        self.forward_targets
            .iter()
            .chain(self.reverse_targets.iter())
            .map(|t| t.len())
            .sum()
    }
}

/// All [`RegisterTypeMap`]s of a trace, keyed by PC
#[derive(Clone, Default)]
pub struct CodeTypeMap {
    pcs: Interner<u64>,
    maps: Vec<RegisterTypeMap>,
    register_count: usize,
}

impl CodeTypeMap {
    pub fn new(register_count: usize) -> Self {
        Self {
            pcs: Interner::new(),
            maps: vec![],
            register_count,
        }
    }

    /// The map for `pc`, created on first use
    pub fn intern(&mut self, pc: u64) -> MapId {
        let id = self.pcs.intern(pc);
        if id == self.maps.len() {
            self.maps.push(RegisterTypeMap::new(pc, self.register_count));
        }
        id
    }

    pub fn id(&self, pc: u64) -> Option<MapId> {
        self.pcs.index_of(&pc)
    }

    pub fn get(&self, id: MapId) -> Option<&RegisterTypeMap> {
        self.maps.get(id)
    }

    pub fn get_mut(&mut self, id: MapId) -> Option<&mut RegisterTypeMap> {
        self.maps.get_mut(id)
    }

    pub fn by_pc(&self, pc: u64) -> Option<&RegisterTypeMap> {
        self.get(self.id(pc)?)
    }

    pub fn by_pc_mut(&mut self, pc: u64) -> Option<&mut RegisterTypeMap> {
        let id = self.id(pc)?;
        self.get_mut(id)
    }

    /// Record that `id` executed right after `last`. The first predecessor of a map is its
    /// primary chain; any other predecessor goes into its extra chain.
    pub fn chain(&mut self, id: MapId, last: MapId) {
        if let Some(map) = self.maps.get_mut(id) {
            match map.chain {
                None => map.chain = Some(last),
                Some(c) if c == last => {}
                Some(_) => {
                    map.extra_chain.insert(last);
                }
            }
        }
        if let Some(prev) = self.maps.get_mut(last) {
            prev.forward_chain.insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }

    pub fn iter(&self) -> impl Iterator<Item = (MapId, &RegisterTypeMap)> {
        self.maps.iter().enumerate()
    }

    pub fn link_count(&self) -> usize {
        self.maps.iter().map(|m| m.link_count()).sum()
    }
}
