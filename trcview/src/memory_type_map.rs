//! Type evidence for memory cells, versioned by the step at which a cell was (re)defined.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::register_type_map::ChainTarget;

#[derive(Clone, Debug, Default)]
pub struct TypedMemoryCell {
    pub step: u64,
    pub flags: u64,
    pub forward: UnorderedSet<ChainTarget>,
    pub reverse: UnorderedSet<ChainTarget>,
}

impl TypedMemoryCell {
    fn new(step: u64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }
}

/// Per-address list of typed cells, oldest first
#[derive(Clone, Debug, Default)]
pub struct MemoryTypeMap {
    cells: UnorderedMap<u64, Vec<TypedMemoryCell>>,
}

impl MemoryTypeMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Start a new version of `address` at `step`. A cell that already started at `step` is
    /// reused.
    pub fn step(&mut self, address: u64, step: u64) {
        let cells = self.cells.entry(address).or_default();
        if cells.last().map_or(true, |c| c.step != step) {
            cells.push(TypedMemoryCell::new(step));
        }
    }

    fn last(&mut self, address: u64) -> &mut TypedMemoryCell {
        let cells = self.cells.entry(address).or_default();
        if cells.is_empty() {
            cells.push(TypedMemoryCell::new(0));
        }
        let idx = cells.len() - 1;
        &mut cells[idx]
    }

    /// Step of the current version of `address`, allocating a step 0 cell if there is none
    pub fn current_step(&mut self, address: u64) -> u64 {
        self.last(address).step
    }

    /// Every version of `address`, oldest first
    pub fn cells(&self, address: u64) -> &[TypedMemoryCell] {
        self.cells.get(&address).map_or(&[], |c| c)
    }

    /// The version of `address` that was current at `step`
    pub fn cell(&self, address: u64, step: u64) -> Option<&TypedMemoryCell> {
        let cells = self.cells.get(&address)?;
        let idx = cells.partition_point(|c| c.step <= step);
        idx.checked_sub(1).map(|i| &cells[i])
    }

    pub fn get(&self, address: u64, step: u64) -> u64 {
        self.cell(address, step).map_or(0, |c| c.flags)
    }

    pub fn set(&mut self, address: u64, flags: u64) {
        self.last(address).flags = flags;
    }

    pub fn constrain(&mut self, address: u64, flags: u64) {
        self.last(address).flags |= flags;
    }

    pub fn forward_chain(&mut self, address: u64, target: ChainTarget) {
        self.last(address).forward.insert(target);
    }

    pub fn reverse_chain(&mut self, address: u64, target: ChainTarget) {
        self.last(address).reverse.insert(target);
    }

    pub fn used_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.cells
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(&a, _)| a)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.values().map(|c| c.len()).sum()
    }
}
