//! Instruction operands, as described by architecture decoders

/// A concrete storage location: the node key of the chain graph
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Location {
    Register(usize),
    Memory(u64),
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Register(r) => write!(f, "r{}", r),
            Location::Memory(a) => write!(f, "@{:#x}", a),
        }
    }
}

/// An operand as an instruction encodes it. Addressing is resolved into a [`Location`] with
/// [`Operand::resolve`] before any effect is recorded.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Operand {
    Register(usize),
    /// An immediate
    Constant(u64),
    /// Memory at an absolute address
    Memory(u64),
    /// Memory at `base (+ index) + offset`
    IndexedMemory {
        base: usize,
        index: Option<usize>,
        offset: i64,
    },
    /// Memory whose address is stored in memory at `base + offset`
    IndirectMemory { base: usize, offset: i64 },
    /// Memory whose address is stored in memory at `base + index + offset`
    IndirectIndexedMemory {
        base: usize,
        index: usize,
        offset: i64,
    },
}

/// What operand resolution needs to know about the machine at the current step
pub trait OperandContext {
    /// Value of register `r` before the current instruction executes
    fn register(&self, r: usize) -> Option<u64>;
    fn pointer_size(&self) -> usize;
    /// The pointer stored at `address`, as last seen in the trace
    fn read_pointer(&self, address: u64) -> Option<u64>;
}

impl Operand {
    /// Compute the location this operand refers to. Constants have no location; `None` is also
    /// returned when a register or pointer needed for the address is not available.
    pub fn resolve(&self, ctx: &dyn OperandContext) -> Option<Location> {
        let mask = address_mask(ctx.pointer_size());
        let indexed = |base: usize, index: Option<usize>, offset: i64| -> Option<u64> {
            let mut addr = ctx.register(base)?;
            if let Some(index) = index {
                addr = addr.wrapping_add(ctx.register(index)?);
            }
            Some(addr.wrapping_add(offset as u64) & mask)
        };
        match *self {
            Operand::Register(r) => Some(Location::Register(r)),
            Operand::Constant(_) => None,
            Operand::Memory(address) => Some(Location::Memory(address & mask)),
            Operand::IndexedMemory {
                base,
                index,
                offset,
            } => indexed(base, index, offset).map(Location::Memory),
            Operand::IndirectMemory { base, offset } => {
                let ptr = ctx.read_pointer(indexed(base, None, offset)?)?;
                Some(Location::Memory(ptr & mask))
            }
            Operand::IndirectIndexedMemory {
                base,
                index,
                offset,
            } => {
                let ptr = ctx.read_pointer(indexed(base, Some(index), offset)?)?;
                Some(Location::Memory(ptr & mask))
            }
        }
    }

    /// Registers whose values are read to form the address of this operand
    pub fn address_registers(&self) -> Vec<usize> {
        match *self {
            Operand::Register(_) | Operand::Constant(_) | Operand::Memory(_) => vec![],
            Operand::IndexedMemory { base, index, .. } => {
                std::iter::once(base).chain(index).collect()
            }
            Operand::IndirectMemory { base, .. } => vec![base],
            Operand::IndirectIndexedMemory { base, index, .. } => vec![base, index],
        }
    }
}

/// Mask that truncates an address to `pointer_size` bytes
pub fn address_mask(pointer_size: usize) -> u64 {
    if pointer_size >= 8 {
        u64::MAX
    } else {
        (1u64 << (pointer_size * 8)) - 1
    }
}
