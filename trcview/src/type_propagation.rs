//! Dynamic type propagation over the chain graph.
//!
//! Every retired step is replayed through the architecture's [`Semantics`] description, which
//! records type evidence into the [`RegisterTypeMap`] of its PC and into the [`MemoryTypeMap`].
//! Resolution then walks the chain graph from a seed node and ORs together the evidence of
//! every node the value may have flowed through.

use crate::arch::Architecture;
use crate::containers::unordered::UnorderedSet;
use crate::error::Result;
use crate::log::*;
use crate::memory_trace::MemoryTrace;
use crate::memory_type_map::MemoryTypeMap;
use crate::node::Step;
use crate::operand::Location;
use crate::register_type_map::{ChainTarget, CodeTypeMap, MapId, RegisterTypeMap};
use crate::semantics::{Semantics, StepContext};
use crate::symbol_table::SymbolTable;
use crate::variable_type::{describe_flags, VariableType, ARITHMETIC_BITS, BREAK_BIT, CHAIN_BIT};
use crate::Cancel;

use std::collections::VecDeque;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TypeStatistics {
    pub steps: u64,
    pub maps: usize,
    pub links: usize,
    pub memory_cells: usize,
}

pub struct DynamicTypePropagation {
    pointer_size: usize,
    big_endian: bool,
    code: CodeTypeMap,
    memory: MemoryTypeMap,
    trails: Vec<UnorderedSet<MapId>>,
    last: Option<MapId>,
    last_step: u64,
    steps: u64,
}

impl DynamicTypePropagation {
    pub fn new(arch: &dyn Architecture) -> Self {
        Self {
            pointer_size: arch.pointer_size(),
            big_endian: arch.is_big_endian(),
            code: CodeTypeMap::new(arch.register_count()),
            memory: MemoryTypeMap::new(),
            trails: (0..arch.register_count()).map(|_| Default::default()).collect(),
            last: None,
            last_step: 0,
            steps: 0,
        }
    }

    /// Record the effects of `step`. `memory` is used to resolve indirect operands.
    pub fn step(
        &mut self,
        arch: &dyn Architecture,
        step: &Step,
        memory: Option<&MemoryTrace>,
    ) -> Result<()> {
        let id = self.code.intern(step.pc);
        if let Some(last) = self.last {
            self.code.chain(id, last);
        }
        self.last = Some(id);
        self.last_step = step.step;
        self.steps += 1;

        let context = StepContext {
            registers: &step.registers,
            pointer_size: self.pointer_size,
            big_endian: self.big_endian,
            step: step.step,
            memory,
        };
        let mut semantics =
            Semantics::new(&mut self.code, &mut self.memory, &mut self.trails, id, context);
        for &r in &step.register_reads {
            semantics.read(r);
        }
        for &r in &step.register_writes {
            semantics.write(r);
        }
        arch.emit_semantics(step, &mut semantics)
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    /// Step number of the last recorded step
    pub fn last_step(&self) -> u64 {
        self.last_step
    }

    /// The raw flags recorded for `register` at `pc`
    pub fn get(&self, pc: u64, register: usize) -> u64 {
        self.code.by_pc(pc).map_or(0, |m| m.get(register))
    }

    fn seed(&self, pc: u64, location: Location) -> Option<ChainTarget> {
        let map = self.code.id(pc)?;
        Some(match location {
            Location::Register(register) => ChainTarget::Register { map, register },
            Location::Memory(address) => ChainTarget::Memory {
                address,
                step: self.code.get(map)?.memory_operand(address).unwrap_or_else(|| {
                    self.memory
                        .cell(address, u64::MAX)
                        .map_or(0, |c| c.step)
                }),
            },
        })
    }

    /// All evidence for `location` as seen by the instruction at `pc`
    pub fn resolve(&self, pc: u64, location: Location) -> u64 {
        self.resolve_cancellable(pc, location, &|| false)
    }

    pub fn resolve_cancellable(&self, pc: u64, location: Location, cancel: Cancel<'_>) -> u64 {
        self.seed(pc, location)
            .map_or(0, |s| self.resolve_from_seed(s, false, None, cancel))
    }

    /// Like [`Self::resolve`], also returning every chain graph node that was visited
    pub fn resolve_with_nodes(&self, pc: u64, location: Location) -> (u64, Vec<ChainTarget>) {
        let mut nodes = vec![];
        let bits = self
            .seed(pc, location)
            .map_or(0, |s| self.resolve_from_seed(s, false, Some(&mut nodes), &|| false));
        (bits, nodes)
    }

    /// How the value of `location` at `pc` was computed: only the arithmetic bits, following
    /// the graph backwards
    pub fn resolve_data(&self, pc: u64, location: Location) -> u64 {
        self.seed(pc, location)
            .map_or(0, |s| self.resolve_from_seed(s, true, None, &|| false))
            & ARITHMETIC_BITS
    }

    /// All evidence for the memory cell at `address` that was current at `step`
    pub fn resolve_memory(&self, address: u64, step: u64) -> u64 {
        let step = self.memory.cell(address, step).map_or(0, |c| c.step);
        self.resolve_from_seed(
            ChainTarget::Memory { address, step },
            false,
            None,
            &|| false,
        )
    }

    /// Resolve `location` at `pc` all the way to a type
    pub fn resolve_type(&self, pc: u64, location: Location) -> Result<Option<VariableType>> {
        VariableType::resolve(self.resolve(pc, location), self.pointer_size)
    }

    fn resolve_from_seed(
        &self,
        seed: ChainTarget,
        backward_only: bool,
        mut visited_nodes: Option<&mut Vec<ChainTarget>>,
        cancel: Cancel<'_>,
    ) -> u64 {
        let mut bits = 0;
        let mut visited: UnorderedSet<ChainTarget> = UnorderedSet::new();
        let mut todo: VecDeque<ChainTarget> = VecDeque::new();
        todo.push_back(seed);

        while let Some(target) = todo.pop_front() {
            if !visited.insert(target) {
                continue;
            }
            if cancel() {
                debug!("Type resolution cancelled"; "visited" => visited.len());
                break;
            }
            if let Some(nodes) = visited_nodes.as_mut() {
                nodes.push(target);
            }

            match target {
                ChainTarget::Register { map: id, register } => {
                    let map = match self.code.get(id) {
                        Some(m) => m,
                        None => continue,
                    };
                    let value = map.get(register);
                    bits |= value;

                    // The value flows in from the predecessors
                    if value & CHAIN_BIT != 0 {
                        todo.extend(
                            map.extra_chain()
                                .iter()
                                .map(|&m| ChainTarget::Register { map: m, register }),
                        );
                        if let Some(prev) = map.chain() {
                            if value & BREAK_BIT == 0 {
                                todo.push_back(ChainTarget::Register {
                                    map: prev,
                                    register,
                                });
                            }
                        }
                    }
                    todo.extend(map.reverse_targets(register).copied());

                    if backward_only {
                        continue;
                    }

                    // ... and out to the successors that keep it
                    for &next in map.forward_chain().iter() {
                        if let Some(n) = self.code.get(next) {
                            let flags = n.get(register);
                            if flags & CHAIN_BIT != 0 && flags & BREAK_BIT == 0 {
                                todo.push_back(ChainTarget::Register {
                                    map: next,
                                    register,
                                });
                            }
                        }
                    }
                    todo.extend(map.forward_targets(register).copied());
                }
                ChainTarget::Memory { address, step } => {
                    let cell = match self.memory.cell(address, step) {
                        Some(c) => c,
                        None => continue,
                    };
                    bits |= cell.flags;
                    todo.extend(cell.reverse.iter().copied());
                    if !backward_only {
                        todo.extend(cell.forward.iter().copied());
                    }
                }
            }
        }

        bits
    }

    /// Whether the value of `register` at `pc` is read before it is overwritten
    pub fn is_live(&self, pc: u64, register: usize) -> bool {
        self.code.by_pc(pc).map_or(false, |m| m.is_live(register))
    }

    /// PC of the instruction that first executed right before `pc`
    pub fn get_chain(&self, pc: u64) -> Option<u64> {
        let prev = self.code.by_pc(pc)?.chain()?;
        Some(self.code.get(prev)?.pc())
    }

    /// Other predecessors of `pc`
    pub fn get_extra_chain(&self, pc: u64) -> Vec<&RegisterTypeMap> {
        self.code.by_pc(pc).map_or(vec![], |m| {
            m.extra_chain()
                .iter()
                .filter_map(|&id| self.code.get(id))
                .collect()
        })
    }

    /// Successors of `pc`
    pub fn get_forward_chain(&self, pc: u64) -> Vec<&RegisterTypeMap> {
        self.code.by_pc(pc).map_or(vec![], |m| {
            m.forward_chain()
                .iter()
                .filter_map(|&id| self.code.get(id))
                .collect()
        })
    }

    pub fn code_map(&self) -> &CodeTypeMap {
        &self.code
    }

    pub fn memory_map(&self) -> &MemoryTypeMap {
        &self.memory
    }

    /// Cut the chains at subroutine entries for registers the subroutine preserves, so that
    /// evidence from one caller does not leak into another through the callee.
    pub fn finish(&mut self, symbols: &SymbolTable) -> Result<()> {
        for sym in symbols.subroutines() {
            let unused = sym.unused_registers()?;
            if let Some(map) = self.code.by_pc_mut(sym.address()) {
                map.break_chains(unused);
            }
        }
        self.print_statistics();
        Ok(())
    }

    /// The resolved type of every memory cell touched during the trace, as of the end of the
    /// trace. Cells without a conclusive type are left out.
    pub fn recovered_memory_types(&self) -> Result<Vec<(u64, VariableType)>> {
        let mut types = vec![];
        for address in self.memory.used_addresses() {
            let bits = self.resolve_memory(address, self.last_step);
            match VariableType::resolve(bits, self.pointer_size)? {
                None | Some(VariableType::Unknown) | Some(VariableType::Conflict) => {}
                Some(ty) => types.push((address, ty)),
            }
        }
        Ok(types)
    }

    pub fn statistics(&self) -> TypeStatistics {
        TypeStatistics {
            steps: self.steps,
            maps: self.code.len(),
            links: self.code.link_count(),
            memory_cells: self.memory.cell_count(),
        }
    }

    pub fn print_statistics(&self) {
        let s = self.statistics();
        info!("Dynamic type propagation";
              "steps" => s.steps,
              "maps" => s.maps,
              "links" => s.links,
              "memory_cells" => s.memory_cells,
              "registers" => self.code.register_count());
    }

    /// Render the chain graph in GraphViz format
    pub fn generate_dot(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        enum Node {
            Code(MapId),
            Memory(u64, u64),
        }
        type Edge = (Node, Node, String);

        struct Graph<'a> {
            types: &'a DynamicTypePropagation,
        }

        fn node_of(t: &ChainTarget) -> Node {
            match *t {
                ChainTarget::Register { map, .. } => Node::Code(map),
                ChainTarget::Memory { address, step } => Node::Memory(address, step),
            }
        }

        fn get_nodes_and_edges(types: &DynamicTypePropagation) -> (Vec<Node>, Vec<Edge>) {
            let mut nodes = std::collections::BTreeSet::new();
            let mut edges: Vec<Edge> = vec![];
            for (id, map) in types.code.iter() {
                nodes.insert(Node::Code(id));
                if let Some(prev) = map.chain() {
                    edges.push((Node::Code(prev), Node::Code(id), "chain".into()));
                }
                for &prev in map.extra_chain().iter() {
                    edges.push((Node::Code(prev), Node::Code(id), "extra".into()));
                }
                for r in 0..map.register_count() {
                    for t in map.forward_targets(r) {
                        let label = match t {
                            ChainTarget::Register { register, .. } => {
                                format!("r{} -> r{}", r, register)
                            }
                            ChainTarget::Memory { .. } => format!("r{}", r),
                        };
                        nodes.insert(node_of(t));
                        edges.push((Node::Code(id), node_of(t), label));
                    }
                }
            }
            for address in types.memory.used_addresses() {
                for cell in types.memory.cells(address) {
                    let n = Node::Memory(address, cell.step);
                    nodes.insert(n);
                    for t in cell.forward.iter() {
                        nodes.insert(node_of(t));
                        edges.push((n, node_of(t), "fwd".into()));
                    }
                }
            }
            (nodes.into_iter().collect(), edges)
        }

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                match dot::Id::new("ChainGraph") {
                    Ok(id) => id,
                    Err(()) => unreachable!(),
                }
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                match dot::Id::new(match n {
                    Node::Code(id) => format!("m{}", id),
                    Node::Memory(address, step) => format!("a{:x}_{}", address, step),
                }) {
                    Ok(id) => id,
                    Err(()) => unreachable!(),
                }
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                match *n {
                    Node::Code(id) => {
                        let map = match self.types.code.get(id) {
                            Some(m) => m,
                            None => return dot::LabelText::label("?"),
                        };
                        let mut text = format!("{:#x}\\l", map.pc());
                        for r in 0..map.register_count() {
                            if map.get(r) != CHAIN_BIT {
                                text += &format!("r{}: {}\\l", r, describe_flags(map.get(r)));
                            }
                        }
                        dot::LabelText::escaped(text)
                    }
                    Node::Memory(address, step) => dot::LabelText::label(format!(
                        "@{:#x} #{}: {}",
                        address,
                        step,
                        describe_flags(self.types.memory.get(address, step))
                    )),
                }
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                match n {
                    Node::Code(_) => Some(dot::LabelText::label("box")),
                    Node::Memory(..) => None,
                }
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(e.2.clone())
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                get_nodes_and_edges(self.types).0.into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                get_nodes_and_edges(self.types).1.into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&Graph { types: self }, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::InstructionType;
    use crate::variable_type::mask_of;
    use VariableType::*;

    /// Decodes nothing; every step's effect is given by a closure keyed by PC
    struct ScriptedArch(fn(u64, &mut Semantics<'_>));

    impl Architecture for ScriptedArch {
        fn name(&self) -> &str {
            "scripted"
        }
        fn register_count(&self) -> usize {
            4
        }
        fn pointer_size(&self) -> usize {
            2
        }
        fn max_instruction_length(&self) -> usize {
            2
        }
        fn decode_length(&self, _pc: u64, _code: &[u8]) -> u32 {
            2
        }
        fn decode_type(&self, _pc: u64, _code: &[u8]) -> Option<InstructionType> {
            Some(InstructionType::Other)
        }
        fn branch_target(&self, _pc: u64, _code: &[u8]) -> Option<u64> {
            None
        }
        fn emit_semantics(&self, step: &Step, semantics: &mut Semantics<'_>) -> Result<()> {
            (self.0)(step.pc, semantics);
            Ok(())
        }
    }

    fn step(n: u64, pc: u64, reads: &[usize], writes: &[usize]) -> Step {
        Step {
            step: n,
            pc,
            insn_type: InstructionType::Other,
            register_reads: reads.to_vec(),
            register_writes: writes.to_vec(),
            registers: vec![0; 4],
            machine_code: vec![],
        }
    }

    fn run(arch: &ScriptedArch, steps: &[Step]) -> DynamicTypePropagation {
        let mut types = DynamicTypePropagation::new(arch);
        for s in steps {
            types.step(arch, s, None).unwrap();
        }
        types
    }

    #[test]
    fn evidence_flows_through_untouched_instructions() {
        let arch = ScriptedArch(|pc, s| match pc {
            0x100 => s.set(Location::Register(1), U16),
            0x104 => s.constrain(Location::Register(1), I16),
            _ => {}
        });
        let types = run(
            &arch,
            &[
                step(0, 0x100, &[], &[1]),
                step(1, 0x102, &[], &[]),
                step(2, 0x104, &[1], &[]),
            ],
        );
        let bits = types.resolve(0x102, Location::Register(1));
        assert_eq!(bits & mask_of(&[U16, I16]), mask_of(&[U16, I16]));
        assert_eq!(
            types.resolve_type(0x102, Location::Register(1)).unwrap(),
            Some(U16)
        );
        assert!(types.is_live(0x102, 1));
        assert!(!types.is_live(0x100, 1));
        assert_eq!(types.get_chain(0x104), Some(0x102));
        assert_eq!(types.get_forward_chain(0x100)[0].pc(), 0x102);
        assert!(types.get_extra_chain(0x102).is_empty());
        assert_eq!(types.resolve(0x999, Location::Register(1)), 0);
    }

    #[test]
    fn constrained_value_reaches_back_without_later_reads() {
        let arch = ScriptedArch(|pc, s| match pc {
            0x100 => s.set(Location::Register(1), U16),
            0x104 => s.constrain(Location::Register(1), I16),
            _ => {}
        });
        let types = run(
            &arch,
            &[
                step(0, 0x100, &[], &[1]),
                step(1, 0x102, &[], &[]),
                step(2, 0x104, &[], &[]),
            ],
        );
        assert!(!types.is_live(0x102, 1));
        assert!(!types.is_live(0x104, 1));
        for pc in [0x102, 0x104] {
            let bits = types.resolve(pc, Location::Register(1));
            assert_eq!(bits & mask_of(&[U16, I16]), mask_of(&[U16, I16]), "{:#x}", pc);
        }
        assert_eq!(
            types.resolve_type(0x104, Location::Register(1)).unwrap(),
            Some(U16)
        );
    }

    #[test]
    fn moves_link_source_and_destination() {
        let arch = ScriptedArch(|pc, s| match pc {
            0x10 => s.set(Location::Register(0), PointerU8),
            0x12 => s.move_value(Location::Register(1), Some(Location::Register(0)), I16),
            0x14 => s.move_value(Location::Memory(0x200), Some(Location::Register(1)), I16),
            0x16 => s.arithmetic(Location::Register(1), true),
            _ => {}
        });
        let types = run(
            &arch,
            &[
                step(0, 0x10, &[], &[0]),
                step(1, 0x12, &[0], &[1]),
                step(2, 0x14, &[1], &[]),
                step(3, 0x16, &[1], &[1]),
            ],
        );
        // Same width register move: the source is not constrained to I16
        assert_eq!(types.get(0x12, 0) & I16.mask(), 0);
        let bits = types.resolve(0x12, Location::Register(1));
        assert!(PointerU8.test(bits));
        assert!(PointerU8.test(types.resolve_memory(0x200, 2)));
        assert!(I16.test(types.resolve_memory(0x200, 2)));
        assert_eq!(types.resolve_data(0x16, Location::Register(1)), crate::variable_type::MUL_BIT);
        assert_eq!(types.resolve_data(0x12, Location::Register(1)), 0);

        let mut dot = vec![];
        types.generate_dot(&mut dot).unwrap();
        let dot = String::from_utf8(dot).unwrap();
        assert!(dot.starts_with("digraph ChainGraph"));
        assert!(dot.contains("r0 -> r1"));
    }

    #[test]
    fn resolution_terminates_on_cycles() {
        let arch = ScriptedArch(|pc, s| match pc {
            0x20 => s.move_value(Location::Register(1), Some(Location::Register(2)), I8),
            0x22 => s.move_value(Location::Register(2), Some(Location::Register(1)), I8),
            _ => {}
        });
        let mut steps = vec![];
        for i in 0..10 {
            steps.push(step(2 * i, 0x20, &[2], &[1]));
            steps.push(step(2 * i + 1, 0x22, &[1], &[2]));
        }
        let types = run(&arch, &steps);
        assert!(I8.test(types.resolve(0x20, Location::Register(1))));
        assert!(I8.test(types.resolve(0x22, Location::Register(2))));
        assert_eq!(types.get_chain(0x20), Some(0x22));
        assert_eq!(types.statistics().steps, 20);
    }

    #[test]
    fn memory_operand_sees_its_own_cell() {
        let arch = ScriptedArch(|pc, s| match pc {
            0x30 => s.set(Location::Memory(0x400), I8),
            0x32 => s.set(Location::Memory(0x400), F32),
            0x34 => s.constrain(Location::Memory(0x400), I8),
            _ => {}
        });
        let types = run(
            &arch,
            &[step(1, 0x30, &[], &[]), step(2, 0x32, &[], &[]), step(3, 0x34, &[], &[])],
        );
        let at_30 = types.resolve(0x30, Location::Memory(0x400));
        assert!(I8.test(at_30));
        assert!(!F32.test(at_30));
        let at_34 = types.resolve(0x34, Location::Memory(0x400));
        assert!(F32.test(at_34) && I8.test(at_34));
        assert!(types.recovered_memory_types().unwrap().is_empty());
    }
}
