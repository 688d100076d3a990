//! The trace tree: retired steps and recorded events, nested into call and interrupt blocks.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Parent links are plain indices, used
//! only to walk upwards.

use crate::arch::InstructionType;
use crate::error::{Error, Result};
use crate::memory_trace::Protection;
use crate::symbols::StaticSymbol;

pub type NodeId = usize;

/// One retired instruction
#[derive(Clone, Debug)]
pub struct Step {
    /// Position in the trace, strictly increasing
    pub step: u64,
    pub pc: u64,
    pub insn_type: InstructionType,
    pub register_reads: Vec<usize>,
    pub register_writes: Vec<usize>,
    /// Register values before the instruction executed
    pub registers: Vec<u64>,
    pub machine_code: Vec<u8>,
}

/// A call or interrupt frame
#[derive(Clone, Debug, Default)]
pub struct Block {
    /// The call instruction that entered this block
    pub head: Option<NodeId>,
    pub interrupt: bool,
    pub children: Vec<NodeId>,
    /// Register state on entry, if the trace recorded it separately from the head step
    pub head_state: Option<Vec<u64>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDefinition {
    pub id: u32,
    pub name: String,
}

/// Everything in a trace that is not a retired instruction
#[derive(Clone, Debug)]
pub enum Event {
    SymbolTable {
        file: String,
        load_bias: u64,
        symbols: Vec<StaticSymbol>,
    },
    Mmap {
        address: u64,
        length: u64,
        protection: Protection,
        filename: Option<String>,
        data: Option<Vec<u8>>,
        /// Result of the system call; negative on failure
        result: i64,
    },
    Memory {
        address: u64,
        size: usize,
        value: u128,
        write: bool,
        big_endian: bool,
    },
    MemoryDump {
        address: u64,
        data: Vec<u8>,
    },
    Brk {
        new_break: u64,
    },
    Io {
        channel: u32,
        input: bool,
        data: Vec<u8>,
    },
    DeviceDefinition {
        devices: Vec<DeviceDefinition>,
    },
    Device {
        id: u32,
        message: String,
    },
    DeviceRegister {
        id: u32,
        register: u32,
        value: u64,
        write: bool,
    },
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Step(Step),
    Block(Block),
    Event(Event),
}

#[derive(Clone, Debug)]
struct NodeEntry {
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// Arena of trace nodes. Node `0` is the root block.
#[derive(Clone, Debug)]
pub struct TraceTree {
    nodes: Vec<NodeEntry>,
}

impl Default for TraceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeEntry {
                parent: None,
                kind: NodeKind::Block(Block::default()),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Append `kind` as the last child of block `parent`
    pub fn push(&mut self, parent: NodeId, kind: NodeKind) -> Result<NodeId> {
        let id = self.nodes.len();
        match self.nodes.get_mut(parent).map(|n| &mut n.kind) {
            Some(NodeKind::Block(b)) => b.children.push(id),
            _ => {
                return Err(Error::IllegalState(format!(
                    "node {} is not a block and cannot have children",
                    parent
                )))
            }
        }
        self.nodes.push(NodeEntry {
            parent: Some(parent),
            kind,
        });
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id).map(|n| &n.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id)?.parent
    }

    pub fn step(&self, id: NodeId) -> Option<&Step> {
        match self.get(id)? {
            NodeKind::Step(s) => Some(s),
            _ => None,
        }
    }

    pub fn block(&self, id: NodeId) -> Option<&Block> {
        match self.get(id)? {
            NodeKind::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn block_mut(&mut self, id: NodeId) -> Option<&mut Block> {
        match self.nodes.get_mut(id).map(|n| &mut n.kind)? {
            NodeKind::Block(b) => Some(b),
            _ => None,
        }
    }

    /// The first step executed inside block `id`, looking into nested blocks
    pub fn first_step(&self, id: NodeId) -> Option<NodeId> {
        self.block(id)?
            .children
            .iter()
            .find_map(|&c| self.first_step_from(c))
    }

    fn first_step_from(&self, id: NodeId) -> Option<NodeId> {
        match self.get(id)? {
            NodeKind::Step(_) => Some(id),
            NodeKind::Block(_) => self.first_step(id),
            NodeKind::Event(_) => None,
        }
    }

    /// The step executed right after node `id`, in trace order. Leaving a block continues after
    /// it in the enclosing block.
    pub fn next_step(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = id;
        loop {
            let parent = self.parent(cur)?;
            let siblings = &self.block(parent)?.children;
            // Children are appended in id order
            let pos = siblings.binary_search(&cur).ok()?;
            if let Some(next) = siblings[pos + 1..]
                .iter()
                .find_map(|&s| self.first_step_from(s))
            {
                return Some(next);
            }
            cur = parent;
        }
    }

    /// All steps, in trace order
    pub fn steps(&self) -> impl Iterator<Item = (NodeId, &Step)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match &n.kind {
                NodeKind::Step(s) => Some((i, s)),
                _ => None,
            })
    }

    /// Register state on entry to block `id`: its recorded head state, else the state at its
    /// head instruction, else the state at its first step.
    pub fn entry_state(&self, id: NodeId) -> Option<&[u64]> {
        let block = self.block(id)?;
        if let Some(state) = &block.head_state {
            return Some(state);
        }
        let step = match block.head {
            Some(head) => self.step(head)?,
            None => self.step(self.first_step(id)?)?,
        };
        Some(&step.registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(pc: u64, n: u64) -> NodeKind {
        NodeKind::Step(Step {
            step: n,
            pc,
            insn_type: InstructionType::Other,
            register_reads: vec![],
            register_writes: vec![],
            registers: vec![n],
            machine_code: vec![],
        })
    }

    #[test]
    fn next_step_follows_execution_order() {
        let mut t = TraceTree::new();
        let root = t.root();
        let call = t.push(root, step(0x10, 0)).unwrap();
        let block = t
            .push(
                root,
                NodeKind::Block(Block {
                    head: Some(call),
                    ..Default::default()
                }),
            )
            .unwrap();
        let ev = t
            .push(block, NodeKind::Event(Event::Brk { new_break: 0 }))
            .unwrap();
        let inner = t.push(block, step(0x100, 1)).unwrap();
        let ret = t.push(block, step(0x104, 2)).unwrap();
        let after = t.push(root, step(0x14, 3)).unwrap();

        assert_eq!(t.next_step(call), Some(inner));
        assert_eq!(t.next_step(ev), Some(inner));
        assert_eq!(t.next_step(inner), Some(ret));
        assert_eq!(t.next_step(ret), Some(after));
        assert_eq!(t.next_step(after), None);
        assert_eq!(t.first_step(block), Some(inner));
        assert_eq!(t.parent(inner), Some(block));
        assert_eq!(t.entry_state(block), Some(&[0u64][..]));
        assert!(t.push(inner, step(0, 9)).is_err());
        assert_eq!(t.steps().count(), 4);
    }
}
