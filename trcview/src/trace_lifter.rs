//! A lifter from textual trace listings.
//!
//! A listing is line based. Lines starting with `#` are comments and blank lines are ignored.
//! Numbers are decimal or `0x`-prefixed hex. The first non-comment line names the architecture:
//!
//! ```text
//! arch NAME regs N ptr P [system] [big]
//! step PC TYPE [target=T] [len=L] [r=REG,..] [w=REG,..] [state=V,V,..] [sem OP; OP; ..]
//! call | irq
//! ret
//! mmap ADDR LEN PROT NAME|- [data=HEX] [result=N]
//! brk ADDR
//! mem r|w ADDR SIZE VALUE [be]
//! dump ADDR HEX
//! sym NAME VALUE SIZE func|object|section|notype [bias=B]
//! io CHANNEL in|out TEXT
//! device ID NAME
//! devev ID TEXT
//! devreg ID REG VALUE r|w
//! ```
//!
//! `call` and `irq` open a block whose head is the previous step, `ret` closes the innermost one.
//! Decoding is given per PC by the `step` lines themselves: their type, branch target, length and
//! `sem` clause become the [`ListingArchitecture`]. Semantic operations are `read R`, `write R`,
//! `set LOC TYPE`, `constrain LOC TYPE`, `move DST SRC TYPE`, `movi DST TYPE`, `unify A B`,
//! `add LOC`, `mul LOC` and `reset LOC`, where a LOC is `rN`, `@ADDR`, `[rB+rI+OFF]` or
//! `*[rB+OFF]`, and a move source may also be an immediate `#V`.

use crate::analysis::Analysis;
use crate::arch::{Architecture, InstructionType};
use crate::containers::unordered::UnorderedMap;
use crate::error::{malformed, Error, Result};
use crate::log::*;
use crate::memory_trace::Protection;
use crate::node::{Block, DeviceDefinition, Event, NodeId, NodeKind, Step, TraceTree};
use crate::operand::Operand;
use crate::semantics::Semantics;
use crate::symbols::{StaticSymbol, StaticSymbolKind, StaticSymbolTable};
use crate::variable_type::VariableType;
use crate::Cancel;

use std::path::Path;

use itertools::Itertools;

/// One decoder-side call into [`Semantics`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SemanticOp {
    Read(usize),
    Write(usize),
    Set(Operand, VariableType),
    Constrain(Operand, VariableType),
    Move(Operand, Operand, VariableType),
    MoveImmediate(Operand, VariableType),
    Unify(Operand, Operand),
    Add(Operand),
    Mul(Operand),
    Reset(Operand),
}

/// How the instruction at one PC decodes
#[derive(Clone, Debug, PartialEq, Eq)]
struct Decoding {
    insn_type: InstructionType,
    length: u32,
    target: Option<u64>,
    semantics: Vec<SemanticOp>,
}

/// An architecture whose instructions are described by the listing it was lifted from
#[derive(Clone, Debug)]
pub struct ListingArchitecture {
    name: String,
    register_count: usize,
    pointer_size: usize,
    system_level: bool,
    big_endian: bool,
    decodings: UnorderedMap<u64, Decoding>,
}

impl ListingArchitecture {
    pub fn new(
        name: &str,
        register_count: usize,
        pointer_size: usize,
        system_level: bool,
        big_endian: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            register_count,
            pointer_size,
            system_level,
            big_endian,
            decodings: Default::default(),
        }
    }

    /// Semantic operations of the instruction at `pc`
    pub fn semantic_ops(&self, pc: u64) -> &[SemanticOp] {
        self.decodings.get(&pc).map_or(&[], |d| &d.semantics)
    }
}

impl Architecture for ListingArchitecture {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_count(&self) -> usize {
        self.register_count
    }

    fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    fn is_system_level(&self) -> bool {
        self.system_level
    }

    fn max_instruction_length(&self) -> usize {
        1
    }

    fn decode_length(&self, pc: u64, _code: &[u8]) -> u32 {
        self.decodings.get(&pc).map_or(0, |d| d.length)
    }

    fn decode_type(&self, pc: u64, _code: &[u8]) -> Option<InstructionType> {
        self.decodings.get(&pc).map(|d| d.insn_type)
    }

    fn branch_target(&self, pc: u64, _code: &[u8]) -> Option<u64> {
        self.decodings.get(&pc)?.target
    }

    fn emit_semantics(&self, step: &Step, semantics: &mut Semantics<'_>) -> Result<()> {
        let decoding = self
            .decodings
            .get(&step.pc)
            .ok_or(Error::DecodeFailure { pc: step.pc })?;
        for op in &decoding.semantics {
            let loc = |semantics: &Semantics<'_>, o: &Operand| {
                let l = semantics.location(o);
                if l.is_none() {
                    trace!("Operand has no location"; "pc" => Hex(step.pc), "operand" => ?o);
                }
                l
            };
            match op {
                SemanticOp::Read(r) => semantics.read(*r),
                SemanticOp::Write(r) => semantics.write(*r),
                SemanticOp::Set(o, ty) => {
                    if let Some(l) = loc(semantics, o) {
                        semantics.set(l, *ty)
                    }
                }
                SemanticOp::Constrain(o, ty) => {
                    if let Some(l) = loc(semantics, o) {
                        semantics.constrain(l, *ty)
                    }
                }
                SemanticOp::Move(dst, src, ty) => {
                    if let Some(d) = loc(semantics, dst) {
                        let s = match src {
                            Operand::Constant(_) => None,
                            src => loc(semantics, src),
                        };
                        semantics.move_value(d, s, *ty)
                    }
                }
                SemanticOp::MoveImmediate(o, ty) => {
                    if let Some(l) = loc(semantics, o) {
                        semantics.move_value(l, None, *ty)
                    }
                }
                SemanticOp::Unify(a, b) => {
                    if let (Some(a), Some(b)) = (loc(semantics, a), loc(semantics, b)) {
                        semantics.unify(a, b)
                    }
                }
                SemanticOp::Add(o) => {
                    if let Some(l) = loc(semantics, o) {
                        semantics.arithmetic(l, false)
                    }
                }
                SemanticOp::Mul(o) => {
                    if let Some(l) = loc(semantics, o) {
                        semantics.arithmetic(l, true)
                    }
                }
                SemanticOp::Reset(o) => {
                    if let Some(l) = loc(semantics, o) {
                        semantics.reset(l)
                    }
                }
            }
        }
        Ok(())
    }
}

/// A lifted listing
pub struct TraceListing {
    pub tree: TraceTree,
    pub arch: ListingArchitecture,
    /// Nodes in the order they have to be processed: steps and events as they appear, blocks
    /// when they are closed
    pub order: Vec<NodeId>,
}

impl TraceListing {
    /// Run the complete analysis over the listing
    pub fn analyze(self, cancel: Cancel<'_>) -> Result<(Analysis, TraceTree)> {
        let TraceListing { tree, arch, order } = self;
        let mut analysis = Analysis::new(Box::new(arch), StaticSymbolTable::new());
        for node in order {
            analysis.process(&tree, node)?;
        }
        analysis.finish(&tree, cancel)?;
        Ok((analysis, tree))
    }
}

pub fn lift_from_file(path: &Path) -> Result<TraceListing> {
    let listing = std::fs::read_to_string(path)?;
    lift_from(&listing)
}

/// Lift a listing into a trace tree and the architecture it describes
pub fn lift_from(listing: &str) -> Result<TraceListing> {
    let mut lines = listing
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

    let arch = match lines.next() {
        Some((n, l)) => parse_arch(n, l)?,
        None => return Err(malformed!(0, "empty listing")),
    };
    let mut lifter = Lifter {
        tree: TraceTree::new(),
        order: vec![],
        blocks: vec![],
        last_step: None,
        state: vec![0; arch.register_count],
        step: 0,
        arch,
    };
    let root = lifter.tree.root();
    lifter.blocks.push(root);
    for (n, l) in lines {
        lifter.line(n, l)?;
    }
    if lifter.blocks.len() > 1 {
        warn!("Listing ends inside blocks"; "open" => lifter.blocks.len() - 1);
    }
    debug!("Lifted listing";
           "arch" => lifter.arch.name(),
           "nodes" => lifter.tree.len(),
           "steps" => lifter.step,
           "instructions" => lifter.arch.decodings.len());
    Ok(TraceListing {
        tree: lifter.tree,
        arch: lifter.arch,
        order: lifter.order,
    })
}

fn parse_arch(n: usize, l: &str) -> Result<ListingArchitecture> {
    let tokens = l.split_whitespace().collect::<Vec<_>>();
    match &tokens[..] {
        ["arch", name, "regs", regs, "ptr", ptr, flags @ ..] => {
            let mut system = false;
            let mut big = false;
            for &f in flags {
                match f {
                    "system" => system = true,
                    "big" => big = true,
                    f => return Err(malformed!(n, "unknown architecture flag {:?}", f)),
                }
            }
            Ok(ListingArchitecture::new(
                name,
                number(n, regs)? as usize,
                number(n, ptr)? as usize,
                system,
                big,
            ))
        }
        _ => Err(malformed!(n, "expected `arch NAME regs N ptr P`, got {:?}", l)),
    }
}

struct Lifter {
    tree: TraceTree,
    order: Vec<NodeId>,
    /// Open blocks, innermost last
    blocks: Vec<NodeId>,
    last_step: Option<NodeId>,
    /// Register state carried over to steps that do not give one
    state: Vec<u64>,
    step: u64,
    arch: ListingArchitecture,
}

impl Lifter {
    fn current_block(&self) -> NodeId {
        self.blocks.last().copied().unwrap_or_else(|| self.tree.root())
    }

    fn push(&mut self, kind: NodeKind) -> Result<NodeId> {
        let parent = self.current_block();
        self.tree.push(parent, kind)
    }

    fn event(&mut self, event: Event) -> Result<()> {
        let id = self.push(NodeKind::Event(event))?;
        self.order.push(id);
        Ok(())
    }

    fn line(&mut self, n: usize, l: &str) -> Result<()> {
        let (keyword, rest) = l.split_once(char::is_whitespace).unwrap_or((l, ""));
        let rest = rest.trim();
        let tokens = rest.split_whitespace().collect::<Vec<_>>();
        match (keyword, &tokens[..]) {
            ("step", _) => self.step_line(n, rest),
            ("call", []) | ("irq", []) => {
                let block = Block {
                    head: self.last_step,
                    interrupt: keyword == "irq",
                    ..Default::default()
                };
                let block = self.push(NodeKind::Block(block))?;
                self.blocks.push(block);
                Ok(())
            }
            ("ret", []) => {
                if self.blocks.len() <= 1 {
                    return Err(malformed!(n, "`ret` outside of a block"));
                }
                if let Some(block) = self.blocks.pop() {
                    self.order.push(block);
                }
                Ok(())
            }
            ("mmap", [address, length, protection, name, options @ ..]) => {
                let mut data = None;
                let mut result = 0;
                for o in options {
                    match o.split_once('=') {
                        Some(("data", d)) => data = Some(hex_bytes(n, d)?),
                        Some(("result", r)) => {
                            result = r
                                .parse()
                                .map_err(|_| malformed!(n, "bad mmap result {:?}", r))?
                        }
                        _ => return Err(malformed!(n, "unknown mmap option {:?}", o)),
                    }
                }
                self.event(Event::Mmap {
                    address: number(n, address)?,
                    length: number(n, length)?,
                    protection: Protection::parse(protection)
                        .ok_or_else(|| malformed!(n, "bad protection {:?}", protection))?,
                    filename: (*name != "-").then(|| name.to_string()),
                    data,
                    result,
                })
            }
            ("brk", [address]) => self.event(Event::Brk {
                new_break: number(n, address)?,
            }),
            ("mem", [rw, address, size, value, options @ ..]) => {
                let big_endian = match options {
                    [] => false,
                    ["be"] => true,
                    _ => return Err(malformed!(n, "unknown memory options {:?}", options)),
                };
                let value = wide_number(n, value)?;
                self.event(Event::Memory {
                    address: number(n, address)?,
                    size: number(n, size)? as usize,
                    value,
                    write: read_or_write(n, rw)?,
                    big_endian,
                })
            }
            ("dump", [address, data]) => self.event(Event::MemoryDump {
                address: number(n, address)?,
                data: hex_bytes(n, data)?,
            }),
            ("sym", [name, value, size, kind, options @ ..]) => {
                let kind = match *kind {
                    "func" => StaticSymbolKind::Func,
                    "object" => StaticSymbolKind::Object,
                    "section" => StaticSymbolKind::Section,
                    "notype" => StaticSymbolKind::NoType,
                    k => return Err(malformed!(n, "unknown symbol kind {:?}", k)),
                };
                let load_bias = match options {
                    [] => 0,
                    [o] => match o.strip_prefix("bias=") {
                        Some(b) => number(n, b)?,
                        None => return Err(malformed!(n, "unknown symbol option {:?}", o)),
                    },
                    _ => return Err(malformed!(n, "too many symbol options")),
                };
                self.event(Event::SymbolTable {
                    file: "listing".to_string(),
                    load_bias,
                    symbols: vec![StaticSymbol {
                        name: name.to_string(),
                        value: number(n, value)?,
                        size: number(n, size)?,
                        kind,
                    }],
                })
            }
            ("io", [channel, direction, ..]) => {
                let input = match *direction {
                    "in" => true,
                    "out" => false,
                    d => return Err(malformed!(n, "expected `in` or `out`, got {:?}", d)),
                };
                let text = rest
                    .splitn(3, char::is_whitespace)
                    .nth(2)
                    .unwrap_or("")
                    .trim_start();
                self.event(Event::Io {
                    channel: number(n, channel)? as u32,
                    input,
                    data: text.as_bytes().to_vec(),
                })
            }
            ("device", [id, name]) => self.event(Event::DeviceDefinition {
                devices: vec![DeviceDefinition {
                    id: number(n, id)? as u32,
                    name: name.to_string(),
                }],
            }),
            ("devev", [id, ..]) => {
                let message = rest
                    .split_once(char::is_whitespace)
                    .map_or("", |(_, m)| m.trim_start());
                self.event(Event::Device {
                    id: number(n, id)? as u32,
                    message: message.to_string(),
                })
            }
            ("devreg", [id, register, value, rw]) => self.event(Event::DeviceRegister {
                id: number(n, id)? as u32,
                register: number(n, register)? as u32,
                value: number(n, value)?,
                write: read_or_write(n, rw)?,
            }),
            (k, _) => Err(malformed!(n, "cannot parse {:?} line {:?}", k, l)),
        }
    }

    fn step_line(&mut self, n: usize, rest: &str) -> Result<()> {
        let (head, sem) = match rest.split_once(" sem ") {
            Some((head, sem)) => (head, Some(sem)),
            None => (rest, None),
        };
        let tokens = head.split_whitespace().collect::<Vec<_>>();
        let (pc, insn_type, options) = match &tokens[..] {
            [pc, ty, options @ ..] => (
                number(n, pc)?,
                InstructionType::from_name(ty)
                    .ok_or_else(|| malformed!(n, "unknown instruction type {:?}", ty))?,
                options,
            ),
            _ => return Err(malformed!(n, "expected `step PC TYPE`")),
        };

        let mut target = None;
        let mut length = None;
        let mut register_reads = vec![];
        let mut register_writes = vec![];
        for o in options {
            match o.split_once('=') {
                Some(("target", t)) => target = Some(number(n, t)?),
                Some(("len", l)) => length = Some(number(n, l)? as u32),
                Some(("r", r)) => register_reads = self.registers(n, r)?,
                Some(("w", w)) => register_writes = self.registers(n, w)?,
                Some(("state", s)) => {
                    let state = s.split(',').map(|v| number(n, v)).collect::<Result<Vec<_>>>()?;
                    if state.len() != self.arch.register_count {
                        return Err(malformed!(
                            n,
                            "state has {} registers, expected {}",
                            state.len(),
                            self.arch.register_count
                        ));
                    }
                    self.state = state;
                }
                _ => return Err(malformed!(n, "unknown step option {:?}", o)),
            }
        }
        let semantics = match sem {
            Some(sem) => Some(
                sem.split(';')
                    .map(str::trim)
                    .filter(|op| !op.is_empty())
                    .map(|op| self.semantic_op(n, op))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        self.define(n, pc, insn_type, target, length, semantics)?;

        let step = Step {
            step: self.step,
            pc,
            insn_type,
            register_reads,
            register_writes,
            registers: self.state.clone(),
            machine_code: vec![],
        };
        self.step += 1;
        let id = self.push(NodeKind::Step(step))?;
        self.order.push(id);
        self.last_step = Some(id);
        Ok(())
    }

    /// Merge what a step line says about the instruction at `pc` into its decoding. Restating a
    /// known detail is fine, contradicting it is not.
    fn define(
        &mut self,
        n: usize,
        pc: u64,
        insn_type: InstructionType,
        target: Option<u64>,
        length: Option<u32>,
        semantics: Option<Vec<SemanticOp>>,
    ) -> Result<()> {
        let d = self.arch.decodings.entry(pc).or_insert_with(|| Decoding {
            insn_type,
            length: 1,
            target: None,
            semantics: vec![],
        });
        if d.insn_type != insn_type {
            return Err(malformed!(n, "conflicting instruction type at {:#x}", pc));
        }
        if let Some(t) = target {
            match d.target.replace(t) {
                Some(old) if old != t => {
                    return Err(malformed!(n, "conflicting branch target at {:#x}", pc))
                }
                _ => {}
            }
        }
        if let Some(l) = length {
            if l == 0 {
                return Err(malformed!(n, "zero instruction length"));
            }
            d.length = l;
        }
        if let Some(s) = semantics {
            if !d.semantics.is_empty() && d.semantics != s {
                return Err(malformed!(n, "conflicting semantics at {:#x}", pc));
            }
            d.semantics = s;
        }
        Ok(())
    }

    fn register(&self, n: usize, r: &str) -> Result<usize> {
        let idx = r
            .strip_prefix('r')
            .and_then(|r| r.parse::<usize>().ok())
            .ok_or_else(|| malformed!(n, "bad register {:?}", r))?;
        if idx >= self.arch.register_count {
            return Err(malformed!(n, "register {} out of range", r));
        }
        Ok(idx)
    }

    fn registers(&self, n: usize, list: &str) -> Result<Vec<usize>> {
        list.split(',')
            .filter(|r| !r.is_empty())
            .map(|r| self.register(n, r))
            .collect()
    }

    fn operand(&self, n: usize, o: &str) -> Result<Operand> {
        if let Some(v) = o.strip_prefix('#') {
            return Ok(Operand::Constant(number(n, v)?));
        }
        if let Some(a) = o.strip_prefix('@') {
            return Ok(Operand::Memory(number(n, a)?));
        }
        let (indirect, o) = match o.strip_prefix('*') {
            Some(o) => (true, o),
            None => (false, o),
        };
        let inner = match o.strip_prefix('[').and_then(|o| o.strip_suffix(']')) {
            Some(inner) => inner,
            None if !indirect => return Ok(Operand::Register(self.register(n, o)?)),
            None => return Err(malformed!(n, "bad operand {:?}", o)),
        };

        // Split into signed terms
        let mut registers = vec![];
        let mut offset = 0i64;
        let mut start = 0;
        let bytes = inner.as_bytes();
        for i in 1..=bytes.len() {
            if i == bytes.len() || bytes[i] == b'+' || bytes[i] == b'-' {
                let term = inner[start..i].trim();
                let (negative, term) = match term.as_bytes().first() {
                    Some(b'-') => (true, &term[1..]),
                    Some(b'+') => (false, &term[1..]),
                    _ => (false, term),
                };
                if term.starts_with('r') {
                    if negative {
                        return Err(malformed!(n, "negative register in {:?}", o));
                    }
                    registers.push(self.register(n, term)?);
                } else {
                    let v = number(n, term)? as i64;
                    offset = if negative {
                        offset.wrapping_sub(v)
                    } else {
                        offset.wrapping_add(v)
                    };
                }
                start = i;
            }
        }
        Ok(match (indirect, &registers[..]) {
            (false, [base]) => Operand::IndexedMemory {
                base: *base,
                index: None,
                offset,
            },
            (false, [base, index]) => Operand::IndexedMemory {
                base: *base,
                index: Some(*index),
                offset,
            },
            (true, [base]) => Operand::IndirectMemory {
                base: *base,
                offset,
            },
            (true, [base, index]) => Operand::IndirectIndexedMemory {
                base: *base,
                index: *index,
                offset,
            },
            _ => return Err(malformed!(n, "bad memory operand {:?}", o)),
        })
    }

    fn semantic_op(&self, n: usize, op: &str) -> Result<SemanticOp> {
        let tokens = op.split_whitespace().collect::<Vec<_>>();
        let ty = |t: &str| {
            VariableType::from_name(t).ok_or_else(|| malformed!(n, "unknown type {:?}", t))
        };
        Ok(match &tokens[..] {
            ["read", r] => SemanticOp::Read(self.register(n, r)?),
            ["write", r] => SemanticOp::Write(self.register(n, r)?),
            ["set", l, t] => SemanticOp::Set(self.operand(n, l)?, ty(t)?),
            ["constrain", l, t] => SemanticOp::Constrain(self.operand(n, l)?, ty(t)?),
            ["move", d, s, t] => SemanticOp::Move(self.operand(n, d)?, self.operand(n, s)?, ty(t)?),
            ["movi", d, t] => SemanticOp::MoveImmediate(self.operand(n, d)?, ty(t)?),
            ["unify", a, b] => SemanticOp::Unify(self.operand(n, a)?, self.operand(n, b)?),
            ["add", l] => SemanticOp::Add(self.operand(n, l)?),
            ["mul", l] => SemanticOp::Mul(self.operand(n, l)?),
            ["reset", l] => SemanticOp::Reset(self.operand(n, l)?),
            _ => return Err(malformed!(n, "unknown semantic operation {:?}", op)),
        })
    }
}

fn number(n: usize, s: &str) -> Result<u64> {
    match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
    .map_err(|_| malformed!(n, "bad number {:?}", s))
}

fn wide_number(n: usize, s: &str) -> Result<u128> {
    match s.strip_prefix("0x") {
        Some(h) => u128::from_str_radix(h, 16),
        None => s.parse(),
    }
    .map_err(|_| malformed!(n, "bad number {:?}", s))
}

fn hex_bytes(n: usize, s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(malformed!(n, "odd number of hex digits"));
    }
    s.chars()
        .tuples()
        .map(|(a, b)| {
            let digit = |c: char| c.to_digit(16).ok_or_else(|| malformed!(n, "bad hex {:?}", s));
            Ok((digit(a)? * 16 + digit(b)?) as u8)
        })
        .collect()
}

fn read_or_write(n: usize, s: &str) -> Result<bool> {
    match s {
        "r" => Ok(false),
        "w" => Ok(true),
        s => Err(malformed!(n, "expected `r` or `w`, got {:?}", s)),
    }
}
