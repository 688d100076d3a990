//! The ingestion driver: feeds trace nodes, in trace order, into the symbol table, the memory
//! trace and type propagation.

use crate::analysis_config::CONFIG;
use crate::arch::{Architecture, InstructionType};
use crate::error::{Error, Result};
use crate::log::*;
use crate::memory_trace::MemoryTrace;
use crate::node::{DeviceDefinition, Event, NodeId, NodeKind, Step, TraceTree};
use crate::subroutine_analyzer::{CodeExploration, CodeRange, SubroutineAnalyzer};
use crate::symbol_table::{Prototype, SymbolKind, SymbolTable};
use crate::symbols::{AugmentedSymbolResolver, StaticSymbolKind, StaticSymbolTable, SymbolResolver};
use crate::type_propagation::DynamicTypePropagation;
use crate::Cancel;

use std::collections::BTreeMap;
use std::io::Write;

use itertools::Itertools;

/// Data that went through an I/O channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoRecord {
    pub step: u64,
    pub node: NodeId,
    pub input: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedFile {
    pub name: String,
    pub address: u64,
    pub length: u64,
    pub step: u64,
}

/// The step seen last, which the next step is interpreted against
#[derive(Clone, Copy, Debug)]
struct LastStep {
    step: u64,
    insn_type: InstructionType,
}

pub struct Analysis {
    arch: Box<dyn Architecture>,
    symbols: SymbolTable,
    memory: MemoryTrace,
    types: DynamicTypePropagation,
    devices: BTreeMap<u32, String>,
    device_events: BTreeMap<u32, Vec<NodeId>>,
    io: BTreeMap<u32, Vec<IoRecord>>,
    mapped_files: Vec<MappedFile>,
    syscalls: Vec<NodeId>,
    /// Byte extents known to hold instructions, by start address
    code: BTreeMap<u64, CodeRange>,
    longest_code: u32,
    last: Option<LastStep>,
    /// A call block that was left; its contract is checked at the next step
    pending_return: Option<NodeId>,
    steps: u64,
}

impl Analysis {
    pub fn new(arch: Box<dyn Architecture>, static_symbols: StaticSymbolTable) -> Self {
        let types = DynamicTypePropagation::new(arch.as_ref());
        Self {
            arch,
            symbols: SymbolTable::new(static_symbols),
            memory: MemoryTrace::new(),
            types,
            devices: BTreeMap::new(),
            device_events: BTreeMap::new(),
            io: BTreeMap::new(),
            mapped_files: vec![],
            syscalls: vec![],
            code: BTreeMap::new(),
            longest_code: 0,
            last: None,
            pending_return: None,
            steps: 0,
        }
    }

    pub fn arch(&self) -> &dyn Architecture {
        self.arch.as_ref()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn memory(&self) -> &MemoryTrace {
        &self.memory
    }

    pub fn types(&self) -> &DynamicTypePropagation {
        &self.types
    }

    pub fn io(&self, channel: u32) -> &[IoRecord] {
        self.io.get(&channel).map_or(&[], |v| v)
    }

    pub fn devices(&self) -> &BTreeMap<u32, String> {
        &self.devices
    }

    pub fn device_events(&self, id: u32) -> &[NodeId] {
        self.device_events.get(&id).map_or(&[], |v| v)
    }

    pub fn mapped_files(&self) -> &[MappedFile] {
        &self.mapped_files
    }

    /// Steps that entered a system call
    pub fn syscalls(&self) -> &[NodeId] {
        &self.syscalls
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Every instruction extent that was executed or found by exploration
    pub fn code_ranges(&self) -> impl Iterator<Item = &CodeRange> {
        self.code.values()
    }

    /// The instruction whose bytes cover `address`
    pub fn code_at(&self, address: u64) -> Option<&CodeRange> {
        self.code
            .range(..=address)
            .rev()
            .take_while(|(&start, _)| address - start < self.longest_code as u64)
            .map(|(_, c)| c)
            .find(|c| c.contains(address))
    }

    fn mark_code(&mut self, range: CodeRange) {
        self.longest_code = self.longest_code.max(range.length);
        self.code.insert(range.address, range);
    }

    /// Step number that events are attributed to
    fn current_step(&self) -> u64 {
        self.last.map_or(0, |l| l.step)
    }

    /// Process `node` of `tree`. Nodes must be processed in trace order; a block is processed
    /// once it has been left.
    pub fn process(&mut self, tree: &TraceTree, node: NodeId) -> Result<()> {
        match tree.get(node) {
            Some(NodeKind::Step(step)) => self.process_step(tree, node, step),
            Some(NodeKind::Block(_)) => {
                self.pending_return = Some(node);
                Ok(())
            }
            Some(NodeKind::Event(event)) => self.process_event(node, event),
            None => Err(Error::IllegalState(format!("no node {}", node))),
        }
    }

    fn process_step(&mut self, tree: &TraceTree, node: NodeId, step: &Step) -> Result<()> {
        if let Some(last) = self.last {
            if step.step <= last.step {
                return Err(Error::IllegalState(format!(
                    "step {} does not follow step {}",
                    step.step, last.step
                )));
            }
        }
        trace!("Step"; "step" => step.step, "pc" => Hex(step.pc), "type" => ?step.insn_type);

        if let Some(block) = self.pending_return.take() {
            if CONFIG.track_call_register_contracts {
                self.process_return(tree, block, step);
            }
        }

        if CONFIG.enable_type_recovery {
            match self.types.step(self.arch.as_ref(), step, Some(&self.memory)) {
                Ok(()) => {}
                Err(e @ Error::DecodeFailure { .. }) | Err(e @ Error::MemoryNotMapped { .. }) => {
                    warn!("No type information for step"; "step" => step.step, "error" => %e);
                }
                Err(e) => return Err(e),
            }
        }

        let length = self.arch.decode_length(step.pc, &step.machine_code);
        if length != 0 {
            self.mark_code(CodeRange {
                address: step.pc,
                length,
                insn_type: step.insn_type,
            });
        }

        if step.insn_type == InstructionType::Syscall {
            self.syscalls.push(node);
        }
        if let Some(last) = self.last {
            self.classify(last.insn_type, step.pc);
        }
        self.symbols.visit(tree, node);

        self.last = Some(LastStep {
            step: step.step,
            insn_type: step.insn_type,
        });
        self.steps += 1;
        Ok(())
    }

    /// Classify `pc` by how control got there
    fn classify(&mut self, previous: InstructionType, pc: u64) {
        let exact = self.symbols.static_symbols().resolve_exact(pc);
        match previous {
            InstructionType::Jmp | InstructionType::Jcc => match exact {
                Some(sym) if sym.kind == StaticSymbolKind::Func => {
                    self.symbols.add_subroutine_named(pc, &sym.name)
                }
                _ => self.symbols.add_location(pc),
            },
            InstructionType::Call => match exact {
                Some(sym) => self.symbols.add_subroutine_named(pc, &sym.name),
                None => self.symbols.add_subroutine(pc),
            },
            InstructionType::Syscall if self.arch.is_system_level() => match exact {
                Some(sym) => self.symbols.add_syscall_named(pc, &sym.name),
                None => self.symbols.add_syscall(pc),
            },
            _ => {}
        }
    }

    /// Compare the registers on entry to call `block` with those at `step`, right after it
    /// returned
    fn process_return(&mut self, tree: &TraceTree, block: NodeId, step: &Step) {
        let entry = match tree.entry_state(block) {
            Some(e) => e,
            None => return,
        };
        let callee = match tree.first_step(block).and_then(|s| tree.step(s)) {
            Some(s) => s.pc,
            None => return,
        };
        let sym = match self.symbols.get_mut(callee) {
            Some(sym) => sym,
            None => {
                debug!("Return from unknown subroutine"; "pc" => Hex(callee));
                return;
            }
        };
        for (r, (before, after)) in entry.iter().zip(step.registers.iter()).enumerate() {
            if before == after {
                sym.saved_registers.insert(r);
            } else {
                sym.destroyed_registers.insert(r);
            }
        }
    }

    fn process_event(&mut self, node: NodeId, event: &Event) -> Result<()> {
        let step = self.current_step();
        match event {
            Event::SymbolTable {
                file,
                load_bias,
                symbols,
            } => {
                debug!("Loading symbols"; "file" => file, "load_bias" => Hex(*load_bias), "count" => symbols.len());
                self.symbols
                    .static_symbols_mut()
                    .add_symbols(symbols.iter().cloned(), *load_bias);
            }
            Event::Mmap {
                address,
                length,
                protection,
                filename,
                data,
                result,
            } => {
                if *result < 0 {
                    trace!("Failed mmap"; "address" => Hex(*address), "result" => result);
                    return Ok(());
                }
                self.memory.mmap(
                    *address,
                    *length,
                    *protection,
                    filename.as_deref(),
                    data.as_deref(),
                    step,
                    node,
                )?;
                if let Some(name) = filename {
                    self.mapped_files.push(MappedFile {
                        name: name.clone(),
                        address: *address,
                        length: *length,
                        step,
                    });
                }
            }
            Event::Memory {
                address,
                size,
                value,
                write,
                big_endian,
            } => self.process_memory(node, *address, *size, *value, *write, *big_endian)?,
            Event::MemoryDump { address, data } => {
                let mut chunks = data.chunks_exact(8);
                let mut address = *address;
                for chunk in &mut chunks {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    self.checked_write(address, 8, u64::from_le_bytes(bytes), node, false)?;
                    address = address.wrapping_add(8);
                }
                for &b in chunks.remainder() {
                    self.checked_write(address, 1, b as u64, node, false)?;
                    address = address.wrapping_add(1);
                }
            }
            Event::Brk { new_break } => self.memory.brk(*new_break, step, node)?,
            Event::Io {
                channel,
                input,
                data,
            } => self.io.entry(*channel).or_default().push(IoRecord {
                step,
                node,
                input: *input,
                data: data.clone(),
            }),
            Event::DeviceDefinition { devices } => {
                for DeviceDefinition { id, name } in devices {
                    if let Some(old) = self.devices.insert(*id, name.clone()) {
                        warn!("Duplicate device id"; "id" => id, "old" => old, "new" => name);
                    }
                }
            }
            Event::Device { id, .. } | Event::DeviceRegister { id, .. } => {
                if self.devices.contains_key(id) {
                    self.device_events.entry(*id).or_default().push(node);
                } else {
                    warn!("Dropping device event"; "node" => node, "error" => %Error::UnknownDevice { id: *id });
                }
            }
        }
        Ok(())
    }

    fn process_memory(
        &mut self,
        node: NodeId,
        address: u64,
        size: usize,
        value: u128,
        write: bool,
        big_endian: bool,
    ) -> Result<()> {
        if size == 16 {
            let (high, low) = ((value >> 64) as u64, value as u64);
            let (first, second) = if big_endian { (high, low) } else { (low, high) };
            self.process_memory(node, address, 8, first as u128, write, big_endian)?;
            return self.process_memory(
                node,
                address.wrapping_add(8),
                8,
                second as u128,
                write,
                big_endian,
            );
        }
        if write {
            self.checked_write(address, size, value as u64, node, big_endian)
        } else {
            match self.memory.read(address, size, self.current_step(), node) {
                Ok(_) => Ok(()),
                Err(e @ Error::MemoryNotMapped { .. }) => {
                    warn!("Read from unmapped memory"; "error" => %e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }

    /// Writes to unmapped memory are reported and skipped
    fn checked_write(
        &mut self,
        address: u64,
        size: usize,
        value: u64,
        node: NodeId,
        big_endian: bool,
    ) -> Result<()> {
        let step = self.current_step();
        match self.memory.write(address, size, value, step, node, big_endian) {
            Ok(()) => Ok(()),
            Err(e @ Error::MemoryNotMapped { .. }) => {
                warn!("Write to unmapped memory"; "error" => %e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Statically explore code from `address` as it is in memory after the last step, adding
    /// every call target as a subroutine and every jump target as a location
    pub fn explore(&mut self, address: u64, cancel: Cancel<'_>) -> CodeExploration {
        let found = SubroutineAnalyzer::new(self.arch.as_ref(), &self.memory, self.current_step())
            .analyze_code(address, cancel);
        for &range in found.code.values() {
            self.mark_code(range);
        }
        for &pc in &found.subroutines {
            self.symbols.add_subroutine(pc);
        }
        for &pc in &found.locations {
            self.symbols.add_location(pc);
        }
        found
    }

    /// Decode the instructions from `address` up to the first one that does not fall through, as
    /// they are in memory after the last step
    pub fn explore_straightline(&mut self, address: u64) -> Vec<CodeRange> {
        let found = SubroutineAnalyzer::new(self.arch.as_ref(), &self.memory, self.current_step())
            .analyze_straightline(address);
        for &range in &found {
            self.mark_code(range);
        }
        found
    }

    /// Conclude the analysis once the whole trace was processed
    pub fn finish(&mut self, tree: &TraceTree, cancel: Cancel<'_>) -> Result<()> {
        self.memory.trim()?;

        // The entry point, unless control flow already explained it
        if let Some((node, first)) = tree.steps().next() {
            if self.symbols.get(first.pc).is_none() {
                let name = self
                    .symbols
                    .static_symbols()
                    .resolve_exact(first.pc)
                    .map_or_else(|| "_start".to_string(), |s| s.name);
                self.symbols.add_subroutine_named(first.pc, &name);
                self.symbols.visit(tree, node);
            }
        }

        let main = self
            .symbols
            .subroutines()
            .find(|s| s.name == "main")
            .map(|s| s.address());
        if let Some(main) = main {
            self.symbols.set_prototype(
                main,
                Prototype {
                    return_type: "s32".to_string(),
                    arguments: vec![
                        ("s32".to_string(), "argc".to_string()),
                        ("char**".to_string(), "argv".to_string()),
                        ("char**".to_string(), "envp".to_string()),
                    ],
                },
            );
        }

        let register_count = self.arch.register_count();
        for sym in self.symbols.subroutines_mut() {
            sym.compute_unused_registers(register_count);
            info!("Subroutine";
                  "pc" => Hex(sym.address()),
                  "name" => &sym.name,
                  "visits" => sym.visits.len(),
                  "saved" => ?sym.saved_registers,
                  "destroyed" => ?sym.destroyed_registers,
                  "unused" => ?sym.unused_registers().ok());
        }

        if CONFIG.enable_trampoline_detection {
            for (pc, name) in self.find_trampolines(tree, cancel) {
                self.symbols.rename_subroutine(pc, &name);
            }
        }

        if CONFIG.enable_type_recovery {
            self.types.finish(&self.symbols)?;
        }

        self.symbols.cleanup();
        self.memory.print_stats();
        info!("Analysis finished";
              "steps" => self.steps,
              "symbols" => self.symbols.len(),
              "subroutines" => self.symbols.subroutines().count(),
              "syscalls" => self.syscalls.len());
        Ok(())
    }

    /// Write the symbol listing: address, kind, name, visit count and, for subroutines, the
    /// registers every call preserved
    pub fn write_symbols(&self, w: &mut dyn Write) -> Result<()> {
        for sym in self.symbols.symbols() {
            let kind = match sym.kind {
                SymbolKind::Subroutine => "sub",
                SymbolKind::Location => "loc",
                SymbolKind::Data => "data",
                SymbolKind::Unknown => "unk",
            };
            write!(
                w,
                "{:#010x} {:<4} {} visits={}",
                sym.address(),
                kind,
                sym.name,
                sym.visits.len()
            )?;
            if let Ok(unused) = sym.unused_registers() {
                write!(
                    w,
                    " unused={}",
                    unused.iter().map(|r| self.arch.register_name(r)).join(",")
                )?;
            }
            if let Some(prototype) = &sym.prototype {
                write!(w, " prototype=\"{}\"", prototype.display(&sym.name))?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Write the resolved type of every typed memory cell, and the extent of every known
    /// instruction, ordered by address
    pub fn write_memory_types(&self, w: &mut dyn Write) -> Result<()> {
        let data = self
            .types
            .recovered_memory_types()?
            .into_iter()
            .map(|(address, ty)| {
                (
                    address,
                    format!("{} {}", ty.name(), ty.to_c_type().unwrap_or("-")),
                )
            });
        let code = self
            .code
            .values()
            .map(|c| (c.address, format!("code {}", c.length)));
        for (address, text) in data.merge_by(code, |a, b| a.0 <= b.0) {
            writeln!(w, "{:#010x} {}", address, text)?;
        }
        Ok(())
    }

    /// Subroutines with a synthetic name that were seen jumping straight into a named symbol,
    /// with the name they should get
    fn find_trampolines(&self, tree: &TraceTree, cancel: Cancel<'_>) -> Vec<(u64, String)> {
        let resolver = AugmentedSymbolResolver::new(
            self.symbols.static_symbols(),
            self.symbols
                .subroutines()
                .map(|s| (s.address(), s.name.clone())),
        );
        let mut renames = vec![];
        for sym in self.symbols.subroutines() {
            if cancel() {
                debug!("Trampoline detection cancelled");
                break;
            }
            if !sym.has_synthetic_name() {
                continue;
            }
            // Any visit that jumps away into a known symbol will do
            let callee = sym
                .visits
                .iter()
                .filter(|&&v| {
                    tree.step(v).map_or(false, |s| {
                        matches!(s.insn_type, InstructionType::Jmp | InstructionType::JmpIndirect)
                    })
                })
                .filter_map(|&v| tree.step(tree.next_step(v)?))
                .filter(|next| next.pc != sym.address())
                .find_map(|next| resolver.resolve_exact(next.pc));
            if let Some(callee) = callee {
                debug!("Trampoline"; "pc" => Hex(sym.address()), "target" => &callee.name);
                renames.push((sym.address(), format!("j_{}", callee.name)));
            }
        }
        renames
    }
}
