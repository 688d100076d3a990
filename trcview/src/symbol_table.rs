//! Symbols recovered from the trace: subroutines, jump targets and system call entries.

use crate::analysis_config::CONFIG;
use crate::error::{Error, Result};
use crate::log::*;
use crate::node::{NodeId, NodeKind, TraceTree};
use crate::symbols::StaticSymbolTable;

use std::collections::BTreeMap;

/// A fixed-capacity set of register indices
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct RegisterSet {
    words: Vec<u64>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Default::default()
    }

    /// The set `{0, .., count - 1}`
    pub fn full(count: usize) -> Self {
        (0..count).collect()
    }

    pub fn insert(&mut self, register: usize) {
        let (word, bit) = (register / 64, register % 64);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << bit;
    }

    pub fn contains(&self, register: usize) -> bool {
        self.words
            .get(register / 64)
            .map_or(false, |w| w & (1 << (register % 64)) != 0)
    }

    /// Registers in `self` but not in `other`
    pub fn difference(&self, other: &RegisterSet) -> RegisterSet {
        RegisterSet {
            words: self
                .words
                .iter()
                .enumerate()
                .map(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64)
                .filter(move |&b| w & (1u64 << b) != 0)
                .map(move |b| i * 64 + b)
        })
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

impl FromIterator<usize> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut r = RegisterSet::new();
        for reg in iter {
            r.insert(reg);
        }
        r
    }
}

impl std::fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A value derived once the data it depends on is complete
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Computed<T> {
    Pending,
    Ready(T),
}

impl<T> Default for Computed<T> {
    fn default() -> Self {
        Computed::Pending
    }
}

impl<T> Computed<T> {
    /// The value, or `IllegalState` naming `what` if it has not been computed yet
    pub fn get(&self, what: &str) -> Result<&T> {
        match self {
            Computed::Ready(v) => Ok(v),
            Computed::Pending => Err(Error::IllegalState(format!(
                "{} requested before it was computed",
                what
            ))),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Computed::Ready(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum SymbolKind {
    Subroutine,
    Location,
    Data,
    Unknown,
}

/// A C-like signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prototype {
    pub return_type: String,
    pub arguments: Vec<(String, String)>,
}

impl Prototype {
    pub fn display<'a>(&'a self, name: &'a str) -> impl std::fmt::Display + 'a {
        struct D<'a>(&'a Prototype, &'a str);
        impl std::fmt::Display for D<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                use itertools::Itertools;
                write!(
                    f,
                    "{} {}({})",
                    self.0.return_type,
                    self.1,
                    self.0
                        .arguments
                        .iter()
                        .map(|(ty, name)| format!("{} {}", ty, name))
                        .join(", ")
                )
            }
        }
        D(self, name)
    }
}

/// A symbol recovered from the trace.
///
/// Identity is the pair of address and name.
#[derive(Clone, Debug)]
pub struct ComputedSymbol {
    pub name: String,
    address: u64,
    pub kind: SymbolKind,
    /// Steps that executed at this symbol's address, in trace order
    pub visits: Vec<NodeId>,
    pub prototype: Option<Prototype>,
    /// Registers that held the same value before a call and after its return
    pub saved_registers: RegisterSet,
    /// Registers that changed across a call
    pub destroyed_registers: RegisterSet,
    unused_registers: Computed<RegisterSet>,
}

impl PartialEq for ComputedSymbol {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.name == other.name
    }
}
impl Eq for ComputedSymbol {}

impl ComputedSymbol {
    pub fn new(name: String, address: u64, kind: SymbolKind) -> Self {
        Self {
            name,
            address,
            kind,
            visits: vec![],
            prototype: None,
            saved_registers: RegisterSet::new(),
            destroyed_registers: RegisterSet::new(),
            unused_registers: Computed::Pending,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Registers that every observed call preserved: saved and never destroyed. Calls are only
    /// complete once the trace is, hence the two phases.
    pub fn compute_unused_registers(&mut self, register_count: usize) {
        let saved = self
            .saved_registers
            .difference(&self.destroyed_registers)
            .iter()
            .filter(|&r| r < register_count)
            .collect();
        self.unused_registers = Computed::Ready(saved);
    }

    pub fn unused_registers(&self) -> Result<&RegisterSet> {
        self.unused_registers.get("unused registers")
    }

    /// Whether the name was made up from the address
    pub fn has_synthetic_name(&self) -> bool {
        is_synthetic(self)
    }
}

pub fn sub_name(pc: u64) -> String {
    format!("sub_{:x}", pc)
}

pub fn loc_name(pc: u64) -> String {
    format!("loc_{:x}", pc)
}

pub fn sc_name(pc: u64) -> String {
    format!("sc_{:x}", pc)
}

/// Callback run synchronously whenever a subroutine is renamed
pub type RenameListener =
    Box<dyn Fn(&ComputedSymbol) -> std::result::Result<(), Box<dyn std::error::Error>>>;

/// All symbols recovered so far, plus the static symbols they were seeded from
#[derive(Default)]
pub struct SymbolTable {
    symbols: BTreeMap<u64, ComputedSymbol>,
    static_symbols: StaticSymbolTable,
    listeners: Vec<RenameListener>,
}

impl SymbolTable {
    pub fn new(static_symbols: StaticSymbolTable) -> Self {
        Self {
            symbols: BTreeMap::new(),
            static_symbols,
            listeners: vec![],
        }
    }

    pub fn static_symbols(&self) -> &StaticSymbolTable {
        &self.static_symbols
    }

    pub fn static_symbols_mut(&mut self) -> &mut StaticSymbolTable {
        &mut self.static_symbols
    }

    pub fn get(&self, pc: u64) -> Option<&ComputedSymbol> {
        self.symbols.get(&pc)
    }

    pub fn get_mut(&mut self, pc: u64) -> Option<&mut ComputedSymbol> {
        self.symbols.get_mut(&pc)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Mark `pc` as a subroutine entry. A `loc_` name is upgraded to `sub_`; any other name is
    /// kept.
    pub fn add_subroutine(&mut self, pc: u64) {
        self.upgrade(pc, sub_name(pc), &[loc_name(pc)]);
    }

    /// Mark `pc` as a subroutine entry named `name`. Only synthetic names are replaced.
    pub fn add_subroutine_named(&mut self, pc: u64, name: &str) {
        self.upgrade(pc, name.to_string(), &[loc_name(pc), sub_name(pc)]);
    }

    /// Mark `pc` as a system call entry
    pub fn add_syscall(&mut self, pc: u64) {
        self.upgrade(pc, sc_name(pc), &[loc_name(pc)]);
    }

    pub fn add_syscall_named(&mut self, pc: u64, name: &str) {
        self.upgrade(pc, name.to_string(), &[loc_name(pc), sub_name(pc)]);
    }

    /// Mark `pc` as a jump target, unless it is known already
    pub fn add_location(&mut self, pc: u64) {
        self.symbols
            .entry(pc)
            .or_insert_with(|| ComputedSymbol::new(loc_name(pc), pc, SymbolKind::Location));
    }

    fn upgrade(&mut self, pc: u64, name: String, replaceable: &[String]) {
        match self.symbols.get_mut(&pc) {
            None => {
                debug!("New subroutine"; "pc" => Hex(pc), "name" => &name);
                self.symbols
                    .insert(pc, ComputedSymbol::new(name, pc, SymbolKind::Subroutine));
            }
            Some(sym) => {
                sym.kind = SymbolKind::Subroutine;
                if replaceable.contains(&sym.name) && sym.name != name {
                    debug!("Renaming symbol"; "pc" => Hex(pc), "from" => &sym.name, "to" => &name);
                    sym.name = name;
                }
            }
        }
    }

    /// Record that step `node` executed at the address of a symbol. Returns whether a symbol was
    /// there.
    pub fn visit(&mut self, tree: &TraceTree, node: NodeId) -> bool {
        let pc = match tree.get(node) {
            Some(NodeKind::Step(step)) => step.pc,
            _ => return false,
        };
        match self.symbols.get_mut(&pc) {
            Some(sym) => {
                sym.visits.push(node);
                true
            }
            None => false,
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &ComputedSymbol> {
        self.symbols.values()
    }

    pub fn subroutines(&self) -> impl Iterator<Item = &ComputedSymbol> {
        self.symbols
            .values()
            .filter(|s| s.kind == SymbolKind::Subroutine)
    }

    pub fn subroutines_mut(&mut self) -> impl Iterator<Item = &mut ComputedSymbol> {
        self.symbols
            .values_mut()
            .filter(|s| s.kind == SymbolKind::Subroutine)
    }

    pub fn locations(&self) -> impl Iterator<Item = &ComputedSymbol> {
        self.symbols
            .values()
            .filter(|s| s.kind == SymbolKind::Location)
    }

    /// Symbols whose name came from evidence rather than from their address
    pub fn named_symbols(&self) -> impl Iterator<Item = &ComputedSymbol> {
        self.symbols.values().filter(|s| !is_synthetic(s))
    }

    pub fn add_listener(&mut self, listener: RenameListener) {
        self.listeners.push(listener);
    }

    /// Rename the subroutine at `pc` and notify listeners. Returns `false` if there is no
    /// subroutine at `pc`.
    pub fn rename_subroutine(&mut self, pc: u64, name: &str) -> bool {
        let sym = match self.symbols.get_mut(&pc) {
            Some(sym) if sym.kind == SymbolKind::Subroutine => sym,
            _ => return false,
        };
        info!("Renaming subroutine"; "pc" => Hex(pc), "from" => &sym.name, "to" => name);
        sym.name = name.to_string();
        let sym: &ComputedSymbol = sym;
        for (i, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener(sym) {
                warn!("Symbol listener failed"; "listener" => i, "error" => %e);
            }
        }
        true
    }

    pub fn set_prototype(&mut self, pc: u64, prototype: Prototype) -> bool {
        match self.symbols.get_mut(&pc) {
            Some(sym) => {
                sym.prototype = Some(prototype);
                true
            }
            None => false,
        }
    }

    /// Report subroutines that were discovered but never executed
    pub fn cleanup(&self) {
        if !CONFIG.log_unvisited_subroutines {
            return;
        }
        for sym in self.subroutines().filter(|s| s.visits.is_empty()) {
            info!("Subroutine never executed"; "pc" => Hex(sym.address), "name" => &sym.name);
        }
    }
}

fn is_synthetic(sym: &ComputedSymbol) -> bool {
    let pc = sym.address;
    sym.name == sub_name(pc) || sym.name == loc_name(pc) || sym.name == sc_name(pc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn synthetic_names_only_improve() {
        let mut t = SymbolTable::default();
        t.add_location(0x10);
        assert_eq!(t.get(0x10).unwrap().name, "loc_10");
        assert_eq!(t.get(0x10).unwrap().kind, SymbolKind::Location);

        t.add_subroutine(0x10);
        assert_eq!(t.get(0x10).unwrap().name, "sub_10");
        assert_eq!(t.get(0x10).unwrap().kind, SymbolKind::Subroutine);

        t.add_subroutine_named(0x10, "strlen");
        assert_eq!(t.get(0x10).unwrap().name, "strlen");

        // No way back to a synthetic name
        t.add_subroutine(0x10);
        t.add_location(0x10);
        t.add_syscall(0x10);
        assert_eq!(t.get(0x10).unwrap().name, "strlen");
        // Nor to a different resolved name
        t.add_subroutine_named(0x10, "other");
        assert_eq!(t.get(0x10).unwrap().name, "strlen");

        t.add_syscall(0x20);
        assert_eq!(t.get(0x20).unwrap().name, "sc_20");
        t.add_subroutine(0x20);
        assert_eq!(t.get(0x20).unwrap().name, "sc_20");
        assert_eq!(t.named_symbols().count(), 1);
    }

    #[test]
    fn unused_registers_are_two_phase() {
        let mut sym = ComputedSymbol::new("f".into(), 0, SymbolKind::Subroutine);
        assert!(matches!(sym.unused_registers(), Err(Error::IllegalState(_))));
        sym.saved_registers = [0, 1, 2].into_iter().collect();
        sym.destroyed_registers.insert(1);
        sym.compute_unused_registers(4);
        assert_eq!(
            sym.unused_registers().unwrap().iter().collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[test]
    fn listener_failures_do_not_stop_renames() {
        let mut t = SymbolTable::default();
        let seen = Rc::new(RefCell::new(vec![]));
        type ListenerResult = std::result::Result<(), Box<dyn std::error::Error>>;
        t.add_listener(Box::new(|_: &ComputedSymbol| -> ListenerResult {
            Err("broken listener".into())
        }));
        let s = seen.clone();
        t.add_listener(Box::new(move |sym: &ComputedSymbol| -> ListenerResult {
            s.borrow_mut().push(sym.name.clone());
            Ok(())
        }));
        t.add_subroutine(0x40);
        assert!(t.rename_subroutine(0x40, "j_puts"));
        assert!(!t.rename_subroutine(0x44, "nothing"));
        assert_eq!(t.get(0x40).unwrap().name, "j_puts");
        assert_eq!(*seen.borrow(), vec!["j_puts".to_string()]);
    }

    #[test]
    fn register_sets() {
        let full = RegisterSet::full(70);
        assert_eq!(full.len(), 70);
        assert!(full.contains(69));
        assert!(!full.contains(70));
        let some: RegisterSet = [3, 65].into_iter().collect();
        let rest = full.difference(&some);
        assert_eq!(rest.len(), 68);
        assert!(!rest.contains(65));
        assert!(RegisterSet::new().is_empty());
    }

    #[test]
    fn prototype_display() {
        let p = Prototype {
            return_type: "s32".into(),
            arguments: vec![("s32".into(), "argc".into()), ("char**".into(), "argv".into())],
        };
        assert_eq!(p.display("main").to_string(), "s32 main(s32 argc, char** argv)");
    }
}
