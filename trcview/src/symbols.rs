//! Static symbols, as found in the symbol tables of the traced binaries

use std::collections::BTreeMap;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum StaticSymbolKind {
    Func,
    Object,
    Section,
    NoType,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StaticSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub kind: StaticSymbolKind,
}

impl StaticSymbol {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.value && address - self.value < self.size.max(1)
    }
}

/// Lookup of static symbols by address
pub trait SymbolResolver {
    /// The symbol covering `address`, if any
    fn resolve(&self, address: u64) -> Option<StaticSymbol>;

    /// The symbol starting exactly at `address`
    fn resolve_exact(&self, address: u64) -> Option<StaticSymbol> {
        self.resolve(address).filter(|s| s.value == address)
    }
}

/// Static symbols of all loaded files, keyed by (relocated) address
#[derive(Clone, Debug, Default)]
pub struct StaticSymbolTable {
    symbols: BTreeMap<u64, StaticSymbol>,
    /// Size of the largest symbol, which bounds how far back a lookup has to look
    largest: u64,
}

impl StaticSymbolTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Add `symbols` of a file loaded `load_bias` bytes away from its link address. On address
    /// collisions, functions are preferred over other kinds.
    pub fn add_symbols(&mut self, symbols: impl IntoIterator<Item = StaticSymbol>, load_bias: u64) {
        for mut sym in symbols {
            sym.value = sym.value.wrapping_add(load_bias);
            match self.symbols.get(&sym.value) {
                Some(old)
                    if old.kind == StaticSymbolKind::Func
                        && sym.kind != StaticSymbolKind::Func => {}
                _ => {
                    self.largest = self.largest.max(sym.size.max(1));
                    self.symbols.insert(sym.value, sym);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaticSymbol> {
        self.symbols.values()
    }

    /// The innermost symbol covering `address`
    pub fn get(&self, address: u64) -> Option<&StaticSymbol> {
        self.symbols
            .range(..=address)
            .rev()
            .take_while(|(&start, _)| address - start < self.largest)
            .map(|(_, s)| s)
            .find(|s| s.contains(address))
    }
}

impl SymbolResolver for StaticSymbolTable {
    fn resolve(&self, address: u64) -> Option<StaticSymbol> {
        self.get(address).cloned()
    }
}

/// Static symbols overlaid with symbols recovered from the trace. Static symbols win.
pub struct AugmentedSymbolResolver<'a> {
    static_symbols: &'a StaticSymbolTable,
    computed: BTreeMap<u64, StaticSymbol>,
}

impl<'a> AugmentedSymbolResolver<'a> {
    pub fn new(
        static_symbols: &'a StaticSymbolTable,
        computed: impl IntoIterator<Item = (u64, String)>,
    ) -> Self {
        Self {
            static_symbols,
            computed: computed
                .into_iter()
                .map(|(value, name)| {
                    (
                        value,
                        StaticSymbol {
                            name,
                            value,
                            size: 0,
                            kind: StaticSymbolKind::Func,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl<'a> SymbolResolver for AugmentedSymbolResolver<'a> {
    fn resolve(&self, address: u64) -> Option<StaticSymbol> {
        self.static_symbols
            .resolve(address)
            .or_else(|| self.computed.get(&address).cloned())
    }
}
