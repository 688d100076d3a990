#![cfg(test)]

use crate::analysis::Analysis;
use crate::containers::unordered::UnorderedSet;
use crate::error::Error;
use crate::node::TraceTree;
use crate::operand::Location;
use crate::symbol_table::{ComputedSymbol, RegisterSet, SymbolKind};
use crate::trace_lifter::lift_from;
use crate::variable_type::VariableType::*;

use std::cell::RefCell;
use std::rc::Rc;

fn analyze(listing: &str) -> (Analysis, TraceTree) {
    lift_from(listing).unwrap().analyze(&|| false).unwrap()
}

fn symbol_listing(analysis: &Analysis) -> Vec<(u64, SymbolKind, String)> {
    analysis
        .symbols()
        .symbols()
        .map(|s| (s.address(), s.kind, s.name.clone()))
        .collect()
}

fn assert_unorderedset_eq<T: Eq + std::hash::Hash + Ord + std::fmt::Debug>(
    a: impl IntoIterator<Item = T>,
    b: impl IntoIterator<Item = T>,
) {
    let a: UnorderedSet<_> = a.into_iter().collect();
    let b: UnorderedSet<_> = b.into_iter().collect();
    assert_eq!(a, b)
}

pub const CALL_CLOBBERING_R1: &str = "
arch t regs 3 ptr 4
step 0x100 call target=0x1000 state=0,5,7
call
step 0x1000 other
step 0x1004 other r=r2 w=r1 sem move r1 r2 I32
step 0x1008 ret state=0,7,7
ret
step 0x104 other
";

#[test]
fn call_register_contract() {
    let (analysis, _) = analyze(CALL_CLOBBERING_R1);
    let sub = analysis.symbols().get(0x1000).unwrap();
    assert_eq!(sub.name, "sub_1000");
    assert_eq!(sub.kind, SymbolKind::Subroutine);
    assert_eq!(sub.destroyed_registers, [1].into_iter().collect::<RegisterSet>());
    assert_eq!(sub.saved_registers, [0, 2].into_iter().collect::<RegisterSet>());
    assert_eq!(
        sub.unused_registers().unwrap(),
        &[0, 2].into_iter().collect::<RegisterSet>()
    );

    let start = analysis.symbols().get(0x100).unwrap();
    assert_eq!(start.name, "_start");
    assert_eq!(start.kind, SymbolKind::Subroutine);
    assert_eq!(start.visits.len(), 1);
    assert_eq!(analysis.step_count(), 5);
}

#[test]
fn untouched_registers_are_unused() {
    let (analysis, _) = analyze(
        "
        arch t regs 4 ptr 8
        step 0x100 call target=0x200 state=1,2,3,4
        call
        step 0x200 other
        step 0x204 ret
        ret
        step 0x104 other
        ",
    );
    let sub = analysis.symbols().get(0x200).unwrap();
    assert_eq!(sub.saved_registers, RegisterSet::full(4));
    assert!(sub.destroyed_registers.is_empty());
    assert_eq!(sub.unused_registers().unwrap(), &RegisterSet::full(4));
}

pub const CLEAR_THEN_TEST: &str = "
arch t regs 2 ptr 4
mmap 0x2000 0x1000 rw- -
# clrb (r1)
step 0x100 other r=r1 state=0,0x2000 sem set [r1] I8
mem w 0x2000 1 0
# movl #1, 4(r1)
step 0x104 other r=r1 sem set [r1+4] I32
mem w 0x2004 4 1
step 0x108 other
# tstb (r1)
step 0x10c other r=r1 sem constrain [r1] I8
mem r 0x2000 1 0
";

#[test]
fn byte_clear_and_test_agree_on_width() {
    let (analysis, _) = analyze(CLEAR_THEN_TEST);
    let types = analysis.types();
    let bits = types.resolve(0x10c, Location::Memory(0x2000));
    assert!(I8.test(bits));
    for wide in [I16, I32, I64, U16, U32, U64, S16, S32, S64] {
        assert!(!wide.test(bits), "{} leaked into a byte", wide.name());
    }
    assert_eq!(
        types
            .resolve_type(0x10c, Location::Memory(0x2000))
            .unwrap(),
        Some(I8)
    );
    assert_eq!(
        types.recovered_memory_types().unwrap(),
        vec![(0x2000, I8), (0x2004, I32)]
    );

    let mut out = vec![];
    analysis.write_memory_types(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("0x00002000 I8 uint8_t"));
}

pub const MEMCPY_THROUGH_STUB: &str = "
arch t regs 2 ptr 4
sym memcpy 0x3000 0x40 func
step 0x100 call target=0x200
call
# jmp *got(memcpy)
step 0x200 jmpi
step 0x3000 other
step 0x3004 ret
ret
step 0x104 call target=0x200
call
step 0x200 jmpi
step 0x3000 other
step 0x3004 ret
ret
step 0x108 other
";

#[test]
fn trampoline_is_named_after_its_target() {
    let (analysis, _) = analyze(MEMCPY_THROUGH_STUB);
    let stub = analysis.symbols().get(0x200).unwrap();
    assert_eq!(stub.name, "j_memcpy");
    assert_eq!(stub.visits.len(), 2);
    assert!(!stub.has_synthetic_name());
    assert_eq!(
        analysis
            .symbols()
            .named_symbols()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>(),
        vec!["_start", "j_memcpy"]
    );
}

#[test]
fn trampoline_is_found_on_any_visit() {
    let (analysis, _) = analyze(
        "
        arch t regs 1 ptr 4
        sym memcpy 0x3000 0x40 func
        step 0x100 call target=0x200
        call
        step 0x200 jmpi
        step 0x500 ret
        ret
        step 0x104 call target=0x200
        call
        step 0x200 jmpi
        step 0x3000 ret
        ret
        step 0x108 other
        ",
    );
    let stub = analysis.symbols().get(0x200).unwrap();
    assert_eq!(stub.visits.len(), 2);
    assert_eq!(stub.name, "j_memcpy");
    assert!(analysis.symbols().get(0x500).is_none());
}

#[test]
fn trampoline_renames_reach_listeners() {
    let lifted = lift_from(MEMCPY_THROUGH_STUB).unwrap();
    let tree = lifted.tree;
    let mut analysis = Analysis::new(
        Box::new(lifted.arch),
        crate::symbols::StaticSymbolTable::new(),
    );
    let renamed = Rc::new(RefCell::new(vec![]));
    type ListenerResult = std::result::Result<(), Box<dyn std::error::Error>>;
    let r = renamed.clone();
    analysis
        .symbols_mut()
        .add_listener(Box::new(move |s: &ComputedSymbol| -> ListenerResult {
            r.borrow_mut().push(s.name.clone());
            Ok(())
        }));
    for node in lifted.order {
        analysis.process(&tree, node).unwrap();
    }
    assert_eq!(analysis.symbols().get(0x200).unwrap().name, "sub_200");
    analysis.finish(&tree, &|| false).unwrap();
    assert_eq!(*renamed.borrow(), vec!["j_memcpy".to_string()]);
}

#[test]
fn loops_terminate_resolution() {
    let (analysis, _) = analyze(
        "
        arch t regs 3 ptr 4
        step 0x0c other
        step 0x10 other r=r2 w=r1 sem move r1 r2 I8
        step 0x14 other r=r1 w=r2 sem move r2 r1 I8
        step 0x18 jmp target=0x10
        step 0x10 other r=r2 w=r1
        step 0x14 other r=r1 w=r2
        step 0x18 jmp target=0x10
        step 0x10 other r=r2 w=r1
        step 0x1c other r=r1 sem constrain r1 U16
        ",
    );
    let types = analysis.types();
    assert!(I8.test(types.resolve(0x10, Location::Register(1))));
    assert!(I8.test(types.resolve(0x14, Location::Register(2))));
    assert!(I8.test(types.resolve(0x10, Location::Register(2))));
    assert_eq!(types.get_chain(0x10), Some(0x0c));
    assert_eq!(types.get_extra_chain(0x10)[0].pc(), 0x18);
    assert_eq!(types.get_chain(0x14), Some(0x10));
    assert_unorderedset_eq(
        types.get_forward_chain(0x10).iter().map(|m| m.pc()),
        [0x14, 0x1c],
    );

    let loc = analysis.symbols().get(0x10).unwrap();
    assert_eq!(loc.name, "loc_10");
    assert_eq!(loc.kind, SymbolKind::Location);
    assert_eq!(loc.visits.len(), 2);
}

pub const MEMORY_ACTIVITY: &str = "
arch t regs 1 ptr 4
mmap 0x1000 0x1000 rw- -
mmap 0x4000 0x1000 r-- libfoo.so data=deadbeef
mmap 0x6000 0x1000 rw- - result=-12
step 0x100 other
mem w 0x1000 4 0x11223344
step 0x104 other
mem r 0x1000 4 0x11223344
mem w 0x1002 2 0xaabb
step 0x108 other
mem r 0x1000 2 0x3344
mem w 0x2000 1 1
mem w 0x1010 16 0x00112233445566778899aabbccddeeff
dump 0x1020 0102030405060708090a
brk 0x8000
brk 0x9800
";

#[test]
fn memory_round_trip() {
    let (analysis, _) = analyze(MEMORY_ACTIVITY);
    let m = analysis.memory();
    assert_eq!(m.value_at(0x1000, 4, 0, false).unwrap(), 0x11223344);
    assert_eq!(m.value_at(0x1000, 4, 1, false).unwrap(), 0xaabb3344);
    assert_eq!(m.value_at(0x1000, 4, 2, false).unwrap(), 0xaabb3344);
    // Mapped but never written
    assert_eq!(m.value_at(0x1100, 4, 2, false).unwrap(), 0);
    assert_eq!(m.value_at(0x4000, 4, 2, true).unwrap(), 0xdeadbeef);
    // Vector write, split into halves
    assert_eq!(m.value_at(0x1010, 8, 2, false).unwrap(), 0x8899aabbccddeeff);
    assert_eq!(m.value_at(0x1018, 8, 2, false).unwrap(), 0x0011223344556677);
    // Dump, in 8 byte chunks then bytes
    assert_eq!(m.value_at(0x1020, 8, 2, false).unwrap(), 0x0807060504030201);
    assert_eq!(m.value_at(0x1028, 2, 2, false).unwrap(), 0x0a09);

    assert!(matches!(
        m.value_at(0x2000, 1, 2, false),
        Err(Error::MemoryNotMapped { address: 0x2000, .. })
    ));
    assert!(matches!(
        m.value_at(0x6000, 1, 2, false),
        Err(Error::MemoryNotMapped { .. })
    ));

    let heap = m.segment(0x9000, 2).unwrap();
    assert_eq!(heap.name.as_deref(), Some("[heap]"));
    assert_eq!((heap.base, heap.length), (0x8000, 0x2000));
    assert_eq!(m.current_break(), Some(0xa000));

    assert_eq!(analysis.mapped_files().len(), 1);
    assert_eq!(analysis.mapped_files()[0].name, "libfoo.so");
    assert!(m.is_sealed());
}

#[test]
fn big_endian_vector_write_puts_high_half_first() {
    let listing = format!(
        "{}mem w 0x1030 16 0x00112233445566778899aabbccddeeff be\n",
        MEMORY_ACTIVITY
    );
    let (analysis, _) = analyze(&listing);
    let m = analysis.memory();
    assert_eq!(m.value_at(0x1030, 8, 2, true).unwrap(), 0x0011223344556677);
    assert_eq!(m.value_at(0x1038, 8, 2, true).unwrap(), 0x8899aabbccddeeff);
    assert_eq!(m.byte_at(0x1030, 2).unwrap(), 0x00);
    assert_eq!(m.byte_at(0x1037, 2).unwrap(), 0x77);
    assert_eq!(m.byte_at(0x1038, 2).unwrap(), 0x88);
    assert_eq!(m.byte_at(0x103f, 2).unwrap(), 0xff);
    assert_eq!(m.get_write_xrefs(0x1030).len(), 1);
    assert_eq!(m.get_write_xrefs(0x1038).len(), 1);
}

#[test]
fn xrefs_are_ordered_by_step() {
    let (analysis, _) = analyze(MEMORY_ACTIVITY);
    let m = analysis.memory();
    let writes = m.get_write_xrefs(0x1002);
    assert_eq!(writes.iter().map(|w| w.step).collect::<Vec<_>>(), vec![0, 1]);
    let reads = m.get_read_xrefs(0x1000);
    assert_eq!(reads.iter().map(|r| r.step).collect::<Vec<_>>(), vec![1, 2]);
    for a in 0x1000..0x1030 {
        let w = m.get_write_xrefs(a);
        assert!(w.windows(2).all(|p| p[0].step <= p[1].step));
        let r = m.get_read_xrefs(a);
        assert!(r.windows(2).all(|p| p[0].step <= p[1].step));
    }
    assert_eq!(m.last_write(0x1002, 0).unwrap().value, 0x11223344);
    assert_eq!(m.next_write(0x1002, 0).unwrap().value, 0xaabb);
    assert_eq!(m.last_read(0x1000, 1).unwrap().step, 1);
    assert!(m.next_read(0x1000, 2).is_none());
    assert!(m.get_write_xrefs(0x3000).is_empty());
}

#[test]
fn classification_is_idempotent() {
    let first = analyze(MEMCPY_THROUGH_STUB).0;
    let second = analyze(MEMCPY_THROUGH_STUB).0;
    assert_eq!(symbol_listing(&first), symbol_listing(&second));

    let first = analyze(CALL_CLOBBERING_R1).0;
    let second = analyze(CALL_CLOBBERING_R1).0;
    assert_eq!(symbol_listing(&first), symbol_listing(&second));
}

#[test]
fn evidence_names_are_never_reverted() {
    let (mut analysis, _) = analyze(
        "
        arch t regs 1 ptr 4
        sym helper 0x200 0x10 func
        step 0x100 jmp target=0x200
        step 0x200 jcc target=0x100
        step 0x100 call target=0x200
        call
        step 0x200 ret
        ret
        step 0x104 other
        ",
    );
    assert_eq!(analysis.symbols().get(0x200).unwrap().name, "helper");
    // The jcc already explained the entry point, so it is not renamed to `_start`
    let entry = analysis.symbols().get(0x100).unwrap();
    assert_eq!(entry.name, "loc_100");
    assert_eq!(entry.kind, SymbolKind::Location);
    assert_eq!(entry.visits.len(), 1);

    let symbols = analysis.symbols_mut();
    symbols.add_subroutine(0x200);
    symbols.add_location(0x200);
    symbols.add_syscall(0x200);
    assert_eq!(symbols.get(0x200).unwrap().name, "helper");
}

#[test]
fn syscalls_on_system_level_architectures() {
    let listing = "
        arch t regs 1 ptr 4 system
        step 0x100 syscall
        step 0x8000 other
        step 0x8004 rti
        step 0x104 other
        ";
    let (analysis, _) = analyze(listing);
    assert_eq!(analysis.syscalls().len(), 1);
    assert_eq!(analysis.symbols().get(0x8000).unwrap().name, "sc_8000");

    let (analysis, _) = analyze(&listing.replace(" system", ""));
    assert_eq!(analysis.syscalls().len(), 1);
    assert!(analysis.symbols().get(0x8000).is_none());
}

#[test]
fn devices_and_io_channels() {
    let (analysis, _) = analyze(
        "
        arch t regs 1 ptr 4
        device 1 uart
        step 0x100 other
        devev 1 hello
        devev 2 ghost
        devreg 1 4 0x41 w
        io 0 out hello world
        io 0 in yes
        device 1 uart0
        ",
    );
    assert_eq!(analysis.devices().len(), 1);
    assert_eq!(analysis.devices()[&1], "uart0");
    assert_eq!(analysis.device_events(1).len(), 2);
    assert!(analysis.device_events(2).is_empty());
    let io = analysis.io(0);
    assert_eq!(io.len(), 2);
    assert_eq!(io[0].data, b"hello world");
    assert!(!io[0].input);
    assert!(io[1].input);
    assert!(analysis.io(1).is_empty());
}

#[test]
fn main_gets_its_prototype() {
    let (analysis, _) = analyze(
        "
        arch t regs 1 ptr 4
        sym main 0x400 0x20 func
        step 0x100 call target=0x400
        call
        step 0x400 ret
        ret
        step 0x104 other
        ",
    );
    let main = analysis.symbols().get(0x400).unwrap();
    assert_eq!(
        main.prototype.as_ref().unwrap().display(&main.name).to_string(),
        "s32 main(s32 argc, char** argv, char** envp)"
    );

    let mut out = vec![];
    analysis.write_symbols(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let lines = out.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0x00000100 sub  _start visits=1"));
    assert!(lines[1].contains("main visits=1 unused=r0"));
    assert!(lines[1].ends_with("prototype=\"s32 main(s32 argc, char** argv, char** envp)\""));
}

#[test]
fn exploration_adds_static_targets() {
    let lifted = lift_from(
        "
        arch t regs 1 ptr 4
        mmap 0x100 0x1000 r-x prog
        step 0x100 jcc target=0x120
        step 0x101 call target=0x140
        step 0x140 ret
        step 0x102 jmp target=0x100
        step 0x120 ret
        ",
    )
    .unwrap();
    let tree = lifted.tree;
    let mut analysis = Analysis::new(
        Box::new(lifted.arch),
        crate::symbols::StaticSymbolTable::new(),
    );
    // Only process the mapping, nothing executes
    analysis.process(&tree, lifted.order[0]).unwrap();
    let found = analysis.explore(0x100, &|| false);
    assert_unorderedset_eq(found.subroutines.iter().copied(), [0x140]);
    assert_unorderedset_eq(found.locations.iter().copied(), [0x100, 0x120]);
    assert_eq!(analysis.symbols().get(0x140).unwrap().name, "sub_140");
    assert_eq!(analysis.symbols().get(0x120).unwrap().name, "loc_120");
}

#[test]
fn code_extents_are_recorded() {
    let (mut analysis, _) = analyze(
        "
        arch t regs 1 ptr 4
        mmap 0x100 0x1000 r-x prog
        step 0x100 other len=4
        step 0x104 other len=2
        step 0x106 jmp target=0x100 len=2
        step 0x100 other len=4
        ",
    );
    assert_eq!(analysis.code_ranges().count(), 3);
    assert_eq!(analysis.code_at(0x103).unwrap().address, 0x100);
    assert_eq!(analysis.code_at(0x105).unwrap().length, 2);
    assert!(analysis.code_at(0x108).is_none());
    assert!(analysis.code_at(0xff).is_none());

    // Decoded from memory as it is after the last step
    let found = analysis.explore_straightline(0x104);
    assert_eq!(
        found.iter().map(|c| c.address).collect::<Vec<_>>(),
        vec![0x104, 0x106]
    );
    assert!(analysis.explore_straightline(0x2000).is_empty());

    let mut out = vec![];
    analysis.write_memory_types(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert_eq!(
        out.lines().collect::<Vec<_>>(),
        vec!["0x00000100 code 4", "0x00000104 code 2", "0x00000106 code 2"]
    );
}

#[test]
fn malformed_step_sequences_are_surfaced() {
    let lifted = lift_from("arch t regs 1 ptr 4\nstep 0 other\nstep 4 other").unwrap();
    let tree = lifted.tree;
    let mut analysis = Analysis::new(
        Box::new(lifted.arch),
        crate::symbols::StaticSymbolTable::new(),
    );
    analysis.process(&tree, lifted.order[1]).unwrap();
    assert!(matches!(
        analysis.process(&tree, lifted.order[0]),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        analysis.process(&tree, 1000),
        Err(Error::IllegalState(_))
    ));
}
