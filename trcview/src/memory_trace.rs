//! The memory access trace and its cross-reference index.
//!
//! Every byte that the trace touches keeps its own timeline of writes and reads, ordered by step.
//! Mappings are tracked per 4 KiB page, each page keeping the history of mappings placed over it.
//! Together these answer "what was at address A at step S" and "which steps touched A".

use crate::containers::unordered::UnorderedMap;
use crate::error::{Error, Result};
use crate::log::*;
use crate::node::NodeId;

use std::collections::BTreeMap;

pub const PAGE_SIZE: u64 = 4096;

fn page_base(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const RW: Protection = Protection {
        read: true,
        write: true,
        execute: false,
    };

    /// Parse the `rwx` notation, with `-` for absent permissions
    pub fn parse(s: &str) -> Option<Protection> {
        let b = s.as_bytes();
        if b.len() != 3 {
            return None;
        }
        let flag = |c: u8, set: u8| match c {
            b'-' => Some(false),
            c if c == set => Some(true),
            _ => None,
        };
        Some(Protection {
            read: flag(b[0], b'r')?,
            write: flag(b[1], b'w')?,
            execute: flag(b[2], b'x')?,
        })
    }
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

/// A recorded write, as seen from each byte it covers
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryUpdate {
    pub step: u64,
    pub node: NodeId,
    pub address: u64,
    pub size: u8,
    pub value: u64,
    pub big_endian: bool,
}

impl MemoryUpdate {
    /// The byte this write stored at `address`
    pub fn byte_at(&self, address: u64) -> Option<u8> {
        let offset = address.checked_sub(self.address)?;
        if offset >= self.size as u64 {
            return None;
        }
        let shift = if self.big_endian {
            (self.size as u64 - 1 - offset) * 8
        } else {
            offset * 8
        };
        Some((self.value >> shift) as u8)
    }
}

/// A recorded read, as seen from each byte it covers
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemoryRead {
    pub step: u64,
    pub node: NodeId,
    pub address: u64,
    pub size: u8,
}

/// A contiguous mapped range
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MemorySegment {
    pub base: u64,
    pub length: u64,
    pub protection: Protection,
    pub name: Option<String>,
    /// Step at which the mapping was created
    pub mapped_step: u64,
}

impl MemorySegment {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.length
    }
}

#[derive(Clone, Debug)]
struct Page {
    /// Base of the mapping this page belongs to
    segment: u64,
    segment_length: u64,
    mapped_step: u64,
    node: NodeId,
    protection: Protection,
    name: Option<String>,
    /// Initial contents; zero filled if absent
    data: Option<Box<[u8]>>,
}

#[derive(Clone, Debug, Default)]
struct ByteTimeline {
    writes: Vec<MemoryUpdate>,
    reads: Vec<MemoryRead>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Recording,
    Sealed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MemoryStats {
    pub pages: usize,
    pub addresses: usize,
    pub writes: usize,
    pub reads: usize,
}

/// Time- and address-indexed log of memory activity
#[derive(Clone, Debug)]
pub struct MemoryTrace {
    /// Mapping history per page, oldest first
    pages: BTreeMap<u64, Vec<Page>>,
    bytes: UnorderedMap<u64, ByteTimeline>,
    brk: Option<u64>,
    state: State,
    stats: MemoryStats,
}

impl Default for MemoryTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTrace {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            bytes: UnorderedMap::new(),
            brk: None,
            state: State::Recording,
            stats: MemoryStats::default(),
        }
    }

    fn check_recording(&self) -> Result<()> {
        match self.state {
            State::Recording => Ok(()),
            State::Sealed => Err(Error::SealedMemoryTrace),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.state == State::Sealed
    }

    /// Map `[address, address + length)` at `step`. `data`, if given, is the initial content
    /// starting at `address`; everything else reads as zero.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &mut self,
        address: u64,
        length: u64,
        protection: Protection,
        name: Option<&str>,
        data: Option<&[u8]>,
        step: u64,
        node: NodeId,
    ) -> Result<()> {
        self.check_recording()?;
        if length == 0 {
            return Ok(());
        }
        let first = page_base(address);
        let end = address.saturating_add(length);
        trace!("mmap";
               "address" => Hex(address),
               "length" => Hex(length),
               "protection" => %protection,
               OptionalKV("name", name),
        );
        let mut page = first;
        while page < end {
            let contents = data.map(|data| {
                let mut bytes = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
                for (i, b) in bytes.iter_mut().enumerate() {
                    let a = page + i as u64;
                    if a >= address {
                        if let Some(d) = data.get((a - address) as usize) {
                            *b = *d;
                        }
                    }
                }
                bytes
            });
            self.pages.entry(page).or_default().push(Page {
                segment: address,
                segment_length: length,
                mapped_step: step,
                node,
                protection,
                name: name.map(str::to_string),
                data: contents,
            });
            page = match page.checked_add(PAGE_SIZE) {
                Some(p) => p,
                None => break,
            };
        }
        Ok(())
    }

    /// Move the program break. The first call only establishes the initial break; growing it
    /// afterwards maps the new range as a zero-filled `[heap]` segment.
    pub fn brk(&mut self, new_break: u64, step: u64, node: NodeId) -> Result<()> {
        self.check_recording()?;
        let aligned = page_base(new_break.saturating_add(PAGE_SIZE - 1));
        match self.brk {
            None => {
                debug!("Initial program break"; "brk" => Hex(new_break));
            }
            Some(old) if aligned > old => {
                self.mmap(old, aligned - old, Protection::RW, Some("[heap]"), None, step, node)?;
            }
            Some(_) => {}
        }
        self.brk = Some(self.brk.map_or(aligned, |old| old.max(aligned)));
        Ok(())
    }

    pub fn current_break(&self) -> Option<u64> {
        self.brk
    }

    fn page(&self, address: u64, step: u64) -> Result<&Page> {
        self.pages
            .get(&page_base(address))
            .and_then(|history| history.iter().rev().find(|p| p.mapped_step <= step))
            .ok_or(Error::MemoryNotMapped { address, step })
    }

    /// Record a write of `size` bytes
    pub fn write(
        &mut self,
        address: u64,
        size: usize,
        value: u64,
        step: u64,
        node: NodeId,
        big_endian: bool,
    ) -> Result<()> {
        self.check_recording()?;
        check_size(size)?;
        for a in byte_range(address, size) {
            self.page(a, step)?;
        }
        let update = MemoryUpdate {
            step,
            node,
            address,
            size: size as u8,
            value,
            big_endian,
        };
        for a in byte_range(address, size) {
            let writes = &mut self.bytes.entry(a).or_default().writes;
            let pos = writes.partition_point(|w| w.step <= step);
            writes.insert(pos, update);
        }
        self.stats.writes += 1;
        Ok(())
    }

    /// Record a read of `size` bytes, returning the bytes as they were at `step`. This adds an
    /// xref, so it fails with [`Error::SealedMemoryTrace`] after [`Self::trim`]; use
    /// [`Self::peek`] to look at a sealed trace.
    pub fn read(&mut self, address: u64, size: usize, step: u64, node: NodeId) -> Result<Vec<u8>> {
        self.check_recording()?;
        let bytes = self.peek(address, size, step)?;
        let read = MemoryRead {
            step,
            node,
            address,
            size: size as u8,
        };
        for a in byte_range(address, size) {
            let reads = &mut self.bytes.entry(a).or_default().reads;
            let pos = reads.partition_point(|r| r.step <= step);
            reads.insert(pos, read);
        }
        self.stats.reads += 1;
        Ok(bytes)
    }

    /// The `size` bytes at `address` as of `step`, without recording a read
    pub fn peek(&self, address: u64, size: usize, step: u64) -> Result<Vec<u8>> {
        check_size(size)?;
        byte_range(address, size)
            .map(|a| self.byte_at(a, step))
            .collect()
    }

    /// The byte at `address` as of `step`: the latest write at or before `step` made under the
    /// mapping valid at `step`, else the mapping's initial content.
    pub fn byte_at(&self, address: u64, step: u64) -> Result<u8> {
        let page = self.page(address, step)?;
        if let Some(w) = self.last_write(address, step) {
            if w.step >= page.mapped_step {
                if let Some(b) = w.byte_at(address) {
                    return Ok(b);
                }
            }
        }
        Ok(page
            .data
            .as_ref()
            .map_or(0, |d| d[(address - page_base(address)) as usize]))
    }

    /// A `size` byte value at `address` as of `step`
    pub fn value_at(&self, address: u64, size: usize, step: u64, big_endian: bool) -> Result<u64> {
        check_size(size)?;
        let mut value = 0u64;
        for (i, a) in byte_range(address, size).enumerate() {
            let b = self.byte_at(a, step)? as u64;
            if big_endian {
                value = (value << 8) | b;
            } else {
                value |= b << (8 * i);
            }
        }
        Ok(value)
    }

    /// The most recent value at `address`, regardless of step
    pub fn last_value(&self, address: u64, size: usize, big_endian: bool) -> Option<u64> {
        self.value_at(address, size, u64::MAX, big_endian).ok()
    }

    /// All writes covering `address`, by step ascending
    pub fn get_write_xrefs(&self, address: u64) -> &[MemoryUpdate] {
        self.bytes.get(&address).map_or(&[], |t| &t.writes)
    }

    /// All reads covering `address`, by step ascending
    pub fn get_read_xrefs(&self, address: u64) -> &[MemoryRead] {
        self.bytes.get(&address).map_or(&[], |t| &t.reads)
    }

    /// The latest write to `address` at or before `step`
    pub fn last_write(&self, address: u64, step: u64) -> Option<&MemoryUpdate> {
        let w = self.get_write_xrefs(address);
        w[..w.partition_point(|w| w.step <= step)].last()
    }

    /// The first write to `address` after `step`
    pub fn next_write(&self, address: u64, step: u64) -> Option<&MemoryUpdate> {
        let w = self.get_write_xrefs(address);
        w.get(w.partition_point(|w| w.step <= step))
    }

    pub fn last_read(&self, address: u64, step: u64) -> Option<&MemoryRead> {
        let r = self.get_read_xrefs(address);
        r[..r.partition_point(|r| r.step <= step)].last()
    }

    pub fn next_read(&self, address: u64, step: u64) -> Option<&MemoryRead> {
        let r = self.get_read_xrefs(address);
        r.get(r.partition_point(|r| r.step <= step))
    }

    /// Up to `max` writes to `address` at or before `step`, newest first
    pub fn previous_writes(&self, address: u64, step: u64, max: usize) -> Vec<&MemoryUpdate> {
        let w = self.get_write_xrefs(address);
        w[..w.partition_point(|w| w.step <= step)]
            .iter()
            .rev()
            .take(max)
            .collect()
    }

    /// The mapping that covers `address` at `step`
    pub fn segment(&self, address: u64, step: u64) -> Result<MemorySegment> {
        let page = self.page(address, step)?;
        Ok(MemorySegment {
            base: page.segment,
            length: page.segment_length,
            protection: page.protection,
            name: page.name.clone(),
            mapped_step: page.mapped_step,
        })
    }

    pub fn protection(&self, address: u64, step: u64) -> Result<Protection> {
        Ok(self.page(address, step)?.protection)
    }

    /// Node of the event that created the mapping covering `address` at `step`
    pub fn map_node(&self, address: u64, step: u64) -> Result<NodeId> {
        Ok(self.page(address, step)?.node)
    }

    /// Mapped regions at `step`, by address. Adjacent pages of the same mapping are merged.
    pub fn regions(&self, step: u64) -> Vec<MemorySegment> {
        let mut regions: Vec<MemorySegment> = vec![];
        for (&base, history) in &self.pages {
            let page = match history.iter().rev().find(|p| p.mapped_step <= step) {
                Some(p) => p,
                None => continue,
            };
            if let Some(last) = regions.last_mut() {
                if last.base + last.length == base
                    && last.mapped_step == page.mapped_step
                    && last.protection == page.protection
                    && last.name == page.name
                {
                    last.length += PAGE_SIZE;
                    continue;
                }
            }
            regions.push(MemorySegment {
                base,
                length: PAGE_SIZE,
                protection: page.protection,
                name: page.name.clone(),
                mapped_step: page.mapped_step,
            });
        }
        regions
    }

    /// Compact the trace once ingestion is complete. Afterwards it is read-only.
    pub fn trim(&mut self) -> Result<()> {
        self.check_recording()?;
        for t in self.bytes.values_mut() {
            t.writes.shrink_to_fit();
            t.reads.shrink_to_fit();
        }
        self.state = State::Sealed;
        Ok(())
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            pages: self.pages.len(),
            addresses: self.bytes.len(),
            ..self.stats
        }
    }

    pub fn print_stats(&self) {
        let s = self.stats();
        info!("Memory trace";
              "pages" => s.pages,
              "addresses" => s.addresses,
              "writes" => s.writes,
              "reads" => s.reads,
              "sealed" => self.is_sealed());
    }
}

fn check_size(size: usize) -> Result<()> {
    match size {
        1 | 2 | 4 | 8 => Ok(()),
        size => Err(Error::InvalidAccessSize { size }),
    }
}

fn byte_range(address: u64, size: usize) -> impl Iterator<Item = u64> {
    (0..size as u64).map(move |i| address.wrapping_add(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped() -> MemoryTrace {
        let mut m = MemoryTrace::new();
        m.mmap(0x1000, 0x2000, Protection::RW, Some("data"), None, 0, 0)
            .unwrap();
        m
    }

    #[test]
    fn round_trip() {
        let mut m = mapped();
        m.write(0x1100, 4, 0xdeadbeef, 5, 1, false).unwrap();
        assert_eq!(m.value_at(0x1100, 4, 5, false).unwrap(), 0xdeadbeef);
        assert_eq!(m.value_at(0x1100, 4, 100, false).unwrap(), 0xdeadbeef);
        assert_eq!(m.byte_at(0x1100, 5).unwrap(), 0xef);
        // Before the write: zero filled
        assert_eq!(m.value_at(0x1100, 4, 4, false).unwrap(), 0);

        m.write(0x1102, 2, 0x1234, 9, 2, true).unwrap();
        assert_eq!(m.value_at(0x1100, 4, 9, false).unwrap(), 0x3412beef);
        assert_eq!(m.value_at(0x1100, 4, 8, false).unwrap(), 0xdeadbeef);
        assert_eq!(m.read(0x1102, 2, 10, 3).unwrap(), vec![0x12, 0x34]);
    }

    #[test]
    fn file_backed_mapping_and_remap() {
        let mut m = MemoryTrace::new();
        m.mmap(0x4000, 3, Protection::parse("r-x").unwrap(), Some("a.out"), Some(&[1, 2, 3]), 2, 0)
            .unwrap();
        assert_eq!(m.byte_at(0x4001, 2).unwrap(), 2);
        assert_eq!(m.byte_at(0x4003, 2).unwrap(), 0);
        assert!(matches!(
            m.byte_at(0x4001, 1),
            Err(Error::MemoryNotMapped { address: 0x4001, step: 1 })
        ));
        assert_eq!(m.protection(0x4000, 3).unwrap().to_string(), "r-x");

        m.write(0x4000, 1, 0xff, 3, 0, false).unwrap();
        m.mmap(0x4000, 0x1000, Protection::RW, None, None, 7, 0)
            .unwrap();
        // The new mapping hides writes made under the old one
        assert_eq!(m.byte_at(0x4000, 7).unwrap(), 0);
        assert_eq!(m.byte_at(0x4000, 6).unwrap(), 0xff);
        assert_eq!(m.segment(0x4fff, 8).unwrap().base, 0x4000);
    }

    #[test]
    fn unmapped_and_bad_accesses() {
        let mut m = mapped();
        assert!(matches!(
            m.write(0x5000, 1, 0, 1, 0, false),
            Err(Error::MemoryNotMapped { address: 0x5000, .. })
        ));
        assert!(matches!(
            m.write(0x2fff, 2, 0, 1, 0, false),
            Err(Error::MemoryNotMapped { address: 0x3000, .. })
        ));
        assert!(m.get_write_xrefs(0x2fff).is_empty());
        assert!(matches!(
            m.write(0x1000, 3, 0, 1, 0, false),
            Err(Error::InvalidAccessSize { size: 3 })
        ));
        assert!(m.read(0x9000, 1, 1, 0).is_err());
    }

    #[test]
    fn xrefs_are_ordered_and_searchable() {
        let mut m = mapped();
        for step in [3, 10, 20] {
            m.write(0x1000, 8, step, step, step as usize, false).unwrap();
        }
        m.read(0x1004, 4, 4, 4).unwrap();
        m.read(0x1006, 1, 12, 12).unwrap();

        let writes = m.get_write_xrefs(0x1006);
        assert_eq!(writes.iter().map(|w| w.step).collect::<Vec<_>>(), vec![3, 10, 20]);
        let reads = m.get_read_xrefs(0x1006);
        assert_eq!(reads.iter().map(|r| r.step).collect::<Vec<_>>(), vec![4, 12]);
        assert_eq!(m.get_read_xrefs(0x1003).len(), 0);

        assert_eq!(m.last_write(0x1000, 15).unwrap().step, 10);
        assert_eq!(m.next_write(0x1000, 10).unwrap().step, 20);
        assert!(m.next_write(0x1000, 20).is_none());
        assert!(m.last_write(0x1000, 2).is_none());
        assert_eq!(m.last_read(0x1006, 11).unwrap().step, 4);
        assert_eq!(m.next_read(0x1006, 4).unwrap().step, 12);
        assert_eq!(
            m.previous_writes(0x1000, 25, 2)
                .iter()
                .map(|w| w.step)
                .collect::<Vec<_>>(),
            vec![20, 10]
        );
    }

    #[test]
    fn brk_and_regions() {
        let mut m = mapped();
        m.brk(0x10010, 1, 0).unwrap();
        assert_eq!(m.current_break(), Some(0x11000));
        assert!(m.byte_at(0x11000, 2).is_err());
        m.brk(0x12800, 2, 0).unwrap();
        assert_eq!(m.byte_at(0x12000, 2).unwrap(), 0);
        assert_eq!(m.protection(0x11000, 2).unwrap(), Protection::RW);

        let regions = m.regions(2);
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].base, regions[0].length), (0x1000, 0x2000));
        assert_eq!((regions[1].base, regions[1].length), (0x11000, 0x2000));
        assert_eq!(regions[1].name.as_deref(), Some("[heap]"));
        assert_eq!(m.regions(1).len(), 1);
    }

    #[test]
    fn sealed_trace_rejects_mutation() {
        let mut m = mapped();
        m.write(0x1000, 1, 7, 1, 0, false).unwrap();
        m.trim().unwrap();
        assert!(m.is_sealed());
        assert!(matches!(m.write(0x1000, 1, 0, 2, 0, false), Err(Error::SealedMemoryTrace)));
        assert!(matches!(m.trim(), Err(Error::SealedMemoryTrace)));
        assert!(matches!(m.read(0x1000, 1, 2, 0), Err(Error::SealedMemoryTrace)));
        // Queries still work
        assert_eq!(m.byte_at(0x1000, 1).unwrap(), 7);
        assert_eq!(m.peek(0x1000, 2, 1).unwrap(), vec![7, 0]);
        assert!(m.get_read_xrefs(0x1000).is_empty());
        assert!(matches!(m.peek(0x1000, 3, 1), Err(Error::InvalidAccessSize { size: 3 })));
        assert_eq!(m.stats().writes, 1);
    }
}
