//! A simulated debuggee: a sparse address space plus the symbolic
//! tables a debugger session would answer from, and builders that lay
//! out heap images byte for byte.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use heapstat::{Error, Module, Symbol, Target};

pub struct SimTarget {
    bytes: BTreeMap<u64, u8>,
    field_offsets: HashMap<(String, String), u64>,
    type_sizes: HashMap<String, u64>,
    expressions: HashMap<String, u64>,
    symbols: Vec<(u64, u64, Symbol)>,
    modules: Vec<Module>,
    teb: u64,
    peb: u64,
    pointer_64: bool,
}

impl SimTarget {
    /// A 32-bit Windows 7 target observed from a 32-bit session.
    pub fn new_win7_32() -> SimTarget {
        let _ = stderrlog::new().verbosity(2).init();
        SimTarget {
            bytes: BTreeMap::new(),
            field_offsets: HashMap::new(),
            type_sizes: HashMap::new(),
            expressions: HashMap::new(),
            symbols: Vec::new(),
            modules: Vec::new(),
            teb: 0x7ffd_e000,
            peb: 0x7ffd_c000,
            pointer_64: false,
        }
    }

    /// A 64-bit Windows 7 target; structure offsets the analyzer must
    /// resolve symbolically are preloaded with the OS values.
    pub fn new_win7_64() -> SimTarget {
        let mut target = SimTarget::new_win7_32();
        target.teb = 0x0000_00fa_1000_0000;
        target.peb = 0x0000_00fa_2000_0000;
        target.pointer_64 = true;
        target.put_field_offset("ntdll!_PEB", "NtGlobalFlag", 0xbc);
        target.put_field_offset("ntdll!_PEB", "NumberOfHeaps", 0xe8);
        target.put_field_offset("ntdll!_PEB", "ProcessHeaps", 0xf0);
        target.put_field_offset("ntdll!_PEB", "OSMajorVersion", 0x118);
        target.put_field_offset("ntdll!_PEB", "OSMinorVersion", 0x11c);
        target.put_field_offset("ntdll!_HEAP", "Encoding", 0x80);
        target
    }

    pub fn set_teb(&mut self, teb: u64) {
        self.teb = teb;
    }

    pub fn set_pointer_64(&mut self, pointer_64: bool) {
        self.pointer_64 = pointer_64;
    }

    pub fn put_bytes(&mut self, address: u64, bytes: &[u8]) {
        for (index, byte) in bytes.iter().enumerate() {
            self.bytes.insert(address + index as u64, *byte);
        }
    }

    pub fn put_u8(&mut self, address: u64, value: u8) {
        self.put_bytes(address, &[value]);
    }

    pub fn put_u16(&mut self, address: u64, value: u16) {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_u32(&mut self, address: u64, value: u32) {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_u64(&mut self, address: u64, value: u64) {
        self.put_bytes(address, &value.to_le_bytes());
    }

    pub fn put_field_offset(&mut self, type_name: &str, field: &str, offset: u64) {
        self.field_offsets
            .insert((type_name.to_string(), field.to_string()), offset);
    }

    pub fn put_type_size(&mut self, type_name: &str, size: u64) {
        self.type_sizes.insert(type_name.to_string(), size);
    }

    pub fn put_expression(&mut self, expr: &str, address: u64) {
        self.expressions.insert(expr.to_string(), address);
    }

    pub fn put_symbol(&mut self, start: u64, len: u64, module: &str, name: &str) {
        self.symbols.push((
            start,
            len,
            Symbol {
                module: module.to_string(),
                name: name.to_string(),
                displacement: 0,
            },
        ));
    }

    pub fn put_module(&mut self, base: u64, size: u64, name: &str) {
        self.modules.push(Module {
            base,
            size,
            name: name.to_string(),
        });
    }
}

impl Target for SimTarget {
    fn read_bytes(&self, address: u64, len: usize) -> heapstat::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        for index in 0..len as u64 {
            match self.bytes.get(&(address + index)) {
                Some(byte) => buf.push(*byte),
                None => return Err(Error::NotReadable(address, len)),
            }
        }
        Ok(buf)
    }

    fn field_offset(&self, type_name: &str, field: &str) -> heapstat::Result<u64> {
        self.field_offsets
            .get(&(type_name.to_string(), field.to_string()))
            .copied()
            .ok_or_else(|| Error::UnknownField(type_name.to_string(), field.to_string()))
    }

    fn type_size(&self, type_name: &str) -> heapstat::Result<u64> {
        self.type_sizes
            .get(type_name)
            .copied()
            .ok_or_else(|| Error::UnknownSymbol(type_name.to_string()))
    }

    fn resolve_expression(&self, expr: &str) -> heapstat::Result<u64> {
        if let Some(address) = self.expressions.get(expr) {
            return Ok(*address);
        }
        let literal = expr.strip_prefix("0x").unwrap_or(expr);
        u64::from_str_radix(literal, 16).map_err(|_| Error::UnknownSymbol(expr.to_string()))
    }

    fn symbolize(&self, address: u64) -> Option<Symbol> {
        self.symbols
            .iter()
            .find(|(start, len, _)| address >= *start && address - *start < *len)
            .map(|(start, _, symbol)| {
                let mut symbol = symbol.clone();
                symbol.displacement = address - *start;
                symbol
            })
    }

    fn modules(&self) -> heapstat::Result<Vec<Module>> {
        Ok(self.modules.clone())
    }

    fn teb_address(&self) -> heapstat::Result<u64> {
        Ok(self.teb)
    }

    fn peb_address(&self) -> heapstat::Result<u64> {
        Ok(self.peb)
    }

    fn is_pointer_64(&self) -> bool {
        self.pointer_64
    }
}

/// XOR masks the fixtures encode their entries with.
pub const ENCODING32: [u8; 8] = [0x3c, 0x96, 0xa5, 0x0f, 0x11, 0x22, 0x33, 0x44];
pub const ENCODING64: [u8; 8] = [0x87, 0x65, 0x43, 0x21, 0xaa, 0xbb, 0xcc, 0xdd];

/// One encoded 32-bit heap entry with a valid checksum byte.
pub fn raw_entry32(size_units: u16, flags: u8, previous: u16, signature: u8) -> [u8; 8] {
    let mut decoded = [0u8; 8];
    decoded[0..2].copy_from_slice(&size_units.to_le_bytes());
    decoded[2] = flags;
    decoded[3] = decoded[0] ^ decoded[1] ^ decoded[2];
    decoded[4..6].copy_from_slice(&previous.to_le_bytes());
    decoded[6] = 0;
    decoded[7] = signature;
    for (byte, mask) in decoded.iter_mut().zip(ENCODING32.iter()) {
        *byte ^= mask;
    }
    decoded
}

/// One encoded 64-bit heap entry: unmasked private data, then the
/// masked significant half.
pub fn raw_entry64(size_units: u16, flags: u8, previous: u16, signature: u8) -> [u8; 16] {
    let mut significant = [0u8; 8];
    significant[0..2].copy_from_slice(&size_units.to_le_bytes());
    significant[2] = flags;
    significant[3] = significant[0] ^ significant[1] ^ significant[2];
    significant[4..6].copy_from_slice(&previous.to_le_bytes());
    significant[7] = signature;
    for (byte, mask) in significant.iter_mut().zip(ENCODING64.iter()) {
        *byte ^= mask;
    }
    let mut raw = [0u8; 16];
    raw[8..].copy_from_slice(&significant);
    raw
}

pub const PEB_HEAP_ARRAY32: u64 = 0x7ffd_d000;

/// Populate the 32-bit PEB: flag, OS version 6.1 and the heap list.
pub fn setup_peb32(target: &mut SimTarget, nt_global_flag: u32, heaps: &[u32]) {
    let peb = target.peb_address().unwrap();
    target.put_u32(peb + 0x68, nt_global_flag);
    target.put_u32(peb + 0xa4, 6);
    target.put_u32(peb + 0xa8, 1);
    target.put_u32(peb + 0x88, heaps.len() as u32);
    target.put_u32(peb + 0x90, PEB_HEAP_ARRAY32 as u32);
    for (index, heap) in heaps.iter().enumerate() {
        target.put_u32(PEB_HEAP_ARRAY32 + 4 * index as u64, *heap);
    }
}

pub const PEB_HEAP_ARRAY64: u64 = 0x0000_00fa_2100_0000;

/// Populate the 64-bit PEB through its symbolic offsets.
pub fn setup_peb64(target: &mut SimTarget, nt_global_flag: u32, heaps: &[u64]) {
    let peb = target.peb_address().unwrap();
    target.put_u32(peb + 0xbc, nt_global_flag);
    target.put_u32(peb + 0x118, 6);
    target.put_u32(peb + 0x11c, 1);
    target.put_u32(peb + 0xe8, heaps.len() as u32);
    target.put_u64(peb + 0xf0, PEB_HEAP_ARRAY64);
    for (index, heap) in heaps.iter().enumerate() {
        target.put_u64(PEB_HEAP_ARRAY64 + 8 * index as u64, *heap);
    }
}

/// Lay out a single-segment 32-bit heap shell: encoding mask, segment
/// bounds, no front end, empty virtual-alloc list, terminating segment
/// chain.
pub fn setup_heap32(target: &mut SimTarget, heap: u64, first_entry: u64, last_valid: u64) {
    target.put_bytes(heap + 0x50, &ENCODING32);
    // SegmentListEntry.Flink backed out by 0x10 must leave alignment
    target.put_u32(heap + 0x10, (heap + 0x110) as u32);
    target.put_u32(heap + 0x24, first_entry as u32);
    target.put_u32(heap + 0x28, last_valid as u32);
    target.put_u32(heap + 0x2c, 0);
    // VirtualAllocdBlocks: empty circular list
    target.put_u32(heap + 0xa0, (heap + 0xa0) as u32);
    target.put_u32(heap + 0xa4, (heap + 0xa0) as u32);
    // no front end
    target.put_u32(heap + 0xd4, 0);
    target.put_u8(heap + 0xda, 0);
}

/// 64-bit version of [`setup_heap32`].
pub fn setup_heap64(target: &mut SimTarget, heap: u64, first_entry: u64, last_valid: u64) {
    let mut encoding = [0u8; 16];
    encoding[8..].copy_from_slice(&ENCODING64);
    target.put_bytes(heap + 0x80, &encoding);
    target.put_u64(heap + 0x18, heap + 0x118);
    target.put_u64(heap + 0x40, first_entry);
    target.put_u64(heap + 0x48, last_valid);
    target.put_u32(heap + 0x50, 0);
    target.put_u64(heap + 0x118, heap + 0x118);
    target.put_u64(heap + 0x120, heap + 0x118);
    target.put_u64(heap + 0x178, 0);
    target.put_u8(heap + 0x182, 0);
}

/// Terminator entry: uncommitted space follows.
pub fn put_terminator32(target: &mut SimTarget, address: u64) {
    target.put_bytes(address, &raw_entry32(1, 0, 0, 0x03));
}

pub fn put_terminator64(target: &mut SimTarget, address: u64) {
    target.put_bytes(address, &raw_entry64(1, 0, 0, 0x03));
}

/// A stack-trace database record; `hpa` moves the depth field.
pub fn put_ust32(target: &mut SimTarget, address: u64, hpa: bool, frames: &[u32]) {
    let depth_offset = if hpa { 0xa } else { 0x8 };
    target.put_u16(address + depth_offset, frames.len() as u16);
    for (index, frame) in frames.iter().enumerate() {
        target.put_u32(address + 0xc + 4 * index as u64, *frame);
    }
}

pub fn put_ust64(target: &mut SimTarget, address: u64, hpa: bool, frames: &[u64]) {
    let depth_offset = if hpa { 0xe } else { 0xc };
    target.put_u16(address + depth_offset, frames.len() as u16);
    for (index, frame) in frames.iter().enumerate() {
        target.put_u64(address + 0x10 + 8 * index as u64, *frame);
    }
}

/// The post-header prefix of a busy 32-bit block under UST: the record
/// pointer and the extra (overhead) field.
pub fn put_ust_block_prefix32(target: &mut SimTarget, block: u64, ust: u32, extra: u16) {
    target.put_u32(block + 8, ust);
    target.put_u16(block + 8 + 0xc, extra);
}

/// A processor that records the full emission stream for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StartHeap(u64),
    StartSegment(u64, u64),
    Record(heapstat::AllocationRecord),
    FinishSegment(u64, u64),
    FinishHeap(u64),
}

impl heapstat::Processor for RecordingSink {
    fn start_heap(&mut self, heap_address: u64) {
        self.events.push(Event::StartHeap(heap_address));
    }

    fn start_segment(&mut self, start: u64, end: u64) {
        self.events.push(Event::StartSegment(start, end));
    }

    fn record(&mut self, record: &heapstat::AllocationRecord) {
        self.events.push(Event::Record(*record));
    }

    fn finish_segment(&mut self, start: u64, end: u64) {
        self.events.push(Event::FinishSegment(start, end));
    }

    fn finish_heap(&mut self, heap_address: u64) {
        self.events.push(Event::FinishHeap(heap_address));
    }
}

impl RecordingSink {
    pub fn records(&self) -> Vec<heapstat::AllocationRecord> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Record(record) => Some(*record),
                _ => None,
            })
            .collect()
    }
}

pub const HEAP32: u64 = 0x0015_0000;
pub const UST_A: u64 = 0x0030_0000;
pub const UST_B: u64 = 0x0030_0100;

/// A 32-bit UST-mode heap with two callers: A allocates twice with
/// `a_units`-unit blocks, B once with a 0x100-byte block. Stacks lead
/// through `ntdll` into an application module.
pub fn ust_fixture32_with(a_units: u16) -> SimTarget {
    let mut target = SimTarget::new_win7_32();
    setup_peb32(&mut target, 0x0000_1000, &[HEAP32 as u32]);
    let first = HEAP32 + 0x580;
    let last = HEAP32 + 0x2000;
    setup_heap32(&mut target, HEAP32, first, last);

    let a_gross = u64::from(a_units) * 8;
    let a1 = first;
    let a2 = a1 + a_gross;
    let b1 = a2 + a_gross;
    target.put_bytes(a1, &raw_entry32(a_units, 1, 0, 0));
    put_ust_block_prefix32(&mut target, a1, UST_A as u32, 0x18);
    target.put_bytes(a2, &raw_entry32(a_units, 1, a_units, 0));
    put_ust_block_prefix32(&mut target, a2, UST_A as u32, 0x18);
    target.put_bytes(b1, &raw_entry32(0x20, 1, a_units, 0));
    put_ust_block_prefix32(&mut target, b1, UST_B as u32, 0x18);
    put_terminator32(&mut target, b1 + 0x100);

    put_ust32(&mut target, UST_A, false, &[0x7701_0010, 0x7c90_1234]);
    put_ust32(&mut target, UST_B, false, &[0x7c90_5678, 0x7702_0020]);

    target.put_module(0x7c90_0000, 0x10_0000, "C:\\Windows\\System32\\ntdll.dll");
    target.put_module(0x7700_0000, 0x10_0000, "C:\\app\\leaky.exe");
    target.put_symbol(0x7701_0000, 0x100, "leaky", "make_widget");
    target.put_symbol(0x7702_0000, 0x100, "leaky", "make_gadget");
    target.put_symbol(0x7c90_1000, 0x1000, "ntdll", "RtlAllocateHeap");
    target.put_symbol(0x7c90_5000, 0x1000, "ntdll", "RtlReAllocateHeap");
    target
}

pub fn ust_fixture32() -> SimTarget {
    ust_fixture32_with(8)
}
