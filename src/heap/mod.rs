//! The heap walker: discovery, per-heap orchestration and the emission
//! protocol.
//!
//! One [`Walker`] serves one command. It enumerates the heaps recorded
//! in the PEB (or, under HPA, the verifier's shadow list), and per heap
//! emits a single address-ordered stream of [`AllocationRecord`]s into
//! the sink: front-end and back-end records interleaved per segment,
//! virtual-alloc records trailing.

pub mod entry;
mod lfh;
mod page_heap;
mod segment;
mod virtual_alloc;

pub use self::entry::{Encoding, HeapEntry};

use std::collections::VecDeque;
use std::io;

use log::debug;

use crate::env::{Bitness, Mode, TargetEnv};
use crate::error::{self, Error};
use crate::processor::{AllocationRecord, Processor};
use crate::target::Target;

pub const PAGE_SIZE: u64 = 0x1000;

/// Knobs for one walk.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Trace every busy back-end entry to the console.
    pub verbose: bool,
    /// Upper bound on visited page-heap tree nodes; a cycle in a
    /// corrupted table must not pin the walk.
    pub dph_node_ceiling: usize,
}

impl Default for WalkOptions {
    fn default() -> WalkOptions {
        WalkOptions {
            verbose: false,
            dph_node_ceiling: 1 << 20,
        }
    }
}

pub struct Walker<'a, T: Target + ?Sized> {
    target: &'a T,
    env: TargetEnv,
    options: WalkOptions,
}

impl<'a, T: Target + ?Sized> Walker<'a, T> {
    pub fn new(target: &'a T, env: TargetEnv) -> Walker<'a, T> {
        Walker::with_options(target, env, WalkOptions::default())
    }

    pub fn with_options(target: &'a T, env: TargetEnv, options: WalkOptions) -> Walker<'a, T> {
        Walker {
            target,
            env,
            options,
        }
    }

    /// Heap base addresses from `PEB.NumberOfHeaps` / `PEB.ProcessHeaps`.
    pub fn heap_addresses(&self) -> error::Result<Vec<u64>> {
        let target = self.target;
        let env = &self.env;
        let (count_offset, heaps_offset) = match env.bitness {
            Bitness::B32 => (0x88, 0x90),
            Bitness::B64 => (
                target.field_offset("ntdll!_PEB", "NumberOfHeaps")?,
                target.field_offset("ntdll!_PEB", "ProcessHeaps")?,
            ),
        };
        let count = target.read_u32(env.peb + count_offset)?;
        let array = target.read_pointer(env.peb + heaps_offset, env.bitness)?;
        let mut heaps = Vec::with_capacity(count as usize);
        for index in 0..u64::from(count) {
            heaps.push(target.read_pointer(array + index * env.pointer_size(), env.bitness)?);
        }
        Ok(heaps)
    }

    /// Walk every heap of the target. A heap whose mandatory reads fail
    /// is abandoned with a console diagnostic; the remaining heaps still
    /// run and whatever was emitted stays in the sink.
    pub fn walk<P: Processor>(
        &self,
        sink: &mut P,
        console: &mut dyn io::Write,
    ) -> error::Result<()> {
        if self.env.mode() == Mode::Hpa {
            return page_heap::walk(self.target, &self.env, &self.options, sink, console);
        }
        for (index, heap) in self.heap_addresses()?.into_iter().enumerate() {
            if self.options.verbose {
                dprintln!(console, "heap[{}] at {:x}", index, heap);
            }
            sink.start_heap(heap);
            let result = self.walk_heap(heap, sink, console);
            sink.finish_heap(heap);
            if let Err(err) = result {
                dprintln!(console, "heap at {:x}: walk aborted: {}", heap, err);
            }
        }
        Ok(())
    }

    fn walk_heap<P: Processor>(
        &self,
        heap: u64,
        sink: &mut P,
        console: &mut dyn io::Write,
    ) -> error::Result<()> {
        let target = self.target;
        let env = &self.env;
        let encoding = Encoding::read(target, env, heap)?;
        let mut front_end = lfh::collect_records(target, env, heap)?;

        let layout = segment::SegmentLayout::of(env.bitness);
        let mut segment_address = heap;
        let mut segment_index = 0u32;
        // heaps are 64-KiB aligned; a Flink back into the _HEAP body is
        // not, which terminates the chain
        while segment_address & 0xffff == 0 {
            let seg = segment::Segment::read(target, env, segment_address)?;
            if self.options.verbose {
                dprintln!(console, "segment {}", segment_index);
            }
            let mut pending = drain_range(&mut front_end, seg.first_entry, seg.last_valid_entry);
            sink.start_segment(segment_address, seg.last_valid_entry);
            let walked = segment::walk_segment(
                target,
                env,
                &encoding,
                &seg,
                &mut pending,
                sink,
                console,
                self.options.verbose,
            );
            while let Some(record) = pending.pop_front() {
                sink.record(&record);
            }
            sink.finish_segment(segment_address, seg.last_valid_entry);
            match walked {
                Ok(()) => {}
                Err(Error::HeaderInvalid(address)) => {
                    dprintln!(
                        console,
                        "segment at {:x}: entry checksum failed at {:x}",
                        segment_address,
                        address
                    );
                }
                Err(err) => return Err(err),
            }
            segment_address = seg.next_flink.wrapping_sub(layout.segment_list_entry);
            segment_index += 1;
        }

        if !front_end.is_empty() {
            debug!(
                "heap {:#x}: dropping {} front-end records outside any segment",
                heap,
                front_end.len()
            );
        }

        virtual_alloc::walk(target, env, heap, &encoding, sink)
    }
}

/// Move the records within `[start, end)` out of `records`, preserving
/// address order.
fn drain_range(records: &mut Vec<AllocationRecord>, start: u64, end: u64) -> VecDeque<AllocationRecord> {
    let mut in_range = VecDeque::new();
    records.retain(|record| {
        if record.block_address >= start && record.block_address < end {
            in_range.push_back(*record);
            false
        } else {
            true
        }
    });
    in_range
}
