//! Back-end segment iteration.
//!
//! A heap's first `HEAP_SEGMENT` coincides with the `_HEAP` structure
//! itself; further segments are reached through `SegmentListEntry` and
//! are 64-KiB aligned, which doubles as the chain terminator.

use std::collections::VecDeque;
use std::io;

use crate::env::{Bitness, Mode, TargetEnv};
use crate::error::{self, Error};
use crate::heap::PAGE_SIZE;
use crate::heap::entry::{self, Encoding, block_unit, entry_size};
use crate::processor::{AllocationRecord, Processor};
use crate::target::Target;

/// Uncommitted space follows this entry.
const SIGNATURE_UNCOMMITTED: u8 = 0x03;

/// Field offsets within `HEAP_SEGMENT`, fixed per bitness.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentLayout {
    pub first_entry: u64,
    pub last_valid_entry: u64,
    pub uncommitted_pages: u64,
    /// In-structure offset of `SegmentListEntry`; backed out of a Flink
    /// to recover the segment base.
    pub segment_list_entry: u64,
}

impl SegmentLayout {
    pub fn of(bitness: Bitness) -> SegmentLayout {
        match bitness {
            Bitness::B32 => SegmentLayout {
                first_entry: 0x24,
                last_valid_entry: 0x28,
                uncommitted_pages: 0x2c,
                segment_list_entry: 0x10,
            },
            Bitness::B64 => SegmentLayout {
                first_entry: 0x40,
                last_valid_entry: 0x48,
                uncommitted_pages: 0x50,
                segment_list_entry: 0x18,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub first_entry: u64,
    pub last_valid_entry: u64,
    pub uncommitted_pages: u64,
    /// `SegmentListEntry.Flink`, pointing into the next segment.
    pub next_flink: u64,
}

impl Segment {
    pub fn read<T: Target + ?Sized>(
        target: &T,
        env: &TargetEnv,
        address: u64,
    ) -> error::Result<Segment> {
        let layout = SegmentLayout::of(env.bitness);
        Ok(Segment {
            first_entry: target.read_pointer(address + layout.first_entry, env.bitness)?,
            last_valid_entry: target.read_pointer(address + layout.last_valid_entry, env.bitness)?,
            uncommitted_pages: u64::from(target.read_u32(address + layout.uncommitted_pages)?),
            next_flink: target.read_pointer(address + layout.segment_list_entry, env.bitness)?,
        })
    }
}

/// Walk one segment, merging the pre-bucketed front-end records into the
/// stream so `block_address` stays strictly increasing. Leftovers in
/// `pending` are flushed by the caller.
#[allow(clippy::too_many_arguments)]
pub(crate) fn walk_segment<T: Target + ?Sized, P: Processor>(
    target: &T,
    env: &TargetEnv,
    encoding: &Encoding,
    segment: &Segment,
    pending: &mut VecDeque<AllocationRecord>,
    sink: &mut P,
    console: &mut dyn io::Write,
    verbose: bool,
) -> error::Result<()> {
    let unit = block_unit(env.bitness);
    let busy = match env.mode() {
        Mode::Hpa => 0x03,
        _ => 0x01,
    };
    let committed_limit = segment
        .last_valid_entry
        .saturating_sub(segment.uncommitted_pages * PAGE_SIZE);

    let mut address = segment.first_entry;
    while address < segment.last_valid_entry {
        let raw = target.read_bytes(address, entry_size(env.bitness) as usize)?;
        let decoded = encoding.decode(env, address, &raw)?;
        if decoded.unused_bytes == SIGNATURE_UNCOMMITTED {
            break;
        }
        let gross = u64::from(decoded.size) * unit;
        if gross == 0 {
            return Err(Error::Malformed(format!("zero-size entry at {address:#x}")));
        }
        let end = address + gross;
        if end > committed_limit {
            // the remaining bytes up to LastValidEntry are uncommitted
            break;
        }
        if decoded.flags == busy {
            while let Some(front) = pending.front().copied() {
                if front.block_address >= address {
                    break;
                }
                pending.pop_front();
                sink.record(&front);
            }
            let record = entry::user_portion(target, env, address, gross, decoded.unused_bytes)?;
            if verbose {
                dprint!(
                    console,
                    "addr:{:x}, {:04x}, {:02x}, {:02x}, {:04x}, {:02x}, {:02x}",
                    address,
                    decoded.size,
                    decoded.flags,
                    decoded.small_tag_index,
                    decoded.previous_size,
                    decoded.segment_offset,
                    decoded.unused_bytes
                );
                match &record {
                    Some(record) => dprintln!(console, ", {:x}", record.ust_address),
                    None => dprintln!(console),
                }
            }
            if let Some(record) = record {
                sink.record(&record);
            }
        }
        address = end;
    }
    Ok(())
}
