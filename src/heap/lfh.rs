//! The low-fragmentation front end: zones, sub-segments and the blocks
//! they serve.
//!
//! Front-end blocks are not chained like back-end entries; they sit in
//! fixed-stride runs inside `UserBlocks` areas that the back end
//! allocated. The collector returns them sorted by address so the
//! segment walk can interleave them into a single ordered stream.

use log::debug;

use crate::env::{Bitness, Mode, TargetEnv};
use crate::error;
use crate::heap::entry::{self, block_unit, entry_size};
use crate::processor::AllocationRecord;
use crate::target::Target;

/// `_HEAP.FrontEndHeapType` value selecting the LFH.
const FRONT_END_LFH: u8 = 0x02;
/// `ExtendedBlockSignature` of a busy front-end block under UST.
const BUSY_UST: u8 = 0xc2;

enum FirstAllocation {
    /// Blocks start after a fixed `_HEAP_USERDATA_HEADER` (pre-Win8).
    HeaderSize(u64),
    /// Blocks start at the `FirstAllocationOffset` the header itself
    /// records (Win8+); the value is the offset of that 16-bit field.
    FieldOffset(u64),
}

struct LfhLayout {
    subsegment_zones: u64,
    zone_header: u64,
    zone_limit: u64,
    zone_free_pointer: Option<u64>,
    subseg_user_blocks: u64,
    subseg_block_size: u64,
    subseg_block_count: u64,
    subseg_stride: u64,
    first_allocation: FirstAllocation,
}

impl LfhLayout {
    /// Pre-Win8 layouts are fixed per bitness; Win8 reshuffled the
    /// structures, so from there the symbol files decide.
    fn resolve<T: Target + ?Sized>(target: &T, env: &TargetEnv) -> error::Result<LfhLayout> {
        if env.os_version.is_win8_or_later() {
            return Ok(LfhLayout {
                subsegment_zones: target.field_offset("ntdll!_LFH_HEAP", "SubSegmentZones")?,
                zone_header: target.type_size("ntdll!_LFH_BLOCK_ZONE")?,
                zone_limit: target.field_offset("ntdll!_LFH_BLOCK_ZONE", "Limit")?,
                zone_free_pointer: target
                    .field_offset("ntdll!_LFH_BLOCK_ZONE", "FreePointer")
                    .ok(),
                subseg_user_blocks: target.field_offset("ntdll!_HEAP_SUBSEGMENT", "UserBlocks")?,
                subseg_block_size: target.field_offset("ntdll!_HEAP_SUBSEGMENT", "BlockSize")?,
                subseg_block_count: target.field_offset("ntdll!_HEAP_SUBSEGMENT", "BlockCount")?,
                subseg_stride: target.type_size("ntdll!_HEAP_SUBSEGMENT")?,
                first_allocation: FirstAllocation::FieldOffset(
                    target.field_offset("ntdll!_HEAP_USERDATA_HEADER", "FirstAllocationOffset")?,
                ),
            });
        }
        Ok(match env.bitness {
            Bitness::B32 => LfhLayout {
                subsegment_zones: 0x18,
                zone_header: 0x10,
                zone_limit: 0x0c,
                zone_free_pointer: Some(0x08),
                subseg_user_blocks: 0x04,
                subseg_block_size: 0x10,
                subseg_block_count: 0x14,
                subseg_stride: 0x20,
                first_allocation: FirstAllocation::HeaderSize(0x10),
            },
            Bitness::B64 => LfhLayout {
                subsegment_zones: 0x28,
                zone_header: 0x20,
                zone_limit: 0x18,
                zone_free_pointer: Some(0x10),
                subseg_user_blocks: 0x08,
                subseg_block_size: 0x18,
                subseg_block_count: 0x1c,
                subseg_stride: 0x30,
                first_allocation: FirstAllocation::HeaderSize(0x20),
            },
        })
    }
}

/// `_HEAP.FrontEndHeapType` / `_HEAP.FrontEndHeap` offsets.
fn front_end_offsets<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
) -> error::Result<(u64, u64)> {
    if env.os_version.is_win8_or_later() {
        Ok((
            target.field_offset("ntdll!_HEAP", "FrontEndHeapType")?,
            target.field_offset("ntdll!_HEAP", "FrontEndHeap")?,
        ))
    } else {
        Ok(match env.bitness {
            Bitness::B32 => (0xda, 0xd4),
            Bitness::B64 => (0x182, 0x178),
        })
    }
}

/// All busy front-end blocks of `heap`, sorted by block address. Empty
/// when no LFH is active.
pub(crate) fn collect_records<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    heap: u64,
) -> error::Result<Vec<AllocationRecord>> {
    let (type_offset, heap_offset) = front_end_offsets(target, env)?;
    if target.read_u8(heap + type_offset)? != FRONT_END_LFH {
        return Ok(Vec::new());
    }
    let lfh = target.read_pointer(heap + heap_offset, env.bitness)?;
    if lfh == 0 {
        return Ok(Vec::new());
    }
    let layout = LfhLayout::resolve(target, env)?;

    let mut records = Vec::new();
    let head = lfh + layout.subsegment_zones;
    let mut zone = target.read_pointer(head, env.bitness)?;
    while zone != head && zone != 0 {
        collect_zone(target, env, &layout, zone, &mut records)?;
        // the zone's own list entry leads the structure
        zone = target.read_pointer(zone, env.bitness)?;
    }
    records.sort_by_key(|record| record.block_address);
    debug!("lfh at {:#x}: {} busy blocks", lfh, records.len());
    Ok(records)
}

fn collect_zone<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    layout: &LfhLayout,
    zone: u64,
    records: &mut Vec<AllocationRecord>,
) -> error::Result<()> {
    let mut bound = target.read_pointer(zone + layout.zone_limit, env.bitness)?;
    if bound == 0 {
        if let Some(free_pointer) = layout.zone_free_pointer {
            bound = target.read_pointer(zone + free_pointer, env.bitness)?;
        }
    }

    let mut subsegment = zone + layout.zone_header;
    while subsegment < bound {
        let block_size = target.read_u16(subsegment + layout.subseg_block_size)?;
        if block_size == 0 {
            break;
        }
        let block_count = target.read_u16(subsegment + layout.subseg_block_count)?;
        let user_blocks = target.read_pointer(subsegment + layout.subseg_user_blocks, env.bitness)?;
        if user_blocks != 0 {
            collect_user_blocks(
                target,
                env,
                layout,
                user_blocks,
                block_size,
                block_count,
                records,
            )?;
        }
        subsegment += layout.subseg_stride;
    }
    Ok(())
}

fn collect_user_blocks<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    layout: &LfhLayout,
    user_blocks: u64,
    block_size: u16,
    block_count: u16,
    records: &mut Vec<AllocationRecord>,
) -> error::Result<()> {
    let first = match layout.first_allocation {
        FirstAllocation::HeaderSize(size) => user_blocks + size,
        FirstAllocation::FieldOffset(offset) => {
            user_blocks + u64::from(target.read_u16(user_blocks + offset)?)
        }
    };
    let stride = u64::from(block_size) * block_unit(env.bitness);
    let mut block = first;
    for _ in 0..block_count {
        let signature = target.read_u8(block + entry_size(env.bitness) - 1)?;
        let busy = match env.mode() {
            Mode::Ust => signature == BUSY_UST,
            // the unused-byte count with the busy bit on top
            _ => signature & 0x80 != 0,
        };
        if busy {
            if let Some(record) =
                entry::user_portion(target, env, block, stride, signature & 0x7f)?
            {
                records.push(record);
            }
        }
        block += stride;
    }
    Ok(())
}
