//! The page-heap verifier's shadow list of isolated allocations.
//!
//! Under HPA the ordinary `_HEAP` structures do not hold the
//! allocations; `verifier!AVrfpDphPageHeapList` chains `_DPH_HEAP_ROOT`
//! nodes whose `BusyNodesTable` is an AVL tree of currently allocated
//! blocks. Every offset here comes from the verifier's symbols.

use std::io;

use log::debug;

use crate::env::{Bitness, TargetEnv};
use crate::error::{self, Error};
use crate::heap::WalkOptions;
use crate::processor::{AllocationRecord, Processor};
use crate::target::Target;

/// Stamp preceding a live user allocation; anything else means freed.
const ALLOCATED_STAMP: u32 = 0xabcd_bbbb;

const PAGE_HEAP_LIST: &str = "verifier!AVrfpDphPageHeapList";
const HEAP_ROOT: &str = "verifier!_DPH_HEAP_ROOT";
const HEAP_BLOCK: &str = "verifier!_DPH_HEAP_BLOCK";

struct BlockLayout {
    user_allocation: u64,
    virtual_block: u64,
    virtual_block_size: u64,
    user_requested_size: u64,
    stack_trace: u64,
}

impl BlockLayout {
    fn resolve<T: Target + ?Sized>(target: &T) -> error::Result<BlockLayout> {
        Ok(BlockLayout {
            user_allocation: target.field_offset(HEAP_BLOCK, "pUserAllocation")?,
            virtual_block: target.field_offset(HEAP_BLOCK, "pVirtualBlock")?,
            virtual_block_size: target.field_offset(HEAP_BLOCK, "nVirtualBlockSize")?,
            user_requested_size: target.field_offset(HEAP_BLOCK, "nUserRequestedSize")?,
            stack_trace: target.field_offset(HEAP_BLOCK, "StackTrace")?,
        })
    }
}

/// Walk every page-heap root. A root whose reads fail is abandoned with
/// a diagnostic; the rest still run.
pub(crate) fn walk<T: Target + ?Sized, P: Processor>(
    target: &T,
    env: &TargetEnv,
    options: &WalkOptions,
    sink: &mut P,
    console: &mut dyn io::Write,
) -> error::Result<()> {
    let head = target.resolve_expression(PAGE_HEAP_LIST)?;
    let next_heap = target.field_offset(HEAP_ROOT, "NextHeap")?;
    let normal_heap = target.field_offset(HEAP_ROOT, "NormalHeap")?;
    let busy_nodes = target.field_offset(HEAP_ROOT, "BusyNodesTable")?;
    let block = BlockLayout::resolve(target)?;

    let mut link = target.read_pointer(head, env.bitness)?;
    while link != head && link != 0 {
        let root = link - next_heap;
        // the backing plain heap is only an identity for the sink
        let identity = target.read_pointer(root + normal_heap, env.bitness)?;
        sink.start_heap(identity);
        let result = walk_busy_nodes(target, env, options, root + busy_nodes, &block, sink);
        sink.finish_heap(identity);
        if let Err(err) = result {
            dprintln!(console, "page heap at {:x}: walk aborted: {}", identity, err);
        }
        link = target.read_pointer(link, env.bitness)?;
    }
    Ok(())
}

/// Depth-first over the balanced-links tree: self, then left, then
/// right. Iterative, with a ceiling on visited nodes so a corrupted
/// tree cannot pin the walk.
fn walk_busy_nodes<T: Target + ?Sized, P: Processor>(
    target: &T,
    env: &TargetEnv,
    options: &WalkOptions,
    table: u64,
    block: &BlockLayout,
    sink: &mut P,
) -> error::Result<()> {
    let pointer = env.pointer_size();
    // the table leads with its own balanced links; the real tree hangs
    // off their right child
    let root = target.read_pointer(table + 2 * pointer, env.bitness)?;
    let mut stack = Vec::new();
    if root != 0 {
        stack.push(root);
    }
    let mut visited = 0usize;
    while let Some(node) = stack.pop() {
        visited += 1;
        if visited > options.dph_node_ceiling {
            return Err(Error::Malformed(format!(
                "busy-nodes traversal exceeded {} nodes",
                options.dph_node_ceiling
            )));
        }
        emit_block(target, env, node + links_size(env.bitness), block, sink)?;
        let left = target.read_pointer(node + pointer, env.bitness)?;
        let right = target.read_pointer(node + 2 * pointer, env.bitness)?;
        if right != 0 {
            stack.push(right);
        }
        if left != 0 {
            stack.push(left);
        }
    }
    Ok(())
}

/// `sizeof(_RTL_BALANCED_LINKS)`: parent, two children, padded balance.
fn links_size(bitness: Bitness) -> u64 {
    4 * bitness.pointer_size()
}

fn emit_block<T: Target + ?Sized, P: Processor>(
    target: &T,
    env: &TargetEnv,
    base: u64,
    block: &BlockLayout,
    sink: &mut P,
) -> error::Result<()> {
    let user_address = target.read_pointer(base + block.user_allocation, env.bitness)?;
    let stamp_back = match env.bitness {
        Bitness::B32 => 0x20,
        Bitness::B64 => 0x40,
    };
    let Some(stamp_address) = user_address.checked_sub(stamp_back) else {
        debug!("dph block at {:#x}: no room for a stamp", base);
        return Ok(());
    };
    if target.read_u32(stamp_address)? != ALLOCATED_STAMP {
        // freed block still in the table
        return Ok(());
    }
    let record = AllocationRecord {
        ust_address: target.read_pointer(base + block.stack_trace, env.bitness)?,
        block_address: target.read_pointer(base + block.virtual_block, env.bitness)?,
        block_size: target.read_pointer(base + block.virtual_block_size, env.bitness)?,
        user_address,
        user_size: target.read_pointer(base + block.user_requested_size, env.bitness)?,
    };
    sink.record(&record);
    Ok(())
}
