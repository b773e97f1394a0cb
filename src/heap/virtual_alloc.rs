//! Oversized allocations kept on `_HEAP.VirtualAllocdBlocks`.
//!
//! Each node is a `_HEAP_VIRTUAL_ALLOC_ENTRY` carrying its own encoded
//! `HeapEntry`; the node address doubles as the block address and the
//! gross size comes from `CommitSize` rather than the header.

use log::debug;

use crate::env::{Bitness, Mode, TargetEnv};
use crate::error::{self, Error};
use crate::heap::entry::{self, Encoding};
use crate::processor::{AllocationRecord, Processor};
use crate::target::Target;

#[derive(Debug, Clone, Copy)]
struct NodeLayout {
    commit_size: u64,
    busy_block: u64,
    /// `sizeof(_HEAP_VIRTUAL_ALLOC_ENTRY)`; the plain-mode user data
    /// starts right behind the node.
    node_size: u64,
    /// UST-mode placement of the stack record pointer and user data.
    ust_pointer: u64,
    ust_user: u64,
}

impl NodeLayout {
    fn of(bitness: Bitness) -> NodeLayout {
        match bitness {
            Bitness::B32 => NodeLayout {
                commit_size: 0x10,
                busy_block: 0x18,
                node_size: 0x20,
                ust_pointer: 0x20,
                ust_user: 0x30,
            },
            Bitness::B64 => NodeLayout {
                commit_size: 0x20,
                busy_block: 0x30,
                node_size: 0x40,
                ust_pointer: 0x40,
                ust_user: 0x60,
            },
        }
    }
}

fn list_offset<T: Target + ?Sized>(target: &T, env: &TargetEnv) -> error::Result<u64> {
    if env.os_version.is_win8_or_later() {
        target.field_offset("ntdll!_HEAP", "VirtualAllocdBlocks")
    } else {
        Ok(match env.bitness {
            Bitness::B32 => 0xa0,
            Bitness::B64 => 0x118,
        })
    }
}

/// Emit every node on the heap's virtual-alloc list. Runs after the
/// segment walk so these records trail the in-segment stream.
pub(crate) fn walk<T: Target + ?Sized, P: Processor>(
    target: &T,
    env: &TargetEnv,
    heap: u64,
    encoding: &Encoding,
    sink: &mut P,
) -> error::Result<()> {
    let head = heap + list_offset(target, env)?;
    let mut node = target.read_pointer(head, env.bitness)?;
    while node != head && node != 0 {
        match emit_node(target, env, encoding, node, sink) {
            Ok(()) => {}
            // a bad embedded header rejects the node, not the list
            Err(Error::HeaderInvalid(address)) => {
                debug!("virtual-alloc node at {:#x}: bad header checksum", address);
            }
            Err(err) => return Err(err),
        }
        node = target.read_pointer(node, env.bitness)?;
    }
    Ok(())
}

fn emit_node<T: Target + ?Sized, P: Processor>(
    target: &T,
    env: &TargetEnv,
    encoding: &Encoding,
    node: u64,
    sink: &mut P,
) -> error::Result<()> {
    let layout = NodeLayout::of(env.bitness);
    let commit = target.read_pointer(node + layout.commit_size, env.bitness)?;
    let raw = target.read_bytes(
        node + layout.busy_block,
        entry::entry_size(env.bitness) as usize,
    )?;
    let decoded = encoding.decode(env, node + layout.busy_block, &raw)?;
    // for oversized blocks the size slot of the header carries the
    // overhead instead of a unit count
    let extra = u64::from(decoded.size);
    if extra > commit {
        debug!(
            "virtual-alloc node at {:#x}: extra {:#x} exceeds commit {:#x}",
            node, extra, commit
        );
        return Ok(());
    }

    let record = match env.mode() {
        Mode::Ust => AllocationRecord {
            ust_address: target.read_pointer(node + layout.ust_pointer, env.bitness)?,
            block_address: node,
            block_size: commit,
            user_address: node + layout.ust_user,
            user_size: commit - extra,
        },
        Mode::Plain | Mode::Hpa => AllocationRecord {
            ust_address: 0,
            block_address: node,
            block_size: commit,
            user_address: node + layout.node_size,
            user_size: commit - extra,
        },
    };
    sink.record(&record);
    Ok(())
}
