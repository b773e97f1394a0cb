//! Encoded `_HEAP_ENTRY` headers and the allocation records derived
//! from them.
//!
//! Every back-end block starts with an 8-byte header XOR-obfuscated with
//! the heap's per-instance `Encoding` mask. On 64-bit layouts the header
//! is preceded by 8 bytes of `PreviousBlockPrivateData` which are not
//! masked, so the entry spans 16 bytes of which only the upper half is
//! significant.

use log::debug;
use scroll::{LE, Pread};

use crate::env::{Bitness, Mode, TargetEnv};
use crate::error::{self, Error};
use crate::processor::AllocationRecord;
use crate::target::Target;

pub const SIZEOF_ENTRY_32: u64 = 8;
pub const SIZEOF_ENTRY_64: u64 = 16;

/// Size of the full (possibly padded) entry at the start of a block.
pub fn entry_size(bitness: Bitness) -> u64 {
    match bitness {
        Bitness::B32 => SIZEOF_ENTRY_32,
        Bitness::B64 => SIZEOF_ENTRY_64,
    }
}

/// Granularity of the `Size` field: blocks are counted in these units.
pub fn block_unit(bitness: Bitness) -> u64 {
    match bitness {
        Bitness::B32 => 8,
        Bitness::B64 => 16,
    }
}

/// The eight significant bytes of a heap entry, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapEntry {
    /// Gross block size in units of [`block_unit`].
    pub size: u16,
    pub flags: u8,
    /// XOR of the first three significant bytes; the decode sentinel.
    pub small_tag_index: u8,
    pub previous_size: u16,
    pub segment_offset: u8,
    /// `ExtendedBlockSignature`: unused-byte count for busy blocks,
    /// state marker (0x03 = uncommitted follows) otherwise.
    pub unused_bytes: u8,
}

impl HeapEntry {
    fn parse(sig: &[u8]) -> error::Result<HeapEntry> {
        let size = sig.pread_with(0, LE)?;
        let flags = sig.pread_with(2, LE)?;
        let small_tag_index = sig.pread_with(3, LE)?;
        let previous_size = sig.pread_with(4, LE)?;
        let segment_offset = sig.pread_with(6, LE)?;
        let unused_bytes = sig.pread_with(7, LE)?;
        Ok(HeapEntry {
            size,
            flags,
            small_tag_index,
            previous_size,
            segment_offset,
            unused_bytes,
        })
    }
}

/// The per-heap XOR mask over the significant header bytes.
#[derive(Debug, Clone, Copy)]
pub struct Encoding {
    mask: [u8; 8],
}

impl Encoding {
    /// Fetch the `_HEAP.Encoding` mask: 8 bytes at 0x50 on 32-bit
    /// layouts, the upper half of the 16-byte field resolved
    /// symbolically on 64-bit.
    pub fn read<T: Target + ?Sized>(
        target: &T,
        env: &TargetEnv,
        heap: u64,
    ) -> error::Result<Encoding> {
        let mut mask = [0u8; 8];
        match env.bitness {
            Bitness::B32 => {
                let raw = target.read_bytes(heap + 0x50, 8)?;
                mask.copy_from_slice(&raw);
            }
            Bitness::B64 => {
                let offset = target.field_offset("ntdll!_HEAP", "Encoding")?;
                let raw = target.read_bytes(heap + offset, 16)?;
                mask.copy_from_slice(&raw[8..16]);
            }
        }
        Ok(Encoding { mask })
    }

    /// Decode the raw entry read at `address`. `raw` must span
    /// [`entry_size`] bytes; validity requires the XOR of the first four
    /// decoded significant bytes to cancel.
    pub fn decode(&self, env: &TargetEnv, address: u64, raw: &[u8]) -> error::Result<HeapEntry> {
        let skip = (entry_size(env.bitness) - 8) as usize;
        let mut sig = [0u8; 8];
        sig.copy_from_slice(&raw[skip..skip + 8]);
        for (byte, mask) in sig.iter_mut().zip(self.mask.iter()) {
            *byte ^= mask;
        }
        if sig[0] ^ sig[1] ^ sig[2] ^ sig[3] != 0 {
            return Err(Error::HeaderInvalid(address));
        }
        HeapEntry::parse(&sig)
    }
}

/// Derive the user-visible portion of a busy block. `Ok(None)` means the
/// entry's own bookkeeping is out of bounds; the record is rejected with
/// a diagnostic and the walk goes on.
pub(crate) fn user_portion<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    block_address: u64,
    gross: u64,
    unused_bytes: u8,
) -> error::Result<Option<AllocationRecord>> {
    let header = entry_size(env.bitness);
    match env.mode() {
        Mode::Ust => {
            let ust_address = target.read_pointer(block_address + header, env.bitness)?;
            let (extra_offset, prefix) = match env.bitness {
                Bitness::B32 => (0x0c, 0x10),
                Bitness::B64 => (0x1c, 0x20),
            };
            let extra = u64::from(target.read_u16(block_address + header + extra_offset)?);
            if extra < prefix || extra > gross {
                debug!(
                    "block at {:#x}: extra {:#x} out of bounds (gross {:#x})",
                    block_address, extra, gross
                );
                return Ok(None);
            }
            Ok(Some(AllocationRecord {
                ust_address,
                block_address,
                block_size: gross,
                user_address: block_address + header + prefix,
                user_size: gross - extra,
            }))
        }
        // HPA allocations live on the verifier's shadow list; anything
        // the back-end still reports is sized like a plain block.
        Mode::Plain | Mode::Hpa => {
            let unused = u64::from(unused_bytes);
            if unused < header || unused > gross {
                debug!(
                    "block at {:#x}: unused {:#x} out of bounds (gross {:#x})",
                    block_address, unused, gross
                );
                return Ok(None);
            }
            Ok(Some(AllocationRecord {
                ust_address: 0,
                block_address,
                block_size: gross,
                user_address: block_address + header,
                user_size: gross - unused,
            }))
        }
    }
}
