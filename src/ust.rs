//! Reader for records in the user-mode stack trace database.
//!
//! A record starts with a mode-dependent prologue followed by an array
//! of return addresses. Only the depth field and the array base move
//! with mode and bitness; frames are native pointer sized and widened
//! to 64 bits, innermost frame first.

use std::io;

use crate::env::{Bitness, Mode, TargetEnv};
use crate::error::{self, Error};
use crate::target::Target;

/// Offset of the 16-bit depth field within a record.
fn depth_offset(env: &TargetEnv) -> error::Result<u64> {
    match (env.mode(), env.bitness) {
        (Mode::Ust, Bitness::B32) => Ok(0x8),
        (Mode::Ust, Bitness::B64) => Ok(0xc),
        (Mode::Hpa, Bitness::B32) => Ok(0xa),
        (Mode::Hpa, Bitness::B64) => Ok(0xe),
        (Mode::Plain, _) => Err(Error::ModeUnavailable),
    }
}

/// Address of the return-address array within a record. Doubles as the
/// BackTrace id in UMDH output.
pub fn trace_array_address(env: &TargetEnv, ust_address: u64) -> u64 {
    match env.bitness {
        Bitness::B32 => ust_address + 0xc,
        Bitness::B64 => ust_address + 0x10,
    }
}

/// The ordered return addresses of the record at `ust_address`.
pub fn read_stack_trace<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    ust_address: u64,
) -> error::Result<Vec<u64>> {
    let depth = target.read_u16(ust_address + depth_offset(env)?)?;
    let mut frames = Vec::with_capacity(usize::from(depth));
    let mut address = trace_array_address(env, ust_address);
    for _ in 0..depth {
        frames.push(target.read_pointer(address, env.bitness)?);
        address += env.pointer_size();
    }
    Ok(frames)
}

/// Print the record at `ust_address` with each frame symbolized, the way
/// the debugger would.
pub fn print_stack_trace<T: Target + ?Sized>(
    target: &T,
    env: &TargetEnv,
    ust_address: u64,
    indent: &str,
    console: &mut dyn io::Write,
) -> error::Result<()> {
    let trace = read_stack_trace(target, env, ust_address)?;
    dprintln!(
        console,
        "{}ust at {:x} depth: {}",
        indent,
        ust_address,
        trace.len()
    );
    for frame in trace {
        match target.symbolize(frame) {
            Some(symbol) if symbol.displacement != 0 => {
                dprintln!(
                    console,
                    "{}{:x} {}+0x{:x}",
                    indent,
                    frame,
                    symbol.qualified(),
                    symbol.displacement
                );
            }
            Some(symbol) => {
                dprintln!(console, "{}{:x} {}", indent, frame, symbol.qualified());
            }
            None => dprintln!(console, "{}{:x}", indent, frame),
        }
    }
    Ok(())
}
