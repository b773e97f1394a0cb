//! The seam between the analyzer and the debuggee: typed reads at
//! arbitrary addresses plus the symbolic lookups the debugger host
//! provides.
//!
//! The host (a live debugger session or a crash-dump reader) implements
//! [`Target`]; everything above it only sees these methods. Read
//! failures are reported as [`Error::NotReadable`](crate::Error), never
//! as panics; callers decide whether a failed read aborts the current
//! heap.

use scroll::{LE, Pread};

use crate::env::Bitness;
use crate::error;

/// A loaded image in the target: base address, image size, full path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub base: u64,
    pub size: u64,
    /// Full path as recorded in the loader data.
    pub name: String,
}

impl Module {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// File stem, lowercased: `C:\Windows\System32\ntdll.dll` -> `ntdll`.
    pub fn stem(&self) -> String {
        let name = self
            .name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(self.name.as_str());
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        stem.to_ascii_lowercase()
    }
}

/// A resolved symbol: owning module, symbol name, displacement from the
/// symbol's start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub module: String,
    pub name: String,
    pub displacement: u64,
}

impl Symbol {
    /// The `module!name` rendering the debugger prints.
    pub fn qualified(&self) -> String {
        format!("{}!{}", self.module, self.name)
    }
}

/// Read and lookup capabilities of the debuggee.
pub trait Target {
    /// Exact-length read of `len` bytes at `address`.
    fn read_bytes(&self, address: u64, len: usize) -> error::Result<Vec<u8>>;

    /// Offset of `field` within the type named `type_name`, e.g.
    /// `("ntdll!_PEB", "Ldr")`.
    fn field_offset(&self, type_name: &str, field: &str) -> error::Result<u64>;

    /// Size of the type named `type_name` in the target's symbols.
    fn type_size(&self, type_name: &str) -> error::Result<u64>;

    /// Evaluate a symbolic expression to an address, e.g.
    /// `"verifier!AVrfpDphPageHeapList"`.
    fn resolve_expression(&self, expr: &str) -> error::Result<u64>;

    /// Nearest symbol at `address`, if any.
    fn symbolize(&self, address: u64) -> Option<Symbol>;

    /// Every loaded image in the target.
    fn modules(&self) -> error::Result<Vec<Module>>;

    /// The debugger-provided thread environment block address.
    fn teb_address(&self) -> error::Result<u64>;

    /// The debugger-provided process environment block address.
    fn peb_address(&self) -> error::Result<u64>;

    /// Pointer width of the debugger session itself, not of the target.
    /// Differs from the target's bitness under WOW64.
    fn is_pointer_64(&self) -> bool;

    fn read_u8(&self, address: u64) -> error::Result<u8> {
        let buf = self.read_bytes(address, 1)?;
        Ok(buf.pread_with(0, LE)?)
    }

    fn read_u16(&self, address: u64) -> error::Result<u16> {
        let buf = self.read_bytes(address, 2)?;
        Ok(buf.pread_with(0, LE)?)
    }

    fn read_u32(&self, address: u64) -> error::Result<u32> {
        let buf = self.read_bytes(address, 4)?;
        Ok(buf.pread_with(0, LE)?)
    }

    fn read_u64(&self, address: u64) -> error::Result<u64> {
        let buf = self.read_bytes(address, 8)?;
        Ok(buf.pread_with(0, LE)?)
    }

    /// Native pointer read, widened to 64 bits.
    fn read_pointer(&self, address: u64, bitness: Bitness) -> error::Result<u64> {
        match bitness {
            Bitness::B32 => self.read_u32(address).map(u64::from),
            Bitness::B64 => self.read_u64(address),
        }
    }

    /// `read_u16(base + field_offset(..))`.
    fn field_value_u16(&self, base: u64, type_name: &str, field: &str) -> error::Result<u16> {
        let offset = self.field_offset(type_name, field)?;
        self.read_u16(base + offset)
    }

    /// `read_u32(base + field_offset(..))`.
    fn field_value_u32(&self, base: u64, type_name: &str, field: &str) -> error::Result<u32> {
        let offset = self.field_offset(type_name, field)?;
        self.read_u32(base + offset)
    }

    /// Pointer-sized `field_value`, widened to 64 bits.
    fn field_value_ptr(
        &self,
        base: u64,
        type_name: &str,
        field: &str,
        bitness: Bitness,
    ) -> error::Result<u64> {
        let offset = self.field_offset(type_name, field)?;
        self.read_pointer(base + offset, bitness)
    }
}

/// The module owning `address`, if any.
pub fn module_at<'m>(modules: &'m [Module], address: u64) -> Option<&'m Module> {
    modules.iter().find(|module| module.contains(address))
}
