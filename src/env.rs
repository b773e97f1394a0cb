//! Facts about the debuggee that stay fixed for the duration of a
//! command: word size, OS version and the significant `NtGlobalFlag`
//! bits. Probed once per command and threaded explicitly; never cached
//! process-wide.

use crate::error;
use crate::target::Target;

/// User-mode stack trace database enabled.
pub const NT_GLOBAL_FLAG_UST: u32 = 0x0000_1000;
/// Page heap enabled.
pub const NT_GLOBAL_FLAG_HPA: u32 = 0x0200_0000;

/// Word size of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    B32,
    B64,
}

impl Bitness {
    pub fn pointer_size(self) -> u64 {
        match self {
            Bitness::B32 => 4,
            Bitness::B64 => 8,
        }
    }

    pub fn is_64(self) -> bool {
        matches!(self, Bitness::B64)
    }
}

/// `(major << 32) | minor`, comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion(pub u64);

impl OsVersion {
    pub const WIN7: OsVersion = OsVersion((6 << 32) | 1);
    pub const WIN8: OsVersion = OsVersion((6 << 32) | 2);
    pub const WIN81: OsVersion = OsVersion((6 << 32) | 3);

    pub fn new(major: u32, minor: u32) -> OsVersion {
        OsVersion((u64::from(major) << 32) | u64::from(minor))
    }

    pub fn major(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn minor(self) -> u32 {
        self.0 as u32
    }

    /// Win8 moved several heap-internal layouts behind the symbol files;
    /// this gates literal offset tables vs. symbolic resolution.
    pub fn is_win8_or_later(self) -> bool {
        self >= OsVersion::WIN8
    }
}

/// The allocator mode in effect. HPA overrides UST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    Ust,
    Hpa,
}

/// Environment of one walk.
#[derive(Debug, Clone, Copy)]
pub struct TargetEnv {
    pub bitness: Bitness,
    pub os_version: OsVersion,
    pub nt_global_flag: u32,
    /// Resolved PEB address (WOW64-corrected).
    pub peb: u64,
}

impl TargetEnv {
    /// Probe the target once. The result is stable until the command
    /// completes.
    pub fn probe<T: Target + ?Sized>(target: &T) -> error::Result<TargetEnv> {
        let teb = target.teb_address()?;
        let bitness = if teb >> 32 != 0 {
            Bitness::B64
        } else {
            Bitness::B32
        };
        let peb = resolve_peb(target, bitness, teb)?;

        let (nt_global_flag, os_version) = match bitness {
            Bitness::B32 => {
                let flag = target.read_u32(peb + 0x68)?;
                let major = target.read_u32(peb + 0xa4)?;
                let minor = target.read_u32(peb + 0xa8)?;
                (flag, OsVersion::new(major, minor))
            }
            Bitness::B64 => {
                let flag = target.field_value_u32(peb, "ntdll!_PEB", "NtGlobalFlag")?;
                let major = target.field_value_u32(peb, "ntdll!_PEB", "OSMajorVersion")?;
                let minor = target.field_value_u32(peb, "ntdll!_PEB", "OSMinorVersion")?;
                (flag, OsVersion::new(major, minor))
            }
        };

        Ok(TargetEnv {
            bitness,
            os_version,
            nt_global_flag,
            peb,
        })
    }

    pub fn mode(&self) -> Mode {
        if self.nt_global_flag & NT_GLOBAL_FLAG_HPA != 0 {
            Mode::Hpa
        } else if self.nt_global_flag & NT_GLOBAL_FLAG_UST != 0 {
            Mode::Ust
        } else {
            Mode::Plain
        }
    }

    pub fn pointer_size(&self) -> u64 {
        self.bitness.pointer_size()
    }

    pub fn is_64(&self) -> bool {
        self.bitness.is_64()
    }
}

fn resolve_peb<T: Target + ?Sized>(
    target: &T,
    bitness: Bitness,
    teb: u64,
) -> error::Result<u64> {
    if bitness == Bitness::B32 && target.is_pointer_64() {
        // WOW64: the 64-bit TEB leads with a pointer to its 32-bit
        // shadow; _TEB::ProcessEnvironmentBlock sits at 0x30 there.
        let teb32 = u64::from(target.read_u32(teb)?);
        let peb32 = target.read_u32(teb32 + 0x30)?;
        Ok(u64::from(peb32))
    } else {
        target.peb_address()
    }
}
