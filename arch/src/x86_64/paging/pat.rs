//! PAT (Page Attribute Table) support for `x86_64` paging

use core::arch::x86_64::__cpuid;

use crate::x86_64::cpu::msr::{IntelMsr, rdmsr, wrmsr};

/// The amount of bits between each PAT entry in the `IA32_PAT` MSR. This is the amount of bits we
/// need to shift to access each PAT entry.
const SHIFTING_SIZE: u8 = 8;

/// All the possible types of memory each PAT entry can represent.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum PatType {
    /// UC type. No caching; all accesses go directly to main memory
    Uncacheable = 0b00,
    /// WC type. Uncacheable, but writes are buffered and combined into bursts.
    WriteCombining = 0b01,
    /// WT type. Cacheable for reads, but writes are immediately propagated to main memory
    WriteThrough = 0b100,
    /// WP type. Cacheable for reads, writes are not allowed
    WriteProtected = 0b101,
    /// WB type. Fully cacheable.
    WriteBack = 0b110,
    /// UC- type. Similar to UC but can be overridden by MTRRs.
    Uncached = 0b111,
}

/// All the available entries in the PAT
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum PatEntry {
    Pat0 = 0b000,
    Pat1 = 0b001,
    Pat2 = 0b010,
    Pat3 = 0b011,
    Pat4 = 0b100,
    Pat5 = 0b101,
    Pat6 = 0b110,
    Pat7 = 0b111,
}

/// Check if PAT is supported by this CPU.
pub fn check_pat_support() -> bool {
    const PAT_BIT: u32 = 1 << 16;
    unsafe { __cpuid(1).edx & PAT_BIT != 0 }
}

/// Set a certain PAT entry to a specific type.
pub unsafe fn set_pat_entry(entry: PatEntry, pat_type: PatType) {
    let mut pat: u64 = unsafe { rdmsr(IntelMsr::Ia32Pat).into() };
    pat &= !(0b111 << (entry as u8 * SHIFTING_SIZE));
    pat |= (pat_type as u64) << (entry as u8 * SHIFTING_SIZE);
    unsafe { wrmsr(IntelMsr::Ia32Pat, pat.into()) };
}

/// Get the current PAT type of a specific entry.
pub fn get_pat_entry(entry: PatEntry) -> PatType {
    let pat: u64 = unsafe { rdmsr(IntelMsr::Ia32Pat).into() };

    ((pat >> (entry as u8 * SHIFTING_SIZE) & 0b111) as u8)
        .try_into()
        .unwrap()
}

impl TryFrom<u8> for PatType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b00 => Ok(PatType::Uncacheable),
            0b01 => Ok(PatType::WriteCombining),
            0b100 => Ok(PatType::WriteThrough),
            0b101 => Ok(PatType::WriteProtected),
            0b110 => Ok(PatType::WriteBack),
            0b111 => Ok(PatType::Uncached),
            _ => Err(()),
        }
    }
}
