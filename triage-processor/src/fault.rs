//! Working out what the crashing instruction was doing when it faulted.

use std::fmt;

use triage_common::{Address, CrashReason};

use crate::context::{Architecture, CanonicalState};
use crate::memory_map::MemoryMap;
use crate::op_analysis::{DecodedInstruction, MemoryAccess, MemoryAccessType};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
    Unknown,
}

impl fmt::Display for FaultAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultAccess::Read => "read",
            FaultAccess::Write => "write",
            FaultAccess::Execute => "execute",
            FaultAccess::Unknown => "unknown",
        })
    }
}

impl From<MemoryAccessType> for FaultAccess {
    fn from(access: MemoryAccessType) -> Self {
        if access.is_write() {
            FaultAccess::Write
        } else {
            FaultAccess::Read
        }
    }
}

/// A fault address the processor derived itself instead of taking it from the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdjustedAddress {
    /// The debugger reported zero for a general protection fault, and the crashing instruction
    /// was accessing this non-canonical address
    NonCanonical(Address),
    /// The debugger didn't report an address, and this was worked out from the instruction
    Inferred(Address),
}

impl AdjustedAddress {
    pub fn address(&self) -> Address {
        match *self {
            AdjustedAddress::NonCanonical(address) | AdjustedAddress::Inferred(address) => address,
        }
    }
}

impl fmt::Display for AdjustedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustedAddress::NonCanonical(address) => {
                write!(f, "Non-canonical address detected: {address}")
            }
            AdjustedAddress::Inferred(address) => {
                write!(f, "Address inferred from the instruction: {address}")
            }
        }
    }
}

/// Whether `address` is outside the canonical x86-64 address space.
///
/// The top 17 bits of a canonical address are all equal.
pub fn is_non_canonical(address: u64) -> bool {
    let top = address >> 47;
    top != 0 && top != 0x1ffff
}

/// What the crashing instruction was doing when it faulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    /// The address the fault is attributed to, after any adjustment
    pub address: Option<u64>,
    pub adjusted: Option<AdjustedAddress>,
    pub access: FaultAccess,
    /// Every memory access the decoded instruction makes
    pub accesses: Vec<MemoryAccess>,
    /// The access whose range covers the fault address
    pub faulting_access: Option<MemoryAccess>,
}

impl FaultInfo {
    pub fn is_execute(&self) -> bool {
        self.access == FaultAccess::Execute
    }
}

/// Whether the fault was raised fetching the instruction at the program counter.
///
/// Without any memory regions only a fault address equal to the program counter can say so.
pub fn is_execute_fault(
    reported: Option<u64>,
    state: &CanonicalState,
    memory: &MemoryMap<'_>,
) -> bool {
    let pc = state.program_counter;
    reported == Some(pc) || (!memory.is_empty() && !memory.is_executable(pc))
}

/// Resolve the fault address and access kind.
///
/// An address is only inferred when the debugger didn't report one for a memory fault.
pub fn resolve(
    reason: &CrashReason,
    reported: Option<u64>,
    state: &CanonicalState,
    memory: &MemoryMap<'_>,
    instruction: Option<&DecodedInstruction>,
) -> FaultInfo {
    let accesses = instruction
        .map(|instruction| instruction.memory_accesses(state))
        .unwrap_or_default();
    let executing = is_execute_fault(reported, state, memory);

    let (address, adjusted) = match reported {
        None if !reason.is_memory_fault() => (None, None),
        _ => resolve_address(reported, state, memory, &accesses, executing),
    };

    let faulting_access = address.and_then(|address| {
        accesses
            .iter()
            .copied()
            .find(|access| access.covers(address))
    });
    let access = if executing {
        FaultAccess::Execute
    } else if let Some(access) = faulting_access {
        access.access_type.into()
    } else if accesses.iter().any(|access| access.access_type.is_write()) {
        FaultAccess::Write
    } else if !accesses.is_empty() {
        FaultAccess::Read
    } else {
        FaultAccess::Unknown
    };

    FaultInfo {
        address,
        adjusted,
        access,
        accesses,
        faulting_access,
    }
}

fn resolve_address(
    reported: Option<u64>,
    state: &CanonicalState,
    memory: &MemoryMap<'_>,
    accesses: &[MemoryAccess],
    executing: bool,
) -> (Option<u64>, Option<AdjustedAddress>) {
    match reported {
        Some(0) if state.architecture == Architecture::X86_64 => {
            match accesses
                .iter()
                .find(|access| is_non_canonical(access.address))
            {
                Some(access) => (
                    Some(access.address),
                    Some(AdjustedAddress::NonCanonical(Address(access.address))),
                ),
                None => (Some(0), None),
            }
        }
        Some(address) => (Some(address), None),
        None if executing => {
            let pc = state.program_counter;
            (Some(pc), Some(AdjustedAddress::Inferred(Address(pc))))
        }
        None => {
            // With several operands, prefer the one that points at nothing.
            let inferred = match accesses {
                [only] => Some(only.address),
                _ if memory.is_empty() => None,
                _ => accesses
                    .iter()
                    .find(|access| memory.region(access.address).is_none())
                    .map(|access| access.address),
            };
            match inferred {
                Some(address) => (
                    Some(address),
                    Some(AdjustedAddress::Inferred(Address(address))),
                ),
                None => (None, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_analysis::decode;
    use crate::op_analysis::test_util::state_for;
    use triage_common::{MemoryRegion, Permissions, RegionLabel};

    fn regions() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion::new(0x1_0000, 0x2_0000, Permissions::READ_EXECUTE, RegionLabel::Module),
            MemoryRegion::new(0x7_0000, 0x9_0000, Permissions::READ_WRITE, RegionLabel::Stack),
            MemoryRegion::new(0x60_0000, 0x62_0000, Permissions::READ_WRITE, RegionLabel::Heap),
        ]
    }

    #[test]
    fn test_non_canonical() {
        assert!(!is_non_canonical(0));
        assert!(!is_non_canonical(0x0000_7fff_ffff_ffff));
        assert!(!is_non_canonical(0xffff_8000_0000_0000));
        assert!(is_non_canonical(0x0000_8000_0000_0000));
        assert!(is_non_canonical(0x4141_4141_4141_4141));
    }

    #[test]
    fn test_write_operand_covers_fault() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let state = state_for(Architecture::X86_64, &[("rax", 0x1234_5000)]);
        // mov qword ptr [rax], rcx
        let instruction = decode(Architecture::X86_64, &[0x48, 0x89, 0x08]).unwrap();
        let fault = resolve(&CrashReason::Segv, Some(0x1234_5004), &state, &map, Some(&instruction));
        assert_eq!(fault.access, FaultAccess::Write);
        assert_eq!(fault.address, Some(0x1234_5004));
        assert_eq!(fault.adjusted, None);
        assert_eq!(fault.faulting_access.map(|a| a.address), Some(0x1234_5000));
    }

    #[test]
    fn test_strongest_access_without_cover() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let state = state_for(Architecture::X86_64, &[("rax", 0x1234_5000)]);
        // add qword ptr [rax], rcx
        let instruction = decode(Architecture::X86_64, &[0x48, 0x01, 0x08]).unwrap();
        let fault = resolve(&CrashReason::Segv, Some(0x9999_0000), &state, &map, Some(&instruction));
        assert_eq!(fault.access, FaultAccess::Write);
        assert_eq!(fault.faulting_access, None);
    }

    #[test]
    fn test_execute_fault() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let state = state_for(
            Architecture::X86_64,
            &[("rip", 0x4141_4141), ("rsp", 0x8_0000)],
        );
        let fault = resolve(&CrashReason::Segv, None, &state, &map, None);
        assert_eq!(fault.access, FaultAccess::Execute);
        assert_eq!(
            fault.adjusted,
            Some(AdjustedAddress::Inferred(Address(0x4141_4141)))
        );

        // an abort doesn't fault on an address
        let fault = resolve(&CrashReason::Abrt, None, &state, &map, None);
        assert_eq!(fault.address, None);
        assert_eq!(fault.adjusted, None);
    }

    #[test]
    fn test_general_protection_fault() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let state = state_for(
            Architecture::X86_64,
            &[("rax", 0x4141_4141_4141_4141), ("rip", 0x1_0000)],
        );
        // mov rcx, qword ptr [rax]
        let instruction = decode(Architecture::X86_64, &[0x48, 0x8b, 0x08]).unwrap();
        let fault = resolve(&CrashReason::Segv, Some(0), &state, &map, Some(&instruction));
        assert_eq!(fault.access, FaultAccess::Read);
        assert_eq!(fault.address, Some(0x4141_4141_4141_4141));
        assert_eq!(
            fault.adjusted,
            Some(AdjustedAddress::NonCanonical(Address(0x4141_4141_4141_4141)))
        );

        // on 32-bit x86 a zero address is taken as reported
        let state = state_for(Architecture::X86, &[("eax", 0), ("eip", 0x1_0000)]);
        let instruction = decode(Architecture::X86, &[0x8b, 0x08]).unwrap();
        let fault = resolve(&CrashReason::Segv, Some(0), &state, &map, Some(&instruction));
        assert_eq!(fault.address, Some(0));
        assert_eq!(fault.adjusted, None);
    }

    #[test]
    fn test_unknown_without_instruction() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let state = state_for(Architecture::Arm64, &[("pc", 0x1_0000)]);
        let fault = resolve(&CrashReason::Segv, Some(0x10), &state, &map, None);
        assert_eq!(fault.access, FaultAccess::Unknown);
        assert_eq!(fault.address, Some(0x10));
    }
}
