//! The crash snapshot captured by a debugger integration.
//!
//! A [`CrashSnapshot`] is captured exactly once per crash event and never modified afterwards;
//! everything downstream only reads it. All types here round-trip through serde so that
//! snapshots can be stored as JSON fixtures and re-analyzed later.
//!
//! Numeric words (addresses and register values) may be written either as JSON integers or as
//! `"0x…"` strings, and are always written back out as hex strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CrashReason, Cpu};

/// A pointer-sized value from the crashed process.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "WordRepr")]
pub struct Address(pub u64);

/// Register contents are the same kind of word as an address.
pub type RegisterValue = Address;

#[derive(Deserialize)]
#[serde(untagged)]
enum WordRepr {
    Int(u64),
    Text(String),
}

/// An error encountered while parsing an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address `{0}` (expected an integer or a 0x-prefixed hex string)")]
pub struct ParseAddressError(String);

impl TryFrom<WordRepr> for Address {
    type Error = ParseAddressError;

    fn try_from(repr: WordRepr) -> Result<Self, Self::Error> {
        match repr {
            WordRepr::Int(v) => Ok(Address(v)),
            WordRepr::Text(s) => s.parse(),
        }
    }
}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => trimmed.replace('_', "").parse::<u64>(),
        };
        parsed
            .map(Address)
            .map_err(|_| ParseAddressError(s.to_owned()))
    }
}

impl From<u64> for Address {
    fn from(v: u64) -> Self {
        Address(v)
    }
}

impl From<Address> for u64 {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_string()
    }
}

impl std::ops::Deref for Address {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Access permissions of a mapped region.
///
/// Written as a `/proc/<pid>/maps` style string (`"r-x"`, `"rw-p"`), or as an object with
/// `read`, `write` and `execute` booleans.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "PermissionsRepr")]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PermissionsRepr {
    Text(String),
    Flags {
        #[serde(default)]
        read: bool,
        #[serde(default)]
        write: bool,
        #[serde(default)]
        execute: bool,
    },
}

/// An error encountered while parsing [`Permissions`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid permissions `{0}` (expected something like \"r-x\" or \"rw-p\")")]
pub struct ParsePermissionsError(String);

impl Permissions {
    pub const READ_ONLY: Permissions = Permissions {
        read: true,
        write: false,
        execute: false,
    };
    pub const READ_WRITE: Permissions = Permissions {
        read: true,
        write: true,
        execute: false,
    };
    pub const READ_EXECUTE: Permissions = Permissions {
        read: true,
        write: false,
        execute: true,
    };
    pub const ALL: Permissions = Permissions {
        read: true,
        write: true,
        execute: true,
    };
    pub const NONE: Permissions = Permissions {
        read: false,
        write: false,
        execute: false,
    };
}

impl FromStr for Permissions {
    type Err = ParsePermissionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePermissionsError(s.to_owned());
        let bytes = s.trim().as_bytes();
        if bytes.len() != 3 && bytes.len() != 4 {
            return Err(err());
        }
        let flag = |idx: usize, set: u8| match bytes[idx] {
            b'-' => Ok(false),
            c if c.eq_ignore_ascii_case(&set) => Ok(true),
            _ => Err(err()),
        };
        let perms = Permissions {
            read: flag(0, b'r')?,
            write: flag(1, b'w')?,
            execute: flag(2, b'x')?,
        };
        // The sharing column of a maps line carries no permission.
        if bytes.len() == 4 && !matches!(bytes[3], b'p' | b's' | b'-') {
            return Err(err());
        }
        Ok(perms)
    }
}

impl TryFrom<PermissionsRepr> for Permissions {
    type Error = ParsePermissionsError;

    fn try_from(repr: PermissionsRepr) -> Result<Self, Self::Error> {
        match repr {
            PermissionsRepr::Text(s) => s.parse(),
            PermissionsRepr::Flags {
                read,
                write,
                execute,
            } => Ok(Permissions {
                read,
                write,
                execute,
            }),
        }
    }
}

impl From<Permissions> for String {
    fn from(p: Permissions) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )
    }
}

/// What a mapped region holds, as far as the debugger could tell.
///
/// Labels other than the ones below are read as [`RegionLabel::Unknown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RegionLabel {
    Stack,
    Heap,
    Module,
    Anonymous,
    #[default]
    Unknown,
}

impl From<String> for RegionLabel {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stack" | "[stack]" => RegionLabel::Stack,
            "heap" | "[heap]" => RegionLabel::Heap,
            "module" | "image" => RegionLabel::Module,
            "anonymous" | "anon" => RegionLabel::Anonymous,
            _ => RegionLabel::Unknown,
        }
    }
}

impl From<RegionLabel> for String {
    fn from(label: RegionLabel) -> Self {
        label.to_string()
    }
}

impl fmt::Display for RegionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionLabel::Stack => "stack",
            RegionLabel::Heap => "heap",
            RegionLabel::Module => "module",
            RegionLabel::Anonymous => "anonymous",
            RegionLabel::Unknown => "unknown",
        })
    }
}

/// One mapped range of the crashed process's address space.
///
/// The start of the range is inclusive, the end is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: Address,
    pub end: Address,
    pub permissions: Permissions,
    #[serde(default)]
    pub label: RegionLabel,
    /// The backing object (module path, `[heap]`, ...), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MemoryRegion {
    pub fn new(start: u64, end: u64, permissions: Permissions, label: RegionLabel) -> Self {
        MemoryRegion {
            start: Address(start),
            end: Address(end),
            permissions,
            label,
            name: None,
        }
    }

    /// Whether `address` falls inside this region.
    pub fn contains(&self, address: u64) -> bool {
        self.start.0 <= address && address < self.end.0
    }

    /// The number of bytes covered by this region.
    pub fn size(&self) -> u64 {
        self.end.0.saturating_sub(self.start.0)
    }

    /// A short description used in signal explanations, e.g. `heap region 0x1000-0x2000 (rw-)`.
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!(
                "{} region {}-{} ({}, {})",
                self.label, self.start, self.end, self.permissions, name
            ),
            None => format!(
                "{} region {}-{} ({})",
                self.label, self.start, self.end, self.permissions
            ),
        }
    }
}

/// One unwound call frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub return_address: Address,
    /// The frame pointer for this frame, if the unwinder recovered one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_base: Option<Address>,
    /// The symbolized function name, if the debugger had symbols for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

impl Frame {
    pub fn new(return_address: u64, frame_base: Option<u64>) -> Self {
        Frame {
            return_address: Address(return_address),
            frame_base: frame_base.map(Address),
            function: None,
        }
    }
}

/// The crash state captured at fault time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashSnapshot {
    pub architecture: Cpu,
    #[serde(alias = "signal")]
    pub crash_reason: CrashReason,
    /// The address the faulting instruction tried to access, if the signal carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_address: Option<Address>,
    pub registers: BTreeMap<String, RegisterValue>,
    /// A window of bytes starting at the program counter.
    ///
    /// Empty if the program counter could not be read.
    #[serde(default, with = "instruction_bytes")]
    pub instruction_bytes: Vec<u8>,
    #[serde(default)]
    pub memory_regions: Vec<MemoryRegion>,
    /// Innermost frame first. Possibly truncated if unwinding failed.
    #[serde(default)]
    pub backtrace: Vec<Frame>,
}

/// Instruction bytes are written as a spaced hex string (`"48 89 07"`), and may also be read
/// from a plain array of integers.
mod instruction_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BytesRepr {
        List(Vec<u8>),
        Text(String),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match BytesRepr::deserialize(deserializer)? {
            BytesRepr::List(bytes) => Ok(bytes),
            BytesRepr::Text(text) => parse_hex(&text).map_err(serde::de::Error::custom),
        }
    }

    fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
        let digits: String = text
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .collect();
        let digits = digits.strip_prefix("0x").unwrap_or(&digits);
        if digits.len() % 2 != 0 {
            return Err(format!("odd number of hex digits in instruction bytes `{text}`"));
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16)
                    .map_err(|_| format!("invalid hex in instruction bytes `{text}`"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_forms() {
        let a: Address = serde_json::from_str("\"0x7fff_0000\"").unwrap();
        assert_eq!(a, Address(0x7fff0000));
        let b: Address = serde_json::from_str("4096").unwrap();
        assert_eq!(b, Address(4096));
        assert_eq!(serde_json::to_string(&b).unwrap(), "\"0x1000\"");
        assert!(serde_json::from_str::<Address>("\"banana\"").is_err());
    }

    #[test]
    fn test_permissions_forms() {
        assert_eq!("r-xp".parse::<Permissions>().unwrap(), Permissions::READ_EXECUTE);
        assert_eq!("rw-".parse::<Permissions>().unwrap(), Permissions::READ_WRITE);
        assert!("rwz".parse::<Permissions>().is_err());
        assert!("r".parse::<Permissions>().is_err());

        let p: Permissions = serde_json::from_str(r#"{"read": true, "execute": true}"#).unwrap();
        assert_eq!(p, Permissions::READ_EXECUTE);
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"r-x\"");
    }

    #[test]
    fn test_unknown_label() {
        let label: RegionLabel = serde_json::from_str("\"vdso\"").unwrap();
        assert_eq!(label, RegionLabel::Unknown);
    }

    #[test]
    fn test_snapshot_json() {
        let json = r#"{
            "architecture": "amd64",
            "signal": "SIGSEGV",
            "fault_address": "0x10",
            "registers": { "rip": "0x401000", "rsp": 140737488347136 },
            "instruction_bytes": "48 8b 07",
            "memory_regions": [
                { "start": "0x400000", "end": "0x402000", "permissions": "r-xp",
                  "label": "module", "name": "/bin/crashy" }
            ],
            "backtrace": [ { "return_address": "0x401000", "frame_base": "0x7fffffffe000" } ]
        }"#;
        let snapshot: CrashSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.architecture, Cpu::X86_64);
        assert_eq!(snapshot.crash_reason, CrashReason::Segv);
        assert_eq!(snapshot.fault_address, Some(Address(0x10)));
        assert_eq!(snapshot.registers["rsp"], Address(0x7fffffffe000));
        assert_eq!(snapshot.instruction_bytes, vec![0x48, 0x8b, 0x07]);
        assert_eq!(snapshot.memory_regions[0].label, RegionLabel::Module);
        assert!(snapshot.memory_regions[0].contains(0x401fff));
        assert!(!snapshot.memory_regions[0].contains(0x402000));
        assert_eq!(snapshot.backtrace[0].function, None);

        let again: CrashSnapshot =
            serde_json::from_str(&serde_json::to_string(&snapshot).unwrap()).unwrap();
        assert_eq!(again, snapshot);
    }

    #[test]
    fn test_bytes_as_list() {
        let json = r#"{
            "architecture": "x86",
            "crash_reason": "SIGILL",
            "registers": {},
            "instruction_bytes": [15, 11]
        }"#;
        let snapshot: CrashSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.instruction_bytes, vec![0x0f, 0x0b]);
        assert!(snapshot.memory_regions.is_empty());
    }
}
