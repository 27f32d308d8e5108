//! The CPU a crash snapshot was captured on.

use std::fmt;
use std::str::FromStr;

/// The CPU tag reported by the debugger integration.
///
/// Tags that aren't recognized are retained verbatim in [`Cpu::Unknown`] so that the
/// processor can report exactly which architecture it was handed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Cpu {
    X86,
    X86_64,
    Arm,
    Arm64,
    Ppc,
    Ppc64,
    Sparc,
    Mips,
    Unknown(String),
}

impl FromStr for Cpu {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cpu = match s.trim().to_ascii_lowercase().as_str() {
            "x86" | "i386" | "i486" | "i586" | "i686" | "ia32" => Cpu::X86,
            "x86_64" | "x86-64" | "amd64" | "x64" => Cpu::X86_64,
            "arm" | "arm32" | "armv7" | "armv7l" | "armhf" => Cpu::Arm,
            "arm64" | "aarch64" | "armv8" => Cpu::Arm64,
            "ppc" | "powerpc" => Cpu::Ppc,
            "ppc64" | "powerpc64" => Cpu::Ppc64,
            "sparc" => Cpu::Sparc,
            "mips" => Cpu::Mips,
            _ => Cpu::Unknown(s.to_owned()),
        };
        Ok(cpu)
    }
}

impl From<String> for Cpu {
    fn from(s: String) -> Self {
        match Cpu::from_str(&s) {
            Ok(cpu) => cpu,
            Err(never) => match never {},
        }
    }
}

impl From<Cpu> for String {
    fn from(cpu: Cpu) -> Self {
        cpu.to_string()
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cpu::X86 => "x86",
            Cpu::X86_64 => "x86_64",
            Cpu::Arm => "arm",
            Cpu::Arm64 => "arm64",
            Cpu::Ppc => "ppc",
            Cpu::Ppc64 => "ppc64",
            Cpu::Sparc => "sparc",
            Cpu::Mips => "mips",
            Cpu::Unknown(name) => name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        assert_eq!("amd64".parse::<Cpu>().unwrap(), Cpu::X86_64);
        assert_eq!("AArch64".parse::<Cpu>().unwrap(), Cpu::Arm64);
        assert_eq!("i686".parse::<Cpu>().unwrap(), Cpu::X86);
        assert_eq!(
            "riscv64".parse::<Cpu>().unwrap(),
            Cpu::Unknown(String::from("riscv64"))
        );
        assert_eq!(Cpu::Unknown(String::from("riscv64")).to_string(), "riscv64");
    }
}
