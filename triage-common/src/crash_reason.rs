//! The signal or exception that stopped the process.

use std::fmt;
use std::str::FromStr;

/// Why the process stopped.
///
/// These are primarily the POSIX signals a debugger reports for a faulting inferior. Names are
/// accepted with or without the `SIG` prefix, in any case, or as Linux signal numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CrashReason {
    /// Segmentation violation
    Segv,
    /// BUS error
    Bus,
    /// Illegal instruction
    Ill,
    /// Abort, usually raised by `abort()` after a failed assertion
    Abrt,
    /// Floating-point or integer arithmetic exception
    Fpe,
    /// Trace/breakpoint trap
    Trap,
    /// Bad system call
    Sys,
    /// Termination request
    Term,
    /// Keyboard interrupt
    Int,
    /// Kill, unblockable
    Kill,
    /// Keyboard quit
    Quit,
    Unknown(String),
}

impl CrashReason {
    /// Whether the signal is raised deliberately by the process or its environment rather than
    /// by a memory or instruction fault.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            CrashReason::Abrt
                | CrashReason::Trap
                | CrashReason::Term
                | CrashReason::Int
                | CrashReason::Kill
                | CrashReason::Quit
        )
    }

    /// Whether the signal is raised by an access to memory.
    pub fn is_memory_fault(&self) -> bool {
        matches!(self, CrashReason::Segv | CrashReason::Bus)
    }

    fn from_linux_signal(signo: u32) -> Option<Self> {
        Some(match signo {
            2 => CrashReason::Int,
            3 => CrashReason::Quit,
            4 => CrashReason::Ill,
            5 => CrashReason::Trap,
            6 => CrashReason::Abrt,
            7 => CrashReason::Bus,
            8 => CrashReason::Fpe,
            9 => CrashReason::Kill,
            11 => CrashReason::Segv,
            15 => CrashReason::Term,
            31 => CrashReason::Sys,
            _ => return None,
        })
    }
}

impl FromStr for CrashReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(signo) = trimmed.parse::<u32>() {
            return Ok(CrashReason::from_linux_signal(signo)
                .unwrap_or_else(|| CrashReason::Unknown(trimmed.to_owned())));
        }
        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        let reason = match name {
            "SEGV" => CrashReason::Segv,
            "BUS" => CrashReason::Bus,
            "ILL" => CrashReason::Ill,
            "ABRT" | "IOT" => CrashReason::Abrt,
            "FPE" => CrashReason::Fpe,
            "TRAP" => CrashReason::Trap,
            "SYS" => CrashReason::Sys,
            "TERM" => CrashReason::Term,
            "INT" => CrashReason::Int,
            "KILL" => CrashReason::Kill,
            "QUIT" => CrashReason::Quit,
            _ => CrashReason::Unknown(trimmed.to_owned()),
        };
        Ok(reason)
    }
}

impl From<String> for CrashReason {
    fn from(s: String) -> Self {
        match CrashReason::from_str(&s) {
            Ok(reason) => reason,
            Err(never) => match never {},
        }
    }
}

impl From<CrashReason> for String {
    fn from(reason: CrashReason) -> Self {
        reason.to_string()
    }
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrashReason::Segv => "SIGSEGV",
            CrashReason::Bus => "SIGBUS",
            CrashReason::Ill => "SIGILL",
            CrashReason::Abrt => "SIGABRT",
            CrashReason::Fpe => "SIGFPE",
            CrashReason::Trap => "SIGTRAP",
            CrashReason::Sys => "SIGSYS",
            CrashReason::Term => "SIGTERM",
            CrashReason::Int => "SIGINT",
            CrashReason::Kill => "SIGKILL",
            CrashReason::Quit => "SIGQUIT",
            CrashReason::Unknown(name) => name,
        })
    }
}
