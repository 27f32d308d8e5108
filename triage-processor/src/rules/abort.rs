//! Rules keyed on the crash reason alone, or on who raised it.

use triage_common::{CrashReason, Frame};

use super::RuleInput;
use crate::report::{Signal, SignalId};

/// Allocator entry points and the internals that call `abort()` when they find the heap
/// corrupted.
const ALLOCATOR_SYMBOLS: &[&str] = &[
    "malloc",
    "free",
    "cfree",
    "calloc",
    "realloc",
    "reallocarray",
    "memalign",
    "posix_memalign",
    "aligned_alloc",
    "valloc",
    "pvalloc",
    "libc_malloc",
    "libc_free",
    "libc_calloc",
    "libc_realloc",
    "libc_memalign",
    "int_malloc",
    "int_free",
    "int_realloc",
    "int_memalign",
    "malloc_printerr",
    "malloc_consolidate",
    "malloc_assert",
    "unlink_chunk",
    "tcache_get",
    "tcache_put",
    "operator new",
    "operator new[]",
    "operator delete",
    "operator delete[]",
];

/// Functions that abort on a smashed stack canary or a failed fortify check.
const STACK_CHECK_SYMBOLS: &[&str] = &[
    "stack_chk_fail",
    "stack_chk_fail_local",
    "fortify_fail",
    "fortify_fail_abort",
    "chk_fail",
];

/// Reduce a symbol to the name it is listed under.
///
/// Strips any argument list, offset or version suffix, then leading underscores and the `GI_`
/// prefix glibc uses for internal aliases (`__GI___libc_free` is `libc_free`).
fn normalize_symbol(name: &str) -> &str {
    let end = name.find(['(', '+', '@']).unwrap_or(name.len());
    let name = name[..end].trim().trim_start_matches('_');
    let name = name.strip_prefix("GI_").unwrap_or(name);
    name.trim_start_matches('_')
}

fn find_frame<'a>(backtrace: &'a [Frame], symbols: &[&str]) -> Option<(usize, &'a str)> {
    backtrace.iter().enumerate().find_map(|(index, frame)| {
        let function = frame.function.as_deref()?;
        symbols
            .contains(&normalize_symbol(function))
            .then_some((index, function))
    })
}

pub fn heap_error(input: &RuleInput<'_>) -> Option<Signal> {
    if input.snapshot.crash_reason != CrashReason::Abrt {
        return None;
    }
    let (index, function) = find_frame(&input.snapshot.backtrace, ALLOCATOR_SYMBOLS)?;
    Some(Signal::new(
        SignalId::HeapError,
        format!("abort raised from the allocator, frame #{index} is {function}"),
    ))
}

pub fn stack_buffer_overflow(input: &RuleInput<'_>) -> Option<Signal> {
    if input.snapshot.crash_reason != CrashReason::Abrt {
        return None;
    }
    let (index, function) = find_frame(&input.snapshot.backtrace, STACK_CHECK_SYMBOLS)?;
    Some(Signal::new(
        SignalId::StackBufferOverflow,
        format!("abort raised by a stack check, frame #{index} is {function}"),
    ))
}

pub fn floating_point_exception(input: &RuleInput<'_>) -> Option<Signal> {
    (input.snapshot.crash_reason == CrashReason::Fpe).then(|| {
        Signal::new(
            SignalId::FloatingPointException,
            "arithmetic exception, most likely a division by zero",
        )
    })
}

pub fn benign_signal(input: &RuleInput<'_>) -> Option<Signal> {
    let reason = &input.snapshot.crash_reason;
    reason.is_benign().then(|| {
        Signal::new(
            SignalId::BenignSignal,
            format!("{reason} is raised deliberately, not by a fault"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    // syscall
    const SYSCALL: &[u8] = &[0x0f, 0x05];

    fn aborted_in(functions: &[&str]) -> triage_common::CrashSnapshot {
        let mut crash = snapshot(CrashReason::Abrt, None, &[], SYSCALL);
        crash.backtrace = functions
            .iter()
            .enumerate()
            .map(|(index, function)| {
                let mut frame = Frame::new(0x40_1000 + index as u64 * 0x100, None);
                frame.function = Some(String::from(*function));
                frame
            })
            .collect();
        crash
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("__GI___libc_free"), "libc_free");
        assert_eq!(normalize_symbol("_int_free+0x3a"), "int_free");
        assert_eq!(normalize_symbol("__stack_chk_fail@plt"), "stack_chk_fail");
        assert_eq!(normalize_symbol("operator delete(void*)"), "operator delete");
        assert_eq!(normalize_symbol("main"), "main");
    }

    #[test]
    fn test_heap_error() {
        let crash = aborted_in(&["raise", "abort", "__libc_message", "malloc_printerr", "_int_free"]);
        let signal = run_rule(heap_error, &crash).unwrap();
        assert!(signal.explanation.contains("frame #3"));
        assert_eq!(run_rule(stack_buffer_overflow, &crash), None);
        assert!(run_rule(benign_signal, &crash).is_some());
    }

    #[test]
    fn test_stack_check() {
        let crash = aborted_in(&["raise", "abort", "__libc_message", "__fortify_fail", "__stack_chk_fail"]);
        assert!(run_rule(stack_buffer_overflow, &crash).is_some());
        assert_eq!(run_rule(heap_error, &crash), None);
    }

    #[test]
    fn test_plain_abort() {
        let crash = aborted_in(&["raise", "abort", "main"]);
        assert_eq!(run_rule(heap_error, &crash), None);
        assert_eq!(run_rule(stack_buffer_overflow, &crash), None);
        assert!(run_rule(benign_signal, &crash).is_some());
        assert_eq!(run_rule(floating_point_exception, &crash), None);
    }

    #[test]
    fn test_fpe() {
        let crash = snapshot(CrashReason::Fpe, None, &[], &[0x48, 0xf7, 0xf1]);
        assert!(run_rule(floating_point_exception, &crash).is_some());
        assert_eq!(run_rule(benign_signal, &crash), None);
    }
}
