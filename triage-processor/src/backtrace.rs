//! Sanity checks over the backtrace the debugger produced.
//!
//! The debugger has already unwound the stack, so all that's left is to look at what it found
//! and decide whether the frames look like a healthy call chain. Frame 0 is the crashing frame
//! itself: its address is the program counter, which the heuristics judge on their own, so only
//! the caller frames are checked as return addresses.

use tracing::trace;
use triage_common::Frame;

use crate::memory_map::MemoryMap;
use crate::report::{Signal, SignalId};

fn describe_frame(index: usize, frame: &Frame) -> String {
    match frame.function {
        Some(ref function) => format!("frame #{index} ({function})"),
        None => format!("frame #{index}"),
    }
}

fn unwind_failed(backtrace: &[Frame]) -> Option<Signal> {
    match backtrace.len() {
        0 => Some(Signal::new(
            SignalId::UnwindFailed,
            "the debugger produced no backtrace",
        )),
        1 => Some(Signal::new(
            SignalId::UnwindFailed,
            "the debugger couldn't unwind past the crashing frame",
        )),
        _ => None,
    }
}

fn return_address_corrupted(backtrace: &[Frame], memory: &MemoryMap<'_>) -> Option<Signal> {
    if memory.is_empty() {
        return None;
    }
    let outermost = backtrace.len().saturating_sub(1);
    for (index, frame) in backtrace.iter().enumerate().skip(1) {
        let address = frame.return_address.0;
        // Zero terminates the chain.
        if address == 0 && index == outermost {
            continue;
        }
        let problem = match memory.region(address) {
            None => String::from("is unmapped"),
            Some(region) if !region.permissions.execute => {
                format!("is in non-executable memory {}", region.describe())
            }
            Some(_) => continue,
        };
        return Some(Signal::new(
            SignalId::ReturnAddressCorrupted,
            format!(
                "return address {} of {} {problem}",
                frame.return_address,
                describe_frame(index, frame)
            ),
        ));
    }
    None
}

fn frame_pointer_corrupted(backtrace: &[Frame], memory: &MemoryMap<'_>) -> Option<Signal> {
    if !memory.has_stack() {
        return None;
    }
    backtrace.iter().enumerate().find_map(|(index, frame)| {
        let base = frame.frame_base.filter(|base| base.0 != 0)?;
        if memory.in_stack(base.0) {
            return None;
        }
        let location = match memory.region(base.0) {
            Some(region) => region.describe(),
            None => String::from("unmapped memory"),
        };
        Some(Signal::new(
            SignalId::FramePointerCorrupted,
            format!(
                "frame base {base} of {} points into {location}, not the stack",
                describe_frame(index, frame)
            ),
        ))
    })
}

fn cyclic_unwind(backtrace: &[Frame]) -> Option<Signal> {
    let index = backtrace.windows(2).position(|pair| {
        pair[0].return_address == pair[1].return_address && pair[0].frame_base == pair[1].frame_base
    })?;
    Some(Signal::new(
        SignalId::CyclicUnwind,
        format!(
            "frames #{index} and #{} are identical ({}), the unwinder went in circles",
            index + 1,
            backtrace[index].return_address
        ),
    ))
}

/// Check the backtrace for signs of corruption or of an unreliable unwind.
///
/// Signals come out in a fixed order: unwind failure, corrupted return address, corrupted
/// frame pointer, cyclic unwind.
pub fn analyze(backtrace: &[Frame], memory: &MemoryMap<'_>) -> Vec<Signal> {
    let signals: Vec<Signal> = [
        unwind_failed(backtrace),
        return_address_corrupted(backtrace, memory),
        frame_pointer_corrupted(backtrace, memory),
        cyclic_unwind(backtrace),
    ]
    .into_iter()
    .flatten()
    .collect();
    for signal in &signals {
        trace!("backtrace: {}", signal);
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::{MemoryRegion, Permissions, RegionLabel};

    fn regions() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion::new(0x40_0000, 0x50_0000, Permissions::READ_EXECUTE, RegionLabel::Module),
            MemoryRegion::new(0x60_0000, 0x62_0000, Permissions::READ_WRITE, RegionLabel::Heap),
            MemoryRegion::new(0x7ff0_0000, 0x7ff2_0000, Permissions::READ_WRITE, RegionLabel::Stack),
        ]
    }

    fn ids(signals: &[Signal]) -> Vec<SignalId> {
        signals.iter().map(|signal| signal.id).collect()
    }

    #[test]
    fn test_healthy_backtrace() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let backtrace = vec![
            Frame::new(0x40_1000, Some(0x7ff1_0000)),
            Frame::new(0x40_2000, Some(0x7ff1_0040)),
            Frame::new(0x40_3000, Some(0x7ff1_0080)),
            Frame::new(0, None),
        ];
        assert!(analyze(&backtrace, &map).is_empty());
    }

    #[test]
    fn test_unwind_failed() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        assert_eq!(ids(&analyze(&[], &map)), vec![SignalId::UnwindFailed]);
        assert_eq!(
            ids(&analyze(&[Frame::new(0x40_1000, None)], &map)),
            vec![SignalId::UnwindFailed]
        );
    }

    #[test]
    fn test_smashed_stack() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let backtrace = vec![
            Frame::new(0x40_1000, Some(0x7ff1_0000)),
            Frame::new(0x4141_4141, Some(0x4141_4141)),
            Frame::new(0x4141_4141, Some(0x4141_4141)),
        ];
        assert_eq!(
            ids(&analyze(&backtrace, &map)),
            vec![
                SignalId::ReturnAddressCorrupted,
                SignalId::FramePointerCorrupted,
                SignalId::CyclicUnwind,
            ]
        );
    }

    #[test]
    fn test_return_into_heap() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        let backtrace = vec![
            Frame::new(0x40_1000, Some(0x7ff1_0000)),
            Frame::new(0x61_0000, Some(0x7ff1_0040)),
        ];
        let signals = analyze(&backtrace, &map);
        assert_eq!(ids(&signals), vec![SignalId::ReturnAddressCorrupted]);
        assert!(signals[0].explanation.contains("non-executable"));
    }

    #[test]
    fn test_abstains_without_map() {
        let map = MemoryMap::new(&[], 0x1000).unwrap();
        let backtrace = vec![
            Frame::new(0x40_1000, Some(0x1234)),
            Frame::new(0x4141_4141, Some(0x5678)),
        ];
        assert!(analyze(&backtrace, &map).is_empty());
    }
}
