//! Turning signals into a verdict.

use std::collections::BTreeSet;

use triage_common::CrashReason;

use crate::report::{Assessment, Severity, Signal, SignalId, Verdict};

/// Thresholds for combining signals into a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerdictPolicy {
    /// Distinct high-severity signals needed for `EXPLOITABLE`.
    pub exploitable_high_count: usize,
    /// Distinct medium-severity signals needed for `PROBABLY_EXPLOITABLE` when nothing is high.
    pub probably_exploitable_medium_count: usize,
    /// Whether missing evidence holds the verdict at `UNKNOWN`.
    pub data_quality_forces_unknown: bool,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        VerdictPolicy {
            exploitable_high_count: 2,
            probably_exploitable_medium_count: 2,
            data_quality_forces_unknown: true,
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// Combine `signals` into an [`Assessment`].
pub fn aggregate(
    signals: Vec<Signal>,
    crash_reason: &CrashReason,
    policy: &VerdictPolicy,
) -> Assessment {
    let distinct = |severity: Severity| -> usize {
        signals
            .iter()
            .filter(|signal| signal.severity == severity)
            .map(|signal| signal.id)
            .collect::<BTreeSet<SignalId>>()
            .len()
    };
    let dominant = signals.iter().map(|signal| signal.severity).max();

    let (verdict, mut rationale) = match dominant {
        Some(Severity::High) => {
            let high = distinct(Severity::High);
            let verdict = if high >= policy.exploitable_high_count {
                Verdict::Exploitable
            } else {
                Verdict::ProbablyExploitable
            };
            (
                verdict,
                format!(
                    "{high} high-severity signal{}, {} needed for EXPLOITABLE",
                    plural(high),
                    policy.exploitable_high_count
                ),
            )
        }
        Some(Severity::Medium) => {
            let medium = distinct(Severity::Medium);
            let verdict = if medium >= policy.probably_exploitable_medium_count {
                Verdict::ProbablyExploitable
            } else {
                Verdict::ProbablyNotExploitable
            };
            (
                verdict,
                format!(
                    "{medium} medium-severity signal{}, {} needed for PROBABLY_EXPLOITABLE",
                    plural(medium),
                    policy.probably_exploitable_medium_count
                ),
            )
        }
        Some(Severity::Low) => (
            Verdict::ProbablyNotExploitable,
            String::from("only low-severity signals"),
        ),
        Some(Severity::Informational) | None if crash_reason.is_benign() => (
            Verdict::NotExploitable,
            format!("no significant signals and {crash_reason} is benign"),
        ),
        Some(Severity::Informational) | None => (
            Verdict::Unknown,
            format!("no significant signals for {crash_reason}"),
        ),
    };

    // A smashed stack can't be unwound, so a failed unwind next to one isn't missing evidence.
    let unwind_explained = signals.iter().any(|signal| signal.id.breaks_unwinding());
    let missing: Vec<&str> = signals
        .iter()
        .filter(|signal| signal.is_data_quality())
        .filter(|signal| !(unwind_explained && signal.id.is_unwind_problem()))
        .map(|signal| signal.id.name())
        .collect();
    let confidence_limited = policy.data_quality_forces_unknown && !missing.is_empty();
    let verdict = if confidence_limited {
        rationale = format!(
            "held at UNKNOWN, evidence is missing ({}); otherwise {verdict}: {rationale}",
            missing.join(", ")
        );
        Verdict::Unknown
    } else {
        rationale = format!("{verdict}: {rationale}");
        verdict
    };

    for signal in &signals {
        rationale.push_str(&format!("\n  - {signal}"));
    }

    Assessment {
        verdict,
        signals,
        confidence_limited,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(ids: &[SignalId]) -> Vec<Signal> {
        ids.iter().map(|&id| Signal::new(id, "test")).collect()
    }

    fn verdict_of(ids: &[SignalId], reason: CrashReason) -> Verdict {
        aggregate(signals(ids), &reason, &VerdictPolicy::default()).verdict
    }

    #[test]
    fn test_severity_mapping() {
        use SignalId::*;
        let segv = || CrashReason::Segv;
        assert_eq!(
            verdict_of(&[WriteToReadOnly, ControlFlowHijackSuspected], segv()),
            Verdict::Exploitable
        );
        assert_eq!(
            verdict_of(&[WildPointerDereference], segv()),
            Verdict::ProbablyExploitable
        );
        assert_eq!(
            verdict_of(&[HeapOverflowPattern, BlockMoveFault], segv()),
            Verdict::ProbablyExploitable
        );
        assert_eq!(
            verdict_of(&[HeapOverflowPattern], segv()),
            Verdict::ProbablyNotExploitable
        );
        assert_eq!(
            verdict_of(&[NullPointerStyle], segv()),
            Verdict::ProbablyNotExploitable
        );
        assert_eq!(verdict_of(&[ReadAccessViolation], segv()), Verdict::Unknown);
        assert_eq!(verdict_of(&[], segv()), Verdict::Unknown);
        assert_eq!(
            verdict_of(&[BenignSignal], CrashReason::Abrt),
            Verdict::NotExploitable
        );
    }

    #[test]
    fn test_duplicate_signals_count_once() {
        let mut duplicated = signals(&[SignalId::WildPointerDereference]);
        duplicated.push(Signal::new(SignalId::WildPointerDereference, "again"));
        let assessment = aggregate(duplicated, &CrashReason::Segv, &VerdictPolicy::default());
        assert_eq!(assessment.verdict, Verdict::ProbablyExploitable);
    }

    #[test]
    fn test_data_quality_forces_unknown() {
        let assessment = aggregate(
            signals(&[
                SignalId::WriteToReadOnly,
                SignalId::ControlFlowHijackSuspected,
                SignalId::DecodeFailed,
            ]),
            &CrashReason::Segv,
            &VerdictPolicy::default(),
        );
        assert_eq!(assessment.verdict, Verdict::Unknown);
        assert!(assessment.confidence_limited);
        assert!(assessment.rationale.contains("decode-failed"));
        assert!(assessment.rationale.contains("otherwise EXPLOITABLE"));

        // and below UNKNOWN too
        assert_eq!(
            verdict_of(&[SignalId::UnwindFailed, SignalId::BenignSignal], CrashReason::Abrt),
            Verdict::Unknown
        );

        let lenient = VerdictPolicy {
            data_quality_forces_unknown: false,
            ..VerdictPolicy::default()
        };
        let assessment = aggregate(
            signals(&[SignalId::UnwindFailed, SignalId::BenignSignal]),
            &CrashReason::Abrt,
            &lenient,
        );
        assert_eq!(assessment.verdict, Verdict::ProbablyNotExploitable);
        assert!(!assessment.confidence_limited);
    }

    #[test]
    fn test_corruption_explains_a_broken_unwind() {
        use SignalId::*;
        let segv = || CrashReason::Segv;
        let assessment = aggregate(
            signals(&[WildPointerDereference, ControlFlowHijackSuspected, UnwindFailed]),
            &segv(),
            &VerdictPolicy::default(),
        );
        assert_eq!(assessment.verdict, Verdict::Exploitable);
        assert!(!assessment.confidence_limited);

        assert_eq!(
            verdict_of(&[ReturnAddressCorrupted, CyclicUnwind], segv()),
            Verdict::ProbablyExploitable
        );
        assert_eq!(
            verdict_of(&[StackPointerCorrupted, UnwindFailed], segv()),
            Verdict::ProbablyExploitable
        );
        assert_eq!(
            verdict_of(&[StackCodeExecution, CyclicUnwind], segv()),
            Verdict::ProbablyExploitable
        );

        // other high signals don't excuse it
        assert_eq!(
            verdict_of(&[WildPointerDereference, UnwindFailed], segv()),
            Verdict::Unknown
        );
        // and nothing excuses a failed decode
        assert_eq!(
            verdict_of(&[ControlFlowHijackSuspected, UnwindFailed, DecodeFailed], segv()),
            Verdict::Unknown
        );
    }

    #[test]
    fn test_rationale_lists_every_signal() {
        let assessment = aggregate(
            signals(&[SignalId::NullPointerStyle, SignalId::ReadAccessViolation]),
            &CrashReason::Segv,
            &VerdictPolicy::default(),
        );
        assert_eq!(assessment.signals.len(), 2);
        assert!(assessment.rationale.contains("null-pointer-style"));
        assert!(assessment.rationale.contains("read-access-violation"));
        assert!(assessment
            .rationale
            .starts_with("PROBABLY_NOT_EXPLOITABLE: only low-severity signals"));
    }

    #[test]
    fn test_adding_a_high_signal_never_lowers_the_verdict() {
        let all = SignalId::ALL;
        let highs: Vec<SignalId> = all
            .iter()
            .copied()
            .filter(|id| id.severity() == Severity::High)
            .collect();
        for reason in [CrashReason::Segv, CrashReason::Abrt] {
            for &base in all {
                for &other in all {
                    let before = verdict_of(&[base, other], reason.clone());
                    for &high in &highs {
                        let after = verdict_of(&[base, other, high], reason.clone());
                        assert!(after >= before, "{base} + {other} + {high}");
                    }
                }
            }
        }
    }
}
