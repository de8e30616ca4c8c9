//! Bounded readiness polling.
//!
//! The same attempt/interval budget is used in two places: in-process, via
//! [`PollPolicy::await_ready`], and inside boot units, where
//! [`PollPolicy::render_shell`] emits an equivalent shell loop.

use crate::error::{StorechainError, StorechainResult};
use log::debug;
use std::thread;
use std::time::Duration;

/// Attempt budget for a readiness predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// Outcome of a bounded poll. Polling itself never fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Evaluate `predicate` until it holds or the attempt budget is spent.
    ///
    /// Sleeps `interval` between failed attempts, never after the last one.
    pub fn await_ready<F>(&self, mut predicate: F) -> Readiness
    where
        F: FnMut() -> bool,
    {
        for attempt in 1..=self.max_attempts {
            if predicate() {
                return Readiness::Ready { attempts: attempt };
            }
            if attempt < self.max_attempts && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
        Readiness::TimedOut {
            attempts: self.max_attempts,
        }
    }

    /// Like [`await_ready`](Self::await_ready) but maps exhaustion to a
    /// `Timeout` error naming `what`.
    pub fn require<F>(&self, what: &str, predicate: F) -> StorechainResult<u32>
    where
        F: FnMut() -> bool,
    {
        match self.await_ready(predicate) {
            Readiness::Ready { attempts } => {
                debug!("{what} ready after {attempts} attempt(s)");
                Ok(attempts)
            }
            Readiness::TimedOut { attempts } => Err(StorechainError::Timeout {
                what: what.to_string(),
                attempts,
            }),
        }
    }

    /// Render this policy as a POSIX shell loop around `probe`.
    ///
    /// The loop exits 0 as soon as every check passes and 1 once the budget
    /// is exhausted. The output contains no single quotes so it can be
    /// wrapped with [`unit_command`].
    pub fn render_shell(&self, probe: &ShellProbe) -> String {
        let condition = probe
            .checks
            .iter()
            .map(ProbeCheck::render)
            .collect::<Vec<_>>()
            .join(" && ");
        let label = &probe.label;
        format!(
            "tries={tries}; delay={delay}; i=0; \
while [ \"$i\" -lt \"$tries\" ]; do \
if {condition}; then echo \"{label}: ready\"; exit 0; fi; \
i=$((i+1)); echo \"{label}: waiting ($i/$tries)\"; \
if [ \"$i\" -lt \"$tries\" ]; then sleep \"$delay\"; fi; \
done; \
echo \"{label}: not ready after $tries attempts\" >&2; exit 1",
            tries = self.max_attempts,
            delay = format_interval(self.interval),
        )
    }
}

/// One condition inside a rendered readiness loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCheck {
    /// Path exists and is a block device.
    BlockDevice(String),
    /// `lsblk` reports a size greater than zero.
    NonZeroSize(String),
    /// A 1 KiB read from the device succeeds.
    TrialRead(String),
}

impl ProbeCheck {
    fn render(&self) -> String {
        match self {
            ProbeCheck::BlockDevice(path) => format!("[ -b \"{path}\" ]"),
            ProbeCheck::NonZeroSize(path) => format!(
                "[ \"$(lsblk -bno SIZE \"{path}\" 2>/dev/null | head -n1 | tr -d \" \")\" -gt 0 ] 2>/dev/null"
            ),
            ProbeCheck::TrialRead(path) => {
                format!("dd if=\"{path}\" of=/dev/null bs=1k count=1 status=none 2>/dev/null")
            }
        }
    }
}

/// Labelled conjunction of checks rendered into a shell loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellProbe {
    pub label: String,
    pub checks: Vec<ProbeCheck>,
}

impl ShellProbe {
    pub fn new(label: impl Into<String>, checks: Vec<ProbeCheck>) -> Self {
        Self {
            label: label.into(),
            checks,
        }
    }
}

/// Wrap a shell script for an `Exec*=` directive.
///
/// systemd expands `$` and `%` itself, so both are doubled to reach the
/// shell untouched.
pub fn unit_command(bash: &str, script: &str) -> String {
    let escaped = script.replace('%', "%%").replace('$', "$$");
    format!("{bash} -c '{escaped}'")
}

fn format_interval(interval: Duration) -> String {
    let millis = interval.as_millis();
    if millis % 1_000 == 0 {
        format!("{}", millis / 1_000)
    } else {
        format!("{}.{:03}", millis / 1_000, millis % 1_000)
            .trim_end_matches('0')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn always_false_predicate_is_evaluated_exactly_max_attempts_times() {
        let calls = Cell::new(0u32);
        let policy = PollPolicy::new(5, Duration::ZERO);
        let outcome = policy.await_ready(|| {
            calls.set(calls.get() + 1);
            false
        });
        assert_eq!(calls.get(), 5);
        assert_eq!(outcome, Readiness::TimedOut { attempts: 5 });
    }

    #[test]
    fn ready_predicate_stops_early() {
        let calls = Cell::new(0u32);
        let policy = PollPolicy::new(10, Duration::ZERO);
        let outcome = policy.await_ready(|| {
            calls.set(calls.get() + 1);
            calls.get() == 3
        });
        assert_eq!(outcome, Readiness::Ready { attempts: 3 });
        assert_eq!(calls.get(), 3);
        assert!(outcome.is_ready());
    }

    #[test]
    fn zero_attempts_never_evaluates() {
        let policy = PollPolicy::new(0, Duration::from_secs(5));
        let outcome = policy.await_ready(|| panic!("must not be called"));
        assert_eq!(outcome, Readiness::TimedOut { attempts: 0 });
    }

    #[test]
    fn no_sleep_after_final_attempt() {
        let policy = PollPolicy::new(2, Duration::from_millis(200));
        let started = std::time::Instant::now();
        let _ = policy.await_ready(|| false);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(390), "{elapsed:?}");
    }

    #[test]
    fn require_maps_exhaustion_to_timeout_error() {
        let err = PollPolicy::new(3, Duration::ZERO)
            .require("logical volume node", || false)
            .unwrap_err();
        match err {
            StorechainError::Timeout { what, attempts } => {
                assert_eq!(what, "logical volume node");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rendered_loop_carries_budget_and_checks() {
        let policy = PollPolicy::new(60, Duration::from_millis(500));
        let probe = ShellProbe::new(
            "nbd device /dev/nbd0",
            vec![
                ProbeCheck::BlockDevice("/dev/nbd0".into()),
                ProbeCheck::NonZeroSize("/dev/nbd0".into()),
                ProbeCheck::TrialRead("/dev/nbd0".into()),
            ],
        );
        let script = policy.render_shell(&probe);
        assert!(script.starts_with("tries=60; delay=0.5;"));
        assert!(script.contains("[ -b \"/dev/nbd0\" ] && "));
        assert!(script.contains("lsblk -bno SIZE"));
        assert!(script.contains("dd if=\"/dev/nbd0\" of=/dev/null bs=1k count=1"));
        assert!(script.ends_with("exit 1"));
        assert!(!script.contains('\''));
    }

    #[test]
    fn unit_command_escapes_systemd_specifiers() {
        let wrapped = unit_command("/bin/bash", "i=$((i+1)); date +%s");
        assert_eq!(wrapped, "/bin/bash -c 'i=$$((i+1)); date +%%s'");
    }

    #[test]
    fn intervals_render_as_plain_seconds() {
        assert_eq!(format_interval(Duration::from_secs(1)), "1");
        assert_eq!(format_interval(Duration::from_millis(500)), "0.5");
        assert_eq!(format_interval(Duration::from_millis(1250)), "1.25");
        assert_eq!(format_interval(Duration::ZERO), "0");
    }
}
