//! Retry/backoff policy.
//!
//! Pure computation: given a job's attempt counters and the outcome of one
//! execution attempt, decide the next state. Persisting the decision is the
//! job store's concern.
//!
//! Backoff is `backoff_base ^ attempts` seconds with no upper cap. A base of 1
//! gives a constant one-second delay and a base of 0 gives no delay at all
//! once the first attempt has failed. The only clamp is the representable
//! time horizon (see [`storage_horizon`]).

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::job::{Failure, JobStatus, Output};

/// Retained tail of stdout/stderr, in characters.
pub const MAX_OUTPUT_CHARS: usize = 4000;

/// Retained head of a fault message, in characters.
pub const MAX_FAULT_CHARS: usize = 500;

/// Marker prefix written to `last_error` when a job goes dead.
pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";

/// Latest instant that can be stored as a fixed-width timestamp.
pub fn storage_horizon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of running a job's command once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The command ran and reported an exit code.
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The command could not be started or observed (no exit code).
    Fault { message: String },
}

/// Live policy inputs, read from the config store at computation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { backoff_base: 2 }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempts + 1`, in seconds: `backoff_base ^ attempts`.
    ///
    /// Saturates at `u64::MAX` instead of overflowing.
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        u64::from(self.backoff_base).saturating_pow(attempts)
    }

    /// Eligibility time for the next attempt, clamped to the storage horizon.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let horizon = storage_horizon();
        let delay = i64::try_from(self.delay_secs(attempts))
            .ok()
            .and_then(TimeDelta::try_seconds);
        match delay.and_then(|d| now.checked_add_signed(d)) {
            Some(at) if at <= horizon => at,
            _ => horizon,
        }
    }

    /// Decide the next state for a job that just finished one attempt.
    ///
    /// `attempts` and `max_retries` are the job's values before this attempt.
    pub fn settle(
        &self,
        attempts: u32,
        max_retries: u32,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Settlement {
        let (reason, rc, output) = match outcome {
            Outcome::Exited {
                code: 0,
                stdout,
                stderr,
            } => {
                return Settlement::Completed {
                    rc: 0,
                    output: bounded_output(&stdout, &stderr),
                };
            }
            Outcome::Exited {
                code,
                stdout,
                stderr,
            } => (
                format!("exit code {code}"),
                Some(code),
                bounded_output(&stdout, &stderr),
            ),
            Outcome::Fault { message } => (head_chars(&message, MAX_FAULT_CHARS), None, Output::default()),
        };

        let attempts = attempts.saturating_add(1);
        if attempts < max_retries {
            Settlement::Retry {
                attempts,
                run_at: self.next_run_at(attempts, now),
                failure: Failure {
                    error: reason,
                    rc,
                    output,
                },
            }
        } else {
            Settlement::Dead {
                attempts,
                failure: Failure {
                    error: format!("{RETRIES_EXHAUSTED}: {reason}"),
                    rc,
                    output,
                },
            }
        }
    }
}

/// The decision taken for one finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed {
        rc: i32,
        output: Output,
    },
    /// Back to `pending`, eligible from `run_at`.
    Retry {
        attempts: u32,
        run_at: DateTime<Utc>,
        failure: Failure,
    },
    Dead {
        attempts: u32,
        failure: Failure,
    },
}

impl Settlement {
    /// State the job is persisted in.
    pub fn status(&self) -> JobStatus {
        match self {
            Settlement::Completed { .. } => JobStatus::Completed,
            Settlement::Retry { .. } => JobStatus::Pending,
            Settlement::Dead { .. } => JobStatus::Dead,
        }
    }

    /// Attempt counter after this settlement, given the counter before it.
    pub fn attempts_after(&self, before: u32) -> u32 {
        match self {
            Settlement::Completed { .. } => before,
            Settlement::Retry { attempts, .. } | Settlement::Dead { attempts, .. } => *attempts,
        }
    }
}

fn bounded_output(stdout: &str, stderr: &str) -> Output {
    Output {
        stdout: Some(tail_chars(stdout, MAX_OUTPUT_CHARS)),
        stderr: Some(tail_chars(stderr, MAX_OUTPUT_CHARS)),
    }
}

/// Keep the last `max` characters of `s`.
pub fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

/// Keep the first `max` characters of `s`.
pub fn head_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn failed(code: i32) -> Outcome {
        Outcome::Exited {
            code,
            stdout: "out".to_string(),
            stderr: "boom".to_string(),
        }
    }

    #[test]
    fn exponential_delay_is_base_to_the_attempts() {
        let policy = RetryPolicy { backoff_base: 2 };
        assert_eq!(policy.delay_secs(1), 2);
        assert_eq!(policy.delay_secs(2), 4);
        assert_eq!(policy.delay_secs(3), 8);
        assert_eq!(policy.delay_secs(10), 1024);
    }

    #[test]
    fn base_one_is_constant_and_base_zero_collapses() {
        let one = RetryPolicy { backoff_base: 1 };
        assert_eq!(one.delay_secs(1), 1);
        assert_eq!(one.delay_secs(7), 1);

        let zero = RetryPolicy { backoff_base: 0 };
        assert_eq!(zero.delay_secs(0), 1);
        assert_eq!(zero.delay_secs(1), 0);
        assert_eq!(zero.delay_secs(5), 0);
    }

    #[test]
    fn huge_delays_clamp_to_horizon_instead_of_overflowing() {
        let policy = RetryPolicy { backoff_base: 10 };
        assert_eq!(policy.delay_secs(40), u64::MAX);
        assert_eq!(policy.next_run_at(40, Utc::now()), storage_horizon());
    }

    #[test]
    fn success_completes_without_touching_attempts() {
        let policy = RetryPolicy::default();
        let settlement = policy.settle(
            1,
            3,
            Outcome::Exited {
                code: 0,
                stdout: "hello\n".into(),
                stderr: String::new(),
            },
            Utc::now(),
        );
        assert_eq!(settlement.status(), JobStatus::Completed);
        assert_eq!(settlement.attempts_after(1), 1);
        match settlement {
            Settlement::Completed { rc, output } => {
                assert_eq!(rc, 0);
                assert_eq!(output.stdout.as_deref(), Some("hello\n"));
            }
            other => panic!("unexpected settlement: {other:?}"),
        }
    }

    #[test]
    fn failure_below_ceiling_retries_with_backoff() {
        let policy = RetryPolicy { backoff_base: 3 };
        let now = Utc::now();
        match policy.settle(1, 3, failed(7), now) {
            Settlement::Retry {
                attempts,
                run_at,
                failure,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(run_at, now + TimeDelta::seconds(9));
                assert_eq!(failure.rc, Some(7));
                assert_eq!(failure.error, "exit code 7");
                assert_eq!(failure.output.stderr.as_deref(), Some("boom"));
            }
            other => panic!("unexpected settlement: {other:?}"),
        }
    }

    #[test]
    fn failure_at_ceiling_goes_dead_with_marker() {
        let policy = RetryPolicy::default();
        match policy.settle(1, 2, failed(1), Utc::now()) {
            Settlement::Dead { attempts, failure } => {
                assert_eq!(attempts, 2);
                assert_eq!(failure.rc, Some(1));
                assert!(failure.error.starts_with(RETRIES_EXHAUSTED));
            }
            other => panic!("unexpected settlement: {other:?}"),
        }
    }

    #[test]
    fn zero_retries_dies_on_first_failure() {
        let settlement = RetryPolicy::default().settle(0, 0, failed(1), Utc::now());
        assert_eq!(settlement.status(), JobStatus::Dead);
        assert_eq!(settlement.attempts_after(0), 1);
    }

    #[test]
    fn fault_has_no_rc_and_truncated_message() {
        let message = "x".repeat(MAX_FAULT_CHARS + 100);
        match RetryPolicy::default().settle(0, 3, Outcome::Fault { message }, Utc::now()) {
            Settlement::Retry { failure, .. } => {
                assert_eq!(failure.rc, None);
                assert_eq!(failure.error.chars().count(), MAX_FAULT_CHARS);
                assert_eq!(failure.output, Output::default());
            }
            other => panic!("unexpected settlement: {other:?}"),
        }
    }

    #[test]
    fn output_keeps_the_tail() {
        let long = format!("{}END", "a".repeat(MAX_OUTPUT_CHARS));
        let kept = tail_chars(&long, MAX_OUTPUT_CHARS);
        assert_eq!(kept.chars().count(), MAX_OUTPUT_CHARS);
        assert!(kept.ends_with("END"));
        assert_eq!(tail_chars("short", MAX_OUTPUT_CHARS), "short");
        assert_eq!(tail_chars("héllo", 3), "llo");
    }

    proptest! {
        #[test]
        fn attempts_never_decrease(attempts in 0u32..50, max in 0u32..50, code in -255i32..255) {
            let settlement = RetryPolicy::default().settle(attempts, max, failed(code), Utc::now());
            prop_assert!(settlement.attempts_after(attempts) >= attempts);
        }

        #[test]
        fn dead_iff_ceiling_reached(attempts in 0u32..50, max in 0u32..50, code in 1i32..255) {
            let settlement = RetryPolicy::default().settle(attempts, max, failed(code), Utc::now());
            let after = settlement.attempts_after(attempts);
            match settlement {
                Settlement::Dead { .. } => prop_assert!(after >= max),
                Settlement::Retry { .. } => prop_assert!(after < max),
                Settlement::Completed { .. } => prop_assert!(false, "non-zero exit completed"),
            }
        }

        #[test]
        fn run_at_is_at_least_now_plus_delay(base in 0u32..6, attempts in 0u32..12) {
            let policy = RetryPolicy { backoff_base: base };
            let now = Utc::now();
            let delay = i64::try_from(policy.delay_secs(attempts)).unwrap();
            prop_assert!(policy.next_run_at(attempts, now) >= now + TimeDelta::seconds(delay));
        }
    }
}
