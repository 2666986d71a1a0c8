//! Per-target quarantine (circuit breaker)
//!
//! A target that fails with a transport error is quarantined. While
//! quarantined no connection attempt is made until the current retry block's
//! interval has elapsed; the next access then moves it to `Retrying` and lets
//! requests through. A failed retry counts against the current block and,
//! once the block's attempt limit is reached, advances to the next block.
//! When every block is used up the target stays quarantined for good.
//!
//! Decisions are computed lazily from the stored state and the caller's clock,
//! so there are no timers. Each target has its own lock.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{MetaError, Result};

/// How many attempts a retry block allows before advancing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Limited(u32),
    Forever,
}

/// One `{interval, attempts}` step of a retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBlock {
    pub interval: Duration,
    pub attempts: RetryLimit,
}

/// Quarantine policy for one target
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QuarantinePolicy {
    /// Failures never quarantine the target
    #[default]
    Never,
    /// Once quarantined, the target is never retried
    Forever,
    /// Ordered retry blocks; exhausting the last one is final
    Schedule(Vec<RetryBlock>),
}

impl QuarantinePolicy {
    fn block(&self, idx: usize) -> Option<&RetryBlock> {
        match self {
            Self::Schedule(blocks) => blocks.get(idx),
            _ => None,
        }
    }
}

impl FromStr for QuarantinePolicy {
    type Err = MetaError;

    /// Parse `"<interval>,<count>[;<interval>,<count>...]"`, `never` or `forever`.
    ///
    /// Intervals are seconds (fractions allowed); a count of `+` retries
    /// forever and must be the last block.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "never" => return Ok(Self::Never),
            "forever" => return Ok(Self::Forever),
            _ => {}
        }

        let bad = |why: &str| MetaError::Config(format!("invalid quarantine \"{}\": {}", s, why));

        let mut blocks: Vec<RetryBlock> = Vec::new();
        for part in s.split(';') {
            if matches!(blocks.last(), Some(b) if b.attempts == RetryLimit::Forever) {
                return Err(bad("a \"+\" block must be last"));
            }
            let (interval, count) = part
                .split_once(',')
                .ok_or_else(|| bad("expected <interval>,<count>"))?;
            let secs: f64 = interval.trim().parse().map_err(|_| bad("interval is not a number"))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(bad("interval must be non-negative"));
            }
            let attempts = match count.trim() {
                "+" => RetryLimit::Forever,
                n => match n.parse::<u32>() {
                    Ok(0) | Err(_) => return Err(bad("count must be a positive integer or \"+\"")),
                    Ok(n) => RetryLimit::Limited(n),
                },
            };
            blocks.push(RetryBlock {
                interval: Duration::from_secs_f64(secs),
                attempts,
            });
        }

        Ok(Self::Schedule(blocks))
    }
}

impl fmt::Display for QuarantinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::Forever => f.write_str("forever"),
            Self::Schedule(blocks) => {
                for (i, b) in blocks.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    match b.attempts {
                        RetryLimit::Limited(n) => write!(f, "{},{}", b.interval.as_secs_f64(), n)?,
                        RetryLimit::Forever => write!(f, "{},+", b.interval.as_secs_f64())?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// Circuit-breaker status of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineStatus {
    #[default]
    Healthy,
    Quarantined,
    Retrying,
}

/// Snapshot of one target's quarantine bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuarantineState {
    pub status: QuarantineStatus,
    pub block: usize,
    pub attempts: u32,
    pub last_failure: Option<Instant>,
}

/// Callback run when a target leaves quarantine
pub type RecoveryHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Quarantine state machines for every configured target
pub struct QuarantineController {
    policies: Vec<QuarantinePolicy>,
    states: Vec<Mutex<QuarantineState>>,
    on_recover: Option<RecoveryHook>,
}

impl QuarantineController {
    /// Create a controller with one state machine per policy, all healthy
    pub fn new(policies: Vec<QuarantinePolicy>) -> Self {
        let states = policies.iter().map(|_| Mutex::new(QuarantineState::default())).collect();
        Self {
            policies,
            states,
            on_recover: None,
        }
    }

    /// Register the hook fired when a target returns to `Healthy`
    pub fn with_recovery_hook(mut self, hook: RecoveryHook) -> Self {
        self.on_recover = Some(hook);
        self
    }

    /// Number of targets tracked
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Whether a connection attempt to `idx` may be made now
    pub fn allow(&self, idx: usize) -> bool {
        self.allow_at(idx, Instant::now())
    }

    /// Decide whether an attempt may be made at `now`.
    ///
    /// Denies only while quarantined with the current interval not yet
    /// elapsed, or once the schedule is exhausted. A quarantined target whose
    /// interval has elapsed moves to `Retrying`.
    pub fn allow_at(&self, idx: usize, now: Instant) -> bool {
        let (Some(policy), Some(state)) = (self.policies.get(idx), self.states.get(idx)) else {
            return false;
        };

        let mut st = state.lock();
        let status = st.status;
        match status {
            QuarantineStatus::Healthy => true,
            QuarantineStatus::Retrying => match policy {
                QuarantinePolicy::Schedule(_) => policy.block(st.block).is_some(),
                _ => true,
            },
            QuarantineStatus::Quarantined => {
                let Some(block) = policy.block(st.block) else {
                    return false;
                };
                let last = st.last_failure.unwrap_or(now);
                if now.saturating_duration_since(last) >= block.interval {
                    st.status = QuarantineStatus::Retrying;
                    info!(target_idx = idx, block = st.block, "Quarantine interval elapsed, retrying");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether `allow` would deny `idx` right now, without changing its state
    pub fn is_blocked(&self, idx: usize) -> bool {
        let (Some(policy), Some(state)) = (self.policies.get(idx), self.states.get(idx)) else {
            return true;
        };
        let st = *state.lock();
        match st.status {
            QuarantineStatus::Healthy => false,
            QuarantineStatus::Retrying => {
                matches!(policy, QuarantinePolicy::Schedule(_)) && policy.block(st.block).is_none()
            }
            QuarantineStatus::Quarantined => match (policy.block(st.block), st.last_failure) {
                (Some(block), Some(last)) => last.elapsed() < block.interval,
                (Some(_), None) => false,
                (None, _) => true,
            },
        }
    }

    /// Record a transport failure against `idx`
    pub fn record_failure(&self, idx: usize) {
        self.record_failure_at(idx, Instant::now())
    }

    pub fn record_failure_at(&self, idx: usize, now: Instant) {
        let (Some(policy), Some(state)) = (self.policies.get(idx), self.states.get(idx)) else {
            return;
        };
        if *policy == QuarantinePolicy::Never {
            return;
        }

        let mut st = state.lock();
        let status = st.status;
        match status {
            QuarantineStatus::Healthy => {
                st.block = 0;
                st.attempts = 0;
                warn!(target_idx = idx, policy = %policy, "Target entering quarantine");
            }
            QuarantineStatus::Retrying => {
                st.attempts += 1;
                if let Some(RetryBlock {
                    attempts: RetryLimit::Limited(limit),
                    ..
                }) = policy.block(st.block)
                {
                    if st.attempts >= *limit {
                        st.block += 1;
                        st.attempts = 0;
                        match policy.block(st.block) {
                            Some(next) => info!(
                                target_idx = idx,
                                block = st.block,
                                interval = ?next.interval,
                                "Quarantine retry block advanced"
                            ),
                            None => warn!(target_idx = idx, "Quarantine retry schedule exhausted"),
                        }
                    }
                }
                debug!(target_idx = idx, attempts = st.attempts, "Quarantine retry failed");
            }
            QuarantineStatus::Quarantined => {}
        }
        st.status = QuarantineStatus::Quarantined;
        st.last_failure = Some(now);
    }

    /// Record a successful attempt against `idx`
    pub fn record_success(&self, idx: usize) {
        let Some(state) = self.states.get(idx) else {
            return;
        };

        let recovered = {
            let mut st = state.lock();
            if st.status == QuarantineStatus::Healthy {
                false
            } else {
                *st = QuarantineState::default();
                true
            }
        };

        if recovered {
            info!(target_idx = idx, "Target left quarantine");
            if let Some(hook) = &self.on_recover {
                hook(idx);
            }
        }
    }

    /// Feed an attempt outcome into the state machine.
    ///
    /// Only errors that mean the target could not be reached count as
    /// failures; other errors leave the state untouched.
    pub fn report<T>(&self, idx: usize, outcome: &Result<T>) {
        match outcome {
            Ok(_) => self.record_success(idx),
            Err(e) if e.counts_against_target() => self.record_failure(idx),
            Err(_) => {}
        }
    }

    /// Current state of `idx`
    pub fn state(&self, idx: usize) -> Option<QuarantineState> {
        self.states.get(idx).map(|s| *s.lock())
    }

    /// Current status of `idx` (unknown targets report healthy)
    pub fn status(&self, idx: usize) -> QuarantineStatus {
        self.state(idx).map(|s| s.status).unwrap_or_default()
    }

    /// Policy configured for `idx`
    pub fn policy(&self, idx: usize) -> Option<&QuarantinePolicy> {
        self.policies.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("never".parse::<QuarantinePolicy>().unwrap(), QuarantinePolicy::Never);
        assert_eq!("forever".parse::<QuarantinePolicy>().unwrap(), QuarantinePolicy::Forever);

        let policy: QuarantinePolicy = "10,3; 60,+".parse().unwrap();
        assert_eq!(
            policy,
            QuarantinePolicy::Schedule(vec![
                RetryBlock {
                    interval: secs(10),
                    attempts: RetryLimit::Limited(3)
                },
                RetryBlock {
                    interval: secs(60),
                    attempts: RetryLimit::Forever
                },
            ])
        );
        assert_eq!(policy.to_string(), "10,3;60,+");
    }

    #[test]
    fn test_policy_parsing_rejects_garbage() {
        assert!("10".parse::<QuarantinePolicy>().is_err());
        assert!("10,0".parse::<QuarantinePolicy>().is_err());
        assert!("-1,3".parse::<QuarantinePolicy>().is_err());
        assert!("10,+;60,3".parse::<QuarantinePolicy>().is_err());
    }

    #[test]
    fn test_never_policy_ignores_failures() {
        let q = QuarantineController::new(vec![QuarantinePolicy::Never]);
        q.record_failure(0);
        assert_eq!(q.status(0), QuarantineStatus::Healthy);
        assert!(q.allow(0));
    }

    #[test]
    fn test_block_advances_and_denies_before_next_interval() {
        let q = QuarantineController::new(vec!["10,3;60,+".parse().unwrap()]);
        let t0 = Instant::now();

        q.record_failure_at(0, t0);
        assert_eq!(q.status(0), QuarantineStatus::Quarantined);
        assert!(!q.allow_at(0, t0 + secs(5)));

        // three failed retries exhaust the first block
        let mut t = t0;
        for _ in 0..3 {
            t += secs(10);
            assert!(q.allow_at(0, t));
            assert_eq!(q.status(0), QuarantineStatus::Retrying);
            q.record_failure_at(0, t);
        }

        let st = q.state(0).unwrap();
        assert_eq!(st.block, 1);
        assert_eq!(st.attempts, 0);
        assert!(!q.allow_at(0, t + secs(5)));
        assert!(!q.allow_at(0, t + secs(59)));
        assert!(q.allow_at(0, t + secs(60)));
    }

    #[test]
    fn test_exhausted_schedule_denies_forever() {
        let q = QuarantineController::new(vec!["1,1".parse().unwrap()]);
        let t0 = Instant::now();
        q.record_failure_at(0, t0);
        assert!(q.allow_at(0, t0 + secs(1)));
        q.record_failure_at(0, t0 + secs(1));
        assert_eq!(q.state(0).unwrap().block, 1);
        assert!(!q.allow_at(0, t0 + secs(3600)));
    }

    #[test]
    fn test_forever_policy_never_retries() {
        let q = QuarantineController::new(vec![QuarantinePolicy::Forever]);
        let t0 = Instant::now();
        q.record_failure_at(0, t0);
        assert!(!q.allow_at(0, t0 + secs(86_400)));
    }

    #[test]
    fn test_success_after_failures_resets_and_fires_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let q = QuarantineController::new(vec!["10,3;60,+".parse().unwrap()])
            .with_recovery_hook(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        let t0 = Instant::now();
        q.record_failure_at(0, t0);
        for n in 1..=4u64 {
            assert!(q.allow_at(0, t0 + secs(100 * n)));
            q.record_failure_at(0, t0 + secs(100 * n));
        }
        assert!(q.allow_at(0, t0 + secs(1000)));
        q.record_success(0);

        assert_eq!(q.state(0).unwrap(), QuarantineState::default());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // success while healthy is a no-op
        q.record_success(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_only_counts_transport_failures() {
        let q = QuarantineController::new(vec!["10,3".parse().unwrap(), "10,3".parse().unwrap()]);
        q.report::<()>(0, &Err(MetaError::InvalidCredentials));
        q.report::<()>(0, &Err(MetaError::Quarantined(0)));
        assert_eq!(q.status(0), QuarantineStatus::Healthy);

        q.report::<()>(1, &Err(MetaError::ServerDown("ldap://b".into())));
        assert_eq!(q.status(1), QuarantineStatus::Quarantined);
        assert_eq!(q.status(0), QuarantineStatus::Healthy);
    }

    #[test]
    fn test_unknown_target_denied() {
        let q = QuarantineController::new(vec![]);
        assert!(!q.allow(3));
        assert!(q.is_empty());
    }
}
