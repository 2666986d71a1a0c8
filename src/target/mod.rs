//! Remote targets and their health
//!
//! - `registry`: immutable table of configured targets
//! - `quarantine`: per-target circuit breaker

pub mod quarantine;
pub mod registry;

pub use quarantine::{
    QuarantineController, QuarantinePolicy, QuarantineState, QuarantineStatus, RecoveryHook,
    RetryBlock, RetryLimit,
};
pub use registry::{IdAssert, Target, TargetRegistry, TargetSummary};
