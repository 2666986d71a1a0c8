//! Merging per-target outcomes into the single result a client receives

use crate::routing::RoutingMode;
use crate::types::{MetaError, Result};

/// The highest-severity error, keeping the first one on ties
pub fn worst_error<'a, I>(errors: I) -> Option<MetaError>
where
    I: IntoIterator<Item = &'a MetaError>,
{
    let mut worst: Option<&MetaError> = None;
    for err in errors {
        if worst.map_or(true, |w| err.severity() > w.severity()) {
            worst = Some(err);
        }
    }
    worst.cloned()
}

/// Combine the outcomes of one request across its candidate targets.
///
/// Under `AllowMultiple` any success wins and only the successes are kept;
/// when every target failed the worst error is reported. Other modes fail
/// on the first error.
pub fn merge_outcomes<T>(mode: RoutingMode, outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
    match mode {
        RoutingMode::AllowMultiple => {
            if outcomes.is_empty() {
                return Err(MetaError::NoCandidate(String::new()));
            }
            let (oks, errs): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(|o| o.is_ok());
            if oks.is_empty() {
                let errs: Vec<MetaError> = errs.into_iter().filter_map(|o| o.err()).collect();
                return Err(worst_error(&errs).unwrap_or_else(|| MetaError::NoCandidate(String::new())));
            }
            Ok(oks.into_iter().filter_map(|o| o.ok()).collect())
        }
        RoutingMode::RequireSingle | RoutingMode::RequireAll => outcomes.into_iter().collect(),
    }
}
