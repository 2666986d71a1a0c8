//! Request routing
//!
//! Candidate selection over the target registry, plus the DN cache that
//! remembers how ambiguous DNs were resolved.

pub mod candidates;
pub mod dncache;

pub use candidates::{
    CandidateSelector, CandidateSet, CandidateSlot, CandidateTag, OperationKind, RoutingMode,
    RoutingRequest, UniqueProbe,
};
pub use dncache::{CacheTtl, DnCache};
