//! metagate - multi-target routing and connection pool engine
//!
//! The core of a directory proxy that spreads one namespace over several
//! remote servers. For every request it:
//!
//! - Selects the candidate targets that own (or may own) the request DN
//! - Finds or creates the pool entry for the requester's identity
//! - Brings each candidate's session up, one handshake per session at a time
//! - Keeps failing targets in quarantine and retries them on a schedule
//!
//! ## Layout
//!
//! - `target`: registry of remote servers and the quarantine controller
//! - `routing`: candidate selection and the DN cache
//! - `pool`: pool entries, per-target sessions and the sweeper
//! - `bind`: handshake and re-bind coordination
//! - `backend`: the facade operation handlers call into
//! - `transport`: connection seam with the `ldap3` and in-memory connectors

pub mod backend;
pub mod bind;
pub mod config;
pub mod dn;
pub mod logging;
pub mod pool;
pub mod result;
pub mod rewrite;
pub mod routing;
pub mod target;
pub mod transport;
pub mod types;

pub use backend::{MetaBackend, MetaBackendBuilder, Prepared};
pub use config::{Args, MetaConfig};
pub use dn::{Dn, Scope};
pub use pool::{ConnectionPool, EntryLease, IdentityKey, PoolEntry, Requester};
pub use routing::{CandidateSet, OperationKind, RoutingMode, RoutingRequest};
pub use target::{QuarantineController, Target, TargetRegistry};
pub use types::{MetaError, Result, ResultCode};
