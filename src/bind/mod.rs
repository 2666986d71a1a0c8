//! Session establishment
//!
//! The coordinator owns every handshake and re-bind against a target so a
//! session never has more than one of them in flight.

pub mod coordinator;

pub use coordinator::BindCoordinator;
