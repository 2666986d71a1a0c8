//! Shared types

pub mod error;

pub use error::{ErrorClass, MetaError, Result, ResultCode};
