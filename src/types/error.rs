//! Error types for metagate
//!
//! Every failure the engine can surface is a `MetaError`. Errors are `Clone`
//! because a single bind outcome is delivered to every request waiting on it.

use std::fmt;

/// Directory result codes the engine reports back to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    NoSuchObject,
    InvalidCredentials,
    Busy,
    Unavailable,
    UnwillingToPerform,
    Other,
}

impl ResultCode {
    /// Numeric wire value
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::OperationsError => 1,
            Self::ProtocolError => 2,
            Self::TimeLimitExceeded => 3,
            Self::SizeLimitExceeded => 4,
            Self::NoSuchObject => 32,
            Self::InvalidCredentials => 49,
            Self::Busy => 51,
            Self::Unavailable => 52,
            Self::UnwillingToPerform => 53,
            Self::Other => 80,
        }
    }

    /// Map a numeric result code received from a remote target
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::OperationsError,
            2 => Self::ProtocolError,
            3 => Self::TimeLimitExceeded,
            4 => Self::SizeLimitExceeded,
            32 => Self::NoSuchObject,
            49 => Self::InvalidCredentials,
            51 => Self::Busy,
            52 => Self::Unavailable,
            53 => Self::UnwillingToPerform,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Taxonomy class of an error; decides retry and quarantine behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Candidate selection failed; reported directly, never retried
    Routing,
    /// Target unreachable; updates quarantine, retried at most once
    Transport,
    /// Per-target request problem; target dropped for this request only
    Protocol,
    /// Authentication rejected by the target
    Credentials,
    /// Local misconfiguration or broken invariant
    Internal,
}

/// Main error type for engine operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    #[error("No suitable candidate target found for \"{0}\"")]
    NoCandidate(String),

    #[error("Unable to select unique candidate target for \"{0}\"")]
    AmbiguousCandidate(String),

    #[error("Cross-target rename not supported")]
    CrossTargetUnsupported,

    #[error("Target {0} is quarantined")]
    Quarantined(usize),

    #[error("Server down: {0}")]
    ServerDown(String),

    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    #[error("Unwilling to perform: {0}")]
    Unwilling(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid DN: {0}")]
    InvalidDn(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Remote error {code}: {message}")]
    Remote { code: ResultCode, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MetaError {
    /// Directory result code returned to the client for this error
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::NoCandidate(_) => ResultCode::NoSuchObject,
            Self::AmbiguousCandidate(_) => ResultCode::UnwillingToPerform,
            Self::CrossTargetUnsupported => ResultCode::UnwillingToPerform,
            Self::Quarantined(_) => ResultCode::Unavailable,
            Self::ServerDown(_) => ResultCode::Unavailable,
            Self::NetworkTimeout(_) => ResultCode::Unavailable,
            Self::Unwilling(_) => ResultCode::UnwillingToPerform,
            Self::Protocol(_) => ResultCode::ProtocolError,
            Self::InvalidDn(_) => ResultCode::ProtocolError,
            Self::InvalidCredentials => ResultCode::InvalidCredentials,
            Self::Remote { code, .. } => *code,
            Self::Config(_) => ResultCode::Other,
            Self::Internal(_) => ResultCode::Other,
        }
    }

    /// Taxonomy class
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoCandidate(_) | Self::AmbiguousCandidate(_) | Self::CrossTargetUnsupported => {
                ErrorClass::Routing
            }
            Self::Quarantined(_) | Self::ServerDown(_) | Self::NetworkTimeout(_) => {
                ErrorClass::Transport
            }
            Self::Remote { code, .. } => match code {
                ResultCode::Unavailable | ResultCode::Busy => ErrorClass::Transport,
                ResultCode::InvalidCredentials => ErrorClass::Credentials,
                _ => ErrorClass::Protocol,
            },
            Self::Unwilling(_) | Self::Protocol(_) | Self::InvalidDn(_) => ErrorClass::Protocol,
            Self::InvalidCredentials => ErrorClass::Credentials,
            Self::Config(_) | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether this failure means the remote target could not be reached.
    ///
    /// A `Quarantined` error never reached the target, so it is a transport
    /// error for retry purposes but must not feed back into quarantine.
    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }

    /// Whether the failure should be recorded against the target's quarantine
    pub fn counts_against_target(&self) -> bool {
        self.is_transport() && !matches!(self, Self::Quarantined(_))
    }

    /// Rank used when several candidates failed and only one error may be
    /// reported: unavailable/timeout outranks everything, not-found ranks lowest.
    pub fn severity(&self) -> u8 {
        match self.result_code() {
            ResultCode::Unavailable | ResultCode::Busy => 6,
            ResultCode::TimeLimitExceeded => 5,
            ResultCode::Other | ResultCode::OperationsError => 4,
            ResultCode::InvalidCredentials => 3,
            ResultCode::UnwillingToPerform | ResultCode::ProtocolError => 2,
            ResultCode::SizeLimitExceeded => 1,
            ResultCode::NoSuchObject | ResultCode::Success => 0,
        }
    }
}

impl From<std::io::Error> for MetaError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::de::Error> for MetaError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("TOML error: {}", err))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MetaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_round_trip_for_known_codes() {
        for code in [0u32, 1, 2, 3, 4, 32, 49, 51, 52, 53, 80] {
            assert_eq!(ResultCode::from_code(code).code(), code);
        }
        assert_eq!(ResultCode::from_code(68), ResultCode::Other);
    }

    #[test]
    fn test_classes() {
        assert_eq!(MetaError::NoCandidate("x".into()).class(), ErrorClass::Routing);
        assert_eq!(MetaError::ServerDown("x".into()).class(), ErrorClass::Transport);
        assert_eq!(MetaError::Unwilling("x".into()).class(), ErrorClass::Protocol);
        assert_eq!(
            MetaError::Remote {
                code: ResultCode::Busy,
                message: String::new()
            }
            .class(),
            ErrorClass::Transport
        );
    }

    #[test]
    fn test_quarantined_is_transport_but_not_counted() {
        let err = MetaError::Quarantined(2);
        assert!(err.is_transport());
        assert!(!err.counts_against_target());
        assert!(MetaError::NetworkTimeout("t".into()).counts_against_target());
    }

    #[test]
    fn test_unavailable_outranks_not_found() {
        let down = MetaError::ServerDown("ldap://a".into());
        let missing = MetaError::Remote {
            code: ResultCode::NoSuchObject,
            message: String::new(),
        };
        assert!(down.severity() > missing.severity());
    }
}
