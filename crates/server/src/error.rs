//! The daemon's error taxonomy, §7.
//!
//! Every fallible core operation returns a `DaemonError` instead of panicking
//! or throwing. The RPC boundary (`rpc.rs`) is the only place these are
//! translated into transport-facing failures; nothing upstream of it
//! inspects error internals beyond matching on `kind()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Malformed RPC argument: out-of-range pos, unparseable command, bad hex.
    /// No state change.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Unknown vm/device/rule. No state change.
    #[error("not found: {0}")]
    NotFound(String),

    /// `is_allowed` refused the pairing. Carries the `pos` of the refusing
    /// rule when a rule (rather than the implicit trailing deny) refused.
    #[error("policy refused the assignment (rule {rule_pos:?})")]
    PolicyRefusal { rule_pos: Option<u16> },

    /// Shared-store transaction aborted; caller may retry.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// A state-wait did not reach its target within its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// An always-assigned device is bound to a VM other than the one its
    /// sticky rule names. Logged, not fatal; surfaces as a non-zero
    /// aggregate return from the batch operation that found it.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Cannot open the shared store, the enumerator, or the settings store
    /// at startup. The daemon exits with a non-zero code.
    #[error("fatal bootstrap failure: {0}")]
    FatalBootstrap(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl DaemonError {
    /// Short tag for logging/diagnostics; mirrors the §7 kind names.
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonError::Validation(_) => "validation",
            DaemonError::NotFound(_) => "not_found",
            DaemonError::PolicyRefusal { .. } => "policy_refusal",
            DaemonError::TransientExternal(_) => "transient_external",
            DaemonError::Timeout(_) => "timeout",
            DaemonError::IntegrityViolation(_) => "integrity_violation",
            DaemonError::FatalBootstrap(_) => "fatal_bootstrap",
        }
    }
}

impl From<usbmuxd_protocol::ProtocolError> for DaemonError {
    fn from(e: usbmuxd_protocol::ProtocolError) -> Self {
        DaemonError::Validation(e.to_string())
    }
}

impl From<usbmuxd_common::Error> for DaemonError {
    fn from(e: usbmuxd_common::Error) -> Self {
        DaemonError::TransientExternal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_the_seven_error_classes() {
        assert_eq!(DaemonError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            DaemonError::PolicyRefusal { rule_pos: Some(10) }.kind(),
            "policy_refusal"
        );
        assert_eq!(
            DaemonError::FatalBootstrap("x".into()).kind(),
            "fatal_bootstrap"
        );
    }
}
