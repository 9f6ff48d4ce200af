// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Broker Error Taxonomy
//!
//! The closed set of failures the attestation-session protocol can return to a
//! client. Every rejected input maps to exactly one variant; nothing in the
//! core panics on client-controlled data.
//!
//! Variants carry an internal detail string for the structured log. Clients
//! only ever see [`KbsError::to_redacted_string`], which names the category and
//! nothing else (no nonce values, key material, or verifier reasoning).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KbsError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Wrong protocol state: {0}")]
    WrongProtocolState(String),

    #[error("Evidence verification failed: {0}")]
    EvidenceVerificationFailed(String),

    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    #[error("Session not attested: {0}")]
    NotAttested(String),

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),
}

/// Discriminant of [`KbsError`] without the detail payload.
///
/// Used for metrics labels and for the `type` field of HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SessionNotFound,
    SessionExpired,
    WrongProtocolState,
    EvidenceVerificationFailed,
    TokenInvalid,
    NotAttested,
    PolicyDenied,
    ResourceNotFound,
    EncryptionFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SessionNotFound => "SessionNotFound",
            ErrorKind::SessionExpired => "SessionExpired",
            ErrorKind::WrongProtocolState => "WrongProtocolState",
            ErrorKind::EvidenceVerificationFailed => "EvidenceVerificationFailed",
            ErrorKind::TokenInvalid => "TokenInvalid",
            ErrorKind::NotAttested => "NotAttested",
            ErrorKind::PolicyDenied => "PolicyDenied",
            ErrorKind::ResourceNotFound => "ResourceNotFound",
            ErrorKind::EncryptionFailure => "EncryptionFailure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl KbsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KbsError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            KbsError::SessionExpired(_) => ErrorKind::SessionExpired,
            KbsError::WrongProtocolState(_) => ErrorKind::WrongProtocolState,
            KbsError::EvidenceVerificationFailed(_) => ErrorKind::EvidenceVerificationFailed,
            KbsError::TokenInvalid(_) => ErrorKind::TokenInvalid,
            KbsError::NotAttested(_) => ErrorKind::NotAttested,
            KbsError::PolicyDenied(_) => ErrorKind::PolicyDenied,
            KbsError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            KbsError::EncryptionFailure(_) => ErrorKind::EncryptionFailure,
        }
    }

    /// Stable numeric code for this error kind.
    ///
    /// - 2000-2099: session lifecycle
    /// - 2100-2199: attestation and credentials
    /// - 2200-2299: resource release
    pub fn code(&self) -> u16 {
        match self.kind() {
            ErrorKind::SessionNotFound => 2000,
            ErrorKind::SessionExpired => 2001,
            ErrorKind::WrongProtocolState => 2002,

            ErrorKind::EvidenceVerificationFailed => 2100,
            ErrorKind::TokenInvalid => 2101,
            ErrorKind::NotAttested => 2102,

            ErrorKind::PolicyDenied => 2200,
            ErrorKind::ResourceNotFound => 2201,
            ErrorKind::EncryptionFailure => 2202,
        }
    }

    /// Client-safe message. Never includes the internal detail.
    pub fn to_redacted_string(&self) -> String {
        match self.kind() {
            ErrorKind::SessionNotFound => "Unknown or expired session",
            ErrorKind::SessionExpired => "Session is no longer valid, restart the protocol",
            ErrorKind::WrongProtocolState => "Request not valid in the current session state",
            ErrorKind::EvidenceVerificationFailed => "Attestation evidence rejected",
            ErrorKind::TokenInvalid => "Invalid or expired credential",
            ErrorKind::NotAttested => "Session has not completed attestation",
            ErrorKind::PolicyDenied => "Access denied by policy",
            ErrorKind::ResourceNotFound => "Resource not found",
            ErrorKind::EncryptionFailure => "Failed to protect resource for recipient",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<KbsError> {
        vec![
            KbsError::SessionNotFound(String::new()),
            KbsError::SessionExpired(String::new()),
            KbsError::WrongProtocolState(String::new()),
            KbsError::EvidenceVerificationFailed(String::new()),
            KbsError::TokenInvalid(String::new()),
            KbsError::NotAttested(String::new()),
            KbsError::PolicyDenied(String::new()),
            KbsError::ResourceNotFound(String::new()),
            KbsError::EncryptionFailure(String::new()),
        ]
    }

    #[test]
    fn test_error_codes_unique() {
        let mut seen = std::collections::HashSet::new();
        for err in all_variants() {
            assert!(seen.insert(err.code()), "Duplicate error code: {}", err.code());
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_redaction_hides_detail() {
        let err = KbsError::EvidenceVerificationFailed(
            "report_data mismatch for nonce q2Vg...".to_string(),
        );
        let redacted = err.to_redacted_string();
        assert_eq!(redacted, "Attestation evidence rejected");
        assert!(!redacted.contains("nonce"));
        assert_eq!(err.code(), 2100);
    }

    #[test]
    fn test_kind_names_match_variants() {
        for err in all_variants() {
            assert!(format!("{:?}", err).starts_with(err.kind().as_str()));
        }
    }
}
