// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Attestation Evidence (BC-KBS)
//!
//! Evidence arrives on the wire as an opaque string; the session already knows
//! which [`Tee`] the client announced, so [`AttestationEvidence::parse`] turns
//! the string into the strongly typed variant for that platform. Verifiers
//! dispatch on the variant and never touch untyped fields.
//!
//! ```text
//! (Tee, "tee-evidence")
//!   └─ AttestationEvidence::parse
//!         ├─ Sample(SampleEvidence)     ← verified locally
//!         └─ Hardware(HardwareEvidence) ← delegated to an attestation service
//!   └─ EvidenceVerifier::verify(nonce, tee_public_key, evidence) -> Claims
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::tee::{Tee, TeePublicKey};

/// Evidence produced by the software-simulated TEE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEvidence {
    /// Security version number of the simulated firmware.
    pub svn: u64,
    /// Hex launch measurement.
    pub measurement: String,
    /// Base64 of [`super::tee::binding_digest`].
    pub report_data: String,
}

/// Vendor evidence the core does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareEvidence {
    pub tee: Tee,
    /// Vendor quote / report bundle exactly as the client sent it.
    pub quote: String,
}

/// Platform-tagged evidence bundle. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationEvidence {
    Sample(SampleEvidence),
    Hardware(HardwareEvidence),
}

impl AttestationEvidence {
    /// Interpret the raw `tee-evidence` string for the announced platform.
    pub fn parse(tee: Tee, raw: &str) -> Result<Self, VerificationError> {
        match tee {
            Tee::Sample => serde_json::from_str::<SampleEvidence>(raw)
                .map(AttestationEvidence::Sample)
                .map_err(|e| VerificationError::MalformedEvidence(e.to_string())),
            hardware => {
                if raw.trim().is_empty() {
                    return Err(VerificationError::MalformedEvidence(
                        "empty hardware evidence".to_string(),
                    ));
                }
                Ok(AttestationEvidence::Hardware(HardwareEvidence {
                    tee: hardware,
                    quote: raw.to_string(),
                }))
            }
        }
    }

    pub fn tee(&self) -> Tee {
        match self {
            AttestationEvidence::Sample(_) => Tee::Sample,
            AttestationEvidence::Hardware(h) => h.tee,
        }
    }
}

/// Normalized verification result evaluated by the authorization gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub tee: Tee,
    pub measurement: String,
    pub svn: u64,
    /// Base64 report data the evidence committed to.
    pub report_data: String,
    /// Platform-specific claims passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Why a piece of evidence was rejected. Internal only: at the session boundary
/// every variant collapses into `KbsError::EvidenceVerificationFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("malformed evidence: {0}")]
    MalformedEvidence(String),

    #[error("malformed TEE public key: {0}")]
    MalformedPublicKey(String),

    #[error("evidence is not bound to the session nonce and TEE key")]
    BindingMismatch,

    #[error("no verifier registered for TEE '{0}'")]
    UnsupportedTee(Tee),

    #[error("evidence platform '{found}' does not match session platform '{expected}'")]
    PlatformMismatch { expected: Tee, found: Tee },

    #[error("attestation service rejected evidence: {0}")]
    Rejected(String),

    #[error("policy rejected claims: {0}")]
    PolicyViolation(String),

    #[error("attestation service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("verification timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Platform verifier. Implementations must check that the evidence commits to
/// both the supplied nonce and the supplied TEE public key.
#[async_trait]
pub trait EvidenceVerifier: Send + Sync {
    async fn verify(
        &self,
        nonce: &str,
        tee_public_key: &TeePublicKey,
        evidence: &AttestationEvidence,
    ) -> Result<Claims, VerificationError>;
}
