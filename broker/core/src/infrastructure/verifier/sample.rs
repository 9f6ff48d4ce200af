// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Verifier for the software-simulated TEE.
//!
//! The sample platform has no hardware root of trust, so this verifier only
//! proves freshness and key binding: `report_data` must equal the binding
//! digest of the session nonce and the submitted TEE key. Whether sample
//! evidence is acceptable at all is decided by the attestation policy.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

use crate::domain::evidence::{AttestationEvidence, Claims, EvidenceVerifier, VerificationError};
use crate::domain::tee::{binding_digest, Tee, TeePublicKey};

#[derive(Debug, Default, Clone, Copy)]
pub struct SampleVerifier;

impl SampleVerifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EvidenceVerifier for SampleVerifier {
    async fn verify(
        &self,
        nonce: &str,
        tee_public_key: &TeePublicKey,
        evidence: &AttestationEvidence,
    ) -> Result<Claims, VerificationError> {
        let sample = match evidence {
            AttestationEvidence::Sample(sample) => sample,
            other => {
                return Err(VerificationError::PlatformMismatch {
                    expected: Tee::Sample,
                    found: other.tee(),
                })
            }
        };

        let report_data = STANDARD
            .decode(&sample.report_data)
            .map_err(|e| VerificationError::MalformedEvidence(format!("report_data: {}", e)))?;
        let expected = binding_digest(nonce, tee_public_key);
        if !bool::from(report_data.as_slice().ct_eq(&expected)) {
            return Err(VerificationError::BindingMismatch);
        }

        Ok(Claims {
            tee: Tee::Sample,
            measurement: sample.measurement.clone(),
            svn: sample.svn,
            report_data: sample.report_data.clone(),
            extra: BTreeMap::new(),
        })
    }
}
