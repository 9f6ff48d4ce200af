// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Evidence verifiers and the per-platform dispatch registry.
//!
//! [`VerifierRegistry`] is itself an [`EvidenceVerifier`]: it rejects TEE keys
//! that could not receive sealed resources, selects the verifier registered
//! for the evidence's platform, bounds the call with the configured timeout,
//! and applies the platform section of the attestation policy to the claims
//! that come back.

pub mod remote;
pub mod sample;

pub use remote::RemoteVerifier;
pub use sample::SampleVerifier;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::evidence::{AttestationEvidence, Claims, EvidenceVerifier, VerificationError};
use crate::domain::policy::AttestationPolicy;
use crate::domain::tee::{Tee, TeePublicKey};

pub struct VerifierRegistry {
    verifiers: HashMap<Tee, Arc<dyn EvidenceVerifier>>,
    policy: Arc<AttestationPolicy>,
    timeout: Duration,
}

impl VerifierRegistry {
    pub fn new(policy: Arc<AttestationPolicy>, timeout: Duration) -> Self {
        Self {
            verifiers: HashMap::new(),
            policy,
            timeout,
        }
    }

    /// Sample verifier plus, when configured, a remote verifier for every
    /// hardware platform.
    pub fn with_defaults(
        policy: Arc<AttestationPolicy>,
        timeout: Duration,
        remote_url: Option<&str>,
    ) -> Self {
        let mut registry = Self::new(policy, timeout).register(Tee::Sample, Arc::new(SampleVerifier::new()));
        if let Some(url) = remote_url {
            let remote: Arc<dyn EvidenceVerifier> = Arc::new(RemoteVerifier::new(url.to_string(), timeout));
            for tee in [Tee::Snp, Tee::Tdx, Tee::Sgx, Tee::AzSnpVtpm] {
                registry = registry.register(tee, remote.clone());
            }
        }
        registry
    }

    pub fn register(mut self, tee: Tee, verifier: Arc<dyn EvidenceVerifier>) -> Self {
        self.verifiers.insert(tee, verifier);
        self
    }

    pub fn supports(&self, tee: Tee) -> bool {
        self.verifiers.contains_key(&tee)
    }
}

#[async_trait]
impl EvidenceVerifier for VerifierRegistry {
    async fn verify(
        &self,
        nonce: &str,
        tee_public_key: &TeePublicKey,
        evidence: &AttestationEvidence,
    ) -> Result<Claims, VerificationError> {
        crate::infrastructure::crypto::recipient_key(tee_public_key)
            .map_err(|e| VerificationError::MalformedPublicKey(e.to_string()))?;

        let tee = evidence.tee();
        let verifier = self
            .verifiers
            .get(&tee)
            .ok_or(VerificationError::UnsupportedTee(tee))?;

        let claims = tokio::time::timeout(self.timeout, verifier.verify(nonce, tee_public_key, evidence))
            .await
            .map_err(|_| VerificationError::Timeout(self.timeout))??;

        if claims.tee != tee {
            return Err(VerificationError::PlatformMismatch {
                expected: tee,
                found: claims.tee,
            });
        }
        self.policy
            .evaluate_platform(&claims)
            .map_err(VerificationError::PolicyViolation)?;

        debug!(tee = %tee, measurement = %claims.measurement, svn = claims.svn, "Evidence verified");
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evidence::SampleEvidence;
    use crate::domain::policy::PlatformPolicy;
    use crate::domain::tee::{binding_digest, KeyWrapAlgorithm};
    use crate::infrastructure::crypto::test_keys::tee_keypair;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    struct SlowVerifier;

    #[async_trait]
    impl EvidenceVerifier for SlowVerifier {
        async fn verify(
            &self,
            _nonce: &str,
            _key: &TeePublicKey,
            _evidence: &AttestationEvidence,
        ) -> Result<Claims, VerificationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(VerificationError::Rejected("unreachable".to_string()))
        }
    }

    fn sample_policy() -> Arc<AttestationPolicy> {
        let mut policy = AttestationPolicy::default();
        policy.platforms.insert(Tee::Sample, PlatformPolicy::default());
        Arc::new(policy)
    }

    fn key() -> TeePublicKey {
        tee_keypair().1.clone()
    }

    fn sample_evidence(nonce: &str, svn: u64) -> AttestationEvidence {
        AttestationEvidence::Sample(SampleEvidence {
            svn,
            measurement: "abcd".to_string(),
            report_data: STANDARD.encode(binding_digest(nonce, &key())),
        })
    }

    #[tokio::test]
    async fn test_dispatches_to_sample_verifier() {
        let registry = VerifierRegistry::with_defaults(sample_policy(), Duration::from_secs(1), None);
        let claims = registry.verify("n", &key(), &sample_evidence("n", 1)).await.unwrap();
        assert_eq!(claims.tee, Tee::Sample);
        assert!(registry.supports(Tee::Sample));
        assert!(!registry.supports(Tee::Snp));
    }

    #[tokio::test]
    async fn test_unregistered_platform() {
        let registry = VerifierRegistry::new(Arc::new(AttestationPolicy::default()), Duration::from_secs(1));
        let result = registry.verify("n", &key(), &sample_evidence("n", 1)).await;
        assert_eq!(result, Err(VerificationError::UnsupportedTee(Tee::Sample)));
    }

    #[tokio::test]
    async fn test_platform_policy_applied() {
        let mut policy = AttestationPolicy::default();
        policy.platforms.insert(
            Tee::Sample,
            PlatformPolicy {
                allow: true,
                measurements: vec![],
                min_svn: 3,
            },
        );
        let registry = VerifierRegistry::with_defaults(Arc::new(policy), Duration::from_secs(1), None);
        let result = registry.verify("n", &key(), &sample_evidence("n", 2)).await;
        assert!(matches!(result, Err(VerificationError::PolicyViolation(_))));
        assert!(registry.verify("n", &key(), &sample_evidence("n", 3)).await.is_ok());

        let registry = VerifierRegistry::with_defaults(
            Arc::new(AttestationPolicy::hardware_only()),
            Duration::from_secs(1),
            None,
        );
        let result = registry.verify("n", &key(), &sample_evidence("n", 9)).await;
        assert!(matches!(result, Err(VerificationError::PolicyViolation(_))));
    }

    #[tokio::test]
    async fn test_default_policy_refuses_sample_evidence() {
        let registry =
            VerifierRegistry::with_defaults(Arc::new(AttestationPolicy::default()), Duration::from_secs(1), None);
        let result = registry.verify("n", &key(), &sample_evidence("n", 1)).await;
        assert!(matches!(result, Err(VerificationError::PolicyViolation(_))));
    }

    #[tokio::test]
    async fn test_rejects_unusable_tee_key() {
        let registry = VerifierRegistry::with_defaults(sample_policy(), Duration::from_secs(1), None);
        let weak = TeePublicKey::new_rsa(KeyWrapAlgorithm::RsaOaep256, "bW9k".to_string(), "AQAB".to_string());
        let result = registry.verify("n", &weak, &sample_evidence("n", 1)).await;
        assert!(matches!(result, Err(VerificationError::MalformedPublicKey(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_verification() {
        let registry = VerifierRegistry::new(Arc::new(AttestationPolicy::default()), Duration::from_secs(10))
            .register(Tee::Sample, Arc::new(SlowVerifier));
        let result = registry.verify("n", &key(), &sample_evidence("n", 1)).await;
        assert_eq!(result, Err(VerificationError::Timeout(Duration::from_secs(10))));
    }
}
