// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Key Broker Service
//!
//! Application service that runs the attestation-session protocol end to end.
//! It is the only entry point the transport layer calls.
//!
//! ## Protocol Flow
//!
//! ```text
//! TEE workload
//!   │  AuthRequest { version, tee }
//!   ▼
//! KeyBrokerService.start_session()     → session id + Challenge { nonce }
//!   │  Attestation { tee-pubkey, tee-evidence }
//!   ▼
//! KeyBrokerService.attest()
//!   1. SessionStore.attempt_attest()   (nonce spent, evidence verified)
//!   2. TokenIssuer.issue_at()          →  RS256 credential bound to the key
//!   3. session committed to Attested
//!   │  Authorization: Bearer <credential>
//!   ▼
//! KeyBrokerService.fetch_resource()
//!   1. ResourceGate.authorize()
//!   2. ResourceStore.lookup()
//!   3. envelope::seal()                →  EncryptedEnvelope for the TEE key
//!   4. SessionStore.record_release()
//! ```

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::resource_gate::ResourceGate;
use crate::application::session_store::SessionStore;
use crate::domain::broker_config::{BrokerConfigManifest, ResourceBackend};
use crate::domain::error::KbsError;
use crate::domain::evidence::EvidenceVerifier;
use crate::domain::policy::AttestationPolicy;
use crate::domain::resource::{ResourceDescriptor, ResourceStore};
use crate::domain::session::{ReleasePolicy, SessionId};
use crate::domain::tee::{Tee, TeePublicKey};
use crate::infrastructure::crypto::{seal, EncryptedEnvelope};
use crate::infrastructure::nonce::NonceGenerator;
use crate::infrastructure::policy_source::{FilePolicySource, PolicySource, StaticPolicySource};
use crate::infrastructure::resource_store::{InMemoryResourceStore, LocalFsResourceStore};
use crate::infrastructure::token::{CredentialBinding, TokenIssuer};
use crate::infrastructure::verifier::VerifierRegistry;

/// Body of the first protocol request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub version: String,
    pub tee: Tee,
    #[serde(rename = "extra-params", default)]
    pub extra_params: serde_json::Value,
}

/// Challenge returned for an [`AuthRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    #[serde(rename = "extra-params", default)]
    pub extra_params: serde_json::Value,
}

/// Evidence submission.
///
/// `tee-evidence` is normally a JSON-encoded string; a JSON object is also
/// accepted and re-serialized before parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(rename = "tee-pubkey")]
    pub tee_pubkey: TeePublicKey,
    #[serde(rename = "tee-evidence")]
    pub tee_evidence: serde_json::Value,
}

impl Attestation {
    pub fn evidence_string(&self) -> String {
        match &self.tee_evidence {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartedSession {
    pub session_id: SessionId,
    pub challenge: Challenge,
}

/// Credential handed back after a successful attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationToken {
    pub token: String,
    #[serde(skip)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Verifying key for issued credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCertificate {
    pub keys: Vec<serde_json::Value>,
    pub pem: String,
}

pub struct KeyBrokerService {
    sessions: Arc<SessionStore>,
    verifier: Arc<dyn EvidenceVerifier>,
    issuer: Arc<TokenIssuer>,
    gate: ResourceGate,
    store: Arc<dyn ResourceStore>,
    policy: Arc<AttestationPolicy>,
}

impl KeyBrokerService {
    pub fn new(
        sessions: Arc<SessionStore>,
        verifier: Arc<dyn EvidenceVerifier>,
        issuer: Arc<TokenIssuer>,
        store: Arc<dyn ResourceStore>,
        policy: Arc<AttestationPolicy>,
        release_policy: ReleasePolicy,
    ) -> Self {
        let gate = ResourceGate::new(issuer.clone(), sessions.clone(), policy.clone(), release_policy);
        Self {
            sessions,
            verifier,
            issuer,
            gate,
            store,
            policy,
        }
    }

    /// Build the full broker from a validated configuration manifest.
    ///
    /// Generates the credential signing key, so this is expected to run once
    /// per process.
    pub fn from_config(config: &BrokerConfigManifest) -> anyhow::Result<Self> {
        let spec = &config.spec;

        let policy_source: Box<dyn PolicySource> = match &spec.attestation.policy_path {
            Some(path) => Box::new(FilePolicySource::new(path)),
            None => Box::new(StaticPolicySource::new(spec.policy.clone())),
        };
        let policy = Arc::new(policy_source.load()?);

        let remote_url = spec.attestation.remote.as_ref().map(|r| r.url.as_str());
        let registry = VerifierRegistry::with_defaults(
            policy.clone(),
            spec.attestation.verifier_timeout,
            remote_url,
        );
        for (tee, _) in policy.platforms.iter().filter(|(tee, p)| p.allow && !registry.supports(**tee)) {
            warn!(tee = %tee, "Policy allows a platform with no verifier; its evidence will be refused");
        }
        if !policy.platforms.contains_key(&Tee::Sample) && remote_url.is_none() {
            warn!("No remote verifier and sample evidence not enabled; every attestation will be refused");
        }
        let verifier: Arc<dyn EvidenceVerifier> = Arc::new(registry);

        let issuer = Arc::new(TokenIssuer::generate(&spec.token.issuer, spec.token.ttl)?);
        let sessions = Arc::new(SessionStore::new(
            NonceGenerator::new().context("Entropy source unavailable")?,
            spec.session.ttl,
        )?);

        let store: Arc<dyn ResourceStore> = match spec.resources.backend {
            ResourceBackend::InMemory => Arc::new(
                InMemoryResourceStore::from_entries(&spec.resources.entries)
                    .context("Failed to load configured resources")?,
            ),
            ResourceBackend::LocalFs => {
                let root = spec
                    .resources
                    .root
                    .clone()
                    .context("resources.root is required for the local-fs backend")?;
                Arc::new(LocalFsResourceStore::new(root))
            }
        };

        info!(
            issuer = %issuer.issuer(),
            backend = ?spec.resources.backend,
            release_policy = ?spec.release_policy,
            remote_verifier = remote_url.is_some(),
            "Key broker initialised"
        );

        Ok(Self::new(sessions, verifier, issuer, store, policy, spec.release_policy))
    }

    /// Start a session and issue its challenge.
    pub fn start_session(&self, request: &AuthRequest) -> StartedSession {
        let (session_id, nonce) = self.sessions.start_session(request.tee);
        metrics::counter!("kbs_sessions_started_total", "tee" => request.tee.as_str()).increment(1);
        tracing::debug!(session_id = %session_id, version = %request.version, "Challenge issued");
        StartedSession {
            session_id,
            challenge: Challenge {
                nonce: nonce.0,
                extra_params: serde_json::Value::String(String::new()),
            },
        }
    }

    /// Verify evidence for `session_id` and mint a credential for the key.
    pub async fn attest(
        &self,
        session_id: SessionId,
        attestation: Attestation,
    ) -> Result<AttestationToken, KbsError> {
        let issued_at = whole_seconds(Utc::now());
        let valid_until = issued_at + self.issuer.ttl();
        let evidence = attestation.evidence_string();
        let fingerprint = attestation.tee_pubkey.fingerprint();

        let (_, credential) = self
            .sessions
            .attempt_attest(
                session_id,
                &evidence,
                attestation.tee_pubkey,
                self.verifier.as_ref(),
                valid_until,
                |tee| {
                    self.issuer.issue_at(
                        &CredentialBinding {
                            session_id,
                            tee,
                            tee_key_fingerprint: fingerprint,
                        },
                        issued_at,
                    )
                },
            )
            .await
            .inspect_err(|e| {
                metrics::counter!("kbs_attestations_total", "outcome" => "failure").increment(1);
                record_denial(e);
            })?;

        metrics::counter!("kbs_attestations_total", "outcome" => "success").increment(1);
        Ok(AttestationToken {
            token: credential.token,
            expires_at: Some(credential.claims.expires_at()),
        })
    }

    /// Release `descriptor` sealed for the TEE key bound to the credential.
    pub async fn fetch_resource(
        &self,
        credential: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<EncryptedEnvelope, KbsError> {
        let result = self.release(credential, descriptor).await;
        match &result {
            Ok(_) => {
                metrics::counter!("kbs_resources_released_total").increment(1);
            }
            Err(e) => record_denial(e),
        }
        result
    }

    async fn release(
        &self,
        credential: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<EncryptedEnvelope, KbsError> {
        let release = self.gate.authorize(credential, descriptor).await?;
        let plaintext = self.store.lookup(descriptor).await?;
        let envelope = seal(&plaintext, &release.tee_public_key)?;
        self.sessions
            .record_release(release.session_id, descriptor, self.gate.release_policy())
            .await?;
        info!(
            session_id = %release.session_id,
            resource = %descriptor,
            measurement = %release.claims.measurement,
            "Resource released"
        );
        Ok(envelope)
    }

    pub fn token_certificate(&self) -> Result<TokenCertificate, KbsError> {
        let pem = self
            .issuer
            .public_key_pem()
            .map_err(|e| KbsError::EncryptionFailure(e.to_string()))?;
        Ok(TokenCertificate {
            keys: vec![self.issuer.public_jwk()],
            pem,
        })
    }

    pub fn attestation_policy(&self) -> &AttestationPolicy {
        &self.policy
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.gate.release_policy()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn spawn_session_reaper(&self, interval: Duration) -> JoinHandle<()> {
        self.sessions.spawn_reaper(interval)
    }
}

fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

fn record_denial(e: &KbsError) {
    warn!(kind = %e.kind(), code = e.code(), error = %e, "Request denied");
    metrics::counter!("kbs_requests_denied_total", "kind" => e.kind().as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evidence::SampleEvidence;
    use crate::domain::policy::PlatformPolicy;
    use crate::domain::tee::binding_digest;
    use crate::infrastructure::crypto::open;
    use crate::infrastructure::crypto::test_keys::{signing_key, tee_keypair};
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn broker(release_policy: ReleasePolicy) -> KeyBrokerService {
        let mut policy = AttestationPolicy::default();
        policy.platforms.insert(Tee::Sample, PlatformPolicy::default());
        let policy = Arc::new(policy);
        let store = InMemoryResourceStore::new();
        store.insert(
            ResourceDescriptor::new("default", "key", "1").unwrap(),
            b"super-secret".to_vec(),
        );
        KeyBrokerService::new(
            Arc::new(SessionStore::new(NonceGenerator::new().unwrap(), Duration::from_secs(300)).unwrap()),
            Arc::new(VerifierRegistry::with_defaults(policy.clone(), Duration::from_secs(5), None)),
            Arc::new(TokenIssuer::from_private_key("coco-kbs", Duration::from_secs(3600), signing_key()).unwrap()),
            Arc::new(store),
            policy,
            release_policy,
        )
    }

    fn auth() -> AuthRequest {
        AuthRequest {
            version: "0.1.0".to_string(),
            tee: Tee::Sample,
            extra_params: serde_json::Value::Null,
        }
    }

    fn attestation_for(nonce: &str) -> Attestation {
        let key = tee_keypair().1.clone();
        let evidence = SampleEvidence {
            svn: 1,
            measurement: "abcd".to_string(),
            report_data: STANDARD.encode(binding_digest(nonce, &key)),
        };
        Attestation {
            tee_pubkey: key,
            tee_evidence: serde_json::Value::String(serde_json::to_string(&evidence).unwrap()),
        }
    }

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor::new("default", "key", "1").unwrap()
    }

    #[tokio::test]
    async fn test_full_protocol_releases_sealed_resource() {
        let kbs = broker(ReleasePolicy::Unlimited);
        let started = kbs.start_session(&auth());
        let token = kbs
            .attest(started.session_id, attestation_for(&started.challenge.nonce))
            .await
            .unwrap();

        let claims = kbs.issuer.verify(&token.token).unwrap();
        assert_eq!(claims.sid, started.session_id);
        assert_eq!(claims.tee_pubkey, tee_keypair().1.fingerprint());
        assert_eq!(Some(claims.expires_at()), token.expires_at);

        let session = kbs.sessions.get(started.session_id).await.unwrap();
        assert_eq!(session.expires_at, claims.expires_at());

        let envelope = kbs.fetch_resource(&token.token, &descriptor()).await.unwrap();
        assert_eq!(open(&envelope, &tee_keypair().0).unwrap(), b"super-secret");
    }

    #[tokio::test]
    async fn test_evidence_as_json_object() {
        let kbs = broker(ReleasePolicy::Unlimited);
        let started = kbs.start_session(&auth());
        let mut attestation = attestation_for(&started.challenge.nonce);
        attestation.tee_evidence = serde_json::from_str(&attestation.evidence_string()).unwrap();
        assert!(attestation.tee_evidence.is_object());
        assert!(kbs.attest(started.session_id, attestation).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_nonce_invalidates_session() {
        let kbs = broker(ReleasePolicy::Unlimited);
        let started = kbs.start_session(&auth());
        let result = kbs.attest(started.session_id, attestation_for("stale")).await;
        assert!(matches!(result, Err(KbsError::EvidenceVerificationFailed(_))));

        let retry = kbs
            .attest(started.session_id, attestation_for(&started.challenge.nonce))
            .await;
        assert!(matches!(retry, Err(KbsError::SessionExpired(_))));
    }

    #[tokio::test]
    async fn test_missing_resource() {
        let kbs = broker(ReleasePolicy::Unlimited);
        let started = kbs.start_session(&auth());
        let token = kbs
            .attest(started.session_id, attestation_for(&started.challenge.nonce))
            .await
            .unwrap();
        let missing = ResourceDescriptor::new("default", "key", "2").unwrap();
        assert!(matches!(
            kbs.fetch_resource(&token.token, &missing).await,
            Err(KbsError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_once_per_resource_release() {
        let kbs = broker(ReleasePolicy::OncePerResource);
        let started = kbs.start_session(&auth());
        let token = kbs
            .attest(started.session_id, attestation_for(&started.challenge.nonce))
            .await
            .unwrap();
        kbs.fetch_resource(&token.token, &descriptor()).await.unwrap();
        assert!(matches!(
            kbs.fetch_resource(&token.token, &descriptor()).await,
            Err(KbsError::PolicyDenied(_))
        ));
    }

    #[test]
    fn test_token_certificate() {
        let kbs = broker(ReleasePolicy::Unlimited);
        let cert = kbs.token_certificate().unwrap();
        assert_eq!(cert.keys.len(), 1);
        assert_eq!(cert.keys[0]["alg"], "RS256");
        assert!(cert.pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_whole_seconds() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(whole_seconds(t).timestamp_subsec_nanos(), 0);
        assert_eq!(whole_seconds(t).timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_from_config_in_memory() {
        let mut config = BrokerConfigManifest::default();
        config
            .spec
            .resources
            .entries
            .insert("default/key/1".to_string(), "value".to_string());
        let kbs = KeyBrokerService::from_config(&config).unwrap();
        assert_eq!(kbs.release_policy(), ReleasePolicy::Unlimited);
        assert_eq!(kbs.active_sessions(), 0);
        kbs.start_session(&auth());
        assert_eq!(kbs.active_sessions(), 1);
    }

    #[test]
    fn test_from_config_with_unverifiable_platform() {
        let mut config = BrokerConfigManifest::default();
        config.spec.token.issuer = "edge-kbs".to_string();
        config.spec.policy.platforms.insert(Tee::Snp, PlatformPolicy::default());
        let kbs = KeyBrokerService::from_config(&config).unwrap();
        assert_eq!(kbs.issuer.issuer(), "edge-kbs");
        assert!(kbs.attestation_policy().platforms.contains_key(&Tee::Snp));
    }

    #[tokio::test]
    async fn test_default_config_refuses_sample_evidence() {
        let mut config = BrokerConfigManifest::default();
        config
            .spec
            .resources
            .entries
            .insert("default/key/1".to_string(), "top-secret".to_string());
        let kbs = KeyBrokerService::from_config(&config).unwrap();

        let started = kbs.start_session(&auth());
        let result = kbs
            .attest(started.session_id, attestation_for(&started.challenge.nonce))
            .await;
        assert!(matches!(result, Err(KbsError::EvidenceVerificationFailed(_))));

        let session = kbs.sessions.get(started.session_id).await.unwrap();
        assert!(session.attested().is_err());
    }

    #[tokio::test]
    async fn test_sample_evidence_accepted_when_listed() {
        let mut config = BrokerConfigManifest::default();
        config.spec.policy.platforms.insert(Tee::Sample, PlatformPolicy::default());
        config
            .spec
            .resources
            .entries
            .insert("default/key/1".to_string(), "top-secret".to_string());
        let kbs = KeyBrokerService::from_config(&config).unwrap();

        let started = kbs.start_session(&auth());
        let token = kbs
            .attest(started.session_id, attestation_for(&started.challenge.nonce))
            .await
            .unwrap();
        let envelope = kbs.fetch_resource(&token.token, &descriptor()).await.unwrap();
        assert_eq!(open(&envelope, &tee_keypair().0).unwrap(), b"top-secret");
    }
}
