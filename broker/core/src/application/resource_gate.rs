// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Authorization Gate
//!
//! The single checkpoint between a bearer credential and the resource store.
//! Checks run in a fixed order and the first failure wins:
//!
//! | # | Check | Error |
//! |---|-------|-------|
//! | 1 | credential signature, issuer, expiry | `TokenInvalid` |
//! | 2 | referenced session is live | `SessionNotFound` / `SessionExpired` |
//! | 3 | session is `Attested` | `NotAttested` |
//! | 4 | credential key fingerprint matches the bound key | `TokenInvalid` |
//! | 5 | resource-scoped attestation policy | `PolicyDenied` |
//! | 6 | release policy not exhausted | `PolicyDenied` |

use std::sync::Arc;
use tracing::warn;

use crate::application::session_store::SessionStore;
use crate::domain::error::KbsError;
use crate::domain::evidence::Claims;
use crate::domain::policy::AttestationPolicy;
use crate::domain::resource::ResourceDescriptor;
use crate::domain::session::{ReleasePolicy, SessionId};
use crate::domain::tee::TeePublicKey;
use crate::infrastructure::token::TokenIssuer;

/// Outcome of a successful authorization: who to seal the resource for.
#[derive(Debug, Clone)]
pub struct AuthorizedRelease {
    pub session_id: SessionId,
    pub tee_public_key: TeePublicKey,
    pub claims: Claims,
}

pub struct ResourceGate {
    issuer: Arc<TokenIssuer>,
    sessions: Arc<SessionStore>,
    policy: Arc<AttestationPolicy>,
    release_policy: ReleasePolicy,
}

impl ResourceGate {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        sessions: Arc<SessionStore>,
        policy: Arc<AttestationPolicy>,
        release_policy: ReleasePolicy,
    ) -> Self {
        Self {
            issuer,
            sessions,
            policy,
            release_policy,
        }
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.release_policy
    }

    pub async fn authorize(
        &self,
        credential: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<AuthorizedRelease, KbsError> {
        let claims = self.issuer.verify(credential)?;
        let session = self.sessions.get(claims.sid).await?;
        let (tee_public_key, session_claims) = session.attested()?;

        if tee_public_key.fingerprint() != claims.tee_pubkey || session.tee != claims.tee {
            warn!(session_id = %session.id, "Credential does not match the session's bound key");
            return Err(KbsError::TokenInvalid(format!(
                "credential key binding does not match session {}",
                session.id
            )));
        }

        self.policy
            .evaluate_resource(descriptor, session_claims)
            .map_err(|reason| KbsError::PolicyDenied(format!("{}: {}", descriptor, reason)))?;

        if !session.may_release(descriptor, self.release_policy) {
            return Err(KbsError::PolicyDenied(format!(
                "release policy {:?} exhausted for {}",
                self.release_policy, descriptor
            )));
        }

        Ok(AuthorizedRelease {
            session_id: session.id,
            tee_public_key: tee_public_key.clone(),
            claims: session_claims.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evidence::SampleEvidence;
    use crate::domain::policy::ResourcePolicy;
    use crate::domain::tee::{binding_digest, Tee};
    use crate::infrastructure::crypto::test_keys::{other_tee_keypair, signing_key, tee_keypair};
    use crate::infrastructure::nonce::NonceGenerator;
    use crate::infrastructure::token::CredentialBinding;
    use crate::infrastructure::verifier::SampleVerifier;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::{Duration, Utc};

    struct Fixture {
        issuer: Arc<TokenIssuer>,
        sessions: Arc<SessionStore>,
    }

    fn fixture() -> Fixture {
        Fixture {
            issuer: Arc::new(
                TokenIssuer::from_private_key("coco-kbs", std::time::Duration::from_secs(3600), signing_key())
                    .unwrap(),
            ),
            sessions: Arc::new(
                SessionStore::new(NonceGenerator::new().unwrap(), std::time::Duration::from_secs(300)).unwrap(),
            ),
        }
    }

    impl Fixture {
        fn gate(&self, policy: AttestationPolicy, release_policy: ReleasePolicy) -> ResourceGate {
            ResourceGate::new(self.issuer.clone(), self.sessions.clone(), Arc::new(policy), release_policy)
        }

        async fn attested_credential(&self) -> (SessionId, String) {
            let (_, key) = tee_keypair();
            let (id, nonce) = self.sessions.start_session(Tee::Sample);
            let evidence = serde_json::to_string(&SampleEvidence {
                svn: 1,
                measurement: "abcd".to_string(),
                report_data: STANDARD.encode(binding_digest(nonce.as_str(), key)),
            })
            .unwrap();
            let (_, credential) = self
                .sessions
                .attempt_attest(
                    id,
                    &evidence,
                    key.clone(),
                    &SampleVerifier::new(),
                    Utc::now() + Duration::hours(1),
                    |_| Ok(self.credential_for(id, key.fingerprint())),
                )
                .await
                .unwrap();
            (id, credential)
        }

        fn credential_for(&self, id: SessionId, fingerprint: String) -> String {
            self.issuer
                .issue(&CredentialBinding {
                    session_id: id,
                    tee: Tee::Sample,
                    tee_key_fingerprint: fingerprint,
                })
                .unwrap()
                .token
        }
    }

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor::new("default", "key", "1").unwrap()
    }

    #[tokio::test]
    async fn test_authorizes_attested_credential() {
        let f = fixture();
        let (id, token) = f.attested_credential().await;
        let release = f
            .gate(AttestationPolicy::default(), ReleasePolicy::Unlimited)
            .authorize(&token, &descriptor())
            .await
            .unwrap();
        assert_eq!(release.session_id, id);
        assert_eq!(&release.tee_public_key, &tee_keypair().1);
    }

    #[tokio::test]
    async fn test_rejects_garbage_credential() {
        let f = fixture();
        let result = f
            .gate(AttestationPolicy::default(), ReleasePolicy::Unlimited)
            .authorize("garbage", &descriptor())
            .await;
        assert!(matches!(result, Err(KbsError::TokenInvalid(_))));
    }

    #[tokio::test]
    async fn test_rejects_unattested_session() {
        let f = fixture();
        let (id, _) = f.sessions.start_session(Tee::Sample);
        let token = f.credential_for(id, tee_keypair().1.fingerprint());
        let result = f
            .gate(AttestationPolicy::default(), ReleasePolicy::Unlimited)
            .authorize(&token, &descriptor())
            .await;
        assert!(matches!(result, Err(KbsError::NotAttested(_))));
    }

    #[tokio::test]
    async fn test_rejects_unknown_session() {
        let f = fixture();
        let token = f.credential_for(SessionId::new(), tee_keypair().1.fingerprint());
        let result = f
            .gate(AttestationPolicy::default(), ReleasePolicy::Unlimited)
            .authorize(&token, &descriptor())
            .await;
        assert!(matches!(result, Err(KbsError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_fingerprint_mismatch() {
        let f = fixture();
        let (id, _) = f.attested_credential().await;
        let token = f.credential_for(id, other_tee_keypair().1.fingerprint());
        let result = f
            .gate(AttestationPolicy::default(), ReleasePolicy::Unlimited)
            .authorize(&token, &descriptor())
            .await;
        assert!(matches!(result, Err(KbsError::TokenInvalid(_))));
    }

    #[tokio::test]
    async fn test_resource_policy_denies() {
        let f = fixture();
        let (_, token) = f.attested_credential().await;
        let policy = AttestationPolicy {
            platforms: Default::default(),
            resources: vec![ResourcePolicy {
                resource: "default/key/*".to_string(),
                allowed_tees: vec![Tee::Tdx],
                measurements: vec![],
                min_svn: 0,
            }],
        };
        let gate = f.gate(policy, ReleasePolicy::Unlimited);
        assert!(matches!(
            gate.authorize(&token, &descriptor()).await,
            Err(KbsError::PolicyDenied(_))
        ));
        let other = ResourceDescriptor::new("default", "cert", "1").unwrap();
        assert!(gate.authorize(&token, &other).await.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_release_policy_denies() {
        let f = fixture();
        let (id, token) = f.attested_credential().await;
        let gate = f.gate(AttestationPolicy::default(), ReleasePolicy::OncePerResource);
        gate.authorize(&token, &descriptor()).await.unwrap();
        f.sessions
            .record_release(id, &descriptor(), ReleasePolicy::OncePerResource)
            .await
            .unwrap();
        assert!(matches!(
            gate.authorize(&token, &descriptor()).await,
            Err(KbsError::PolicyDenied(_))
        ));
    }
}
