// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! RS256 bearer credentials bound to an attested session.
//!
//! A credential names the session (`sid`) and the fingerprint of the TEE key
//! bound at attestation (`tee-pubkey`). It is not stored server-side: the
//! resource gate re-checks both claims against the live session.

use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::error::KbsError;
use crate::domain::session::SessionId;
use crate::domain::tee::Tee;

const SIGNING_KEY_BITS: usize = 2048;

/// Claims carried by a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Session the credential was issued for.
    pub sid: SessionId,
    /// RFC 7638 thumbprint of the bound TEE key.
    #[serde(rename = "tee-pubkey")]
    pub tee_pubkey: String,
    pub tee: Tee,
}

impl CredentialClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

/// What a credential is bound to.
#[derive(Debug, Clone)]
pub struct CredentialBinding {
    pub session_id: SessionId,
    pub tee: Tee,
    pub tee_key_fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    pub claims: CredentialClaims,
}

pub struct TokenIssuer {
    issuer: String,
    ttl: Duration,
    key_id: String,
    public_key: RsaPublicKey,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenIssuer {
    /// Generate a fresh signing key. Called once at broker start.
    pub fn generate(issuer: &str, ttl: std::time::Duration) -> anyhow::Result<Self> {
        let private_key = RsaPrivateKey::new(&mut rand_core::OsRng, SIGNING_KEY_BITS)
            .context("Failed to generate credential signing key")?;
        Self::from_private_key(issuer, ttl, &private_key)
    }

    pub fn from_private_key(
        issuer: &str,
        ttl: std::time::Duration,
        private_key: &RsaPrivateKey,
    ) -> anyhow::Result<Self> {
        if issuer.is_empty() {
            anyhow::bail!("credential issuer must not be empty");
        }
        let ttl = Duration::from_std(ttl).context("credential ttl out of range")?;
        if ttl <= Duration::zero() {
            anyhow::bail!("credential ttl must be positive");
        }

        let private_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .context("Failed to encode signing key")?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .context("Failed to load signing key")?;

        let public_key = private_key.to_public_key();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .context("Failed to encode verifying key")?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .context("Failed to load verifying key")?;

        let (n, e) = jwk_components(&public_key);
        let canonical = format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n);
        let key_id = URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()));

        Ok(Self {
            issuer: issuer.to_string(),
            ttl,
            key_id,
            public_key,
            encoding_key,
            decoding_key,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, binding: &CredentialBinding) -> Result<IssuedCredential, KbsError> {
        self.issue_at(binding, Utc::now())
    }

    /// Issue with an explicit issue time.
    pub fn issue_at(
        &self,
        binding: &CredentialBinding,
        issued_at: DateTime<Utc>,
    ) -> Result<IssuedCredential, KbsError> {
        let claims = CredentialClaims {
            iss: self.issuer.clone(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
            sid: binding.session_id,
            tee_pubkey: binding.tee_key_fingerprint.clone(),
            tee: binding.tee,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| KbsError::EncryptionFailure(format!("credential signing failed: {}", e)))?;
        Ok(IssuedCredential { token, claims })
    }

    /// Check signature, issuer and expiry. No leeway: a credential is rejected
    /// as soon as `now > exp`.
    pub fn verify(&self, token: &str) -> Result<CredentialClaims, KbsError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;
        validation.leeway = 0;

        decode::<CredentialClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| KbsError::TokenInvalid(format!("credential rejected: {}", e)))
    }

    /// Verifying key as a JWK.
    pub fn public_jwk(&self) -> serde_json::Value {
        let (n, e) = jwk_components(&self.public_key);
        serde_json::json!({
            "kty": "RSA",
            "alg": "RS256",
            "use": "sig",
            "kid": self.key_id,
            "n": n,
            "e": e,
        })
    }

    /// Verifying key as SPKI PEM.
    pub fn public_key_pem(&self) -> anyhow::Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .context("Failed to encode verifying key")
    }
}

fn jwk_components(key: &RsaPublicKey) -> (String, String) {
    (
        URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
    )
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}
