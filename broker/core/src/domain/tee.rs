// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # TEE Identity Value Objects
//!
//! [`Tee`] is the platform tag a client announces in its auth request and which
//! selects the evidence schema and verifier. [`TeePublicKey`] is the ephemeral
//! RSA key the workload generates inside the enclave; after a successful
//! attestation every released resource is sealed to it.
//!
//! ## Channel Binding
//!
//! Evidence must commit to a SHA-256 over the nonce and the key's `n` and `e`,
//! each prefixed with its length (see [`binding_digest`]). Without this a man-in-the-middle could attest with
//! its own enclave and then receive resources under a key it controls.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Supported TEE platform tags (wire form is lower case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tee {
    /// Software-simulated TEE. Refused unless the policy lists it.
    Sample,
    Snp,
    Tdx,
    Sgx,
    AzSnpVtpm,
}

impl Tee {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tee::Sample => "sample",
            Tee::Snp => "snp",
            Tee::Tdx => "tdx",
            Tee::Sgx => "sgx",
            Tee::AzSnpVtpm => "azsnpvtpm",
        }
    }

    /// True for platforms whose evidence is rooted in hardware.
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Tee::Sample)
    }
}

impl std::fmt::Display for Tee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tee {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sample" => Ok(Tee::Sample),
            "snp" => Ok(Tee::Snp),
            "tdx" => Ok(Tee::Tdx),
            "sgx" => Ok(Tee::Sgx),
            "azsnpvtpm" => Ok(Tee::AzSnpVtpm),
            other => Err(format!("unsupported TEE type '{}'", other)),
        }
    }
}

/// Key-wrapping algorithm requested by the TEE for its public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyWrapAlgorithm {
    /// RSAES-OAEP with SHA-1 (the algorithm the first KBS clients used).
    #[serde(rename = "RSA-OAEP")]
    RsaOaep,
    /// RSAES-OAEP with SHA-256.
    #[serde(rename = "RSA-OAEP-256")]
    RsaOaep256,
}

impl KeyWrapAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyWrapAlgorithm::RsaOaep => "RSA-OAEP",
            KeyWrapAlgorithm::RsaOaep256 => "RSA-OAEP-256",
        }
    }
}

impl Default for KeyWrapAlgorithm {
    fn default() -> Self {
        KeyWrapAlgorithm::RsaOaep256
    }
}

/// TEE public key in JWK form.
///
/// `n` and `e` are base64url (unpadded) big-endian integers. The older
/// `k_mod`/`k_exp` field names used by some attestation agents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeePublicKey {
    pub kty: String,

    #[serde(default)]
    pub alg: KeyWrapAlgorithm,

    #[serde(alias = "k_mod")]
    pub n: String,

    #[serde(alias = "k_exp")]
    pub e: String,
}

impl TeePublicKey {
    pub fn new_rsa(alg: KeyWrapAlgorithm, n: String, e: String) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg,
            n,
            e,
        }
    }

    /// RFC 7638 JWK thumbprint (SHA-256, base64url).
    ///
    /// Credentials reference the bound key by this value, never by the key
    /// material itself.
    pub fn fingerprint(&self) -> String {
        // Members in lexicographic order, no whitespace.
        let canonical = serde_json::json!({
            "e": self.e,
            "kty": self.kty,
            "n": self.n,
        })
        .to_string();
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Digest a TEE must embed in its evidence to bind the challenge and its key.
///
/// Every field is preceded by its byte length as a big-endian `u64`.
pub fn binding_digest(nonce: &str, key: &TeePublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in [nonce, key.n.as_str(), key.e.as_str()] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().into()
}
