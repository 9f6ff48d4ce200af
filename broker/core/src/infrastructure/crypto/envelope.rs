// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-recipient resource sealing.
//!
//! Output is a JWE in flattened JSON form: a fresh AES-256-GCM content key
//! encrypts the resource, and the content key is wrapped with RSA-OAEP for the
//! session's TEE key. Only the holder of the TEE private key can open it.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand_core::{OsRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::domain::error::KbsError;
use crate::domain::tee::{KeyWrapAlgorithm, TeePublicKey};

pub const MIN_RSA_BITS: usize = 2048;
pub const CONTENT_ENCRYPTION: &str = "A256GCM";

const CEK_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// base64url of the JWE protected header; also the GCM AAD.
    pub protected: String,
    pub encrypted_key: String,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProtectedHeader {
    alg: KeyWrapAlgorithm,
    enc: String,
}

/// Decode a JWK-form TEE key into an RSA public key usable for key wrapping.
pub fn recipient_key(tee_public_key: &TeePublicKey) -> Result<RsaPublicKey, KbsError> {
    if tee_public_key.kty != "RSA" {
        return Err(KbsError::EncryptionFailure(format!(
            "unsupported key type '{}'",
            tee_public_key.kty
        )));
    }
    let n = decode_b64url("n", &tee_public_key.n)?;
    let e = decode_b64url("e", &tee_public_key.e)?;
    let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| KbsError::EncryptionFailure(format!("invalid RSA public key: {}", e)))?;
    if key.n().bits() < MIN_RSA_BITS {
        return Err(KbsError::EncryptionFailure(format!(
            "RSA modulus of {} bits is below the {}-bit minimum",
            key.n().bits(),
            MIN_RSA_BITS
        )));
    }
    Ok(key)
}

/// JWK form of an RSA public key, as a TEE would submit it.
pub fn tee_public_key(alg: KeyWrapAlgorithm, key: &RsaPublicKey) -> TeePublicKey {
    TeePublicKey::new_rsa(
        alg,
        URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
    )
}

/// Seal `plaintext` for `recipient`. A fresh content key and IV are drawn for
/// every call.
pub fn seal(plaintext: &[u8], recipient: &TeePublicKey) -> Result<EncryptedEnvelope, KbsError> {
    let public_key = recipient_key(recipient)?;

    let header = serde_json::to_vec(&ProtectedHeader {
        alg: recipient.alg,
        enc: CONTENT_ENCRYPTION.to_string(),
    })
    .map_err(|e| KbsError::EncryptionFailure(format!("header encoding failed: {}", e)))?;
    let protected = URL_SAFE_NO_PAD.encode(header);

    let mut cek = [0u8; CEK_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut cek);
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|e| KbsError::EncryptionFailure(format!("content key rejected: {}", e)))?;
    let mut sealed = cipher
        .encrypt(
            GcmNonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: protected.as_bytes(),
            },
        )
        .map_err(|_| KbsError::EncryptionFailure("content encryption failed".to_string()))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    let encrypted_key = match recipient.alg {
        KeyWrapAlgorithm::RsaOaep => public_key.encrypt(&mut OsRng, Oaep::new::<sha1::Sha1>(), &cek),
        KeyWrapAlgorithm::RsaOaep256 => {
            public_key.encrypt(&mut OsRng, Oaep::new::<sha2::Sha256>(), &cek)
        }
    }
    .map_err(|e| KbsError::EncryptionFailure(format!("key wrap failed: {}", e)))?;

    Ok(EncryptedEnvelope {
        protected,
        encrypted_key: URL_SAFE_NO_PAD.encode(encrypted_key),
        iv: URL_SAFE_NO_PAD.encode(iv),
        ciphertext: URL_SAFE_NO_PAD.encode(sealed),
        tag: URL_SAFE_NO_PAD.encode(tag),
    })
}

/// Inverse of [`seal`]. Fails for any private key other than the recipient's.
pub fn open(envelope: &EncryptedEnvelope, private_key: &RsaPrivateKey) -> Result<Vec<u8>, KbsError> {
    let header: ProtectedHeader = serde_json::from_slice(&decode_b64url("protected", &envelope.protected)?)
        .map_err(|e| KbsError::EncryptionFailure(format!("invalid protected header: {}", e)))?;
    if header.enc != CONTENT_ENCRYPTION {
        return Err(KbsError::EncryptionFailure(format!(
            "unsupported content encryption '{}'",
            header.enc
        )));
    }

    let wrapped = decode_b64url("encrypted_key", &envelope.encrypted_key)?;
    let cek = match header.alg {
        KeyWrapAlgorithm::RsaOaep => private_key.decrypt(Oaep::new::<sha1::Sha1>(), &wrapped),
        KeyWrapAlgorithm::RsaOaep256 => private_key.decrypt(Oaep::new::<sha2::Sha256>(), &wrapped),
    }
    .map_err(|_| KbsError::EncryptionFailure("key unwrap failed".to_string()))?;

    let iv = decode_b64url("iv", &envelope.iv)?;
    if iv.len() != IV_LEN {
        return Err(KbsError::EncryptionFailure("invalid IV length".to_string()));
    }
    let mut sealed = decode_b64url("ciphertext", &envelope.ciphertext)?;
    sealed.extend_from_slice(&decode_b64url("tag", &envelope.tag)?);

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|_| KbsError::EncryptionFailure("invalid content key length".to_string()))?;
    cipher
        .decrypt(
            GcmNonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: envelope.protected.as_bytes(),
            },
        )
        .map_err(|_| KbsError::EncryptionFailure("content authentication failed".to_string()))
}

fn decode_b64url(field: &str, value: &str) -> Result<Vec<u8>, KbsError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| KbsError::EncryptionFailure(format!("{} is not base64url: {}", field, e)))
}
