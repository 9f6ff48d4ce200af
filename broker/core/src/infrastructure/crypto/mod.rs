// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod envelope;

pub use envelope::{open, recipient_key, seal, tee_public_key, EncryptedEnvelope};

#[cfg(test)]
pub(crate) mod test_keys {
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    use super::tee_public_key;
    use crate::domain::tee::{KeyWrapAlgorithm, TeePublicKey};

    // RSA key generation dominates test time; generate each pair once per test binary.
    static TEE: OnceLock<(RsaPrivateKey, TeePublicKey)> = OnceLock::new();
    static OTHER_TEE: OnceLock<(RsaPrivateKey, TeePublicKey)> = OnceLock::new();
    static SIGNING: OnceLock<RsaPrivateKey> = OnceLock::new();

    fn generate() -> (RsaPrivateKey, TeePublicKey) {
        let key = RsaPrivateKey::new(&mut rand_core::OsRng, 2048).unwrap();
        let public = tee_public_key(KeyWrapAlgorithm::RsaOaep256, &key.to_public_key());
        (key, public)
    }

    pub fn tee_keypair() -> &'static (RsaPrivateKey, TeePublicKey) {
        TEE.get_or_init(generate)
    }

    pub fn other_tee_keypair() -> &'static (RsaPrivateKey, TeePublicKey) {
        OTHER_TEE.get_or_init(generate)
    }

    pub fn signing_key() -> &'static RsaPrivateKey {
        SIGNING.get_or_init(|| RsaPrivateKey::new(&mut rand_core::OsRng, 2048).unwrap())
    }
}
