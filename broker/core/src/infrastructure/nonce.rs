// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};

use crate::domain::session::Nonce;

/// Nonce length in bytes (256 bits).
pub const NONCE_LEN: usize = 32;

/// Source of single-use attestation challenges, backed by the OS CSPRNG.
#[derive(Debug, Clone, Copy)]
pub struct NonceGenerator {
    _checked: (),
}

impl NonceGenerator {
    /// Check the OS entropy source once. The broker refuses to start without it.
    pub fn new() -> anyhow::Result<Self> {
        let mut scratch = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut scratch)
            .map_err(|e| anyhow::anyhow!("OS entropy source unavailable: {}", e))?;
        Ok(Self { _checked: () })
    }

    pub fn generate(&self) -> Nonce {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Nonce(STANDARD.encode(bytes))
    }
}
