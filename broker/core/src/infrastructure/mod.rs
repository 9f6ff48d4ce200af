// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod crypto;
pub mod nonce;
pub mod policy_source;
pub mod resource_store;
pub mod token;
pub mod verifier;

pub use nonce::NonceGenerator;
pub use policy_source::{FilePolicySource, PolicySource, StaticPolicySource};
pub use resource_store::{InMemoryResourceStore, LocalFsResourceStore};
pub use token::{CredentialBinding, CredentialClaims, IssuedCredential, TokenIssuer};
pub use verifier::{RemoteVerifier, SampleVerifier, VerifierRegistry};
