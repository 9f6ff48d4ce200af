// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod broker_service;
pub mod resource_gate;
pub mod session_store;

pub use broker_service::{
    Attestation, AttestationToken, AuthRequest, Challenge, KeyBrokerService, StartedSession, TokenCertificate,
};
pub use resource_gate::{AuthorizedRelease, ResourceGate};
pub use session_store::SessionStore;
