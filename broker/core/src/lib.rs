// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Attestation-gated key broker.
//!
//! # Architecture
//!
//! - **domain:** sessions, evidence, policy, resources, errors, configuration
//! - **application:** session store, resource gate, broker service
//! - **infrastructure:** nonces, verifiers, credentials, envelopes, stores
//! - **presentation:** `/kbs/v0` HTTP API

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
