// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model of the key broker: sessions, evidence, policy, resources and
//! the closed error taxonomy.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and invariants; no I/O beyond configuration loading

pub mod broker_config;
pub mod error;
pub mod evidence;
pub mod policy;
pub mod resource;
pub mod session;
pub mod tee;
