// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`aegis-kbs-core`)
//!
//! HTTP surface that translates `/kbs/v0` requests into calls on
//! [`KeyBrokerService`](crate::application::broker_service::KeyBrokerService).
//! No protocol decisions are made here.

pub mod api;
