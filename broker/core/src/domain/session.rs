// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Attestation Session Aggregate (BC-KBS)
//!
//! Domain model for one run of the attestation-session protocol, from the
//! client's first `auth` request to resource release.
//!
//! ## Session Lifecycle
//!
//! ```text
//! Session::new(tee, nonce, ttl)                 Started → Challenged
//!   └─ begin_verification()                     Challenged → Expired (nonce spent)
//!         └─ complete_attestation(key, claims)  Expired → Attested
//!   └─ (TTL elapses)                            treated as absent everywhere
//! ```
//!
//! ## Invariants
//!
//! - `tee_public_key` and `claims` are `Some` iff `state == Attested`.
//! - The nonce is handed to a verifier at most once: [`Session::begin_verification`]
//!   leaves `Challenged` before verification runs, so a failed, cancelled, or
//!   concurrent attempt can never present the same nonce again.
//! - `Attested` is only reachable from the in-flight verification started by
//!   `begin_verification`.
//!
//! The aggregate is plain data; atomicity comes from the session store,
//! which only ever mutates a session while holding that session's lock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::error::KbsError;
use super::evidence::Claims;
use super::resource::ResourceDescriptor;
use super::tee::{Tee, TeePublicKey};

/// Opaque identifier for a single attestation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, KbsError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| KbsError::SessionNotFound("malformed session id".to_string()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-use challenge value (base64 of at least 128 random bits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(pub String);

impl Nonce {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, nonce not yet issued. Never observable outside the constructor.
    Started,
    /// Nonce issued, waiting for evidence.
    Challenged,
    /// Evidence verified; the TEE key is bound.
    Attested,
    /// Invalidated. The client must start a new session.
    Expired,
}

/// How often an attested session may receive the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleasePolicy {
    /// Any number of releases until the credential expires.
    #[default]
    Unlimited,
    /// Each resource at most once per session.
    OncePerResource,
    /// One release in total per session.
    OncePerSession,
}

/// Aggregate root for one attestation session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,

    /// Platform announced in the auth request.
    pub tee: Tee,

    pub state: SessionState,

    nonce: Nonce,

    tee_public_key: Option<TeePublicKey>,

    claims: Option<Claims>,

    /// Paths of resources already released (single-use release policies).
    released: BTreeSet<String>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a session and issue its challenge in one step.
    pub fn new(tee: Tee, nonce: Nonce, ttl: Duration) -> Self {
        let now = Utc::now();
        let mut session = Self {
            id: SessionId::new(),
            tee,
            state: SessionState::Started,
            nonce,
            tee_public_key: None,
            claims: None,
            released: BTreeSet::new(),
            created_at: now,
            expires_at: now + ttl,
        };
        session.state = SessionState::Challenged;
        session
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn tee_public_key(&self) -> Option<&TeePublicKey> {
        self.tee_public_key.as_ref()
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Consume the challenge. Must be called under the session's lock, before
    /// the verifier runs.
    ///
    /// # Errors
    ///
    /// - [`KbsError::SessionExpired`]: the session was already invalidated
    /// - [`KbsError::WrongProtocolState`]: not waiting for evidence
    pub fn begin_verification(&mut self) -> Result<Nonce, KbsError> {
        match self.state {
            SessionState::Challenged => {
                self.state = SessionState::Expired;
                Ok(self.nonce.clone())
            }
            SessionState::Expired => Err(KbsError::SessionExpired(format!(
                "session {} was invalidated",
                self.id
            ))),
            other => Err(KbsError::WrongProtocolState(format!(
                "session {} is {:?}, expected Challenged",
                self.id, other
            ))),
        }
    }

    /// Bind the verified TEE key. Only valid right after `begin_verification`.
    pub fn complete_attestation(
        &mut self,
        tee_public_key: TeePublicKey,
        claims: Claims,
        expires_at: DateTime<Utc>,
    ) {
        debug_assert_eq!(self.state, SessionState::Expired);
        self.tee_public_key = Some(tee_public_key);
        self.claims = Some(claims);
        self.state = SessionState::Attested;
        self.expires_at = expires_at;
    }

    /// Bound key and claims of an attested session.
    ///
    /// # Errors
    ///
    /// - [`KbsError::SessionExpired`]: invalidated
    /// - [`KbsError::NotAttested`]: still waiting for evidence
    pub fn attested(&self) -> Result<(&TeePublicKey, &Claims), KbsError> {
        match (self.state, &self.tee_public_key, &self.claims) {
            (SessionState::Attested, Some(key), Some(claims)) => Ok((key, claims)),
            (SessionState::Expired, _, _) => Err(KbsError::SessionExpired(format!(
                "session {} was invalidated",
                self.id
            ))),
            (state, _, _) => Err(KbsError::NotAttested(format!(
                "session {} is {:?}",
                self.id, state
            ))),
        }
    }

    /// Whether `release_policy` still permits releasing `descriptor`.
    pub fn may_release(&self, descriptor: &ResourceDescriptor, release_policy: ReleasePolicy) -> bool {
        match release_policy {
            ReleasePolicy::Unlimited => true,
            ReleasePolicy::OncePerResource => !self.released.contains(&descriptor.path()),
            ReleasePolicy::OncePerSession => self.released.is_empty(),
        }
    }

    /// Record a completed release.
    ///
    /// # Errors
    ///
    /// [`KbsError::PolicyDenied`] if the release policy is already exhausted
    /// (a concurrent fetch got there first).
    pub fn record_release(
        &mut self,
        descriptor: &ResourceDescriptor,
        release_policy: ReleasePolicy,
    ) -> Result<(), KbsError> {
        self.attested()?;
        if !self.may_release(descriptor, release_policy) {
            return Err(KbsError::PolicyDenied(format!(
                "release policy {:?} exhausted for {}",
                release_policy, descriptor
            )));
        }
        self.released.insert(descriptor.path());
        Ok(())
    }

    /// `tee_public_key` set iff `Attested`.
    pub fn key_binding_consistent(&self) -> bool {
        let bound = self.tee_public_key.is_some();
        bound == self.claims.is_some() && bound == (self.state == SessionState::Attested)
    }
}
