// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Store
//!
//! Process-wide registry of attestation sessions. Every session sits behind
//! its own `tokio::sync::Mutex` inside a `DashMap`, so operations on one
//! session are serialized while unrelated sessions never contend.
//!
//! Only whole protocol steps are public; callers never hold a session lock.
//!
//! ## Expiry
//!
//! Expiry is lazy: any operation that finds `now >= expires_at` removes the
//! session and reports [`KbsError::SessionNotFound`]. [`SessionStore::spawn_reaper`]
//! additionally sweeps idle sessions so abandoned handshakes do not accumulate.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::error::KbsError;
use crate::domain::evidence::{AttestationEvidence, EvidenceVerifier};
use crate::domain::resource::ResourceDescriptor;
use crate::domain::session::{Nonce, ReleasePolicy, Session, SessionId};
use crate::domain::tee::{Tee, TeePublicKey};
use crate::infrastructure::nonce::NonceGenerator;

type SessionMap = DashMap<SessionId, Arc<Mutex<Session>>>;

pub struct SessionStore {
    sessions: Arc<SessionMap>,
    nonces: NonceGenerator,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(nonces: NonceGenerator, ttl: std::time::Duration) -> anyhow::Result<Self> {
        let ttl = Duration::from_std(ttl)?;
        if ttl <= Duration::zero() {
            anyhow::bail!("session ttl must be positive");
        }
        Ok(Self {
            sessions: Arc::new(DashMap::new()),
            nonces,
            ttl,
        })
    }

    /// Create a session in `Challenged` with a fresh nonce.
    pub fn start_session(&self, tee: Tee) -> (SessionId, Nonce) {
        let nonce = self.nonces.generate();
        let session = Session::new(tee, nonce.clone(), self.ttl);
        let id = session.id;
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        info!(session_id = %id, tee = %tee, "Attestation session started");
        (id, nonce)
    }

    /// Verify evidence for a challenged session and bind `tee_public_key`.
    ///
    /// `evidence` is the raw wire string; it is parsed into the typed variant
    /// for the platform the session announced. The session leaves `Challenged`
    /// before parsing or verification, so this is the only attempt the
    /// session's nonce will ever get: malformed evidence, rejection, timeout,
    /// or cancellation of the returned future all leave the session `Expired`.
    ///
    /// Once the evidence is accepted, `credential` runs with the session lock
    /// still held and the session is only marked `Attested` if it succeeds. A
    /// failing `credential` leaves the session `Expired` like any other failed
    /// attempt, so no session is ever attested without a credential. On
    /// success the session's expiry becomes `valid_until` (the credential's
    /// expiry).
    ///
    /// # Errors
    ///
    /// - [`KbsError::SessionNotFound`]: unknown or past its TTL
    /// - [`KbsError::SessionExpired`]: invalidated by an earlier attempt
    /// - [`KbsError::WrongProtocolState`]: already attested
    /// - [`KbsError::EvidenceVerificationFailed`]: evidence malformed or rejected
    /// - whatever `credential` returns
    pub async fn attempt_attest<T>(
        &self,
        id: SessionId,
        evidence: &str,
        tee_public_key: TeePublicKey,
        verifier: &dyn EvidenceVerifier,
        valid_until: DateTime<Utc>,
        credential: impl FnOnce(Tee) -> Result<T, KbsError>,
    ) -> Result<(Session, T), KbsError> {
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;
        if session.is_expired_at(Utc::now()) {
            drop(session);
            self.sessions.remove(&id);
            return Err(not_found(id));
        }

        let nonce = session.begin_verification()?;
        let verified = match AttestationEvidence::parse(session.tee, evidence) {
            Ok(evidence) => verifier.verify(nonce.as_str(), &tee_public_key, &evidence).await,
            Err(e) => Err(e),
        };
        match verified {
            Ok(claims) => {
                let issued = credential(session.tee).inspect_err(|e| {
                    warn!(session_id = %id, error = %e, "Credential issuance failed; session invalidated");
                })?;
                session.complete_attestation(tee_public_key, claims, valid_until);
                info!(session_id = %id, tee = %session.tee, "Session attested");
                Ok((session.clone(), issued))
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Evidence verification failed; session invalidated");
                Err(KbsError::EvidenceVerificationFailed(e.to_string()))
            }
        }
    }

    /// Snapshot of a live session.
    pub async fn get(&self, id: SessionId) -> Result<Session, KbsError> {
        self.with_live_session(id, |session| Ok(session.clone())).await
    }

    /// Atomically check the release policy and record a release.
    pub async fn record_release(
        &self,
        id: SessionId,
        descriptor: &ResourceDescriptor,
        release_policy: ReleasePolicy,
    ) -> Result<(), KbsError> {
        self.with_live_session(id, |session| session.record_release(descriptor, release_policy))
            .await
    }

    /// Remove every session past its expiry. Sessions currently locked by an
    /// in-flight operation are left for the next sweep.
    pub fn purge_expired(&self) -> usize {
        purge(&self.sessions, Utc::now())
    }

    /// Run [`SessionStore::purge_expired`] every `interval` in the background.
    pub fn spawn_reaper(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = purge(&sessions, Utc::now());
                if removed > 0 {
                    debug!(removed, remaining = sessions.len(), "Reaped expired sessions");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn handle(&self, id: SessionId) -> Result<Arc<Mutex<Session>>, KbsError> {
        // Clone the Arc out so no map guard is held across an await.
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(id))
    }

    async fn with_live_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<R, KbsError>,
    ) -> Result<R, KbsError> {
        let handle = self.handle(id)?;
        let mut session = handle.lock().await;
        if session.is_expired_at(Utc::now()) {
            drop(session);
            self.sessions.remove(&id);
            return Err(not_found(id));
        }
        f(&mut session)
    }
}

fn purge(sessions: &SessionMap, now: DateTime<Utc>) -> usize {
    let before = sessions.len();
    sessions.retain(|_, session| match session.try_lock() {
        Ok(session) => !session.is_expired_at(now),
        Err(_) => true,
    });
    before.saturating_sub(sessions.len())
}

fn not_found(id: SessionId) -> KbsError {
    KbsError::SessionNotFound(format!("no live session {}", id))
}
