// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Remote Attestation Service Adapter
//
// Anti-Corruption Layer for an external attestation service. Hardware quotes
// are opaque to the broker; the service parses and appraises them and answers
// with an allow/deny decision and normalized claims.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::domain::evidence::{AttestationEvidence, Claims, EvidenceVerifier, VerificationError};
use crate::domain::tee::{binding_digest, Tee, TeePublicKey};

pub struct RemoteVerifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    tee: Tee,
    quote: &'a str,
    /// Value the quote must commit to (base64).
    report_data: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    allow: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    claims: Option<RemoteClaims>,
}

#[derive(Deserialize)]
struct RemoteClaims {
    measurement: String,
    svn: u64,
    report_data: String,
    #[serde(default)]
    extra: BTreeMap<String, String>,
}

impl RemoteVerifier {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }

    async fn call(&self, request: &VerifyRequest<'_>) -> Result<VerifyResponse, VerificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| VerificationError::ServiceUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(VerificationError::ServiceUnavailable(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| VerificationError::ServiceUnavailable(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl EvidenceVerifier for RemoteVerifier {
    async fn verify(
        &self,
        nonce: &str,
        tee_public_key: &TeePublicKey,
        evidence: &AttestationEvidence,
    ) -> Result<Claims, VerificationError> {
        let hardware = match evidence {
            AttestationEvidence::Hardware(hardware) => hardware,
            AttestationEvidence::Sample(_) => {
                return Err(VerificationError::UnsupportedTee(Tee::Sample));
            }
        };

        let expected = binding_digest(nonce, tee_public_key);
        let request = VerifyRequest {
            tee: hardware.tee,
            quote: &hardware.quote,
            report_data: STANDARD.encode(expected),
        };

        let response = tokio::time::timeout(self.timeout, self.call(&request))
            .await
            .map_err(|_| VerificationError::Timeout(self.timeout))??;

        if !response.allow {
            return Err(VerificationError::Rejected(
                response.reason.unwrap_or_else(|| "denied".to_string()),
            ));
        }
        let claims = response.claims.ok_or_else(|| {
            VerificationError::Rejected("service allowed evidence without claims".to_string())
        })?;

        // The returned commitment must match the one computed locally.
        let returned = STANDARD
            .decode(&claims.report_data)
            .map_err(|e| VerificationError::MalformedEvidence(format!("report_data: {}", e)))?;
        if !bool::from(returned.as_slice().ct_eq(&expected)) {
            return Err(VerificationError::BindingMismatch);
        }

        Ok(Claims {
            tee: hardware.tee,
            measurement: claims.measurement,
            svn: claims.svn,
            report_data: claims.report_data,
            extra: claims.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evidence::HardwareEvidence;
    use crate::domain::tee::KeyWrapAlgorithm;

    fn key() -> TeePublicKey {
        TeePublicKey::new_rsa(KeyWrapAlgorithm::RsaOaep256, "bW9k".to_string(), "AQAB".to_string())
    }

    fn snp_evidence() -> AttestationEvidence {
        AttestationEvidence::Hardware(HardwareEvidence {
            tee: Tee::Snp,
            quote: "c25wLXF1b3Rl".to_string(),
        })
    }

    fn allow_body(report_data: &str) -> String {
        serde_json::json!({
            "allow": true,
            "claims": {
                "measurement": "feed",
                "svn": 4,
                "report_data": report_data,
                "extra": { "chip_id": "c0ffee" }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_allowed_evidence_yields_claims() {
        let mut server = mockito::Server::new_async().await;
        let report_data = STANDARD.encode(binding_digest("n1", &key()));
        let mock = server
            .mock("POST", "/verify")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "tee": "snp",
                "report_data": report_data,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(allow_body(&report_data))
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url()), Duration::from_secs(5));
        let claims = verifier.verify("n1", &key(), &snp_evidence()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(claims.tee, Tee::Snp);
        assert_eq!(claims.measurement, "feed");
        assert_eq!(claims.svn, 4);
        assert_eq!(claims.extra["chip_id"], "c0ffee");
    }

    #[tokio::test]
    async fn test_denied_evidence() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(200)
            .with_body(r#"{"allow":false,"reason":"debug mode enabled"}"#)
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url()), Duration::from_secs(5));
        let result = verifier.verify("n1", &key(), &snp_evidence()).await;
        assert_eq!(
            result,
            Err(VerificationError::Rejected("debug mode enabled".to_string()))
        );
    }

    #[tokio::test]
    async fn test_service_echoing_wrong_report_data_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let stale = STANDARD.encode(binding_digest("old-nonce", &key()));
        server
            .mock("POST", "/verify")
            .with_status(200)
            .with_body(allow_body(&stale))
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url()), Duration::from_secs(5));
        let result = verifier.verify("n1", &key(), &snp_evidence()).await;
        assert_eq!(result, Err(VerificationError::BindingMismatch));
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(503)
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url()), Duration::from_secs(5));
        let result = verifier.verify("n1", &key(), &snp_evidence()).await;
        assert!(matches!(result, Err(VerificationError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        use std::io::Write;

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                w.write_all(b"{\"allow\":false}")
            })
            .create_async()
            .await;

        let timeout = Duration::from_millis(200);
        let verifier = RemoteVerifier::new(format!("{}/verify", server.url()), timeout);
        let result = verifier.verify("n1", &key(), &snp_evidence()).await;
        assert_eq!(result, Err(VerificationError::Timeout(timeout)));
    }

    #[tokio::test]
    async fn test_sample_evidence_is_not_forwarded() {
        let verifier = RemoteVerifier::new("http://127.0.0.1:1/verify".to_string(), Duration::from_secs(1));
        let evidence = AttestationEvidence::parse(
            Tee::Sample,
            r#"{"svn":1,"measurement":"aa","report_data":"AAAA"}"#,
        )
        .unwrap();
        let result = verifier.verify("n1", &key(), &evidence).await;
        assert_eq!(result, Err(VerificationError::UnsupportedTee(Tee::Sample)));
    }
}
