// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use anyhow::Context;
use std::path::PathBuf;

use crate::domain::policy::AttestationPolicy;

/// Loads the process-wide attestation policy at startup.
pub trait PolicySource: Send + Sync {
    fn load(&self) -> anyhow::Result<AttestationPolicy>;
}

/// Policy given inline (configuration or tests).
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    policy: AttestationPolicy,
}

impl StaticPolicySource {
    pub fn new(policy: AttestationPolicy) -> Self {
        Self { policy }
    }
}

impl PolicySource for StaticPolicySource {
    fn load(&self) -> anyhow::Result<AttestationPolicy> {
        self.policy.validate().context("Invalid attestation policy")?;
        Ok(self.policy.clone())
    }
}

/// Policy read from a YAML file.
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicySource for FilePolicySource {
    fn load(&self) -> anyhow::Result<AttestationPolicy> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read attestation policy {:?}", self.path))?;
        let policy: AttestationPolicy = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse attestation policy {:?}", self.path))?;
        policy
            .validate()
            .with_context(|| format!("Invalid attestation policy {:?}", self.path))?;
        tracing::info!(
            path = ?self.path,
            platforms = policy.platforms.len(),
            resource_rules = policy.resources.len(),
            "Loaded attestation policy"
        );
        Ok(policy)
    }
}
