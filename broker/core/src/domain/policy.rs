// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::evidence::Claims;
use super::resource::ResourceDescriptor;
use super::tee::Tee;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Invalid resource pattern: {0}")]
    InvalidPattern(String),
}

/// Accepted claims for one TEE platform, checked when evidence is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformPolicy {
    #[serde(default = "default_true")]
    pub allow: bool,

    /// Accepted launch measurements (hex). Empty accepts any.
    #[serde(default)]
    pub measurements: Vec<String>,

    #[serde(default)]
    pub min_svn: u64,
}

impl Default for PlatformPolicy {
    fn default() -> Self {
        Self {
            allow: true,
            measurements: Vec::new(),
            min_svn: 0,
        }
    }
}

/// Extra conditions for releasing resources matching `resource`.
///
/// `resource` is a `repository/type/tag` pattern where a segment may be `*`
/// (any value) or end in `*` (prefix match).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub resource: String,

    /// Platforms allowed to receive the resource. Empty allows any.
    #[serde(default)]
    pub allowed_tees: Vec<Tee>,

    #[serde(default)]
    pub measurements: Vec<String>,

    #[serde(default)]
    pub min_svn: u64,
}

impl ResourcePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let segments: Vec<&str> = self.resource.split('/').collect();
        if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(PolicyError::InvalidPattern(self.resource.clone()));
        }
        if segments
            .iter()
            .any(|s| s.contains("..") || s.strip_suffix('*').unwrap_or(s).contains('*'))
        {
            return Err(PolicyError::InvalidPattern(self.resource.clone()));
        }
        Ok(())
    }

    pub fn matches(&self, descriptor: &ResourceDescriptor) -> bool {
        let segments: Vec<&str> = self.resource.split('/').collect();
        if segments.len() != 3 {
            return false;
        }
        matches_segment(segments[0], &descriptor.repository)
            && matches_segment(segments[1], &descriptor.resource_type)
            && matches_segment(segments[2], &descriptor.tag)
    }

    fn evaluate(&self, claims: &Claims) -> Result<(), String> {
        if !self.allowed_tees.is_empty() && !self.allowed_tees.contains(&claims.tee) {
            return Err(format!(
                "TEE '{}' not allowed for '{}'",
                claims.tee, self.resource
            ));
        }
        check_measurement(&self.measurements, &claims.measurement)?;
        check_svn(self.min_svn, claims.svn)
    }
}

/// Process-wide attestation policy. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttestationPolicy {
    /// Per-platform predicates. An empty map accepts every hardware platform;
    /// the sample TEE is refused unless it has its own entry.
    #[serde(default)]
    pub platforms: BTreeMap<Tee, PlatformPolicy>,

    /// Resource-scoped predicates. Resources matching no rule are released
    /// to any attested session.
    #[serde(default)]
    pub resources: Vec<ResourcePolicy>,
}

impl AttestationPolicy {
    /// Hardware platforms only; the simulated TEE is refused.
    pub fn hardware_only() -> Self {
        let platforms = [Tee::Snp, Tee::Tdx, Tee::Sgx, Tee::AzSnpVtpm]
            .into_iter()
            .map(|tee| (tee, PlatformPolicy::default()))
            .collect();
        Self {
            platforms,
            resources: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for rule in &self.resources {
            rule.validate()?;
        }
        Ok(())
    }

    /// Check verified claims against the platform section.
    pub fn evaluate_platform(&self, claims: &Claims) -> Result<(), String> {
        let platform = match self.platforms.get(&claims.tee) {
            Some(platform) => platform,
            None if !claims.tee.is_hardware() => {
                return Err(format!(
                    "TEE '{}' requires an explicit policy entry",
                    claims.tee
                ));
            }
            None if self.platforms.is_empty() => return Ok(()),
            None => return Err(format!("TEE '{}' not listed in policy", claims.tee)),
        };
        if !platform.allow {
            return Err(format!("TEE '{}' disabled by policy", claims.tee));
        }
        check_measurement(&platform.measurements, &claims.measurement)?;
        check_svn(platform.min_svn, claims.svn)
    }

    /// Check an attested session's claims against every rule covering `descriptor`.
    pub fn evaluate_resource(
        &self,
        descriptor: &ResourceDescriptor,
        claims: &Claims,
    ) -> Result<(), String> {
        for rule in self.resources.iter().filter(|r| r.matches(descriptor)) {
            rule.evaluate(claims)?;
        }
        Ok(())
    }
}

fn check_measurement(accepted: &[String], measurement: &str) -> Result<(), String> {
    if accepted.is_empty() || accepted.iter().any(|m| m.eq_ignore_ascii_case(measurement)) {
        Ok(())
    } else {
        Err("measurement not in accepted set".to_string())
    }
}

fn check_svn(min_svn: u64, svn: u64) -> Result<(), String> {
    if svn < min_svn {
        Err(format!("SVN {} below minimum {}", svn, min_svn))
    } else {
        Ok(())
    }
}

fn matches_segment(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    false
}

fn default_true() -> bool {
    true
}
