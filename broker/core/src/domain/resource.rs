// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Descriptor & Store Contract
//!
//! A resource is addressed by `repository/type/tag`, the three path segments
//! of `GET /kbs/v0/resource/{repository}/{type}/{tag}`. Each segment is
//! validated as a single, non-traversing path component before any backend
//! sees it, so a filesystem-backed store can join them under its root safely.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Identifies resources and defines the lookup collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::KbsError;

const MAX_SEGMENT_LEN: usize = 255;

/// Repository used when a client sends an empty repository segment.
pub const DEFAULT_REPOSITORY: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} exceeds 255 bytes")]
    TooLong { field: &'static str },

    #[error("{field} contains a path separator or traversal sequence: {value}")]
    Traversal { field: &'static str, value: String },
}

/// Identifies a plaintext resource held by the [`ResourceStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub repository: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub tag: String,
}

impl ResourceDescriptor {
    pub fn new(
        repository: impl Into<String>,
        resource_type: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let mut repository = repository.into();
        if repository.is_empty() {
            repository = DEFAULT_REPOSITORY.to_string();
        }
        let descriptor = Self {
            repository,
            resource_type: resource_type.into(),
            tag: tag.into(),
        };
        validate_segment("repository", &descriptor.repository)?;
        validate_segment("type", &descriptor.resource_type)?;
        validate_segment("tag", &descriptor.tag)?;
        Ok(descriptor)
    }

    /// `repository/type/tag`
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.repository, self.resource_type, self.tag)
    }
}

impl std::fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

impl std::str::FromStr for ResourceDescriptor {
    type Err = DescriptorError;

    /// Parse `repository/type/tag`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let repository = parts.next().unwrap_or_default();
        let resource_type = parts.next().unwrap_or_default();
        let tag = parts.next().unwrap_or_default();
        Self::new(repository, resource_type, tag)
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), DescriptorError> {
    if value.is_empty() {
        return Err(DescriptorError::Empty { field });
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(DescriptorError::TooLong { field });
    }
    if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        tracing::warn!(field = field, value = %value, "Rejected resource descriptor segment");
        return Err(DescriptorError::Traversal {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Long-term resource store. Lookups return plaintext; only the broker
/// service calls this, and only after the authorization gate has passed.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fails with [`KbsError::ResourceNotFound`] when nothing is stored under
    /// `descriptor`.
    async fn lookup(&self, descriptor: &ResourceDescriptor) -> Result<Vec<u8>, KbsError>;
}
