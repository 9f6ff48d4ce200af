// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource store backends.
//!
//! - [`InMemoryResourceStore`]: seeded from configuration or at runtime
//! - [`LocalFsResourceStore`]: one file per resource at `root/repository/type/tag`

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::error::KbsError;
use crate::domain::resource::{ResourceDescriptor, ResourceStore};

#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    entries: DashMap<ResourceDescriptor, Vec<u8>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `"repository/type/tag" -> value` entries. Values of the form
    /// `env:VAR_NAME` are read from the environment.
    pub fn from_entries(entries: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let store = Self::new();
        for (path, value) in entries {
            let descriptor: ResourceDescriptor = path
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid resource path '{}': {}", path, e))?;
            let value = match value.strip_prefix("env:") {
                Some(var) => std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("Environment variable '{}' for '{}' is not set", var, path))?,
                None => value.clone(),
            };
            store.insert(descriptor, value.into_bytes());
        }
        Ok(store)
    }

    pub fn insert(&self, descriptor: ResourceDescriptor, value: Vec<u8>) {
        self.entries.insert(descriptor, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn lookup(&self, descriptor: &ResourceDescriptor) -> Result<Vec<u8>, KbsError> {
        self.entries
            .get(descriptor)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KbsError::ResourceNotFound(descriptor.path()))
    }
}

#[derive(Debug, Clone)]
pub struct LocalFsResourceStore {
    root: PathBuf,
}

impl LocalFsResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, descriptor: &ResourceDescriptor) -> PathBuf {
        // Segments were validated as single path components by ResourceDescriptor::new.
        self.root
            .join(&descriptor.repository)
            .join(&descriptor.resource_type)
            .join(&descriptor.tag)
    }
}

#[async_trait]
impl ResourceStore for LocalFsResourceStore {
    async fn lookup(&self, descriptor: &ResourceDescriptor) -> Result<Vec<u8>, KbsError> {
        let path = self.path_for(descriptor);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Resource lookup failed");
                Err(KbsError::ResourceNotFound(descriptor.path()))
            }
        }
    }
}
