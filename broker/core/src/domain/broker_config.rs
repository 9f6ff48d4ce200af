// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Broker Configuration Types
//
// Defines the configuration schema for a KBS node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - HTTP listener settings
// - Session and credential lifetimes
// - Attestation (verifier timeout, remote attestation service, policy)
// - Resource backend and release policy
// - Observability settings

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::policy::AttestationPolicy;
use super::session::ReleasePolicy;

pub const API_VERSION: &str = "kbs.confidentialcontainers.org/v1";
pub const KIND: &str = "BrokerConfig";

/// Top-level Kubernetes-style broker configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfigManifest {
    /// API version (must be "kbs.confidentialcontainers.org/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "BrokerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: BrokerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable broker name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Broker configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfigSpec {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub attestation: AttestationConfig,

    /// Inline attestation policy, used when `attestation.policy_path` is unset
    #[serde(default)]
    pub policy: AttestationPolicy,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub release_policy: ReleasePolicy,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Request body cap in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of an unattested session
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Interval of the background sweep of expired sessions
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            reaper_interval: default_reaper_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// `iss` claim of issued credentials
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Credential lifetime
    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            ttl: default_token_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Upper bound for a single evidence verification
    #[serde(default = "default_verifier_timeout", with = "humantime_serde")]
    pub verifier_timeout: Duration,

    /// External attestation service for hardware evidence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteVerifierConfig>,

    /// YAML attestation policy file; overrides `spec.policy`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<PathBuf>,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            verifier_timeout: default_verifier_timeout(),
            remote: None,
            policy_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteVerifierConfig {
    /// Verification endpoint, e.g. "http://attestation-service:8080/verify"
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceBackend {
    #[default]
    InMemory,
    LocalFs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub backend: ResourceBackend,

    /// Root directory of the local-fs backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Seed entries for the in-memory backend, keyed by "repository/type/tag".
    /// Values of the form "env:VAR_NAME" are read from the environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus exposition
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_issuer() -> String {
    "coco-kbs".to_string()
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(72 * 60 * 60)
}

fn default_verifier_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for BrokerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "kbs".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: BrokerConfigSpec::default(),
        }
    }
}

impl BrokerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_yaml_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. KBS_CONFIG_PATH environment variable
    /// 2. ./kbs-config.yaml (working directory)
    /// 3. ~/.kbs/config.yaml (user home)
    /// 4. /etc/kbs/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("KBS_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./kbs-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".kbs").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/kbs/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(val) = lookup("KBS_PORT") {
            self.spec.server.port = val
                .parse()
                .with_context(|| format!("Invalid value for KBS_PORT: '{}'", val))?;
            tracing::info!("Environment override: KBS_PORT={}", val);
        }
        if let Some(val) = lookup("KBS_BIND_ADDRESS") {
            tracing::info!("Environment override: KBS_BIND_ADDRESS={}", val);
            self.spec.server.bind_address = val;
        }
        if let Some(val) = lookup("KBS_TOKEN_TTL") {
            self.spec.token.ttl = parse_duration("KBS_TOKEN_TTL", &val)?;
            tracing::info!("Environment override: KBS_TOKEN_TTL={}", val);
        }
        if let Some(val) = lookup("KBS_SESSION_TTL") {
            self.spec.session.ttl = parse_duration("KBS_SESSION_TTL", &val)?;
            tracing::info!("Environment override: KBS_SESSION_TTL={}", val);
        }
        if let Some(val) = lookup("KBS_RESOURCE_ROOT") {
            tracing::info!("Environment override: KBS_RESOURCE_ROOT={}", val);
            self.spec.resources.backend = ResourceBackend::LocalFs;
            self.spec.resources.root = Some(PathBuf::from(val));
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.session.ttl.is_zero() {
            anyhow::bail!("spec.session.ttl must be greater than zero");
        }
        if spec.token.ttl.is_zero() {
            anyhow::bail!("spec.token.ttl must be greater than zero");
        }
        if spec.attestation.verifier_timeout.is_zero() {
            anyhow::bail!("spec.attestation.verifier_timeout must be greater than zero");
        }
        if spec.token.issuer.is_empty() {
            anyhow::bail!("spec.token.issuer cannot be empty");
        }
        if spec.server.max_body_bytes == 0 {
            anyhow::bail!("spec.server.max_body_bytes must be greater than zero");
        }

        if let Some(remote) = &spec.attestation.remote {
            let url = url::Url::parse(&remote.url)
                .with_context(|| format!("Invalid attestation service URL '{}'", remote.url))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("Attestation service URL must be http(s): '{}'", remote.url);
            }
        }

        match spec.resources.backend {
            ResourceBackend::LocalFs if spec.resources.root.is_none() => {
                anyhow::bail!("spec.resources.root is required for the local-fs backend");
            }
            ResourceBackend::LocalFs if !spec.resources.entries.is_empty() => {
                anyhow::bail!("spec.resources.entries is only supported by the in-memory backend");
            }
            _ => {}
        }
        for path in spec.resources.entries.keys() {
            path.parse::<super::resource::ResourceDescriptor>()
                .with_context(|| format!("Invalid resource entry '{}'", path))?;
        }

        spec.policy.validate().context("Invalid spec.policy")?;

        Ok(())
    }
}

fn parse_duration(name: &str, value: &str) -> anyhow::Result<Duration> {
    humantime_serde::re::humantime::parse_duration(value)
        .with_context(|| format!("Invalid value for {}: '{}'", name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tee::Tee;

    #[test]
    fn test_default_manifest() {
        let manifest = BrokerConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.session.ttl, Duration::from_secs(300));
        assert_eq!(manifest.spec.token.ttl, Duration::from_secs(72 * 3600));
        assert_eq!(manifest.spec.token.issuer, "coco-kbs");
        assert_eq!(manifest.spec.server.max_body_bytes, 1024 * 1024);
        assert_eq!(manifest.spec.release_policy, ReleasePolicy::Unlimited);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
apiVersion: kbs.confidentialcontainers.org/v1
kind: BrokerConfig
metadata:
  name: test-kbs
spec:
  server:
    port: 9000
  session:
    ttl: 2m
  token:
    issuer: test-issuer
    ttl: 1h
  attestation:
    verifier_timeout: 3s
    remote:
      url: http://as.local:8080/verify
  policy:
    platforms:
      snp:
        min_svn: 2
  resources:
    backend: in-memory
    entries:
      default/key/1: secret
  release_policy: once-per-resource
"#;
        let manifest = BrokerConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "test-kbs");
        assert_eq!(manifest.spec.server.port, 9000);
        assert_eq!(manifest.spec.server.bind_address, "0.0.0.0");
        assert_eq!(manifest.spec.session.ttl, Duration::from_secs(120));
        assert_eq!(manifest.spec.session.reaper_interval, Duration::from_secs(60));
        assert_eq!(manifest.spec.token.ttl, Duration::from_secs(3600));
        assert_eq!(manifest.spec.attestation.verifier_timeout, Duration::from_secs(3));
        assert_eq!(manifest.spec.policy.platforms[&Tee::Snp].min_svn, 2);
        assert_eq!(manifest.spec.resources.entries["default/key/1"], "secret");
        assert_eq!(manifest.spec.release_policy, ReleasePolicy::OncePerResource);
        assert!(manifest.validate().is_ok());

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let reparsed = BrokerConfigManifest::from_yaml_str(&yaml).unwrap();
        assert_eq!(reparsed.spec.token.ttl, manifest.spec.token.ttl);
    }

    #[test]
    fn test_validation() {
        let mut manifest = BrokerConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.token.ttl = Duration::ZERO;
        assert!(manifest.validate().is_err());
        manifest.spec.token.ttl = Duration::from_secs(60);

        manifest.spec.attestation.remote = Some(RemoteVerifierConfig {
            url: "not a url".to_string(),
        });
        assert!(manifest.validate().is_err());
        manifest.spec.attestation.remote = None;

        manifest.spec.resources.backend = ResourceBackend::LocalFs;
        assert!(manifest.validate().is_err());
        manifest.spec.resources.root = Some(PathBuf::from("/var/lib/kbs"));
        assert!(manifest.validate().is_ok());

        manifest.spec.resources.backend = ResourceBackend::InMemory;
        manifest
            .spec
            .resources
            .entries
            .insert("../key/1".to_string(), "x".to_string());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut manifest = BrokerConfigManifest::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("KBS_PORT", "9443"),
            ("KBS_TOKEN_TTL", "30m"),
            ("KBS_RESOURCE_ROOT", "/srv/kbs"),
        ]);
        manifest
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(manifest.spec.server.port, 9443);
        assert_eq!(manifest.spec.token.ttl, Duration::from_secs(1800));
        assert_eq!(manifest.spec.resources.backend, ResourceBackend::LocalFs);
        assert_eq!(manifest.spec.resources.root, Some(PathBuf::from("/srv/kbs")));

        let bad = manifest.apply_overrides(|k| (k == "KBS_SESSION_TTL").then(|| "soon".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbs-config.yaml");
        BrokerConfigManifest::default().to_yaml_file(&path).unwrap();
        let loaded = BrokerConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.kind, KIND);
        assert!(BrokerConfigManifest::load_or_default(Some(dir.path().join("missing.yaml"))).is_err());
    }
}
