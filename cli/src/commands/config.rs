// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use kbs_core::domain::broker_config::{BrokerConfigManifest, ResourceBackend};

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./kbs-config.yaml)
        #[arg(short, long, default_value = "./kbs-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = BrokerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. KBS_CONFIG_PATH: {}",
            std::env::var("KBS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./kbs-config.yaml");
        println!("  4. ~/.kbs/config.yaml");
        println!("  5. /etc/kbs/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Server:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Listen: {}:{}", spec.server.bind_address, spec.server.port);
    println!("  Max body: {} bytes", spec.server.max_body_bytes);
    println!();

    println!("{}", "Sessions & Credentials:".bold());
    println!("  Session TTL: {:?}", spec.session.ttl);
    println!("  Credential issuer: {}", spec.token.issuer);
    println!("  Credential TTL: {:?}", spec.token.ttl);
    println!("  Release policy: {:?}", spec.release_policy);
    println!();

    println!("{}", "Attestation:".bold());
    println!("  Verifier timeout: {:?}", spec.attestation.verifier_timeout);
    match &spec.attestation.remote {
        Some(remote) => println!("  Remote verifier: {}", remote.url),
        None => println!("  Remote verifier: {}", "(none, sample evidence only)".dimmed()),
    }
    match &spec.attestation.policy_path {
        Some(path) => println!("  Policy file: {}", path.display()),
        None => println!(
            "  Inline policy: {} platform rule(s), {} resource rule(s)",
            spec.policy.platforms.len(),
            spec.policy.resources.len()
        ),
    }
    println!();

    println!("{}", "Resources:".bold());
    match spec.resources.backend {
        ResourceBackend::InMemory => {
            println!("  Backend: in-memory ({} entries)", spec.resources.entries.len());
            for path in spec.resources.entries.keys() {
                println!("    - {}", path);
            }
        }
        ResourceBackend::LocalFs => println!(
            "  Backend: local-fs ({})",
            spec.resources
                .root
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "root not set".to_string())
        ),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BrokerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_valid() {
        for template in [MINIMAL_TEMPLATE, EXAMPLES_TEMPLATE] {
            let config = BrokerConfigManifest::from_yaml_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbs-config.yaml");
        generate(&path, true).await.unwrap();
        validate(Some(path.clone())).await.unwrap();

        let config = BrokerConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(config.spec.resources.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(
            &path,
            "apiVersion: kbs.confidentialcontainers.org/v1\nkind: NodeConfig\nmetadata:\n  name: x\n",
        )
        .unwrap();
        assert!(validate(Some(path)).await.is_err());
    }
}
