// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use join_auth::VerifierConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Addresses new nodes use to reach the auth service
    pub auth_servers: Vec<String>,
    /// PEM file with the cluster CA certificates
    pub ca_cert: PathBuf,
    /// JSON file holding provisioning tokens
    pub token_file: PathBuf,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodectl.toml");
        std::fs::write(
            &path,
            r#"
            [cluster]
            auth_servers = ["auth.example.com:3025"]
            ca_cert = "/var/lib/nodejoin/ca.pem"
            token_file = "/var/lib/nodejoin/tokens.json"

            [verifier]
            trust_store = ["/etc/nodejoin/aws.pem"]
            default_iid_ttl = "5m"
            "#,
        )
        .unwrap();
        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.cluster.auth_servers, vec!["auth.example.com:3025"]);
        assert_eq!(config.verifier.trust_store.len(), 1);
        assert_eq!(config.verifier.call_timeout, join_auth::DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from_file("/nonexistent/nodectl.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nodectl.toml"), "{err}");
    }

    #[test]
    fn test_cluster_section_required() {
        assert!(Config::from_toml_str("[verifier]\n").is_err());
    }
}
