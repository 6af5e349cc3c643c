// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use iid_qvl::TrustStore;
use serde::{Deserialize, Serialize};

use crate::serde_time;

/// Default maximum age of an identity document
pub const DEFAULT_IID_TTL: Duration = Duration::from_secs(5 * 60);
/// Default bound on each external call made while checking a join
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// `[verifier]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifierConfig {
    /// PEM files with the vendor signing certificates
    #[serde(default)]
    pub trust_store: Vec<PathBuf>,
    #[serde(default = "default_iid_ttl", with = "serde_time::duration")]
    pub default_iid_ttl: Duration,
    #[serde(default = "default_call_timeout", with = "serde_time::duration")]
    pub call_timeout: Duration,
}

fn default_iid_ttl() -> Duration {
    DEFAULT_IID_TTL
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            trust_store: vec![],
            default_iid_ttl: DEFAULT_IID_TTL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl VerifierConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid verifier config")
    }

    pub fn load_trust_store(&self) -> Result<TrustStore> {
        let store = TrustStore::load(&self.trust_store)?;
        if store.is_empty() {
            anyhow::bail!("verifier.trust_store lists no certificates");
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VerifierConfig::from_toml_str("").unwrap();
        assert_eq!(config, VerifierConfig::default());
        assert!(config.load_trust_store().is_err());
    }

    #[test]
    fn test_parse() {
        let config = VerifierConfig::from_toml_str(
            r#"
            trust_store = ["/etc/nodejoin/us-west-2.pem", "/etc/nodejoin/legacy.pem"]
            default_iid_ttl = "10m"
            call_timeout = "3s"
            "#,
        )
        .unwrap();
        assert_eq!(config.trust_store.len(), 2);
        assert_eq!(config.default_iid_ttl, Duration::from_secs(600));
        assert_eq!(config.call_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(VerifierConfig::from_toml_str("iid_ttl = \"5m\"").is_err());
    }

    #[test]
    fn test_load_trust_store_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signer.pem");
        std::fs::write(
            &path,
            include_str!("../../iid-qvl/tests/fixtures/primary-signer.pem"),
        )
        .unwrap();
        let config = VerifierConfig {
            trust_store: vec![path],
            ..Default::default()
        };
        assert_eq!(config.load_trust_store().unwrap().len(), 1);
    }
}
