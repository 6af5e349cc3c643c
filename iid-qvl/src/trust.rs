// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::{bail, Context, Result};
use fs_err as fs;
use rsa::{pkcs1::DecodeRsaPublicKey, traits::PublicKeyParts, RsaPublicKey};
use tracing::debug;
use x509_parser::prelude::*;

use crate::OID_RSA_ENCRYPTION;

/// A certificate whose key is trusted to sign identity documents
#[derive(Debug, Clone)]
pub struct TrustedSigner {
    /// Certificate subject, for diagnostics
    pub subject: String,
    /// DER encoded certificate
    pub cert_der: Vec<u8>,
    pub public_key: RsaPublicKey,
}

/// Immutable set of signing certificates.
///
/// Regions and key rotations use different certificates, so the store holds many and a
/// document is accepted if any one of them verifies it.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    signers: Vec<TrustedSigner>,
}

impl TrustStore {
    /// Build a store from one or more concatenated PEM certificates
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let blocks = ::pem::parse_many(pem_str).context("failed to parse PEM")?;
        if blocks.is_empty() {
            bail!("no certificate found in PEM input");
        }
        let signers = blocks
            .into_iter()
            .map(|block| {
                if block.tag() != "CERTIFICATE" {
                    bail!("PEM is not a certificate: {}", block.tag());
                }
                TrustedSigner::from_der(block.into_contents())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { signers })
    }

    /// Load every PEM file and merge their certificates
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut signers = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let pem_str = fs::read_to_string(path)?;
            let store = Self::from_pem(&pem_str)
                .with_context(|| format!("invalid trust store file {}", path.display()))?;
            signers.extend(store.signers);
        }
        debug!("loaded {} trusted signing certificates", signers.len());
        Ok(Self { signers })
    }

    pub fn signers(&self) -> &[TrustedSigner] {
        &self.signers
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }
}

impl TrustedSigner {
    pub fn from_der(cert_der: Vec<u8>) -> Result<Self> {
        let (_, cert) =
            X509Certificate::from_der(&cert_der).context("failed to parse signing certificate")?;
        let spki = cert.public_key();
        let algo: Vec<u64> = spki
            .algorithm
            .algorithm
            .iter()
            .context("invalid public key algorithm OID")?
            .collect();
        if algo != OID_RSA_ENCRYPTION {
            bail!("unsupported public key algorithm: {algo:?}");
        }
        let public_key = RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
            .context("failed to decode RSA public key from certificate")?;
        let subject = cert.subject().to_string();
        debug!(
            "trusted signer {subject} ({} bits)",
            public_key.size() * 8
        );
        Ok(Self {
            subject,
            cert_der,
            public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: &str = include_str!("../tests/fixtures/primary-signer.pem");
    const ROTATED: &str = include_str!("../tests/fixtures/rotated-signer.pem");

    #[test]
    fn test_bundle_parsing() {
        let bundle = format!("{PRIMARY}\n{ROTATED}");
        let store = TrustStore::from_pem(&bundle).expect("Failed to parse bundle");
        assert_eq!(store.len(), 2);
        assert!(store.signers()[0].subject.contains("primary-signer"));
        assert!(store.signers()[1].subject.contains("rotated-signer"));
        assert_eq!(store.signers()[0].public_key.size(), 256);
    }

    #[test]
    fn test_rejects_non_certificate_pem() {
        let key = "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n";
        let err = TrustStore::from_pem(key).unwrap_err();
        assert!(err.to_string().contains("not a certificate"), "{err}");
    }

    #[test]
    fn test_rejects_empty_input() {
        assert!(TrustStore::from_pem("").is_err());
    }

    #[test]
    fn test_load_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pem");
        let b = dir.path().join("b.pem");
        std::fs::write(&a, PRIMARY).unwrap();
        std::fs::write(&b, ROTATED).unwrap();
        let store = TrustStore::load(&[a, b]).unwrap();
        assert_eq!(store.len(), 2);
    }
}
