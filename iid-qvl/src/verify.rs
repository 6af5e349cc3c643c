// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Identity Document Verification Module

use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    SignedData, SignerInfo, TrustStore, OID_DATA, OID_RSA_ENCRYPTION, OID_SHA256,
    OID_SHA256_WITH_RSA,
};

/// Why a document was rejected.
///
/// The variants only exist for diagnostics. Callers making an authorization decision
/// must treat them all the same.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed identity document: {0:#}")]
    Decode(anyhow::Error),
    #[error("identity document signature rejected: {0:#}")]
    Signature(anyhow::Error),
    #[error("invalid identity document claims: {0:#}")]
    Claims(anyhow::Error),
}

/// Claims of a verified instance identity document.
///
/// Only produced by [`verify_identity_document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaims {
    account_id: String,
    region: String,
    instance_id: String,
    #[serde(with = "rfc3339")]
    issued_at: SystemTime,
}

impl IdentityClaims {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Instance pending time, signed by the vendor
    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    /// Host identifier the instance registers under
    pub fn host_id(&self) -> String {
        format!("{}-{}", self.account_id, self.instance_id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    #[serde(default)]
    account_id: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    pending_time: String,
}

/// Verify a base64 encoded PKCS#7 identity document against the trust store
pub fn verify_identity_document(
    document: &[u8],
    trust_store: &TrustStore,
) -> Result<IdentityClaims, ParseError> {
    let signed = SignedData::from_base64(document).map_err(ParseError::Decode)?;
    if signed.content_type.components().as_slice() != OID_DATA {
        return Err(ParseError::Decode(anyhow::anyhow!(
            "unexpected encapsulated content type: {}",
            signed.content_type
        )));
    }
    if signed.content.is_empty() {
        return Err(ParseError::Decode(anyhow::anyhow!(
            "identity document content is missing"
        )));
    }
    verify_signature(&signed, trust_store).map_err(ParseError::Signature)?;
    debug!("✓ identity document signature verified");
    let claims = decode_claims(&signed.content).map_err(ParseError::Claims)?;
    debug!(
        "✓ identity document claims decoded for {}",
        claims.host_id()
    );
    Ok(claims)
}

fn verify_signature(signed: &SignedData, trust_store: &TrustStore) -> Result<()> {
    if trust_store.is_empty() {
        bail!("trust store is empty");
    }
    let mut last_err = None;
    for signer_info in &signed.signer_infos {
        let signed_bytes = match signed_bytes(signer_info, &signed.content) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("skipping signer info: {err:#}");
                last_err = Some(err);
                continue;
            }
        };
        let hash = Sha256::digest(&signed_bytes);
        for signer in trust_store.signers() {
            let padding = rsa::Pkcs1v15Sign::new::<Sha256>();
            if signer
                .public_key
                .verify(padding, &hash, &signer_info.signature)
                .is_ok()
            {
                debug!("✓ RSA signature verified by {}", signer.subject);
                return Ok(());
            }
        }
    }
    if let Some(err) = last_err {
        return Err(err.context(format!(
            "signature does not verify against any of {} trusted certificates",
            trust_store.len()
        )));
    }
    bail!(
        "signature does not verify against any of {} trusted certificates",
        trust_store.len()
    );
}

/// Bytes covered by the signer's signature after checking its algorithms and digest
fn signed_bytes(signer_info: &SignerInfo, content: &[u8]) -> Result<Vec<u8>> {
    let digest_alg = signer_info.digest_algorithm.components();
    if digest_alg.as_slice() != OID_SHA256 {
        bail!("unsupported digest algorithm: {}", signer_info.digest_algorithm);
    }
    let sig_alg = signer_info.signature_algorithm.components();
    if sig_alg.as_slice() != OID_RSA_ENCRYPTION && sig_alg.as_slice() != OID_SHA256_WITH_RSA {
        bail!(
            "unsupported signature algorithm: {}",
            signer_info.signature_algorithm
        );
    }
    let Some(attrs) = signer_info.signed_attrs_for_signature() else {
        return Ok(content.to_vec());
    };
    if let Some(content_type) = signer_info.content_type()? {
        if content_type.components().as_slice() != OID_DATA {
            bail!("signed contentType attribute mismatch: {content_type}");
        }
    }
    let digest = signer_info
        .message_digest()?
        .context("signed attributes lack a messageDigest")?;
    if digest.as_slice() != Sha256::digest(content).as_slice() {
        bail!("messageDigest does not match the document content");
    }
    Ok(attrs)
}

fn decode_claims(content: &[u8]) -> Result<IdentityClaims> {
    let doc: IdentityDocument =
        serde_json::from_slice(content).context("identity document is not valid JSON")?;
    if doc.account_id.is_empty() {
        bail!("accountId is missing");
    }
    if doc.region.is_empty() {
        bail!("region is missing");
    }
    if doc.instance_id.is_empty() {
        bail!("instanceId is missing");
    }
    let issued_at = humantime::parse_rfc3339(&doc.pending_time)
        .with_context(|| format!("invalid pendingTime: {:?}", doc.pending_time))?;
    Ok(IdentityClaims {
        account_id: doc.account_id,
        region: doc.region,
        instance_id: doc.instance_id,
        issued_at,
    })
}

mod rfc3339 {
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_rfc3339(*time))
    }
}

#[cfg(test)]
mod tests {
    use yasna::models::ObjectIdentifier;

    use super::*;

    const INSTANCE1_IID: &[u8] = include_bytes!("../tests/fixtures/instance1.iid");
    const PRIMARY_SIGNER_PEM: &str = include_str!("../tests/fixtures/primary-signer.pem");

    #[test]
    fn test_unsupported_signer_info_is_skipped() {
        let trust_store = TrustStore::from_pem(PRIMARY_SIGNER_PEM).unwrap();
        let mut signed = SignedData::from_base64(INSTANCE1_IID).unwrap();
        let mut sha1_signer = signed.signer_infos[0].clone();
        sha1_signer.digest_algorithm = ObjectIdentifier::from_slice(&[1, 3, 14, 3, 2, 26]);
        signed.signer_infos.insert(0, sha1_signer.clone());
        verify_signature(&signed, &trust_store).unwrap();

        signed.signer_infos = vec![sha1_signer];
        let err = verify_signature(&signed, &trust_store).unwrap_err();
        assert!(
            format!("{err:#}").contains("unsupported digest algorithm"),
            "{err:#}"
        );
    }

    #[test]
    fn test_claims_require_every_field() {
        let doc = br#"{"accountId":"1","region":"","instanceId":"i-1","pendingTime":"2021-09-03T21:25:44Z"}"#;
        let err = decode_claims(doc).unwrap_err();
        assert!(err.to_string().contains("region"), "{err}");

        let doc = br#"{"accountId":"1","region":"us-east-1","pendingTime":"2021-09-03T21:25:44Z"}"#;
        let err = decode_claims(doc).unwrap_err();
        assert!(err.to_string().contains("instanceId"), "{err}");
    }

    #[test]
    fn test_claims_pending_time() {
        let doc = br#"{"accountId":"1","region":"us-east-1","instanceId":"i-1","pendingTime":"2021-09-03T21:25:44Z"}"#;
        let claims = decode_claims(doc).unwrap();
        let secs = claims
            .issued_at()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_630_704_344);
        assert_eq!(claims.host_id(), "1-i-1");

        let doc = br#"{"accountId":"1","region":"us-east-1","instanceId":"i-1","pendingTime":"soon"}"#;
        assert!(decode_claims(doc).is_err());
    }
}
