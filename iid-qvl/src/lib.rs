// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! EC2 Instance Identity Document Verification Library
//!
//! This crate verifies the PKCS#7 signed instance identity document that the EC2
//! instance metadata service serves at `/latest/dynamic/instance-identity/rsa2048`.
//! It verifies:
//! - The CMS `SignedData` envelope (BER, indefinite lengths allowed)
//! - The `messageDigest` signed attribute against the SHA-256 of the embedded document
//! - The RSA PKCS#1 v1.5 signature against one of the trusted signing certificates
//!
//! # Architecture
//! 1. Decode base64 text into a BER `ContentInfo`
//! 2. Extract the attached JSON document and the signer infos
//! 3. Verify the signature against every certificate in the [`TrustStore`] until one matches
//! 4. Decode the claims out of the JSON document
//!
//! Certificates embedded in the envelope are never trusted; only the caller supplied
//! trust store is consulted.
//!
//! # References
//! - https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/verify-rsa2048.html
//! - RFC 5652 (Cryptographic Message Syntax)

use anyhow::{anyhow, bail, Context, Result};
use yasna::{models::ObjectIdentifier, BERReader, BERReaderSeq, Tag};

mod trust;
mod verify;

pub use trust::{TrustStore, TrustedSigner};
pub use verify::{verify_identity_document, IdentityClaims, ParseError};

pub(crate) const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 2];
pub(crate) const OID_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 1];
pub(crate) const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
pub(crate) const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
pub(crate) const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
pub(crate) const OID_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113549, 1, 9, 3];
pub(crate) const OID_MESSAGE_DIGEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 4];

/// Parsed CMS `SignedData` carrying an attached identity document
#[derive(Debug, Clone)]
pub struct SignedData {
    /// Content type of the encapsulated content (expected: id-data)
    pub content_type: ObjectIdentifier,
    /// Encapsulated content, i.e. the JSON identity document
    pub content: Vec<u8>,
    /// One entry per signer
    pub signer_infos: Vec<SignerInfo>,
}

/// A single CMS `SignerInfo`
#[derive(Debug, Clone)]
pub struct SignerInfo {
    pub digest_algorithm: ObjectIdentifier,
    /// Raw DER of the `[0] IMPLICIT` signed attributes, if present
    pub signed_attrs: Option<Vec<u8>>,
    pub signature_algorithm: ObjectIdentifier,
    pub signature: Vec<u8>,
}

/// A decoded signed attribute
#[derive(Debug, Clone)]
pub struct Attribute {
    pub oid: ObjectIdentifier,
    /// Raw BER of each attribute value
    pub values: Vec<Vec<u8>>,
}

impl SignedData {
    /// Parse the base64 text form served by the metadata service.
    ///
    /// Line breaks and other whitespace inside the base64 text are ignored.
    pub fn from_base64(text: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(text).context("identity document is not text")?;
        let armored = format!("-----BEGIN PKCS7-----\n{}\n-----END PKCS7-----\n", text.trim());
        let block = ::pem::parse(armored).context("failed to decode base64 envelope")?;
        Self::from_ber(block.contents())
    }

    /// Parse a BER encoded `ContentInfo` wrapping a `SignedData`
    pub fn from_ber(data: &[u8]) -> Result<Self> {
        let (content_type, signed_data) = yasna::parse_ber(data, |reader| {
            reader.read_sequence(|seq| {
                let content_type = seq.next().read_oid()?;
                let signed_data = seq
                    .next()
                    .read_tagged(Tag::context(0), |reader| read_signed_data(reader))?;
                Ok((content_type, signed_data))
            })
        })
        .map_err(|err| anyhow!("invalid PKCS#7 structure: {err}"))?;

        if content_type.components().as_slice() != OID_SIGNED_DATA {
            bail!("unexpected content type: {content_type}, expected signedData");
        }
        if signed_data.signer_infos.is_empty() {
            bail!("signed data carries no signer infos");
        }
        Ok(signed_data)
    }
}

impl SignerInfo {
    /// Signed attributes re-tagged as `SET OF`, which is what the signature covers
    pub fn signed_attrs_for_signature(&self) -> Option<Vec<u8>> {
        self.signed_attrs.as_ref().map(|raw| {
            let mut bytes = raw.clone();
            if let Some(first) = bytes.first_mut() {
                *first = 0x31;
            }
            bytes
        })
    }

    /// Decode the signed attributes
    pub fn attributes(&self) -> Result<Vec<Attribute>> {
        let Some(set) = self.signed_attrs_for_signature() else {
            return Ok(vec![]);
        };
        yasna::parse_ber(&set, |reader| {
            reader.collect_set_of(|reader| {
                reader.read_sequence(|seq| {
                    let oid = seq.next().read_oid()?;
                    let values = seq.next().collect_set_of(|reader| reader.read_der())?;
                    Ok(Attribute { oid, values })
                })
            })
        })
        .map_err(|err| anyhow!("invalid signed attributes: {err}"))
    }

    /// Value of the `messageDigest` signed attribute, if present
    pub fn message_digest(&self) -> Result<Option<Vec<u8>>> {
        let attrs = self.attributes()?;
        let Some(attr) = attrs
            .iter()
            .find(|attr| attr.oid.components().as_slice() == OID_MESSAGE_DIGEST)
        else {
            return Ok(None);
        };
        let [value] = attr.values.as_slice() else {
            bail!("messageDigest attribute must have exactly one value");
        };
        let digest = yasna::parse_ber(value, |reader| reader.read_bytes())
            .map_err(|err| anyhow!("invalid messageDigest value: {err}"))?;
        Ok(Some(digest))
    }

    /// Value of the `contentType` signed attribute, if present
    pub fn content_type(&self) -> Result<Option<ObjectIdentifier>> {
        let attrs = self.attributes()?;
        let Some(attr) = attrs
            .iter()
            .find(|attr| attr.oid.components().as_slice() == OID_CONTENT_TYPE)
        else {
            return Ok(None);
        };
        let [value] = attr.values.as_slice() else {
            bail!("contentType attribute must have exactly one value");
        };
        let oid = yasna::parse_ber(value, |reader| reader.read_oid())
            .map_err(|err| anyhow!("invalid contentType value: {err}"))?;
        Ok(Some(oid))
    }
}

fn read_signed_data(reader: BERReader) -> yasna::ASN1Result<SignedData> {
    reader.read_sequence(|seq| {
        let _version = seq.next().read_u8()?;
        let _digest_algorithms = seq.next().collect_set_of(read_algorithm)?;
        let (content_type, content) = seq.next().read_sequence(|seq| {
            let content_type = seq.next().read_oid()?;
            let content = seq.read_optional(|reader| {
                reader.read_tagged(Tag::context(0), |reader| reader.read_bytes())
            })?;
            Ok((content_type, content))
        })?;
        // certificates [0] and crls [1] are not used for trust decisions
        skip_implicit(seq, 0)?;
        skip_implicit(seq, 1)?;
        let signer_infos = seq.next().collect_set_of(read_signer_info)?;
        Ok(SignedData {
            content_type,
            content: content.unwrap_or_default(),
            signer_infos,
        })
    })
}

fn read_signer_info(reader: BERReader) -> yasna::ASN1Result<SignerInfo> {
    reader.read_sequence(|seq| {
        let _version = seq.next().read_u8()?;
        let _sid = seq.next().read_der()?;
        let digest_algorithm = read_algorithm(seq.next())?;
        let signed_attrs = if seq.next().lookahead_tag()? == Tag::context(0) {
            Some(seq.next().read_der()?)
        } else {
            None
        };
        let signature_algorithm = read_algorithm(seq.next())?;
        let signature = seq.next().read_bytes()?;
        let _unsigned_attrs = seq.read_optional(|reader| reader.read_der())?;
        Ok(SignerInfo {
            digest_algorithm,
            signed_attrs,
            signature_algorithm,
            signature,
        })
    })
}

fn read_algorithm(reader: BERReader) -> yasna::ASN1Result<ObjectIdentifier> {
    reader.read_sequence(|seq| {
        let oid = seq.next().read_oid()?;
        let _params = seq.read_optional(|reader| reader.read_der())?;
        Ok(oid)
    })
}

fn skip_implicit(seq: &mut BERReaderSeq, tag: u64) -> yasna::ASN1Result<()> {
    if seq.next().lookahead_tag()? == Tag::context(tag) {
        seq.next().read_der()?;
    }
    Ok(())
}
