// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime},
};

use anyhow::{bail, Context, Result};
use join_auth::{generate_token, ProvisionToken, SystemRole, TokenRule, TokenStore};
use sha2::{Digest, Sha256};
use tracing::info;
use x509_parser::prelude::*;

/// A freshly created enrollment token and what a node needs to use it
#[derive(Debug, Clone)]
pub struct Invite {
    pub token: String,
    pub roles: BTreeSet<SystemRole>,
    pub ttl: Duration,
    pub ca_pins: Vec<String>,
    pub auth_server: String,
}

/// Create and store a provisioning token for the given roles
pub async fn generate_enrollment_token(
    store: &dyn TokenStore,
    roles: BTreeSet<SystemRole>,
    ttl: Duration,
    token: Option<String>,
    now: SystemTime,
) -> Result<ProvisionToken> {
    let name = match token {
        Some(token) if token.trim().is_empty() => bail!("token must not be empty"),
        Some(token) => token,
        None => generate_token()?,
    };
    if store.get(&name).await?.is_some() {
        bail!("token {name} already exists");
    }
    let token = ProvisionToken::new(name, roles, now + ttl);
    store.upsert(token.clone()).await?;
    info!(
        "created token for roles {} valid for {}",
        roles_string(&token.roles),
        humantime::format_duration(ttl)
    );
    Ok(token)
}

/// Add an account/region allow rule to an existing token
pub async fn allow_account(
    store: &dyn TokenStore,
    token: &str,
    rule: TokenRule,
) -> Result<ProvisionToken> {
    let mut stored = store
        .get(token)
        .await?
        .with_context(|| format!("token {token} not found"))?;
    if !stored.allow.contains(&rule) {
        stored.allow.push(rule);
    }
    store.upsert(stored.clone()).await?;
    Ok(stored)
}

/// `sha256:<hex>` of the SubjectPublicKeyInfo of every certificate in the PEM input
pub fn ca_pins(ca_pem: &str) -> Result<Vec<String>> {
    let mut pins = Vec::new();
    for pem in Pem::iter_from_buffer(ca_pem.as_bytes()) {
        let pem = pem.context("failed to parse CA PEM")?;
        let cert = pem.parse_x509().context("invalid CA certificate")?;
        let spki = cert.public_key().raw;
        pins.push(format!("sha256:{}", hex::encode(Sha256::digest(spki))));
    }
    if pins.is_empty() {
        bail!("no CA certificate found");
    }
    Ok(pins)
}

pub fn roles_string(roles: &BTreeSet<SystemRole>) -> String {
    roles
        .iter()
        .map(SystemRole::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl Invite {
    pub fn minutes(&self) -> u64 {
        self.ttl.as_secs() / 60
    }

    pub fn render_text(&self) -> String {
        let minutes = self.minutes();
        if self.roles.contains(&SystemRole::TrustedCluster) {
            return format!(
                "The cluster invite token: {}\n\
                 This token will expire in {minutes} minutes\n\
                 \n\
                 Use this token when defining a trusted cluster resource on a remote cluster.\n",
                self.token
            );
        }
        let pins: String = self
            .ca_pins
            .iter()
            .map(|pin| format!("   --ca-pin={pin} \\\n"))
            .collect();
        format!(
            "The invite token: {token}.\n\
             This token will expire in {minutes} minutes.\n\
             \n\
             Run this on the new node to join the cluster:\n\
             \n\
             > node-agent start \\\n   \
             --roles={roles} \\\n   \
             --token={token} \\\n\
             {pins}   \
             --auth-server={auth_server}\n\
             \n\
             Please note:\n\
             \n  \
             - This invitation token will expire in {minutes} minutes\n  \
             - {auth_server} must be reachable from the new node\n",
            token = self.token,
            roles = roles_string(&self.roles),
            auth_server = self.auth_server,
        )
    }

    /// Always a list so tooling can rely on the shape
    pub fn render_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&[&self.token])?)
    }
}
