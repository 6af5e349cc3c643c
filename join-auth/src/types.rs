// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use anyhow::{bail, Result};
use iid_qvl::IdentityClaims;
use serde::{Deserialize, Serialize};

use crate::{registry::ResourceKind, serde_time};

/// Role a host asks to join the cluster as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRole {
    Auth,
    Node,
    Proxy,
    Kube,
    Db,
    App,
    TrustedCluster,
}

impl SystemRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Node => "node",
            Self::Proxy => "proxy",
            Self::Kube => "kube",
            Self::Db => "db",
            Self::App => "app",
            Self::TrustedCluster => "trusted_cluster",
        }
    }

    /// Registry kind a host joining with this role is recorded under
    pub const fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            Self::Node => Some(ResourceKind::Node),
            Self::Proxy => Some(ResourceKind::Proxy),
            Self::Kube => Some(ResourceKind::KubeService),
            Self::Db => Some(ResourceKind::DatabaseServer),
            Self::App => Some(ResourceKind::AppServer),
            Self::Auth | Self::TrustedCluster => None,
        }
    }
}

impl fmt::Display for SystemRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let role = match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Self::Auth,
            "node" => Self::Node,
            "proxy" => Self::Proxy,
            "kube" => Self::Kube,
            "db" | "database" => Self::Db,
            "app" => Self::App,
            "trusted_cluster" | "trustedcluster" => Self::TrustedCluster,
            other => bail!("unknown role: {other:?}"),
        };
        Ok(role)
    }
}

/// Parse a comma separated role list such as `node,proxy`
pub fn parse_roles(s: &str) -> Result<BTreeSet<SystemRole>> {
    let roles = s
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(SystemRole::from_str)
        .collect::<Result<BTreeSet<_>>>()?;
    if roles.is_empty() {
        bail!("at least one role is required");
    }
    Ok(roles)
}

/// Account and region predicate attached to a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRule {
    pub account: String,
    /// Empty means any region
    #[serde(default)]
    pub regions: BTreeSet<String>,
}

impl TokenRule {
    pub fn new(account: impl Into<String>, regions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            account: account.into(),
            regions: regions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn any_region(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            regions: BTreeSet::new(),
        }
    }

    pub fn matches(&self, claims: &IdentityClaims) -> bool {
        self.account == claims.account_id()
            && (self.regions.is_empty() || self.regions.contains(claims.region()))
    }
}

/// Operator created secret gating which identities may join as which roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionToken {
    pub name: String,
    pub roles: BTreeSet<SystemRole>,
    #[serde(default)]
    pub allow: Vec<TokenRule>,
    /// Overrides the maximum age of the identity document
    #[serde(default, with = "serde_time::opt_duration", skip_serializing_if = "Option::is_none")]
    pub iid_ttl: Option<Duration>,
    #[serde(with = "serde_time::rfc3339")]
    pub expires: SystemTime,
    /// Delete the token once a host joined with it
    #[serde(default)]
    pub single_use: bool,
}

impl ProvisionToken {
    pub fn new(name: impl Into<String>, roles: BTreeSet<SystemRole>, expires: SystemTime) -> Self {
        Self {
            name: name.into(),
            roles,
            allow: vec![],
            iid_ttl: None,
            expires,
            single_use: false,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires
    }

    /// First allow rule satisfied by the claims. A token without rules matches nothing.
    pub fn matching_rule(&self, claims: &IdentityClaims) -> Option<&TokenRule> {
        self.allow.iter().find(|rule| rule.matches(claims))
    }
}

/// A host asking to join, carrying its vendor identity document
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub token: String,
    pub role: SystemRole,
    pub host_id: String,
    /// Base64 PKCS#7 identity document
    pub document: Vec<u8>,
}
