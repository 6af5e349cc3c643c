// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, fmt, str::FromStr};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the cloud control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => bail!("unknown instance state: {other:?}"),
        })
    }
}

/// Out-of-band query confirming an instance exists and what state it is in
#[async_trait]
pub trait LivenessOracle: Send + Sync {
    /// `Ok(None)` when the account has no such instance.
    /// Transport failures are errors, never `None`.
    async fn describe_instance(
        &self,
        instance_id: &str,
        account_id: &str,
    ) -> Result<Option<InstanceState>>;
}

/// Oracle answering from a fixed inventory
#[derive(Debug, Default)]
pub struct StaticInventory {
    instances: RwLock<HashMap<(String, String), InstanceState>>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(self, account_id: &str, instance_id: &str, state: InstanceState) -> Self {
        self.set(account_id, instance_id, state);
        self
    }

    pub fn set(&self, account_id: &str, instance_id: &str, state: InstanceState) {
        self.instances
            .write()
            .insert((account_id.to_string(), instance_id.to_string()), state);
    }

    pub fn remove(&self, account_id: &str, instance_id: &str) {
        self.instances
            .write()
            .remove(&(account_id.to_string(), instance_id.to_string()));
    }
}

#[async_trait]
impl LivenessOracle for StaticInventory {
    async fn describe_instance(
        &self,
        instance_id: &str,
        account_id: &str,
    ) -> Result<Option<InstanceState>> {
        Ok(self
            .instances
            .read()
            .get(&(account_id.to_string(), instance_id.to_string()))
            .copied())
    }
}
