// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use iid_qvl::TrustStore;
use join_auth::{
    InstanceState, JoinRequest, JoinVerifier, LivenessOracle, MemRegistry, MemTokenStore,
    ProvisionToken, StaticInventory, SystemRole, TokenRule,
};

pub const INSTANCE1_IID: &[u8] = include_bytes!("../../../iid-qvl/tests/fixtures/instance1.iid");
pub const INSTANCE2_IID: &[u8] = include_bytes!("../../../iid-qvl/tests/fixtures/instance2.iid");
pub const ROGUE_IID: &[u8] =
    include_bytes!("../../../iid-qvl/tests/fixtures/instance1-rogue.iid");
const PRIMARY_SIGNER: &str = include_str!("../../../iid-qvl/tests/fixtures/primary-signer.pem");
const ROTATED_SIGNER: &str = include_str!("../../../iid-qvl/tests/fixtures/rotated-signer.pem");

pub struct Instance {
    pub account: &'static str,
    pub region: &'static str,
    pub instance_id: &'static str,
    pub pending_time: &'static str,
    pub iid: &'static [u8],
}

pub const INSTANCE1: Instance = Instance {
    account: "278576220453",
    region: "us-west-2",
    instance_id: "i-078517ca8a70a1dde",
    pending_time: "2021-09-03T21:25:44Z",
    iid: INSTANCE1_IID,
};

pub const INSTANCE2: Instance = Instance {
    account: "883474662888",
    region: "us-west-1",
    instance_id: "i-01b940c45fd11fe74",
    pending_time: "2021-09-11T00:14:18Z",
    iid: INSTANCE2_IID,
};

impl Instance {
    pub fn host_id(&self) -> String {
        format!("{}-{}", self.account, self.instance_id)
    }

    pub fn pending_time(&self) -> SystemTime {
        humantime::parse_rfc3339(self.pending_time).unwrap()
    }

    pub fn request(&self, token: &str) -> JoinRequest {
        JoinRequest {
            token: token.to_string(),
            role: SystemRole::Node,
            host_id: self.host_id(),
            document: self.iid.to_vec(),
        }
    }

    pub fn rule(&self) -> TokenRule {
        TokenRule::new(self.account, [self.region])
    }
}

pub fn trust_store() -> Arc<TrustStore> {
    Arc::new(TrustStore::from_pem(&format!("{PRIMARY_SIGNER}{ROTATED_SIGNER}")).unwrap())
}

/// Token valid for an hour past `now`
pub fn token(name: &str, now: SystemTime, allow: Vec<TokenRule>) -> ProvisionToken {
    let mut token = ProvisionToken::new(
        name,
        BTreeSet::from([SystemRole::Node]),
        now + Duration::from_secs(3600),
    );
    token.allow = allow;
    token
}

pub struct Harness {
    pub tokens: Arc<MemTokenStore>,
    pub inventory: Arc<StaticInventory>,
    pub registry: Arc<MemRegistry>,
}

impl Harness {
    /// Both fixture instances running, nothing registered, no tokens
    pub fn new() -> Self {
        let inventory = StaticInventory::new()
            .with_instance(INSTANCE1.account, INSTANCE1.instance_id, InstanceState::Running)
            .with_instance(INSTANCE2.account, INSTANCE2.instance_id, InstanceState::Running);
        Self {
            tokens: Arc::new(MemTokenStore::new()),
            inventory: Arc::new(inventory),
            registry: Arc::new(MemRegistry::new()),
        }
    }

    pub fn verifier(&self) -> JoinVerifier {
        self.verifier_with_oracle(self.inventory.clone())
    }

    pub fn verifier_with_oracle(&self, oracle: Arc<dyn LivenessOracle>) -> JoinVerifier {
        JoinVerifier::new(
            trust_store(),
            self.tokens.clone(),
            oracle,
            self.registry.clone(),
        )
    }
}

/// Oracle whose transport is down
pub struct UnreachableOracle;

#[async_trait]
impl LivenessOracle for UnreachableOracle {
    async fn describe_instance(&self, _: &str, _: &str) -> Result<Option<InstanceState>> {
        bail!("connection refused")
    }
}

/// Oracle that answers from an inventory after a delay, counting calls
pub struct SlowOracle {
    pub delay: Duration,
    pub inner: Arc<StaticInventory>,
    pub calls: AtomicUsize,
}

impl SlowOracle {
    pub fn new(delay: Duration, inner: Arc<StaticInventory>) -> Self {
        Self {
            delay,
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessOracle for SlowOracle {
    async fn describe_instance(
        &self,
        instance_id: &str,
        account_id: &str,
    ) -> Result<Option<InstanceState>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.describe_instance(instance_id, account_id).await
    }
}
