// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{future::Future, sync::Arc, time::Duration, time::SystemTime};

use anyhow::anyhow;
use iid_qvl::{verify_identity_document, IdentityClaims, TrustStore};
use tracing::{debug, info, warn};

use crate::{
    config::{VerifierConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_IID_TTL},
    error::{DenyReason, JoinError},
    liveness::LivenessOracle,
    registry::{Registry, UniquenessGuard},
    tokens::TokenStore,
    types::{JoinRequest, ProvisionToken},
};

/// Outcome of an admitted join check
#[derive(Debug, Clone)]
pub struct Admission {
    pub claims: IdentityClaims,
    pub token: ProvisionToken,
}

/// Decides whether a host presenting an EC2 identity document may join.
///
/// Checks run in a fixed order and stop at the first failure. Local checks come first;
/// the liveness oracle and the registry are only consulted for requests that passed them.
pub struct JoinVerifier {
    trust_store: Arc<TrustStore>,
    tokens: Arc<dyn TokenStore>,
    oracle: Arc<dyn LivenessOracle>,
    registry: Arc<dyn Registry>,
    guard: UniquenessGuard,
    default_iid_ttl: Duration,
    call_timeout: Duration,
}

impl JoinVerifier {
    pub fn new(
        trust_store: Arc<TrustStore>,
        tokens: Arc<dyn TokenStore>,
        oracle: Arc<dyn LivenessOracle>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            trust_store,
            tokens,
            oracle,
            guard: UniquenessGuard::new(registry.clone()),
            registry,
            default_iid_ttl: DEFAULT_IID_TTL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_config(mut self, config: &VerifierConfig) -> Self {
        self.default_iid_ttl = config.default_iid_ttl;
        self.call_timeout = config.call_timeout;
        self
    }

    pub fn with_default_iid_ttl(mut self, ttl: Duration) -> Self {
        self.default_iid_ttl = ttl;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub async fn check_join(&self, req: &JoinRequest) -> Result<Admission, JoinError> {
        self.check_join_at(req, SystemTime::now()).await
    }

    /// Like [`Self::check_join_at`], aborting with an internal error once `cancel` resolves
    pub async fn check_join_until(
        &self,
        req: &JoinRequest,
        now: SystemTime,
        cancel: impl Future<Output = ()>,
    ) -> Result<Admission, JoinError> {
        tokio::select! {
            biased;
            _ = cancel => {
                warn!("join check for {} cancelled", req.host_id);
                Err(JoinError::Internal(anyhow!("context cancelled")))
            }
            result = self.check_join_at(req, now) => result,
        }
    }

    /// Run every check against the given current time
    pub async fn check_join_at(
        &self,
        req: &JoinRequest,
        now: SystemTime,
    ) -> Result<Admission, JoinError> {
        let claims = match verify_identity_document(&req.document, &self.trust_store) {
            Ok(claims) => claims,
            Err(err) => {
                debug!("identity document rejected: {err}");
                return Err(deny(&req.host_id, DenyReason::InvalidAttestation));
            }
        };
        debug!("✓ identity document verified");

        if claims.host_id() != req.host_id {
            debug!(
                "host id {} does not match document host id {}",
                req.host_id,
                claims.host_id()
            );
            return Err(deny(&req.host_id, DenyReason::HostIdMismatch));
        }

        let token = self
            .bounded("token lookup", self.tokens.get(&req.token))
            .await?;
        let token = match token {
            Some(token) if !token.is_expired(now) => token,
            _ => return Err(deny(&req.host_id, DenyReason::InvalidToken)),
        };
        debug!("✓ provision token found");

        let ttl = token.iid_ttl.unwrap_or(self.default_iid_ttl);
        match now.duration_since(claims.issued_at()) {
            Ok(age) if age <= ttl => {}
            Ok(age) => {
                debug!("identity document is {age:?} old, ttl is {ttl:?}");
                return Err(deny(&req.host_id, DenyReason::AttestationExpired));
            }
            Err(_) => {
                debug!("identity document is issued in the future");
                return Err(deny(&req.host_id, DenyReason::AttestationExpired));
            }
        }
        debug!("✓ identity document is fresh");

        let Some(rule) = token.matching_rule(&claims) else {
            debug!(
                "no allow rule matches account {} in {}",
                claims.account_id(),
                claims.region()
            );
            return Err(deny(&req.host_id, DenyReason::NotAuthorized));
        };
        if !token.roles.contains(&req.role) {
            debug!("role {} is not allowed by the token", req.role);
            return Err(deny(&req.host_id, DenyReason::NotAuthorized));
        }
        debug!("✓ authorized by rule for account {}", rule.account);

        let state = self
            .bounded(
                "instance liveness query",
                self.oracle
                    .describe_instance(claims.instance_id(), claims.account_id()),
            )
            .await?;
        match state {
            Some(state) if state.is_running() => {}
            Some(state) => {
                debug!("instance {} is {state}", claims.instance_id());
                return Err(deny(&req.host_id, DenyReason::InstanceNotRunning));
            }
            None => {
                debug!("instance {} not found", claims.instance_id());
                return Err(deny(&req.host_id, DenyReason::InstanceNotRunning));
            }
        }
        debug!("✓ instance is running");

        let existing = self
            .bounded("registry lookup", self.guard.find_registered(&req.host_id))
            .await?;
        if let Some(existing) = existing {
            debug!("host already registered as {}", existing.kind);
            return Err(deny(&req.host_id, DenyReason::HostAlreadyRegistered));
        }
        debug!("✓ host id is not registered");

        info!("join admitted for {} as {}", req.host_id, req.role);
        Ok(Admission { claims, token })
    }

    pub(crate) async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, JoinError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!("{what} failed: {err:#}");
                Err(JoinError::Internal(err.context(format!("{what} failed"))))
            }
            Err(_) => {
                warn!("{what} timed out after {:?}", self.call_timeout);
                Err(JoinError::Internal(anyhow!(
                    "{what} timed out after {:?}",
                    self.call_timeout
                )))
            }
        }
    }
}

fn deny(host_id: &str, reason: DenyReason) -> JoinError {
    warn!("join denied for {host_id:?}: {reason}");
    JoinError::AccessDenied(reason)
}
