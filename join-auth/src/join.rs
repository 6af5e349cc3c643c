// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::{
    error::{DenyReason, JoinError},
    registry::RegistryEntry,
    types::{JoinRequest, ProvisionToken},
    verifier::{Admission, JoinVerifier},
};

#[derive(Debug)]
struct LockSlot {
    mutex: Arc<AsyncMutex<()>>,
    /// Guards holding or waiting for the mutex
    users: usize,
}

/// Per host id mutual exclusion.
///
/// Entries are dropped once nobody holds or waits for them, including waiters whose
/// `lock` future was dropped before it resolved.
#[derive(Debug, Default)]
pub struct HostLocks {
    locks: Mutex<HashMap<String, LockSlot>>,
}

pub struct HostLockGuard<'a> {
    locks: &'a HostLocks,
    host_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl HostLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, host_id: &str) -> HostLockGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            let slot = locks
                .entry(host_id.to_string())
                .or_insert_with(|| LockSlot {
                    mutex: Arc::new(AsyncMutex::new(())),
                    users: 0,
                });
            slot.users += 1;
            slot.mutex.clone()
        };
        let mut guard = HostLockGuard {
            locks: self,
            host_id: host_id.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }

    /// Number of host ids currently locked or contended
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HostLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if let Some(slot) = locks.get_mut(&self.host_id) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(&self.host_id);
            }
        }
    }
}

/// Registers hosts admitted by the [`JoinVerifier`].
///
/// The uniqueness check and the registry write happen under a per host id lock, and the
/// write itself is conditional, so concurrent joins for one host id admit at most one.
/// A single use token is consumed before the registry write, so it admits one host even
/// when different hosts present it at the same time.
pub struct JoinService {
    verifier: JoinVerifier,
    host_locks: HostLocks,
}

impl JoinService {
    pub fn new(verifier: JoinVerifier) -> Self {
        Self {
            verifier,
            host_locks: HostLocks::new(),
        }
    }

    pub fn verifier(&self) -> &JoinVerifier {
        &self.verifier
    }

    pub async fn register_using_token(&self, req: &JoinRequest) -> Result<RegistryEntry, JoinError> {
        self.register_using_token_at(req, SystemTime::now()).await
    }

    pub async fn register_using_token_at(
        &self,
        req: &JoinRequest,
        now: SystemTime,
    ) -> Result<RegistryEntry, JoinError> {
        let _lock = self.host_locks.lock(&req.host_id).await;
        let Admission { token, .. } = self.verifier.check_join_at(req, now).await?;

        let Some(kind) = req.role.resource_kind() else {
            warn!("join denied for {:?}: role {} has no registry kind", req.host_id, req.role);
            return Err(JoinError::AccessDenied(DenyReason::NotAuthorized));
        };

        if token.single_use {
            let consumed = self
                .verifier
                .bounded("token consumption", self.verifier.token_store().delete(&token.name))
                .await?;
            if !consumed {
                warn!("join denied for {:?}: single use token already consumed", req.host_id);
                return Err(JoinError::AccessDenied(DenyReason::InvalidToken));
            }
            info!("consumed single use token for {}", req.host_id);
        }

        let entry = RegistryEntry::new(kind, req.host_id.clone());
        let inserted = self
            .verifier
            .bounded(
                "host registration",
                self.verifier.registry().insert_if_absent(entry.clone()),
            )
            .await;
        let denied = match inserted {
            Ok(true) => {
                info!("registered {} as {kind}", req.host_id);
                return Ok(entry);
            }
            Ok(false) => {
                warn!("join denied for {:?}: lost registration race", req.host_id);
                JoinError::AccessDenied(DenyReason::HostAlreadyRegistered)
            }
            Err(err) => err,
        };
        if token.single_use {
            self.restore_token(token).await?;
        }
        Err(denied)
    }

    /// Put back a single use token consumed by a join that did not register
    async fn restore_token(&self, token: ProvisionToken) -> Result<(), JoinError> {
        let name = token.name.clone();
        self.verifier
            .bounded("token restore", self.verifier.token_store().upsert(token))
            .await
            .inspect_err(|err| error!("single use token {name:?} is lost: {err}"))
    }
}
