// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Node join authorization using EC2 instance identity documents
//!
//! A host that holds nothing but its vendor signed identity document and a provisioning
//! token asks to join the cluster. [`JoinVerifier`] turns the request into a verdict:
//! admitted, denied with a [`DenyReason`], or an internal failure of a dependency.
//!
//! # Architecture
//! 1. Verify the identity document signature and decode its claims (`iid-qvl`)
//! 2. Check the claimed host id against `<account>-<instance>`
//! 3. Load the provisioning token
//! 4. Check the document age against the token TTL
//! 5. Match the claims against the token allow rules and roles
//! 6. Ask the [`LivenessOracle`] whether the instance is running
//! 7. Ask the [`UniquenessGuard`] whether the host id is already registered
//!
//! [`JoinService`] wraps the verifier with per host id serialization and performs the
//! registration and single use token cleanup.

mod config;
mod error;
mod join;
mod liveness;
mod registry;
pub mod serde_time;
mod tokens;
mod types;
mod verifier;

pub use config::{VerifierConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_IID_TTL};
pub use error::{DenyReason, JoinError};
pub use join::{HostLockGuard, HostLocks, JoinService};
pub use liveness::{InstanceState, LivenessOracle, StaticInventory};
pub use registry::{MemRegistry, Registry, RegistryEntry, ResourceKind, UniquenessGuard};
pub use tokens::{generate_token, FileTokenStore, MemTokenStore, TokenStore, TOKEN_LEN_BYTES};
pub use types::{parse_roles, JoinRequest, ProvisionToken, SystemRole, TokenRule};
pub use verifier::{Admission, JoinVerifier};
