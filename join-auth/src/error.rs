// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Trust decision that rejected a join attempt.
///
/// The rendered strings go to the audit log and back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    InvalidAttestation,
    HostIdMismatch,
    InvalidToken,
    AttestationExpired,
    NotAuthorized,
    InstanceNotRunning,
    HostAlreadyRegistered,
}

impl DenyReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidAttestation => "invalid attestation",
            Self::HostIdMismatch => "host id mismatch",
            Self::InvalidToken => "invalid token",
            Self::AttestationExpired => "attestation expired",
            Self::NotAuthorized => "not authorized",
            Self::InstanceNotRunning => "instance not running",
            Self::HostAlreadyRegistered => "host already registered",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of a failed join check
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The request is well formed but fails a trust decision
    #[error("access denied: {0}")]
    AccessDenied(DenyReason),
    /// A dependency failed; the request was neither admitted nor rejected
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl JoinError {
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::AccessDenied(reason) => Some(*reason),
            Self::Internal(_) => None,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}
