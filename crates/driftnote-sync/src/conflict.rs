//! Conflict detection and resolution policy.
//!
//! A conflict exists when a push is rejected because the server's version is
//! ahead of the one the local mutation was based on, or when a remote event
//! arrives for an entity that also has a pending local mutation. Resolution
//! is whole-entity: one side wins outright, there is no field-level merge.

use crate::entity::{EntityKey, Operation};
use crate::remote::RemoteEntity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// How diverging local and server versions are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Surface both versions and wait for the user's decision.
    #[default]
    Ask,
    /// This device wins: force-push the local state.
    Local,
    /// The server wins: overwrite local state, drop the pending mutation.
    Server,
}

impl Display for ConflictPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictPolicy::Ask => "ask",
            ConflictPolicy::Local => "local",
            ConflictPolicy::Server => "server",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("unknown conflict policy: {0} (expected ask, local, or server)")]
pub struct PolicyParseError(String);

impl FromStr for ConflictPolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(ConflictPolicy::Ask),
            "local" => Ok(ConflictPolicy::Local),
            "server" => Ok(ConflictPolicy::Server),
            _ => Err(PolicyParseError(s.to_string())),
        }
    }
}

/// One detected divergence between a pending local mutation and the server.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub key: EntityKey,
    pub local_operation: Operation,
    /// The pending mutation's snapshot; None for a delete.
    pub local_payload: Option<Value>,
    /// When the local change was made (unix ms).
    pub local_updated_at: u64,
    /// The server version the push lost against.
    pub server_version: u64,
    /// The server's current entity; None when it was deleted there.
    pub server: Option<RemoteEntity>,
}

/// What to do about a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Re-push the local state based on the server's current version
    /// (last-writer-wins from this device's perspective).
    KeepLocal { expected_version: u64 },
    /// Adopt the server state and drop the pending local mutation.
    KeepServer,
    /// Park the queue item and surface both versions to the UI.
    Escalate,
}

/// The user's answer to an escalated conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictDecision {
    KeepLocal,
    KeepServer,
}

/// Decide a conflict under the configured policy. Pure function.
pub fn resolve(policy: ConflictPolicy, conflict: &Conflict) -> Resolution {
    match policy {
        ConflictPolicy::Local => Resolution::KeepLocal {
            expected_version: conflict.server_version,
        },
        ConflictPolicy::Server => Resolution::KeepServer,
        ConflictPolicy::Ask => Resolution::Escalate,
    }
}
