//! Conflict detection and resolution.

use crate::operation::{OpId, OperationKind};
use crate::record::{RecordKey, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolution of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// The local mutation was written over the remote row.
    KeepLocal,
    /// The remote row was kept and the local mutation dropped.
    AcceptRemote,
}

/// A base-version mismatch between a queued mutation and the remote row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Operation that hit the conflict.
    pub op_id: OpId,
    /// Kind of that operation.
    pub kind: OperationKind,
    /// Targeted row.
    pub key: RecordKey,
    /// Version the operation was made against.
    pub base_version: Option<Version>,
    /// Write time of the local mutation.
    pub local_version: Version,
    /// Version of the remote row when the conflict was seen (`None` if absent).
    pub remote_version: Option<Version>,
    /// How it was resolved.
    pub resolution: ConflictResolution,
}

impl Conflict {
    /// Returns true if the local mutation lost.
    pub fn local_lost(&self) -> bool {
        self.resolution == ConflictResolution::AcceptRemote
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conflict on {} (op {}, {}): base {:?}, local {}, remote {:?}, {:?}",
            self.key,
            self.op_id,
            self.kind,
            self.base_version,
            self.local_version,
            self.remote_version,
            self.resolution
        )
    }
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The newer write by wall-clock time wins; ties go to the remote.
    #[default]
    LastWriteWins,
    /// The remote row always wins.
    ServerWins,
    /// The local mutation always wins.
    ClientWins,
}

impl ConflictPolicy {
    /// Decides a conflict between a local write and the remote row.
    ///
    /// `remote_version` is `None` when the remote no longer has the row; with
    /// last-write-wins the local write then wins since there is nothing newer.
    pub fn resolve(
        &self,
        local_version: Version,
        remote_version: Option<Version>,
    ) -> ConflictResolution {
        match self {
            ConflictPolicy::ServerWins => ConflictResolution::AcceptRemote,
            ConflictPolicy::ClientWins => ConflictResolution::KeepLocal,
            ConflictPolicy::LastWriteWins => match remote_version {
                Some(remote) if remote >= local_version => ConflictResolution::AcceptRemote,
                _ => ConflictResolution::KeepLocal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_prefers_newer() {
        let policy = ConflictPolicy::LastWriteWins;
        assert_eq!(policy.resolve(200, Some(100)), ConflictResolution::KeepLocal);
        assert_eq!(policy.resolve(100, Some(200)), ConflictResolution::AcceptRemote);
    }

    #[test]
    fn last_write_wins_tie_goes_to_remote() {
        assert_eq!(
            ConflictPolicy::LastWriteWins.resolve(100, Some(100)),
            ConflictResolution::AcceptRemote
        );
    }

    #[test]
    fn last_write_wins_missing_remote_keeps_local() {
        assert_eq!(
            ConflictPolicy::LastWriteWins.resolve(100, None),
            ConflictResolution::KeepLocal
        );
    }

    #[test]
    fn fixed_policies() {
        assert_eq!(
            ConflictPolicy::ServerWins.resolve(500, Some(1)),
            ConflictResolution::AcceptRemote
        );
        assert_eq!(
            ConflictPolicy::ClientWins.resolve(1, Some(500)),
            ConflictResolution::KeepLocal
        );
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::LastWriteWins);
    }

    #[test]
    fn conflict_display_names_the_row() {
        let conflict = Conflict {
            op_id: OpId(9),
            kind: OperationKind::Update,
            key: RecordKey::new("tasks", "t1"),
            base_version: Some(1),
            local_version: 5,
            remote_version: Some(7),
            resolution: ConflictResolution::AcceptRemote,
        };
        assert!(conflict.local_lost());
        assert!(conflict.to_string().contains("tasks/t1"));
        assert!(conflict.to_string().contains("op 9"));
    }
}
