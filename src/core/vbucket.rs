use std::fmt;

use serde::{Deserialize, Serialize};

/// Partition ownership state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketState {
    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }

    /// Whether a consumer may stream into a partition in this state.
    pub fn accepts_replication(self) -> bool {
        matches!(self, VBucketState::Replica | VBucketState::Pending)
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
