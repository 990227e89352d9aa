//! Configured sync targets.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{InstanceId, RemoteId, RoleId, RosterId};

/// Kind of Ilios group a target pulls members from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    #[serde(rename = "cohort")]
    Cohort,
    #[serde(rename = "learnerGroup")]
    LearnerGroup,
}

impl GroupKind {
    /// The sync type name as stored on the instance and written to the trace.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Cohort => "cohort",
            GroupKind::LearnerGroup => "learnerGroup",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GroupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cohort" => Ok(GroupKind::Cohort),
            "learnergroup" | "learner_group" => Ok(GroupKind::LearnerGroup),
            _ => Err(format!("Unknown sync type: {s}")),
        }
    }
}

/// Which members of a learner group hold the target role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleMode {
    #[default]
    Learners,
    Instructors,
}

impl RoleMode {
    /// Word used in the enrol-phase trace line.
    #[must_use]
    pub fn audience(&self) -> &'static str {
        match self {
            RoleMode::Learners => "students",
            RoleMode::Instructors => "instructors",
        }
    }
}

/// The remote group a target is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    #[serde(rename = "synctype")]
    pub kind: GroupKind,
    pub id: RemoteId,
}

/// One configured mapping from an Ilios group to a local roster and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub instance_id: InstanceId,
    pub roster_id: RosterId,
    #[serde(flatten)]
    pub remote_ref: RemoteRef,
    /// Ignored for cohorts, which only carry a flat user list.
    #[serde(default)]
    pub role_mode: RoleMode,
    pub role_id: RoleId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SyncTarget {
    /// Target enrolling the members of a cohort.
    #[must_use]
    pub fn cohort(instance_id: InstanceId, roster_id: RosterId, cohort_id: RemoteId, role_id: RoleId) -> Self {
        Self {
            instance_id,
            roster_id,
            remote_ref: RemoteRef {
                kind: GroupKind::Cohort,
                id: cohort_id,
            },
            role_mode: RoleMode::Learners,
            role_id,
            enabled: true,
        }
    }

    /// Target enrolling the learners or instructors of a learner group.
    #[must_use]
    pub fn learner_group(
        instance_id: InstanceId,
        roster_id: RosterId,
        group_id: RemoteId,
        role_mode: RoleMode,
        role_id: RoleId,
    ) -> Self {
        Self {
            instance_id,
            roster_id,
            remote_ref: RemoteRef {
                kind: GroupKind::LearnerGroup,
                id: group_id,
            },
            role_mode,
            role_id,
            enabled: true,
        }
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The effective role mode; cohorts always enrol their users.
    #[must_use]
    pub fn effective_role_mode(&self) -> RoleMode {
        match self.remote_ref.kind {
            GroupKind::Cohort => RoleMode::Learners,
            GroupKind::LearnerGroup => self.role_mode,
        }
    }
}
