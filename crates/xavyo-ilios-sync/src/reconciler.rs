//! Three-way roster reconciliation.
//!
//! Every account that is desired, disabled, enrolled in the roster or holding
//! the target's role is classified into an [`AccountState`]. The transition
//! table in [`transition`] maps each state to the operations that bring the
//! roster in line with Ilios. The result is a [`MutationPlan`] whose enrol
//! phase always precedes its removal phase.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::ids::{AccountId, InstanceId, RoleId, RosterId};
use crate::plan::{Mutation, MutationOp, MutationPlan};
use crate::roster::{EnrolmentStatus, RoleAssignment, RosterEntry};
use crate::target::SyncTarget;

/// What happens to owned enrolments whose user left the Ilios group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Remove the role, then the enrolment.
    #[default]
    Unenrol,
    /// Remove the role and suspend the enrolment.
    SuspendNoRoles,
    /// Leave the account untouched.
    Keep,
}

impl RemovalPolicy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalPolicy::Unenrol => "unenrol",
            RemovalPolicy::SuspendNoRoles => "suspend_no_roles",
            RemovalPolicy::Keep => "keep",
        }
    }
}

impl fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RemovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unenrol" | "unenroll" => Ok(RemovalPolicy::Unenrol),
            "suspend" | "suspend_no_roles" | "suspendnoroles" => Ok(RemovalPolicy::SuspendNoRoles),
            "keep" => Ok(RemovalPolicy::Keep),
            _ => Err(format!("Unknown removal policy: {s}")),
        }
    }
}

/// Where an account stands relative to the Ilios group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Presence {
    /// Mapped from an enabled Ilios user.
    Desired,
    /// Mapped from a disabled Ilios user.
    Disabled,
    /// Not returned by the expansion at all.
    Absent,
}

/// The account's enrolment row in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Standing {
    NotEnrolled,
    /// Row attributed to this instance.
    Owned(EnrolmentStatus),
    /// Row attributed to another instance or enrolment method.
    Foreign(EnrolmentStatus),
}

/// Classification of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountState {
    pub presence: Presence,
    pub standing: Standing,
    /// Whether this instance has granted the target role.
    pub has_role: bool,
}

/// Operations for one account, split by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub enrol: Vec<MutationOp>,
    pub removal: Vec<MutationOp>,
}

/// The transition table.
#[must_use]
pub fn transition(state: AccountState, policy: RemovalPolicy) -> Transition {
    use EnrolmentStatus::{Active, Suspended};
    use MutationOp::{AssignRole, Enrol, Reactivate, Suspend, UnassignRole, Unenrol};

    let mut t = Transition::default();
    let grant = |ops: &mut Vec<MutationOp>| {
        if !state.has_role {
            ops.push(AssignRole);
        }
    };
    let revoke = |ops: &mut Vec<MutationOp>| {
        if state.has_role {
            ops.push(UnassignRole);
        }
    };

    match (state.presence, state.standing) {
        (Presence::Desired, Standing::NotEnrolled) => {
            t.enrol.push(Enrol);
            grant(&mut t.enrol);
        }
        (Presence::Desired, Standing::Owned(Suspended)) => {
            t.enrol.push(Reactivate);
            grant(&mut t.enrol);
        }
        (Presence::Desired, Standing::Owned(Active) | Standing::Foreign(_)) => {
            grant(&mut t.enrol);
        }

        (Presence::Disabled, Standing::Owned(status)) => {
            if status == Active {
                t.enrol.push(Suspend);
            }
            revoke(&mut t.removal);
        }
        (Presence::Disabled, Standing::Foreign(_) | Standing::NotEnrolled) => {
            revoke(&mut t.removal);
        }

        (Presence::Absent, _) if policy == RemovalPolicy::Keep => {}
        (Presence::Absent, Standing::Owned(status)) => {
            revoke(&mut t.removal);
            match policy {
                RemovalPolicy::Unenrol => t.removal.push(Unenrol),
                RemovalPolicy::SuspendNoRoles if status == Active => t.removal.push(Suspend),
                RemovalPolicy::SuspendNoRoles | RemovalPolicy::Keep => {}
            }
        }
        (Presence::Absent, Standing::Foreign(_) | Standing::NotEnrolled) => {
            revoke(&mut t.removal);
        }
    }

    t
}

/// Diffs the desired membership of one target against its roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciler {
    instance_id: InstanceId,
    roster_id: RosterId,
    role_id: RoleId,
    policy: RemovalPolicy,
}

impl Reconciler {
    #[must_use]
    pub fn new(target: &SyncTarget) -> Self {
        Self {
            instance_id: target.instance_id,
            roster_id: target.roster_id,
            role_id: target.role_id,
            policy: RemovalPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Classify every account the target is concerned with, by ascending id.
    ///
    /// `entries` may contain rows of other rosters and `assignments` may
    /// contain other roles or instances; both are filtered here. An account in
    /// both `desired` and `disabled` is desired.
    #[must_use]
    pub fn classify(
        &self,
        desired: &BTreeSet<AccountId>,
        disabled: &BTreeSet<AccountId>,
        entries: &[RosterEntry],
        assignments: &[RoleAssignment],
    ) -> BTreeMap<AccountId, AccountState> {
        let rows: BTreeMap<AccountId, &RosterEntry> = entries
            .iter()
            .filter(|e| e.roster_id == self.roster_id)
            .map(|e| (e.account_id, e))
            .collect();
        let role_holders: BTreeSet<AccountId> = assignments
            .iter()
            .filter(|a| {
                a.role_id == self.role_id
                    && a.context.roster_id == self.roster_id
                    && a.context.instance_id == self.instance_id
            })
            .map(|a| a.account_id)
            .collect();

        let accounts: BTreeSet<AccountId> = desired
            .iter()
            .chain(disabled.iter())
            .chain(rows.keys())
            .chain(role_holders.iter())
            .copied()
            .collect();

        accounts
            .into_iter()
            .map(|account| {
                let presence = if desired.contains(&account) {
                    Presence::Desired
                } else if disabled.contains(&account) {
                    Presence::Disabled
                } else {
                    Presence::Absent
                };
                let standing = match rows.get(&account) {
                    None => Standing::NotEnrolled,
                    Some(row) if row.instance_id == self.instance_id => Standing::Owned(row.status),
                    Some(row) => Standing::Foreign(row.status),
                };
                let state = AccountState {
                    presence,
                    standing,
                    has_role: role_holders.contains(&account),
                };
                (account, state)
            })
            .collect()
    }

    /// Build the ordered mutation plan.
    #[must_use]
    pub fn plan(
        &self,
        desired: &BTreeSet<AccountId>,
        disabled: &BTreeSet<AccountId>,
        entries: &[RosterEntry],
        assignments: &[RoleAssignment],
    ) -> MutationPlan {
        let mut plan = MutationPlan::default();
        for (account, state) in self.classify(desired, disabled, entries, assignments) {
            let t = transition(state, self.policy);
            plan.enrol_phase
                .extend(t.enrol.into_iter().map(|op| Mutation::new(op, account)));
            plan.removal_phase
                .extend(t.removal.into_iter().map(|op| Mutation::new(op, account)));
        }
        plan
    }
}
