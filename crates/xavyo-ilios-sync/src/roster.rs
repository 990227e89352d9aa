//! Roster collaborator trait and in-memory implementation.
//!
//! The engine never touches enrolment storage directly. It reads current state
//! and requests mutations through [`RosterStore`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use crate::error::{IliosError, IliosResult};
use crate::ids::{AccountId, InstanceId, RoleId, RosterId};
use crate::plan::MutationOp;

/// Component name recorded on role assignments made by the sync.
pub const ROLE_COMPONENT: &str = "ilios_sync";

/// Status of an enrolment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrolmentStatus {
    #[default]
    Active,
    Suspended,
}

impl EnrolmentStatus {
    /// Numeric status as stored by the roster (0 active, 1 suspended).
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            EnrolmentStatus::Active => 0,
            EnrolmentStatus::Suspended => 1,
        }
    }
}

impl fmt::Display for EnrolmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrolmentStatus::Active => write!(f, "active"),
            EnrolmentStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// One enrolment row: an account in a roster, attributed to a sync instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub account_id: AccountId,
    pub roster_id: RosterId,
    pub status: EnrolmentStatus,
    pub instance_id: InstanceId,
}

/// Handle to an enrolment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrolmentRef {
    pub roster_id: RosterId,
    pub account_id: AccountId,
    pub instance_id: InstanceId,
}

/// Where a role assignment lives and which instance made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleContext {
    pub roster_id: RosterId,
    pub instance_id: InstanceId,
}

impl RoleContext {
    /// Component owning assignments in this context.
    #[must_use]
    pub fn component(&self) -> &'static str {
        ROLE_COMPONENT
    }
}

/// A role held by an account in a roster, owned by a sync instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub account_id: AccountId,
    pub role_id: RoleId,
    pub context: RoleContext,
}

/// Local roster persistence.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Every enrolment row of a roster, whichever instance it belongs to.
    async fn enrolments(&self, roster_id: RosterId) -> IliosResult<Vec<RosterEntry>>;

    /// Role assignments made by the instance in its roster.
    async fn role_assignments(&self, context: &RoleContext) -> IliosResult<Vec<RoleAssignment>>;

    /// Create an active enrolment attributed to the instance.
    ///
    /// The role is granted separately through [`assign_role`](Self::assign_role).
    async fn enrol(&self, enrolment: &EnrolmentRef) -> IliosResult<()>;

    async fn set_status(&self, enrolment: &EnrolmentRef, status: EnrolmentStatus)
        -> IliosResult<()>;

    async fn unenrol(&self, enrolment: &EnrolmentRef) -> IliosResult<()>;

    async fn assign_role(
        &self,
        account_id: AccountId,
        role_id: RoleId,
        context: &RoleContext,
    ) -> IliosResult<()>;

    async fn unassign_role(
        &self,
        account_id: AccountId,
        role_id: RoleId,
        context: &RoleContext,
    ) -> IliosResult<()>;

    /// Short name of a role for trace output, if the roster knows it.
    async fn role_name(&self, _role_id: RoleId) -> IliosResult<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Default)]
struct RosterState {
    entries: BTreeMap<(RosterId, AccountId), RosterEntry>,
    roles: BTreeSet<RoleAssignment>,
    role_names: HashMap<RoleId, String>,
    failures: HashSet<(MutationOp, AccountId)>,
}

/// In-memory implementation of `RosterStore` for testing and embedding.
#[derive(Debug, Default)]
pub struct InMemoryRoster {
    state: RwLock<RosterState>,
}

impl InMemoryRoster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a role short name.
    #[must_use]
    pub fn with_role_name(self, role_id: RoleId, name: impl Into<String>) -> Self {
        self.state
            .write()
            .expect("lock poisoned")
            .role_names
            .insert(role_id, name.into());
        self
    }

    /// Seed an enrolment row, with the instance's role if `role_id` is given.
    pub fn seed(&self, entry: RosterEntry, role_id: Option<RoleId>) {
        let mut state = self.state.write().expect("lock poisoned");
        state
            .entries
            .insert((entry.roster_id, entry.account_id), entry);
        if let Some(role_id) = role_id {
            state.roles.insert(RoleAssignment {
                account_id: entry.account_id,
                role_id,
                context: RoleContext {
                    roster_id: entry.roster_id,
                    instance_id: entry.instance_id,
                },
            });
        }
    }

    /// Make the given operation fail for an account.
    pub fn fail_on(&self, op: MutationOp, account_id: AccountId) {
        self.state
            .write()
            .expect("lock poisoned")
            .failures
            .insert((op, account_id));
    }

    /// Current row for an account.
    pub fn entry(&self, roster_id: RosterId, account_id: AccountId) -> Option<RosterEntry> {
        self.state
            .read()
            .expect("lock poisoned")
            .entries
            .get(&(roster_id, account_id))
            .copied()
    }

    /// Whether the account holds the role in the roster through any instance.
    pub fn has_role(&self, roster_id: RosterId, account_id: AccountId, role_id: RoleId) -> bool {
        self.state
            .read()
            .expect("lock poisoned")
            .roles
            .iter()
            .any(|r| {
                r.account_id == account_id && r.role_id == role_id && r.context.roster_id == roster_id
            })
    }

    /// Number of enrolment rows across all rosters.
    pub fn entry_count(&self) -> usize {
        self.state.read().expect("lock poisoned").entries.len()
    }

    fn check(state: &RosterState, op: MutationOp, account_id: AccountId) -> IliosResult<()> {
        if state.failures.contains(&(op, account_id)) {
            return Err(IliosError::MutationFailure {
                op,
                account: account_id,
                message: "rejected by roster".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RosterStore for InMemoryRoster {
    async fn enrolments(&self, roster_id: RosterId) -> IliosResult<Vec<RosterEntry>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state
            .entries
            .values()
            .filter(|e| e.roster_id == roster_id)
            .copied()
            .collect())
    }

    async fn role_assignments(&self, context: &RoleContext) -> IliosResult<Vec<RoleAssignment>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state
            .roles
            .iter()
            .filter(|r| r.context == *context)
            .copied()
            .collect())
    }

    async fn enrol(&self, enrolment: &EnrolmentRef) -> IliosResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        Self::check(&state, MutationOp::Enrol, enrolment.account_id)?;
        let key = (enrolment.roster_id, enrolment.account_id);
        if state.entries.contains_key(&key) {
            return Err(IliosError::MutationFailure {
                op: MutationOp::Enrol,
                account: enrolment.account_id,
                message: "already enrolled".to_string(),
            });
        }
        state.entries.insert(
            key,
            RosterEntry {
                account_id: enrolment.account_id,
                roster_id: enrolment.roster_id,
                status: EnrolmentStatus::Active,
                instance_id: enrolment.instance_id,
            },
        );
        Ok(())
    }

    async fn set_status(
        &self,
        enrolment: &EnrolmentRef,
        status: EnrolmentStatus,
    ) -> IliosResult<()> {
        let op = match status {
            EnrolmentStatus::Active => MutationOp::Reactivate,
            EnrolmentStatus::Suspended => MutationOp::Suspend,
        };
        let mut state = self.state.write().expect("lock poisoned");
        Self::check(&state, op, enrolment.account_id)?;
        match state
            .entries
            .get_mut(&(enrolment.roster_id, enrolment.account_id))
        {
            Some(entry) if entry.instance_id == enrolment.instance_id => {
                entry.status = status;
                Ok(())
            }
            _ => Err(IliosError::MutationFailure {
                op,
                account: enrolment.account_id,
                message: "no enrolment for this instance".to_string(),
            }),
        }
    }

    async fn unenrol(&self, enrolment: &EnrolmentRef) -> IliosResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        Self::check(&state, MutationOp::Unenrol, enrolment.account_id)?;
        let key = (enrolment.roster_id, enrolment.account_id);
        let owned = matches!(
            state.entries.get(&key),
            Some(entry) if entry.instance_id == enrolment.instance_id
        );
        if !owned {
            return Err(IliosError::MutationFailure {
                op: MutationOp::Unenrol,
                account: enrolment.account_id,
                message: "no enrolment for this instance".to_string(),
            });
        }

        state.entries.remove(&key);
        state.roles.retain(|r| {
            !(r.account_id == enrolment.account_id
                && r.context.roster_id == enrolment.roster_id
                && r.context.instance_id == enrolment.instance_id)
        });
        Ok(())
    }

    async fn assign_role(
        &self,
        account_id: AccountId,
        role_id: RoleId,
        context: &RoleContext,
    ) -> IliosResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        Self::check(&state, MutationOp::AssignRole, account_id)?;
        state.roles.insert(RoleAssignment {
            account_id,
            role_id,
            context: *context,
        });
        Ok(())
    }

    async fn unassign_role(
        &self,
        account_id: AccountId,
        role_id: RoleId,
        context: &RoleContext,
    ) -> IliosResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        Self::check(&state, MutationOp::UnassignRole, account_id)?;
        state.roles.remove(&RoleAssignment {
            account_id,
            role_id,
            context: *context,
        });
        Ok(())
    }

    async fn role_name(&self, role_id: RoleId) -> IliosResult<Option<String>> {
        Ok(self
            .state
            .read()
            .expect("lock poisoned")
            .role_names
            .get(&role_id)
            .cloned())
    }
}
