//! Mutation plans produced by the reconciler.

use serde::Serialize;
use std::fmt;

use crate::ids::AccountId;

/// A single roster change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Create an active enrolment owned by the instance.
    Enrol,
    /// Set a suspended owned enrolment back to active.
    Reactivate,
    /// Set an owned enrolment to suspended.
    Suspend,
    /// Delete the owned enrolment.
    Unenrol,
    AssignRole,
    UnassignRole,
}

impl MutationOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Enrol => "enrol",
            MutationOp::Reactivate => "reactivate",
            MutationOp::Suspend => "suspend",
            MutationOp::Unenrol => "unenrol",
            MutationOp::AssignRole => "assign role",
            MutationOp::UnassignRole => "unassign role",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An operation bound to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Mutation {
    pub op: MutationOp,
    pub account: AccountId,
}

impl Mutation {
    #[must_use]
    pub fn new(op: MutationOp, account: AccountId) -> Self {
        Self { op, account }
    }
}

/// Ordered changes for one target.
///
/// The enrol phase runs to completion before the removal phase starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationPlan {
    pub enrol_phase: Vec<Mutation>,
    pub removal_phase: Vec<Mutation>,
}

impl MutationPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enrol_phase.is_empty() && self.removal_phase.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.enrol_phase.len() + self.removal_phase.len()
    }

    /// All mutations in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.enrol_phase.iter().chain(self.removal_phase.iter())
    }

    /// Number of planned mutations with the given operation.
    #[must_use]
    pub fn count(&self, op: MutationOp) -> usize {
        self.iter().filter(|m| m.op == op).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_display() {
        assert_eq!(MutationOp::Unenrol.to_string(), "unenrol");
        assert_eq!(MutationOp::UnassignRole.to_string(), "unassign role");
    }

    #[test]
    fn test_plan_iterates_phases_in_order() {
        let plan = MutationPlan {
            enrol_phase: vec![Mutation::new(MutationOp::Enrol, AccountId::new(5))],
            removal_phase: vec![
                Mutation::new(MutationOp::UnassignRole, AccountId::new(1)),
                Mutation::new(MutationOp::Unenrol, AccountId::new(1)),
            ],
        };

        let ops: Vec<MutationOp> = plan.iter().map(|m| m.op).collect();
        assert_eq!(
            ops,
            vec![MutationOp::Enrol, MutationOp::UnassignRole, MutationOp::Unenrol]
        );
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.count(MutationOp::Unenrol), 1);
        assert!(!plan.is_empty());
        assert!(MutationPlan::default().is_empty());
    }
}
