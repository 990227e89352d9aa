//! Sync driver: expand, map, reconcile and apply for each configured target.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::client::DirectoryClient;
use crate::config::IliosConfig;
use crate::error::{IliosError, IliosResult};
use crate::expander::{GroupExpander, DEFAULT_MAX_DEPTH};
use crate::identity::{AccountDirectory, IdentityMapper};
use crate::ids::{AccountId, InstanceId, RosterId};
use crate::plan::{Mutation, MutationOp};
use crate::reconciler::{Reconciler, RemovalPolicy};
use crate::roster::{EnrolmentRef, EnrolmentStatus, RoleContext, RosterStore};
use crate::target::SyncTarget;
use crate::trace::ProgressTrace;

/// A mutation the roster rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMutation {
    pub mutation: Mutation,
    pub message: String,
}

/// Outcome of syncing one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub instance_id: InstanceId,
    pub roster_id: RosterId,
    /// Ilios users returned for the expanded group.
    pub remote_users_found: usize,
    /// Ilios users without a local account.
    pub unmapped: usize,
    /// Referenced Ilios records that no longer exist.
    pub stale_references: usize,
    pub applied: Vec<Mutation>,
    pub failed: Vec<FailedMutation>,
}

impl TargetReport {
    fn new(target: &SyncTarget) -> Self {
        Self {
            instance_id: target.instance_id,
            roster_id: target.roster_id,
            remote_users_found: 0,
            unmapped: 0,
            stale_references: 0,
            applied: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Number of applied mutations with the given operation.
    #[must_use]
    pub fn applied_count(&self, op: MutationOp) -> usize {
        self.applied.iter().filter(|m| m.op == op).count()
    }
}

/// A target whose run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub instance_id: InstanceId,
    pub roster_id: RosterId,
    pub message: String,
}

/// Outcome of a sync run over several targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub reports: Vec<TargetReport>,
    pub failures: Vec<TargetFailure>,
    /// Disabled targets.
    pub skipped: usize,
}

impl SyncSummary {
    #[must_use]
    pub fn synced(&self) -> usize {
        self.reports.len()
    }

    /// Failed targets plus rejected mutations.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failures.len() + self.reports.iter().map(|r| r.failed.len()).sum::<usize>()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.error_count() == 0
    }
}

/// Runs sync targets against the directory and the roster.
///
/// Plans for the same roster never overlap: each target holds its roster's
/// lock from reading roster state until its last mutation. Targets of
/// different rosters may run concurrently on a shared driver.
pub struct SyncDriver {
    client: Arc<dyn DirectoryClient>,
    accounts: Arc<dyn AccountDirectory>,
    roster: Arc<dyn RosterStore>,
    max_depth: u32,
    removal_policy: RemovalPolicy,
    roster_locks: Mutex<HashMap<RosterId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncDriver {
    #[must_use]
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        accounts: Arc<dyn AccountDirectory>,
        roster: Arc<dyn RosterStore>,
    ) -> Self {
        Self {
            client,
            accounts,
            roster,
            max_depth: DEFAULT_MAX_DEPTH,
            removal_policy: RemovalPolicy::default(),
            roster_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Driver using the depth cap and removal policy from configuration.
    #[must_use]
    pub fn from_config(
        config: &IliosConfig,
        client: Arc<dyn DirectoryClient>,
        accounts: Arc<dyn AccountDirectory>,
        roster: Arc<dyn RosterStore>,
    ) -> Self {
        Self::new(client, accounts, roster)
            .with_max_depth(config.max_depth)
            .with_removal_policy(config.removal_policy)
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Sync every enabled target, or only those of `only_roster`.
    ///
    /// A failing target is logged and recorded; the remaining targets still run.
    #[instrument(skip(self, targets, trace), fields(targets = targets.len()))]
    pub async fn sync_all(
        &self,
        targets: &[SyncTarget],
        only_roster: Option<RosterId>,
        trace: &dyn ProgressTrace,
    ) -> SyncSummary {
        let mut summary = SyncSummary::default();

        for target in targets {
            if only_roster.is_some_and(|roster_id| roster_id != target.roster_id) {
                continue;
            }
            if !target.enabled {
                debug!(instance_id = %target.instance_id, "Sync target disabled, skipping");
                summary.skipped += 1;
                continue;
            }

            match self.sync_target(target, trace).await {
                Ok(report) => summary.reports.push(report),
                Err(e) => {
                    warn!(
                        instance_id = %target.instance_id,
                        roster_id = %target.roster_id,
                        error = %e,
                        "Sync target failed, skipping"
                    );
                    summary.failures.push(TargetFailure {
                        instance_id: target.instance_id,
                        roster_id: target.roster_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            synced = summary.synced(),
            failed = summary.failures.len(),
            skipped = summary.skipped,
            errors = summary.error_count(),
            "Ilios sync finished"
        );
        summary
    }

    /// Sync one target.
    ///
    /// # Errors
    ///
    /// Fails when the directory is unavailable, when the target's own group no
    /// longer exists, or when roster state cannot be read. Rejected mutations
    /// do not fail the target; they are listed in the report.
    #[instrument(skip(self, target, trace), fields(instance_id = %target.instance_id, roster_id = %target.roster_id))]
    pub async fn sync_target(
        &self,
        target: &SyncTarget,
        trace: &dyn ProgressTrace,
    ) -> IliosResult<TargetReport> {
        let mut report = TargetReport::new(target);

        trace.line(&format!(
            "Enrolling {} to Course ID {} with Role ID {} through Ilios Sync ID {}.",
            target.effective_role_mode().audience(),
            target.roster_id,
            target.role_id,
            target.instance_id
        ));

        let expansion = GroupExpander::new(self.client.as_ref())
            .with_max_depth(self.max_depth)
            .expand_detailed(target)
            .await?;
        report.stale_references = expansion.stale_references;

        let mapping = IdentityMapper::new(self.client.as_ref(), self.accounts.as_ref())
            .map(&expansion.users)
            .await?;
        report.remote_users_found = expansion.users.len().saturating_sub(mapping.missing.len());
        report.unmapped = mapping.unmapped.len();

        trace.line(&format!("{} Ilios users found.", report.remote_users_found));
        for unmapped in mapping.unmapped_errors() {
            debug!(error = %unmapped, "Excluding Ilios user");
        }

        let lock = self.roster_lock(target.roster_id);
        let _guard = lock.lock().await;

        let context = RoleContext {
            roster_id: target.roster_id,
            instance_id: target.instance_id,
        };
        let entries = self.roster.enrolments(target.roster_id).await?;
        let assignments = self.roster.role_assignments(&context).await?;
        let role_name = self
            .roster
            .role_name(target.role_id)
            .await?
            .unwrap_or_else(|| target.role_id.to_string());

        let plan = Reconciler::new(target)
            .with_removal_policy(self.removal_policy)
            .plan(
                &mapping.desired_accounts(),
                &mapping.disabled_accounts(),
                &entries,
                &assignments,
            );
        debug!(
            enrol = plan.enrol_phase.len(),
            removal = plan.removal_phase.len(),
            "Planned roster mutations"
        );

        let apply = Apply {
            roster: self.roster.as_ref(),
            target,
            context: &context,
            role_name: &role_name,
            trace,
        };

        // Accounts with a rejected mutation get no further changes in this run.
        let mut rejected: BTreeSet<AccountId> = BTreeSet::new();

        apply
            .run_phase(&plan.enrol_phase, Phase::Enrol, &mut rejected, &mut report)
            .await;
        trace.line(&format!(
            "Finished enrolling users to Course ID {} through Ilios Sync ID {}.",
            target.roster_id, target.instance_id
        ));

        trace.line(&format!(
            "Unenrolling users from Course ID {} with Role ID {} that no longer associate with Ilios Sync ID {}.",
            target.roster_id, target.role_id, target.instance_id
        ));
        apply
            .run_phase(&plan.removal_phase, Phase::Removal, &mut rejected, &mut report)
            .await;
        trace.line(&format!(
            "Finished unenrolling users from Course ID {} through Ilios Sync ID {}.",
            target.roster_id, target.instance_id
        ));

        info!(
            found = report.remote_users_found,
            unmapped = report.unmapped,
            applied = report.applied.len(),
            failed = report.failed.len(),
            "Sync target complete"
        );
        Ok(report)
    }

    fn roster_lock(&self, roster_id: RosterId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.roster_locks.lock().expect("lock poisoned");
        Arc::clone(locks.entry(roster_id).or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Enrol,
    Removal,
}

/// Applies single mutations for one target and writes their trace lines.
struct Apply<'a> {
    roster: &'a dyn RosterStore,
    target: &'a SyncTarget,
    context: &'a RoleContext,
    role_name: &'a str,
    trace: &'a dyn ProgressTrace,
}

impl Apply<'_> {
    /// Apply a phase in order, skipping accounts that already had a rejection.
    async fn run_phase(
        &self,
        mutations: &[Mutation],
        phase: Phase,
        rejected: &mut BTreeSet<AccountId>,
        report: &mut TargetReport,
    ) {
        for mutation in mutations {
            if rejected.contains(&mutation.account) {
                debug!(
                    op = %mutation.op,
                    account_id = %mutation.account,
                    "Skipping mutation after earlier failure for account"
                );
                continue;
            }
            if !self.run(*mutation, phase, report).await {
                rejected.insert(mutation.account);
            }
        }
    }

    /// Apply one mutation. Returns whether the roster accepted it.
    async fn run(&self, mutation: Mutation, phase: Phase, report: &mut TargetReport) -> bool {
        let account = mutation.account;
        let roster_id = self.target.roster_id;
        let enrolment = EnrolmentRef {
            roster_id,
            account_id: account,
            instance_id: self.target.instance_id,
        };

        let line = match mutation.op {
            MutationOp::Enrol => format!(
                "enrolling with {} status: userid {account} ==> courseid {roster_id}",
                EnrolmentStatus::Active.code()
            ),
            MutationOp::Reactivate => {
                format!("unsuspending: userid {account} ==> courseid {roster_id}")
            }
            MutationOp::Suspend if phase == Phase::Enrol => format!(
                "Suspending enrollment for disabled Ilios user: userid  {account} ==> courseid {roster_id}."
            ),
            MutationOp::Suspend => {
                format!("suspending: userid {account} ==> courseid {roster_id}")
            }
            MutationOp::AssignRole => {
                format!("assigning role: {account} ==> {roster_id} as {}", self.role_name)
            }
            MutationOp::UnassignRole => {
                format!("unassigning role: {account} ==> {roster_id} as {}", self.role_name)
            }
            MutationOp::Unenrol => format!(
                "unenrolling: {account} ==> {roster_id} via Ilios {} {}",
                self.target.remote_ref.kind, self.target.remote_ref.id
            ),
        };
        self.trace.line(&line);

        let result = match mutation.op {
            MutationOp::Enrol => self.roster.enrol(&enrolment).await,
            MutationOp::Reactivate => {
                self.roster
                    .set_status(&enrolment, EnrolmentStatus::Active)
                    .await
            }
            MutationOp::Suspend => {
                self.roster
                    .set_status(&enrolment, EnrolmentStatus::Suspended)
                    .await
            }
            MutationOp::Unenrol => self.roster.unenrol(&enrolment).await,
            MutationOp::AssignRole => {
                self.roster
                    .assign_role(account, self.target.role_id, self.context)
                    .await
            }
            MutationOp::UnassignRole => {
                self.roster
                    .unassign_role(account, self.target.role_id, self.context)
                    .await
            }
        };

        match result {
            Ok(()) => {
                report.applied.push(mutation);
                true
            }
            Err(e) => {
                let message = match e {
                    IliosError::MutationFailure { message, .. } => message,
                    other => other.to_string(),
                };
                error!(
                    op = %mutation.op,
                    account_id = %account,
                    component = self.context.component(),
                    error = %message,
                    "Roster mutation failed"
                );
                self.trace.line(&format!(
                    "failed to {}: {account} ==> {roster_id}: {message}",
                    mutation.op
                ));
                report.failed.push(FailedMutation { mutation, message });
                false
            }
        }
    }
}
