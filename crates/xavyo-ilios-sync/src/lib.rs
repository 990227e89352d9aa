//! Ilios roster synchronization for xavyo
//!
//! Keeps local course rosters in line with cohort and learner-group
//! membership published by an Ilios curriculum server.
//!
//! # Pipeline
//!
//! For each configured [`SyncTarget`]:
//!
//! 1. [`GroupExpander`] resolves the Ilios group to the qualifying user ids,
//!    walking nested learner groups, offerings, ILM sessions and instructor
//!    groups with memoized, batched requests.
//! 2. [`IdentityMapper`] joins those users to local accounts on campus id.
//! 3. [`Reconciler`] diffs the result against the roster and produces a
//!    two-phase [`MutationPlan`].
//! 4. [`SyncDriver`] applies the plan through a [`RosterStore`] and writes
//!    progress lines to a [`ProgressTrace`].
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use xavyo_ilios_sync::{
//!     IliosClient, IliosConfig, InMemoryRoster, SyncDriver, SyncTarget, TracingTrace,
//! };
//!
//! # async fn example(targets: Vec<SyncTarget>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = IliosConfig::from_env()?;
//! let client = IliosClient::new(&config)?;
//! let accounts: HashMap<String, xavyo_ilios_sync::AccountId> = HashMap::new();
//!
//! let driver = SyncDriver::from_config(
//!     &config,
//!     Arc::new(client),
//!     Arc::new(accounts),
//!     Arc::new(InMemoryRoster::new()),
//! );
//! let summary = driver.sync_all(&targets, None, &TracingTrace).await;
//! println!("{} targets synced, {} errors", summary.synced(), summary.error_count());
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod expander;
mod identity;
mod ids;
pub mod logging;
mod models;
mod plan;
mod reconciler;
mod roster;
mod sync;
mod target;
mod trace;

// Re-exports
pub use client::{DirectoryClient, IliosClient, ID_FILTER_PARAM};
pub use config::{ApiToken, ConfigError, IliosConfig};
pub use error::{IliosError, IliosResult};
pub use expander::{Expansion, GroupExpander, DEFAULT_MAX_DEPTH};
pub use identity::{AccountDirectory, IdentityMapper, IdentityMapping};
pub use ids::{AccountId, InstanceId, RemoteId, RoleId, RosterId};
pub use models::{
    Cohort, InstructorGroup, LearnerGroup, RemoteNode, RemoteUser, ResourceKind, TeachingEvent,
};
pub use plan::{Mutation, MutationOp, MutationPlan};
pub use reconciler::{
    transition, AccountState, Presence, Reconciler, RemovalPolicy, Standing, Transition,
};
pub use roster::{
    EnrolmentRef, EnrolmentStatus, InMemoryRoster, RoleAssignment, RoleContext, RosterEntry,
    RosterStore, ROLE_COMPONENT,
};
pub use sync::{FailedMutation, SyncDriver, SyncSummary, TargetFailure, TargetReport};
pub use target::{GroupKind, RemoteRef, RoleMode, SyncTarget};
pub use trace::{BufferedTrace, ProgressTrace, TracingTrace};
