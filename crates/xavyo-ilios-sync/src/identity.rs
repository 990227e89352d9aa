//! Mapping between Ilios users and local accounts.
//!
//! Remote users are joined to local accounts on the campus id, which the
//! local side stores as the account's external identifier (`idnumber`).

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, instrument};

use crate::client::DirectoryClient;
use crate::error::{IliosError, IliosResult};
use crate::ids::{AccountId, RemoteId};
use crate::models::{RemoteNode, ResourceKind};

/// Lookup of local accounts by external identifier.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Local accounts for the given external ids. Unknown ids are absent.
    async fn accounts_by_external_id(
        &self,
        external_ids: &BTreeSet<String>,
    ) -> IliosResult<HashMap<String, AccountId>>;
}

#[async_trait]
impl AccountDirectory for HashMap<String, AccountId> {
    async fn accounts_by_external_id(
        &self,
        external_ids: &BTreeSet<String>,
    ) -> IliosResult<HashMap<String, AccountId>> {
        Ok(external_ids
            .iter()
            .filter_map(|ext| self.get(ext).map(|id| (ext.clone(), *id)))
            .collect())
    }
}

/// Result of mapping a desired set of remote users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapping {
    /// Enabled remote users with a local account.
    pub enabled: BTreeMap<RemoteId, AccountId>,
    /// Disabled remote users with a local account.
    pub disabled: BTreeMap<RemoteId, AccountId>,
    /// Remote users without a usable campus id or without a local account.
    pub unmapped: BTreeSet<RemoteId>,
    /// Referenced users the directory did not return.
    pub missing: BTreeSet<RemoteId>,
}

impl IdentityMapping {
    /// Accounts that should hold the role.
    #[must_use]
    pub fn desired_accounts(&self) -> BTreeSet<AccountId> {
        self.enabled.values().copied().collect()
    }

    /// Accounts whose remote user is disabled.
    ///
    /// An account also reached through an enabled remote user is desired and
    /// not listed here.
    #[must_use]
    pub fn disabled_accounts(&self) -> BTreeSet<AccountId> {
        let desired = self.desired_accounts();
        self.disabled
            .values()
            .copied()
            .filter(|account| !desired.contains(account))
            .collect()
    }

    /// One `UnmappedIdentity` per remote user that could not be mapped.
    #[must_use]
    pub fn unmapped_errors(&self) -> Vec<IliosError> {
        self.unmapped
            .iter()
            .map(|remote_id| IliosError::UnmappedIdentity {
                remote_id: *remote_id,
            })
            .collect()
    }
}

/// Maps remote user ids to local accounts.
pub struct IdentityMapper<'a, C: DirectoryClient + ?Sized, A: AccountDirectory + ?Sized> {
    client: &'a C,
    accounts: &'a A,
}

impl<'a, C, A> IdentityMapper<'a, C, A>
where
    C: DirectoryClient + ?Sized,
    A: AccountDirectory + ?Sized,
{
    #[must_use]
    pub fn new(client: &'a C, accounts: &'a A) -> Self {
        Self { client, accounts }
    }

    /// Resolve remote users with one batch user fetch and one account lookup.
    ///
    /// # Errors
    ///
    /// Fails only when the directory or the account lookup fails.
    #[instrument(skip(self, remote_ids), fields(count = remote_ids.len()))]
    pub async fn map(&self, remote_ids: &BTreeSet<RemoteId>) -> IliosResult<IdentityMapping> {
        let mut mapping = IdentityMapping::default();
        if remote_ids.is_empty() {
            return Ok(mapping);
        }

        let users = match self.client.fetch_batch(ResourceKind::User, remote_ids).await {
            Ok(users) => users,
            Err(e) if e.is_not_found() => HashMap::new(),
            Err(e) => return Err(e),
        };

        // (remote id, campus id, enabled)
        let mut candidates: Vec<(RemoteId, String, bool)> = Vec::with_capacity(users.len());
        for remote_id in remote_ids {
            let Some(user) = users.get(remote_id).and_then(RemoteNode::as_user) else {
                mapping.missing.insert(*remote_id);
                continue;
            };
            match user.external_id() {
                Some(external_id) => {
                    candidates.push((*remote_id, external_id.to_string(), user.enabled));
                }
                None => {
                    debug!(remote_id = %remote_id, "Ilios user has no campus id");
                    mapping.unmapped.insert(*remote_id);
                }
            }
        }

        let external_ids: BTreeSet<String> =
            candidates.iter().map(|(_, ext, _)| ext.clone()).collect();
        let accounts = if external_ids.is_empty() {
            HashMap::new()
        } else {
            self.accounts.accounts_by_external_id(&external_ids).await?
        };

        for (remote_id, external_id, enabled) in candidates {
            match accounts.get(&external_id) {
                Some(account) if enabled => {
                    mapping.enabled.insert(remote_id, *account);
                }
                Some(account) => {
                    mapping.disabled.insert(remote_id, *account);
                }
                None => {
                    debug!(remote_id = %remote_id, external_id = %external_id, "No local account for Ilios user");
                    mapping.unmapped.insert(remote_id);
                }
            }
        }

        debug!(
            enabled = mapping.enabled.len(),
            disabled = mapping.disabled.len(),
            unmapped = mapping.unmapped.len(),
            missing = mapping.missing.len(),
            "Mapped Ilios users"
        );
        Ok(mapping)
    }
}
