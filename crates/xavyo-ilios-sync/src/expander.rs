//! Group expansion: resolve a sync target to the Ilios users that qualify.
//!
//! Learner groups form a hierarchy through `children`, and offerings or ILM
//! sessions may point back into it through their `learnerGroups`. The graph is
//! walked depth-first with an explicit stack, a visited set and a depth cap.
//! Every record is fetched at most once per expansion: fetched nodes are
//! memoized by `(kind, id)`, including misses.
//!
//! References are batched per visited group: one request per resource kind for
//! the ids that group needs and that have not been seen yet. Child groups are
//! fetched one at a time because the API cannot embed them in a batch.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, instrument, warn};

use crate::client::DirectoryClient;
use crate::error::{IliosError, IliosResult};
use crate::ids::RemoteId;
use crate::models::{LearnerGroup, RemoteNode, ResourceKind, TeachingEvent};
use crate::target::{GroupKind, RoleMode, SyncTarget};

/// Default cap on learner-group nesting.
pub const DEFAULT_MAX_DEPTH: u32 = 32;

/// Outcome of one expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    /// Qualifying Ilios user ids.
    pub users: BTreeSet<RemoteId>,
    /// Learner groups visited, including the entry group.
    pub groups_visited: usize,
    /// Requests issued to the directory.
    pub requests: usize,
    /// Referenced records that no longer exist remotely.
    pub stale_references: usize,
    /// Whether the depth cap stopped the walk.
    pub depth_limited: bool,
}

/// Resolves sync targets to Ilios user ids.
pub struct GroupExpander<'a, C: DirectoryClient + ?Sized> {
    client: &'a C,
    max_depth: u32,
}

impl<'a, C: DirectoryClient + ?Sized> GroupExpander<'a, C> {
    #[must_use]
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The set of Ilios user ids that should hold the target's role.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` when the target's own cohort or learner group is
    /// gone, and with `RemoteUnavailable` when the directory cannot be reached.
    pub async fn expand(&self, target: &SyncTarget) -> IliosResult<BTreeSet<RemoteId>> {
        Ok(self.expand_detailed(target).await?.users)
    }

    /// Like [`expand`](Self::expand), with traversal statistics.
    #[instrument(skip(self, target), fields(instance_id = %target.instance_id, synctype = %target.remote_ref.kind, remote_id = %target.remote_ref.id))]
    pub async fn expand_detailed(&self, target: &SyncTarget) -> IliosResult<Expansion> {
        let mut memo = NodeMemo::new(self.client);
        let mut expansion = Expansion::default();

        match target.remote_ref.kind {
            GroupKind::Cohort => {
                let node = memo.fetch_entry(ResourceKind::Cohort, target.remote_ref.id).await?;
                let cohort = node.as_cohort().ok_or_else(|| unexpected(&node))?;
                expansion.users.extend(cohort.users.iter().copied());
            }
            GroupKind::LearnerGroup => {
                self.walk_learner_groups(
                    &mut memo,
                    target.remote_ref.id,
                    target.effective_role_mode(),
                    &mut expansion,
                )
                .await?;
            }
        }

        expansion.requests = memo.requests;
        expansion.stale_references = memo.stale;

        debug!(
            users = expansion.users.len(),
            groups = expansion.groups_visited,
            requests = expansion.requests,
            stale = expansion.stale_references,
            "Expansion complete"
        );
        Ok(expansion)
    }

    async fn walk_learner_groups(
        &self,
        memo: &mut NodeMemo<'a, C>,
        entry_id: RemoteId,
        mode: RoleMode,
        expansion: &mut Expansion,
    ) -> IliosResult<()> {
        let entry = memo.fetch_entry(ResourceKind::LearnerGroup, entry_id).await?;
        if entry.as_learner_group().is_none() {
            return Err(unexpected(&entry));
        }

        let mut visited: HashSet<RemoteId> = HashSet::new();
        let mut stack: Vec<(RemoteId, u32)> = vec![(entry_id, 0)];

        while let Some((group_id, depth)) = stack.pop() {
            if !visited.insert(group_id) {
                continue;
            }

            let Some(node) = memo.get(ResourceKind::LearnerGroup, group_id).await? else {
                continue;
            };
            let Some(group) = node.as_learner_group() else {
                return Err(unexpected(&node));
            };
            expansion.groups_visited += 1;

            let events = self.teaching_events(memo, group).await?;

            let mut descend: Vec<RemoteId> = group.children.clone();
            match mode {
                RoleMode::Learners => {
                    expansion.users.extend(group.users.iter().copied());
                    for event in &events {
                        expansion.users.extend(event.learners.iter().copied());
                        descend.extend(event.learner_groups.iter().copied());
                    }
                }
                RoleMode::Instructors => {
                    expansion.users.extend(group.instructors.iter().copied());

                    let mut instructor_group_ids: BTreeSet<RemoteId> =
                        group.instructor_groups.iter().copied().collect();
                    for event in &events {
                        expansion.users.extend(event.instructors.iter().copied());
                        instructor_group_ids.extend(event.instructor_groups.iter().copied());
                    }

                    memo.prefetch(ResourceKind::InstructorGroup, &instructor_group_ids)
                        .await?;
                    for id in &instructor_group_ids {
                        if let Some(instructors) = memo
                            .cached(ResourceKind::InstructorGroup, *id)
                            .and_then(RemoteNode::as_instructor_group)
                        {
                            expansion.users.extend(instructors.users.iter().copied());
                        }
                    }
                }
            }

            descend.retain(|id| !visited.contains(id));
            if descend.is_empty() {
                continue;
            }
            if depth >= self.max_depth {
                warn!(
                    group_id = %group_id,
                    depth,
                    skipped = descend.len(),
                    "Learner group nesting exceeds max depth, not descending"
                );
                expansion.depth_limited = true;
                continue;
            }

            // Reverse so the first child is popped first.
            stack.extend(descend.into_iter().rev().map(|id| (id, depth + 1)));
        }

        Ok(())
    }

    /// Offerings and ILM sessions of a group that still exist.
    async fn teaching_events(
        &self,
        memo: &mut NodeMemo<'a, C>,
        group: &LearnerGroup,
    ) -> IliosResult<Vec<TeachingEvent>> {
        let offering_ids: BTreeSet<RemoteId> = group.offerings.iter().copied().collect();
        let session_ids: BTreeSet<RemoteId> = group.ilm_sessions.iter().copied().collect();

        memo.prefetch(ResourceKind::Offering, &offering_ids).await?;
        memo.prefetch(ResourceKind::IlmSession, &session_ids).await?;

        let offerings = offering_ids
            .iter()
            .filter_map(|id| memo.cached(ResourceKind::Offering, *id));
        let sessions = session_ids
            .iter()
            .filter_map(|id| memo.cached(ResourceKind::IlmSession, *id));

        Ok(offerings
            .chain(sessions)
            .filter_map(RemoteNode::as_teaching_event)
            .cloned()
            .collect())
    }
}

fn unexpected(node: &RemoteNode) -> IliosError {
    IliosError::Parse(format!(
        "unexpected {} record {} in response",
        node.kind(),
        node.id()
    ))
}

/// Per-expansion record cache. `None` marks a record known not to exist.
struct NodeMemo<'a, C: DirectoryClient + ?Sized> {
    client: &'a C,
    nodes: HashMap<(ResourceKind, RemoteId), Option<RemoteNode>>,
    requests: usize,
    stale: usize,
}

impl<'a, C: DirectoryClient + ?Sized> NodeMemo<'a, C> {
    fn new(client: &'a C) -> Self {
        Self {
            client,
            nodes: HashMap::new(),
            requests: 0,
            stale: 0,
        }
    }

    fn cached(&self, kind: ResourceKind, id: RemoteId) -> Option<&RemoteNode> {
        self.nodes.get(&(kind, id)).and_then(Option::as_ref)
    }

    /// Fetch the target's own record. A miss is an error here.
    async fn fetch_entry(&mut self, kind: ResourceKind, id: RemoteId) -> IliosResult<RemoteNode> {
        if let Some(Some(node)) = self.nodes.get(&(kind, id)) {
            return Ok(node.clone());
        }

        self.requests += 1;
        let node = self.client.fetch(kind, id).await?;
        self.nodes.insert((kind, id), Some(node.clone()));
        Ok(node)
    }

    /// Fetch a referenced record. A miss is remembered and yields `None`.
    async fn get(&mut self, kind: ResourceKind, id: RemoteId) -> IliosResult<Option<RemoteNode>> {
        if let Some(entry) = self.nodes.get(&(kind, id)) {
            return Ok(entry.clone());
        }

        self.requests += 1;
        match self.client.fetch(kind, id).await {
            Ok(node) => {
                self.nodes.insert((kind, id), Some(node.clone()));
                Ok(Some(node))
            }
            Err(e) if e.is_not_found() => {
                debug!(kind = %kind, id = %id, "Referenced record not found, skipping");
                self.stale += 1;
                self.nodes.insert((kind, id), None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Batch-fetch every id not seen yet in a single request.
    async fn prefetch(&mut self, kind: ResourceKind, ids: &BTreeSet<RemoteId>) -> IliosResult<()> {
        let missing: BTreeSet<RemoteId> = ids
            .iter()
            .copied()
            .filter(|id| !self.nodes.contains_key(&(kind, *id)))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        self.requests += 1;
        let mut found = match self.client.fetch_batch(kind, &missing).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => HashMap::new(),
            Err(e) => return Err(e),
        };

        for id in missing {
            let node = found.remove(&id);
            if node.is_none() {
                debug!(kind = %kind, id = %id, "Referenced record not found, skipping");
                self.stale += 1;
            }
            self.nodes.insert((kind, id), node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{InstanceId, RoleId, RosterId};
    use crate::models::{Cohort, InstructorGroup};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn ids(raw: &[u64]) -> Vec<RemoteId> {
        raw.iter().copied().map(RemoteId::new).collect()
    }

    fn set(raw: &[u64]) -> BTreeSet<RemoteId> {
        raw.iter().copied().map(RemoteId::new).collect()
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Fetch(ResourceKind, u64),
        Batch(ResourceKind, Vec<u64>),
    }

    /// In-memory directory recording every call.
    #[derive(Default)]
    struct FakeDirectory {
        nodes: HashMap<(ResourceKind, RemoteId), RemoteNode>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeDirectory {
        fn with(mut self, node: RemoteNode) -> Self {
            self.nodes.insert((node.kind(), node.id()), node);
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn fetch(&self, kind: ResourceKind, id: RemoteId) -> IliosResult<RemoteNode> {
            self.calls.lock().unwrap().push(Call::Fetch(kind, id.get()));
            self.nodes
                .get(&(kind, id))
                .cloned()
                .ok_or(IliosError::NotFound { kind, id })
        }

        async fn fetch_batch(
            &self,
            kind: ResourceKind,
            ids: &BTreeSet<RemoteId>,
        ) -> IliosResult<HashMap<RemoteId, RemoteNode>> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Batch(kind, ids.iter().map(RemoteId::get).collect()));
            Ok(ids
                .iter()
                .filter_map(|id| self.nodes.get(&(kind, *id)).map(|n| (*id, n.clone())))
                .collect())
        }
    }

    fn group(id: u64) -> LearnerGroup {
        LearnerGroup {
            id: RemoteId::new(id),
            children: vec![],
            users: vec![],
            instructors: vec![],
            instructor_groups: vec![],
            offerings: vec![],
            ilm_sessions: vec![],
        }
    }

    fn event(id: u64) -> TeachingEvent {
        TeachingEvent {
            id: RemoteId::new(id),
            instructors: vec![],
            instructor_groups: vec![],
            learners: vec![],
            learner_groups: vec![],
        }
    }

    fn instructor_group(id: u64, users: &[u64]) -> RemoteNode {
        RemoteNode::InstructorGroup(InstructorGroup {
            id: RemoteId::new(id),
            users: ids(users),
        })
    }

    fn learners_target(group_id: u64) -> SyncTarget {
        SyncTarget::learner_group(
            InstanceId::new(1),
            RosterId::new(1),
            RemoteId::new(group_id),
            RoleMode::Learners,
            RoleId::new(5),
        )
    }

    fn instructors_target(group_id: u64) -> SyncTarget {
        SyncTarget::learner_group(
            InstanceId::new(1),
            RosterId::new(1),
            RemoteId::new(group_id),
            RoleMode::Instructors,
            RoleId::new(3),
        )
    }

    /// Root 1 with children 2 and 3, offerings 1-3 and ILM sessions 1-3.
    fn nested_instructor_fixture() -> FakeDirectory {
        let mut root = group(1);
        root.children = ids(&[2, 3]);
        root.offerings = ids(&[1, 2]);
        root.ilm_sessions = ids(&[1, 2]);

        let mut child2 = group(2);
        child2.offerings = ids(&[3]);
        child2.instructors = ids(&[2]);
        child2.instructor_groups = ids(&[2]);

        let mut child3 = group(3);
        child3.ilm_sessions = ids(&[3]);
        child3.instructors = ids(&[3]);
        child3.instructor_groups = ids(&[3]);

        let mut offering1 = event(1);
        offering1.instructor_groups = ids(&[1]);
        offering1.learner_groups = ids(&[1]);
        let mut offering2 = event(2);
        offering2.instructors = ids(&[1]);
        offering2.learner_groups = ids(&[1]);
        let mut offering3 = event(3);
        offering3.learner_groups = ids(&[2]);

        let mut session1 = event(1);
        session1.instructor_groups = ids(&[1]);
        session1.learner_groups = ids(&[1]);
        let mut session2 = event(2);
        session2.instructors = ids(&[1]);
        session2.learner_groups = ids(&[1]);

        FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(root))
            .with(RemoteNode::LearnerGroup(child2))
            .with(RemoteNode::LearnerGroup(child3))
            .with(RemoteNode::Offering(offering1))
            .with(RemoteNode::Offering(offering2))
            .with(RemoteNode::Offering(offering3))
            .with(RemoteNode::IlmSession(session1))
            .with(RemoteNode::IlmSession(session2))
            .with(RemoteNode::IlmSession(event(3)))
            .with(instructor_group(1, &[4, 5]))
            .with(instructor_group(2, &[6, 7]))
            .with(instructor_group(3, &[8, 9]))
    }

    #[tokio::test]
    async fn test_cohort_users_deduplicated() {
        let directory = FakeDirectory::default().with(RemoteNode::Cohort(Cohort {
            id: RemoteId::new(1),
            users: ids(&[2, 3, 4, 5, 3]),
        }));
        let target = SyncTarget::cohort(
            InstanceId::new(1),
            RosterId::new(1),
            RemoteId::new(1),
            RoleId::new(5),
        );

        let users = GroupExpander::new(&directory).expand(&target).await.unwrap();
        assert_eq!(users, set(&[2, 3, 4, 5]));
        assert_eq!(directory.calls(), vec![Call::Fetch(ResourceKind::Cohort, 1)]);
    }

    #[tokio::test]
    async fn test_nested_instructors() {
        let directory = nested_instructor_fixture();
        let expansion = GroupExpander::new(&directory)
            .expand_detailed(&instructors_target(1))
            .await
            .unwrap();

        assert_eq!(expansion.users, set(&[1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert_eq!(expansion.groups_visited, 3);
        assert_eq!(expansion.stale_references, 0);
    }

    #[tokio::test]
    async fn test_every_record_fetched_once() {
        let directory = nested_instructor_fixture();
        GroupExpander::new(&directory)
            .expand(&instructors_target(1))
            .await
            .unwrap();

        let calls = directory.calls();
        let entry_fetches = calls
            .iter()
            .filter(|c| **c == Call::Fetch(ResourceKind::LearnerGroup, 1))
            .count();
        assert_eq!(entry_fetches, 1, "entry group must not be fetched twice");

        let mut seen = HashSet::new();
        for call in &calls {
            match call {
                Call::Fetch(kind, id) => assert!(seen.insert((*kind, *id)), "{call:?} repeated"),
                Call::Batch(kind, batch) => {
                    for id in batch {
                        assert!(seen.insert((*kind, *id)), "{kind} {id} fetched twice");
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_one_batch_per_kind_per_group() {
        let directory = nested_instructor_fixture();
        GroupExpander::new(&directory)
            .expand(&instructors_target(1))
            .await
            .unwrap();

        let calls = directory.calls();
        assert!(calls.contains(&Call::Batch(ResourceKind::Offering, vec![1, 2])));
        assert!(calls.contains(&Call::Batch(ResourceKind::IlmSession, vec![1, 2])));
        assert!(!calls.contains(&Call::Fetch(ResourceKind::Offering, 1)));
        assert!(!calls.contains(&Call::Fetch(ResourceKind::Offering, 2)));
        // Root's own instructor groups and its events' groups share one request.
        assert!(calls.contains(&Call::Batch(ResourceKind::InstructorGroup, vec![1])));
    }

    #[tokio::test]
    async fn test_learners_follow_offering_groups() {
        let mut root = group(1);
        root.offerings = ids(&[10]);
        let mut offering = event(10);
        offering.learners = ids(&[100]);
        offering.learner_groups = ids(&[2, 1]);
        let mut linked = group(2);
        linked.ilm_sessions = ids(&[20]);
        let mut session = event(20);
        session.learners = ids(&[200, 201]);
        session.instructors = ids(&[999]);

        let directory = FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(root))
            .with(RemoteNode::LearnerGroup(linked))
            .with(RemoteNode::Offering(offering))
            .with(RemoteNode::IlmSession(session));

        let users = GroupExpander::new(&directory)
            .expand(&learners_target(1))
            .await
            .unwrap();
        assert_eq!(users, set(&[100, 200, 201]));
    }

    #[tokio::test]
    async fn test_group_without_events_contributes_only_descendants() {
        let mut root = group(1);
        root.children = ids(&[2]);
        let mut child = group(2);
        child.offerings = ids(&[5]);
        let mut offering = event(5);
        offering.learners = ids(&[50, 51]);

        let directory = FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(root))
            .with(RemoteNode::LearnerGroup(child))
            .with(RemoteNode::Offering(offering));

        let users = GroupExpander::new(&directory)
            .expand(&learners_target(1))
            .await
            .unwrap();
        assert_eq!(users, set(&[50, 51]));
    }

    #[tokio::test]
    async fn test_missing_offering_does_not_abort_siblings() {
        let mut root = group(1);
        root.offerings = ids(&[1, 2]);
        let mut offering = event(2);
        offering.learners = ids(&[7]);

        let directory = FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(root))
            .with(RemoteNode::Offering(offering));

        let expansion = GroupExpander::new(&directory)
            .expand_detailed(&learners_target(1))
            .await
            .unwrap();
        assert_eq!(expansion.users, set(&[7]));
        assert_eq!(expansion.stale_references, 1);
    }

    #[tokio::test]
    async fn test_missing_child_group_is_skipped() {
        let mut root = group(1);
        root.children = ids(&[2, 3]);
        let mut child = group(3);
        child.users = ids(&[30]);

        let directory = FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(root))
            .with(RemoteNode::LearnerGroup(child));

        let expansion = GroupExpander::new(&directory)
            .expand_detailed(&learners_target(1))
            .await
            .unwrap();
        assert_eq!(expansion.users, set(&[30]));
        assert_eq!(expansion.groups_visited, 2);
        assert_eq!(expansion.stale_references, 1);
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_found() {
        let directory = FakeDirectory::default();
        let err = GroupExpander::new(&directory)
            .expand(&learners_target(42))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cycle_is_visited_once() {
        let mut a = group(1);
        a.children = ids(&[2]);
        a.users = ids(&[10]);
        let mut b = group(2);
        b.children = ids(&[1]);
        b.users = ids(&[20]);

        let directory = FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(a))
            .with(RemoteNode::LearnerGroup(b));

        let expansion = GroupExpander::new(&directory)
            .expand_detailed(&learners_target(1))
            .await
            .unwrap();
        assert_eq!(expansion.users, set(&[10, 20]));
        assert_eq!(expansion.groups_visited, 2);
        assert_eq!(directory.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_depth_cap_stops_descent() {
        let mut a = group(1);
        a.children = ids(&[2]);
        a.users = ids(&[10]);
        let mut b = group(2);
        b.children = ids(&[3]);
        b.users = ids(&[20]);
        let mut c = group(3);
        c.users = ids(&[30]);

        let directory = FakeDirectory::default()
            .with(RemoteNode::LearnerGroup(a))
            .with(RemoteNode::LearnerGroup(b))
            .with(RemoteNode::LearnerGroup(c));

        let expansion = GroupExpander::new(&directory)
            .with_max_depth(1)
            .expand_detailed(&learners_target(1))
            .await
            .unwrap();
        assert_eq!(expansion.users, set(&[10, 20]));
        assert!(expansion.depth_limited);
    }

    #[tokio::test]
    async fn test_empty_group_is_valid() {
        let directory = FakeDirectory::default().with(RemoteNode::LearnerGroup(group(1)));
        let users = GroupExpander::new(&directory)
            .expand(&instructors_target(1))
            .await
            .unwrap();
        assert!(users.is_empty());
    }
}
