//! Shared fixtures for Ilios sync integration tests.
//!
//! [`MockIlios`] wraps a wiremock server that answers the v3 endpoints the
//! engine reads. Every mounted response expects to be hit exactly once per
//! sync run, so a test fails on drop if a record is fetched twice.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use xavyo_ilios_sync::{
    AccountId, ApiToken, IliosClient, IliosConfig, InMemoryRoster, InstanceId, RoleId, RosterId,
    SyncDriver, ID_FILTER_PARAM,
};

pub const TOKEN: &str = "test-token-123";
pub const COURSE: RosterId = RosterId::new(2);
pub const INSTANCE: InstanceId = InstanceId::new(1);
pub const STUDENT_ROLE: RoleId = RoleId::new(5);

/// Matches a batch request whose `filters[id][]` values are exactly `ids`, in order.
pub struct IdFilter(pub Vec<u64>);

impl Match for IdFilter {
    fn matches(&self, request: &Request) -> bool {
        let ids: Vec<String> = request
            .url
            .query_pairs()
            .filter(|(key, _)| key == ID_FILTER_PARAM)
            .map(|(_, value)| value.into_owned())
            .collect();
        let expected: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        ids == expected
    }
}

/// A mock Ilios API.
pub struct MockIlios {
    server: MockServer,
    hits: u64,
}

impl MockIlios {
    pub async fn new() -> Self {
        Self {
            server: MockServer::start().await,
            hits: 1,
        }
    }

    /// Expect each mounted response to be hit `hits` times (for repeated runs).
    pub fn expecting(mut self, hits: u64) -> Self {
        self.hits = hits;
        self
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn config(&self) -> IliosConfig {
        IliosConfig::new(&self.uri(), ApiToken::new(TOKEN)).unwrap()
    }

    pub fn client(&self) -> IliosClient {
        IliosClient::with_http_client(&self.config(), reqwest::Client::new())
    }

    /// Mount `GET /api/v3/{endpoint}/{id}` returning `record` under `collection_key`.
    pub async fn mock_record(&self, endpoint: &str, collection_key: &str, id: u64, record: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v3/{endpoint}/{id}")))
            .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ collection_key: [record] })))
            .expect(self.hits)
            .mount(&self.server)
            .await;
    }

    /// Mount `GET /api/v3/{endpoint}?filters[id][]=...` for exactly `ids`.
    pub async fn mock_batch(&self, endpoint: &str, collection_key: &str, ids: &[u64], records: Vec<Value>) {
        self.mock_batch_times(endpoint, collection_key, ids, records, self.hits)
            .await;
    }

    /// Like [`mock_batch`](Self::mock_batch), expected exactly `hits` times.
    pub async fn mock_batch_times(
        &self,
        endpoint: &str,
        collection_key: &str,
        ids: &[u64],
        records: Vec<Value>,
        hits: u64,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v3/{endpoint}")))
            .and(IdFilter(ids.to_vec()))
            .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ collection_key: records })))
            .expect(hits)
            .mount(&self.server)
            .await;
    }

    /// Fail the test if any request path matches `pattern`.
    pub async fn expect_no_request(&self, pattern: &str) {
        Mock::given(method("GET"))
            .and(path_regex(pattern))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&self.server)
            .await;
    }

    pub async fn mock_status(&self, endpoint_path: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(endpoint_path.to_string()))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_cohort(&self, id: u64, users: &[u64]) {
        self.mock_record("cohorts", "cohorts", id, json!({ "id": id, "users": refs(users) }))
            .await;
    }

    pub async fn mock_learner_group(&self, record: Value) {
        let id = record["id"].as_u64().unwrap();
        self.mock_record("learnergroups", "learnerGroups", id, record).await;
    }

    pub async fn mock_offerings(&self, ids: &[u64], records: Vec<Value>) {
        self.mock_batch("offerings", "offerings", ids, records).await;
    }

    pub async fn mock_ilm_sessions(&self, ids: &[u64], records: Vec<Value>) {
        self.mock_batch("ilmsessions", "ilmSessions", ids, records).await;
    }

    pub async fn mock_instructor_group(&self, id: u64, users: &[u64]) {
        self.mock_batch(
            "instructorgroups",
            "instructorGroups",
            &[id],
            vec![json!({ "id": id, "users": refs(users) })],
        )
        .await;
    }

    /// Mount the user batch for `ids`; ids in `disabled` come back disabled.
    pub async fn mock_users(&self, ids: &[u64], disabled: &[u64]) {
        let records = ids
            .iter()
            .map(|id| user_json(*id, !disabled.contains(id)))
            .collect();
        self.mock_batch("users", "users", ids, records).await;
    }
}

/// References are serialized as strings, as Ilios does.
pub fn refs(ids: &[u64]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

pub fn campus_id(remote_id: u64) -> String {
    format!("xx100000{remote_id}")
}

pub fn user_json(id: u64, enabled: bool) -> Value {
    json!({ "id": id, "campusId": campus_id(id), "enabled": enabled })
}

pub fn teaching_event(
    id: u64,
    instructors: &[u64],
    instructor_groups: &[u64],
    learners: &[u64],
    learner_groups: &[u64],
) -> Value {
    json!({
        "id": id,
        "instructors": refs(instructors),
        "instructorGroups": refs(instructor_groups),
        "learners": refs(learners),
        "learnerGroups": refs(learner_groups),
    })
}

/// Local account for Ilios user `n`. Local ids are offset so the two id
/// spaces never coincide.
pub fn account(remote_id: u64) -> AccountId {
    AccountId::new(100 + remote_id)
}

/// Local accounts for Ilios users `1..=n`, keyed by campus id.
pub fn local_accounts(n: u64) -> HashMap<String, AccountId> {
    (1..=n).map(|i| (campus_id(i), account(i))).collect()
}

pub fn roster() -> Arc<InMemoryRoster> {
    Arc::new(InMemoryRoster::new().with_role_name(STUDENT_ROLE, "student"))
}

pub fn driver(mock: &MockIlios, accounts: HashMap<String, AccountId>, roster: Arc<InMemoryRoster>) -> SyncDriver {
    SyncDriver::from_config(&mock.config(), Arc::new(mock.client()), Arc::new(accounts), roster)
}
