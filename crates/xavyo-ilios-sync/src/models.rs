//! Ilios resource records as returned by the v3 API.
//!
//! Records only carry id references to each other; nothing is embedded. The
//! expander resolves references lazily through the [`DirectoryClient`].
//!
//! [`DirectoryClient`]: crate::client::DirectoryClient

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IliosError, IliosResult};
use crate::ids::RemoteId;

/// Resource kinds exposed by the Ilios API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cohort,
    LearnerGroup,
    Offering,
    IlmSession,
    InstructorGroup,
    User,
}

impl ResourceKind {
    /// URL path segment for this kind.
    #[must_use]
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResourceKind::Cohort => "cohorts",
            ResourceKind::LearnerGroup => "learnergroups",
            ResourceKind::Offering => "offerings",
            ResourceKind::IlmSession => "ilmsessions",
            ResourceKind::InstructorGroup => "instructorgroups",
            ResourceKind::User => "users",
        }
    }

    /// Key of the record array in a response envelope.
    #[must_use]
    pub fn collection_key(&self) -> &'static str {
        match self {
            ResourceKind::Cohort => "cohorts",
            ResourceKind::LearnerGroup => "learnerGroups",
            ResourceKind::Offering => "offerings",
            ResourceKind::IlmSession => "ilmSessions",
            ResourceKind::InstructorGroup => "instructorGroups",
            ResourceKind::User => "users",
        }
    }

    /// Human readable name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cohort => "cohort",
            ResourceKind::LearnerGroup => "learner group",
            ResourceKind::Offering => "offering",
            ResourceKind::IlmSession => "ILM session",
            ResourceKind::InstructorGroup => "instructor group",
            ResourceKind::User => "user",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A flat group of users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    pub id: RemoteId,
    #[serde(default)]
    pub users: Vec<RemoteId>,
}

/// A nestable group whose members derive from linked teaching events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerGroup {
    pub id: RemoteId,
    /// Child learner groups, in API order.
    #[serde(default)]
    pub children: Vec<RemoteId>,
    /// Users assigned directly to the group.
    #[serde(default)]
    pub users: Vec<RemoteId>,
    #[serde(default)]
    pub instructors: Vec<RemoteId>,
    #[serde(default)]
    pub instructor_groups: Vec<RemoteId>,
    #[serde(default)]
    pub offerings: Vec<RemoteId>,
    #[serde(default)]
    pub ilm_sessions: Vec<RemoteId>,
}

/// An offering or ILM session. Both share the same reference layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeachingEvent {
    pub id: RemoteId,
    #[serde(default)]
    pub instructors: Vec<RemoteId>,
    #[serde(default)]
    pub instructor_groups: Vec<RemoteId>,
    #[serde(default)]
    pub learners: Vec<RemoteId>,
    #[serde(default)]
    pub learner_groups: Vec<RemoteId>,
}

/// A named set of instructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructorGroup {
    pub id: RemoteId,
    #[serde(default)]
    pub users: Vec<RemoteId>,
}

/// An Ilios user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub id: RemoteId,
    /// Campus identifier, joined against the local account id number.
    #[serde(default)]
    pub campus_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RemoteUser {
    /// The campus id if it is present and non-blank.
    #[must_use]
    pub fn external_id(&self) -> Option<&str> {
        self.campus_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Any record fetched from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteNode {
    Cohort(Cohort),
    LearnerGroup(LearnerGroup),
    Offering(TeachingEvent),
    IlmSession(TeachingEvent),
    InstructorGroup(InstructorGroup),
    User(RemoteUser),
}

impl RemoteNode {
    /// Decode one record of the given kind.
    pub fn from_value(kind: ResourceKind, value: serde_json::Value) -> IliosResult<Self> {
        Ok(match kind {
            ResourceKind::Cohort => Self::Cohort(serde_json::from_value(value)?),
            ResourceKind::LearnerGroup => Self::LearnerGroup(serde_json::from_value(value)?),
            ResourceKind::Offering => Self::Offering(serde_json::from_value(value)?),
            ResourceKind::IlmSession => Self::IlmSession(serde_json::from_value(value)?),
            ResourceKind::InstructorGroup => Self::InstructorGroup(serde_json::from_value(value)?),
            ResourceKind::User => Self::User(serde_json::from_value(value)?),
        })
    }

    /// Decode every record in a `{ "<collectionKey>": [...] }` envelope.
    ///
    /// A missing key is treated as an empty collection.
    pub fn from_envelope(kind: ResourceKind, mut body: serde_json::Value) -> IliosResult<Vec<Self>> {
        let records = match body.get_mut(kind.collection_key()) {
            Some(serde_json::Value::Array(items)) => std::mem::take(items),
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(IliosError::Parse(format!(
                    "expected array under '{}', got {}",
                    kind.collection_key(),
                    other
                )))
            }
        };

        records
            .into_iter()
            .map(|value| Self::from_value(kind, value))
            .collect()
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Cohort(_) => ResourceKind::Cohort,
            Self::LearnerGroup(_) => ResourceKind::LearnerGroup,
            Self::Offering(_) => ResourceKind::Offering,
            Self::IlmSession(_) => ResourceKind::IlmSession,
            Self::InstructorGroup(_) => ResourceKind::InstructorGroup,
            Self::User(_) => ResourceKind::User,
        }
    }

    #[must_use]
    pub fn id(&self) -> RemoteId {
        match self {
            Self::Cohort(c) => c.id,
            Self::LearnerGroup(g) => g.id,
            Self::Offering(e) | Self::IlmSession(e) => e.id,
            Self::InstructorGroup(g) => g.id,
            Self::User(u) => u.id,
        }
    }

    #[must_use]
    pub fn as_cohort(&self) -> Option<&Cohort> {
        match self {
            Self::Cohort(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_learner_group(&self) -> Option<&LearnerGroup> {
        match self {
            Self::LearnerGroup(g) => Some(g),
            _ => None,
        }
    }

    /// Offerings and ILM sessions.
    #[must_use]
    pub fn as_teaching_event(&self) -> Option<&TeachingEvent> {
        match self {
            Self::Offering(e) | Self::IlmSession(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_instructor_group(&self) -> Option<&InstructorGroup> {
        match self {
            Self::InstructorGroup(g) => Some(g),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_user(&self) -> Option<&RemoteUser> {
        match self {
            Self::User(u) => Some(u),
            _ => None,
        }
    }
}
