//! Identifier newtypes.
//!
//! Remote (Ilios) ids and local ids live in different identity spaces; keeping
//! them as distinct types stops a remote user id from being handed to the roster.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw numeric id.
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the raw numeric value.
            #[must_use]
            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserialize_numeric(deserializer).map(Self)
            }
        }
    };
}

numeric_id!(
    /// Id of any record in the remote directory (user, group, offering...).
    RemoteId
);

numeric_id!(
    /// Id of a local user account.
    AccountId
);

numeric_id!(
    /// Id of a local roster (course).
    RosterId
);

numeric_id!(
    /// Id of a configured sync instance.
    InstanceId
);

numeric_id!(
    /// Id of a local role.
    RoleId
);

/// The remote API emits ids as numbers on records and as strings in
/// reference lists, so both forms are accepted.
fn deserialize_numeric<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s
            .trim()
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid numeric id '{s}': {e}"))),
    }
}
