//! Core type definitions: identifiers, timestamps, and the tagged metadata value.
//!
//! All entity identifiers use UUID v7 for time-ordered uniqueness, following
//! the same convention across the crate's tenants, documents, and chunks.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new, time-ordered identifier.
            #[inline]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates a nil (all-zero) identifier, useful as a sentinel in tests.
            #[inline]
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Returns the raw UUID bytes for storage.
            #[inline]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Creates an identifier from raw bytes.
            #[inline]
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    TenantId,
    "Tenant (organization) identifier. Each tenant owns one independent HNSW index."
);
uuid_id!(
    DocumentId,
    "Document identifier, issued by the external store."
);
uuid_id!(
    ChunkId,
    "Stable external chunk identifier — the node's user-visible key. \
     Distinct from the internal `NodeId` generated at insert time."
);

/// Opaque user identifier, provided by the caller's own auth system.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Creates a new user id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group identifier, used by the `GROUP` access level.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    /// Creates a new group id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unix timestamp in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    ///
    /// Never panics: if the system clock is somehow before the Unix epoch,
    /// returns a timestamp of 0 rather than unwrapping.
    #[inline]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    /// Creates a timestamp from Unix milliseconds.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as Unix milliseconds.
    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns big-endian bytes for storage (lexicographic order matches time order).
    #[inline]
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense embedding vector. Fixed dimension per index, set by the first insert.
pub type Vector = Vec<f32>;

/// Internal node identifier, distinct from the external [`ChunkId`].
///
/// Generated fresh on every insert (including re-inserts), never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// The five-level access model evaluated by the permission filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessLevel {
    /// Visible to any authenticated caller.
    Public,
    /// Visible only to callers whose `user_group_ids` contains the chunk's `groupId`.
    Group,
    /// Visible only to callers with role `MANAGER` or `ADMIN`.
    Managers,
    /// Visible only to callers with role `ADMIN`.
    Admins,
    /// Visible only to callers whose `user_id` is in the chunk's `restrictedToUsers`.
    Restricted,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessLevel::Public => "PUBLIC",
            AccessLevel::Group => "GROUP",
            AccessLevel::Managers => "MANAGERS",
            AccessLevel::Admins => "ADMINS",
            AccessLevel::Restricted => "RESTRICTED",
        };
        write!(f, "{s}")
    }
}

/// A caller's role, as carried in a search filter's `permissions` sub-structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserRole {
    /// Ordinary member; subject to all access-level checks.
    Member,
    /// Passes the `MANAGERS` access level in addition to everything `Member` passes.
    Manager,
    /// Bypasses the permission block unconditionally (generic filters still apply).
    Admin,
}

/// Tagged-value mapping used for open-ended chunk/document metadata.
///
/// A sum type over scalar, list, and nested-mapping values, per the design
/// notes' "dynamic dictionaries for metadata" guidance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value, distinct from a missing key.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar (used for both integers and floats).
    Number(f64),
    /// String scalar.
    String(String),
    /// List of values — matched as membership by the generic filter operators.
    List(Vec<Value>),
    /// Nested mapping — matched as an operator map (`$in`/`$gte`/`$lte`/`$ne`)
    /// by the generic filter operators when it appears as a filter value.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convenience constructor for a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    /// Returns the value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an `f64`, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as a list slice, if it is a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// Open key→value metadata attached to a chunk or document.
pub type Metadata = BTreeMap<String, Value>;
