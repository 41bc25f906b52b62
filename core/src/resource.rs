//! Resource identification, versioning and state snapshot types.
//!
//! These are the strong types every other module speaks in: who is asking
//! (`RequesterId`), what they are asking for (`ResourceId`, `PoolId`), and the
//! versioned state the ledger hands back (`ResourceSnapshot`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "` without validation.")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert into the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "identifier cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a reservable resource (for example `"train-12/coach-3/seat-41"`).
    ///
    /// The derived `Ord` is the global lock order: any operation touching more than
    /// one resource acquires them in ascending `ResourceId` order.
    ///
    /// # Examples
    ///
    /// ```
    /// use seatguard_core::resource::ResourceId;
    ///
    /// let seat = ResourceId::new("train-12/seat-41");
    /// assert_eq!(seat.as_str(), "train-12/seat-41");
    ///
    /// assert!("".parse::<ResourceId>().is_err());
    /// ```
    ResourceId,
    "resource id"
);

string_id!(
    /// Identifier of whoever is asking for a resource (user, session, client).
    RequesterId,
    "requester id"
);

string_id!(
    /// Identifier of a pool of interchangeable resources (for example a train).
    PoolId,
    "pool id"
);

/// Per-resource version for optimistic concurrency control.
///
/// A freshly provisioned resource is at version 0. Every committed mutation moves
/// it to `next()`, so after `n` commits the version is exactly `n`.
///
/// # Examples
///
/// ```
/// use seatguard_core::resource::Version;
///
/// let v = Version::INITIAL;
/// assert_eq!(v.next(), Version::new(1));
/// assert!(v < v.next());
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    /// Version of a resource that has never been mutated.
    pub const INITIAL: Self = Self(0);

    /// Create a version from a raw value.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Point-in-time view of a resource as stored in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Which resource this is.
    pub id: ResourceId,
    /// Total units the resource was provisioned with (1 for a seat).
    pub capacity: u32,
    /// Units not yet granted. Always `<= capacity`.
    pub available: u32,
    /// Version of the last committed mutation.
    pub version: Version,
}

impl ResourceSnapshot {
    /// Snapshot of a resource that has just been provisioned.
    #[must_use]
    pub fn provisioned(id: ResourceId, capacity: u32) -> Self {
        Self {
            id,
            capacity,
            available: capacity,
            version: Version::INITIAL,
        }
    }

    /// `true` once every unit has been granted.
    #[must_use]
    pub const fn is_sold_out(&self) -> bool {
        self.available == 0
    }

    /// Compute the `available` count after applying `delta`.
    ///
    /// Returns `None` when the result would leave `0..=capacity`.
    #[must_use]
    pub fn available_after(&self, delta: i32) -> Option<u32> {
        let next = i64::from(self.available) + i64::from(delta);
        if next < 0 || next > i64::from(self.capacity) {
            return None;
        }
        u32::try_from(next).ok()
    }
}

/// A change to one resource's `available` count, attributed to a requester.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Who the change is made for.
    pub requester: RequesterId,
    /// Signed change to `available` (-1 takes a unit, +1 hands one back).
    pub delta: i32,
}

impl Mutation {
    /// Take one unit for `requester`.
    #[must_use]
    pub const fn take(requester: RequesterId) -> Self {
        Self {
            requester,
            delta: -1,
        }
    }

    /// Hand one unit held by `requester` back to the resource.
    #[must_use]
    pub const fn give_back(requester: RequesterId) -> Self {
        Self {
            requester,
            delta: 1,
        }
    }
}

/// A named set of interchangeable resources ("any seat on this train").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    /// Pool identifier, used as the admission key for any-of-pool bookings.
    pub id: PoolId,
    members: Vec<ResourceId>,
}

impl ResourcePool {
    /// Create a pool. Members are sorted and deduplicated so every worker scans
    /// them in the same order.
    #[must_use]
    pub fn new(id: PoolId, members: impl IntoIterator<Item = ResourceId>) -> Self {
        let mut members: Vec<ResourceId> = members.into_iter().collect();
        members.sort();
        members.dedup();
        Self { id, members }
    }

    /// Members in ascending order.
    #[must_use]
    pub fn members(&self) -> &[ResourceId] {
        &self.members
    }

    /// `true` when the pool has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_rejects_blank_input() {
        assert!("".parse::<ResourceId>().is_err());
        assert!("   ".parse::<RequesterId>().is_err());
        assert_eq!("seat-1".parse::<ResourceId>(), Ok(ResourceId::new("seat-1")));
    }

    #[test]
    fn test_version_is_monotonic() {
        let mut v = Version::INITIAL;
        for expected in 1..=5 {
            v = v.next();
            assert_eq!(v.value(), expected);
        }
        assert_eq!(v.to_string(), "v5");
    }

    #[test]
    fn test_available_after_respects_bounds() {
        let snap = ResourceSnapshot::provisioned(ResourceId::new("seat"), 2);
        assert_eq!(snap.available_after(-1), Some(1));
        assert_eq!(snap.available_after(-2), Some(0));
        assert_eq!(snap.available_after(-3), None);
        assert_eq!(snap.available_after(1), None);
    }

    #[test]
    fn test_pool_members_sorted_and_deduplicated() {
        let pool = ResourcePool::new(
            PoolId::new("train-9"),
            ["s3", "s1", "s2", "s1"].map(ResourceId::new),
        );
        let ids: Vec<&str> = pool.members().iter().map(ResourceId::as_str).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }
}
