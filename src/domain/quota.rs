use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of gated actions allowed per usage window.
///
/// Serialized as a number, or `null` when unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Option<u32>", from = "Option<u32>")]
pub enum Quota {
    Unbounded,
    Bounded(u32),
}

impl Quota {
    /// Whether `used` actions leave room for one more.
    pub fn admits(&self, used: u32) -> bool {
        match self {
            Quota::Unbounded => true,
            Quota::Bounded(limit) => used < *limit,
        }
    }

    pub fn remaining(&self, used: u32) -> Option<u32> {
        match self {
            Quota::Unbounded => None,
            Quota::Bounded(limit) => Some(limit.saturating_sub(used)),
        }
    }

    pub fn bound(&self) -> Option<u32> {
        match self {
            Quota::Unbounded => None,
            Quota::Bounded(limit) => Some(*limit),
        }
    }
}

impl From<Option<u32>> for Quota {
    fn from(limit: Option<u32>) -> Self {
        limit.map_or(Quota::Unbounded, Quota::Bounded)
    }
}

impl From<Quota> for Option<u32> {
    fn from(quota: Quota) -> Self {
        quota.bound()
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quota::Unbounded => f.write_str("unbounded"),
            Quota::Bounded(limit) => write!(f, "{}", limit),
        }
    }
}
