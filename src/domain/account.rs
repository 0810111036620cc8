use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Plan an account is on. Paid tiers are named by configuration, so any
/// name other than `trial` is a paid tier; whether it is *recognized* is
/// decided by the plan policy, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Plan {
    Trial,
    Paid(String),
}

impl Plan {
    pub fn parse(raw: &str) -> Self {
        let name = raw.trim().to_ascii_lowercase();
        if name == "trial" {
            Plan::Trial
        } else {
            Plan::Paid(name)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Plan::Trial => "trial",
            Plan::Paid(name) => name.as_str(),
        }
    }

    pub fn is_trial(&self) -> bool {
        matches!(self, Plan::Trial)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Plan {
    fn from(raw: String) -> Self {
        Plan::parse(&raw)
    }
}

impl From<Plan> for String {
    fn from(plan: Plan) -> Self {
        plan.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub plan: Plan,
    pub plan_start: DateTime<Utc>,
    pub usage_count: u32,
    pub usage_window_start: DateTime<Utc>,
    /// Optimistic-lock version, bumped by every persisted mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh trial account as created on first reference.
    pub fn new_trial(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            plan: Plan::Trial,
            plan_start: now,
            usage_count: 0,
            usage_window_start: now,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
