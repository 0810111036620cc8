//! Plan policy: pure mapping from a plan to its quota and validity rule.
//!
//! Quota and expiry are configured per tier as two independent settings.
//! Nothing here performs I/O; every answer is a function of its inputs.

use crate::domain::{Account, Plan, Quota};
use crate::infrastructure::AppConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_USAGE_WINDOW_DAYS: i64 = 7;
pub const MAX_TRIAL_DURATION_HOURS: i64 = 24 * 366;
pub const MAX_USAGE_WINDOW_DAYS: i64 = 366;
pub const MAX_PLAN_DURATION_DAYS: i64 = 3660;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{setting} must be between 1 and {max}, got {value}")]
    OutOfRange {
        setting: String,
        value: i64,
        max: i64,
    },
}

fn in_range(setting: &str, value: i64, max: i64) -> Result<i64, PolicyError> {
    if (1..=max).contains(&value) {
        Ok(value)
    } else {
        Err(PolicyError::OutOfRange {
            setting: setting.to_string(),
            value,
            max,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub quota: Quota,
    /// `None` means the tier never expires.
    pub duration_days: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaidValidity {
    pub valid: bool,
    pub days_remaining: i64,
}

/// Whether an account's current plan is still in force at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanValidity {
    Active {
        expires_at: Option<DateTime<Utc>>,
        days_remaining: Option<i64>,
    },
    TrialExpired,
    PlanExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanPolicy {
    trial_duration_hours: i64,
    trial_quota: Quota,
    usage_window: Duration,
    tiers: HashMap<String, TierPolicy>,
}

pub fn is_trial_valid(plan_start: DateTime<Utc>, now: DateTime<Utc>, trial_duration_hours: i64) -> bool {
    now - plan_start < Duration::hours(trial_duration_hours)
}

pub fn is_paid_plan_valid(
    plan_start: DateTime<Utc>,
    now: DateTime<Utc>,
    plan_duration_days: i64,
) -> PaidValidity {
    let expires_at = plan_start + Duration::days(plan_duration_days);
    let valid = now < expires_at;
    let days_remaining = if valid {
        (expires_at - now).num_days()
    } else {
        0
    };
    PaidValidity {
        valid,
        days_remaining,
    }
}

impl PlanPolicy {
    /// Policy with only the trial configured. Paid tiers are added with [`with_tier`].
    ///
    /// [`with_tier`]: PlanPolicy::with_tier
    pub fn new(trial_duration_hours: i64, trial_quota: Quota) -> Self {
        Self {
            trial_duration_hours,
            trial_quota,
            usage_window: Duration::days(DEFAULT_USAGE_WINDOW_DAYS),
            tiers: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, name: &str, tier: TierPolicy) -> Self {
        self.tiers.insert(name.trim().to_ascii_lowercase(), tier);
        self
    }

    pub fn with_usage_window(mut self, window: Duration) -> Self {
        self.usage_window = window;
        self
    }

    /// Build the policy from settings, rejecting durations that are not
    /// positive or lie beyond the supported maximums.
    pub fn from_config(config: &AppConfig) -> Result<Self, PolicyError> {
        let trial_hours = in_range(
            "trial_duration_hours",
            config.trial_duration_hours,
            MAX_TRIAL_DURATION_HOURS,
        )?;
        let window_days = in_range(
            "usage_window_days",
            config.usage_window_days,
            MAX_USAGE_WINDOW_DAYS,
        )?;

        let mut policy = Self::new(trial_hours, Quota::Bounded(config.trial_weekly_limit))
            .with_usage_window(Duration::days(window_days));

        for (name, tier) in &config.tiers {
            let duration_days = tier
                .duration_days
                .map(|days| {
                    in_range(
                        &format!("tiers.{}.duration_days", name),
                        days,
                        MAX_PLAN_DURATION_DAYS,
                    )
                })
                .transpose()?;
            policy = policy.with_tier(
                name,
                TierPolicy {
                    quota: tier.weekly_limit.into(),
                    duration_days,
                },
            );
        }
        Ok(policy)
    }

    pub fn trial_duration_hours(&self) -> i64 {
        self.trial_duration_hours
    }

    pub fn usage_window(&self) -> Duration {
        self.usage_window
    }

    pub fn tier(&self, plan: &Plan) -> Option<&TierPolicy> {
        match plan {
            Plan::Trial => None,
            Plan::Paid(name) => self.tiers.get(name),
        }
    }

    /// A plan an account may be moved onto by payment or activation.
    pub fn is_paid_tier(&self, plan: &Plan) -> bool {
        self.tier(plan).is_some()
    }

    pub fn tier_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tiers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unrecognized tiers get a zero quota, never an unbounded one.
    pub fn limit_for(&self, plan: &Plan) -> Quota {
        match plan {
            Plan::Trial => self.trial_quota,
            Plan::Paid(_) => self
                .tier(plan)
                .map(|t| t.quota)
                .unwrap_or(Quota::Bounded(0)),
        }
    }

    pub fn validity(&self, account: &Account, now: DateTime<Utc>) -> PlanValidity {
        match &account.plan {
            Plan::Trial => {
                if is_trial_valid(account.plan_start, now, self.trial_duration_hours) {
                    PlanValidity::Active {
                        expires_at: Some(
                            account.plan_start + Duration::hours(self.trial_duration_hours),
                        ),
                        days_remaining: None,
                    }
                } else {
                    PlanValidity::TrialExpired
                }
            }
            Plan::Paid(_) => match self.tier(&account.plan).and_then(|t| t.duration_days) {
                Some(days) => {
                    let paid = is_paid_plan_valid(account.plan_start, now, days);
                    if paid.valid {
                        PlanValidity::Active {
                            expires_at: Some(account.plan_start + Duration::days(days)),
                            days_remaining: Some(paid.days_remaining),
                        }
                    } else {
                        PlanValidity::PlanExpired
                    }
                }
                None => PlanValidity::Active {
                    expires_at: None,
                    days_remaining: None,
                },
            },
        }
    }

    /// The usage window rolls over once it is strictly older than its length.
    pub fn is_window_stale(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - window_start > self.usage_window
    }
}
