use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What the subscription collaborator reports for a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionQuota {
    /// `None` means unlimited.
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

/// Remaining allowance for a (user, day). Serializes as a number, or `null`
/// when unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Remaining {
    Limited(u32),
    Unlimited,
}

impl Remaining {
    pub fn allows_consumption(self) -> bool {
        match self {
            Remaining::Unlimited => true,
            Remaining::Limited(n) => n > 0,
        }
    }
}

impl std::fmt::Display for Remaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remaining::Limited(n) => write!(f, "{n}"),
            Remaining::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Per (user, calendar day) consumption counter.
///
/// `used` only grows within a day. A new day starts a new record at zero;
/// old records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub user_id: String,
    pub day: NaiveDate,
    pub limit: Option<u32>,
    pub used: u32,
}

impl QuotaRecord {
    pub fn new(user_id: impl Into<String>, day: NaiveDate, limit: Option<u32>, used: u32) -> Self {
        Self {
            user_id: user_id.into(),
            day,
            limit,
            used,
        }
    }

    /// `limit - used` clamped at zero, or `Unlimited` when there is no limit.
    pub fn remaining(&self) -> Remaining {
        match self.limit {
            None => Remaining::Unlimited,
            Some(limit) => Remaining::Limited(limit.saturating_sub(self.used)),
        }
    }

    pub fn can_consume(&self) -> bool {
        self.remaining().allows_consumption()
    }
}
