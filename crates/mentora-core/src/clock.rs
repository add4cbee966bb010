//! Day-boundary policy for quota records.
//!
//! Every quota read and write resolves "today" through [`QuotaCalendar`], so
//! the boundary is decided in exactly one place. The default is UTC midnight;
//! a fixed UTC offset can be configured for deployments whose learners share
//! a timezone.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::config::QuotaConfig;
use crate::error::{MentoraError, Result};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayBoundary {
    /// Days roll over at 00:00 UTC.
    Utc,
    /// Days roll over at local midnight of a fixed offset.
    Offset(FixedOffset),
}

impl DayBoundary {
    pub fn from_config(config: &QuotaConfig) -> Result<Self> {
        match config.day_boundary.as_str() {
            "utc" => Ok(Self::Utc),
            "fixed_offset" => {
                let seconds = config.utc_offset_minutes * 60;
                FixedOffset::east_opt(seconds).map(Self::Offset).ok_or_else(|| {
                    MentoraError::Config(format!(
                        "quota.utc_offset_minutes = {} is out of range",
                        config.utc_offset_minutes
                    ))
                })
            }
            other => Err(MentoraError::Config(format!(
                "unknown quota.day_boundary '{other}' (expected 'utc' or 'fixed_offset')"
            ))),
        }
    }

    /// Calendar day that `at` falls on under this policy.
    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Utc => at.date_naive(),
            Self::Offset(offset) => at.with_timezone(offset).date_naive(),
        }
    }
}

/// Resolves the quota day for "now".
#[derive(Clone)]
pub struct QuotaCalendar {
    boundary: DayBoundary,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QuotaCalendar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaCalendar")
            .field("boundary", &self.boundary)
            .finish()
    }
}

impl QuotaCalendar {
    pub fn new(boundary: DayBoundary, clock: Arc<dyn Clock>) -> Self {
        Self { boundary, clock }
    }

    pub fn utc() -> Self {
        Self::new(DayBoundary::Utc, Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.boundary.day_of(self.clock.now())
    }

    pub fn boundary(&self) -> DayBoundary {
        self.boundary
    }
}
