//! Run admission: day-of-month windows, the per-period allow flag, and the run quota.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use appsync_core::Progress;
use chrono::{DateTime, Datelike, Utc};

pub const DEFAULT_RUN_CAP: u32 = 33;

/// Inclusive range of days within a month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRange {
    pub first: u32,
    pub last: u32,
}

impl DayRange {
    pub fn contains(&self, day: u32) -> bool {
        (self.first..=self.last).contains(&day)
    }

    /// Parses `"1-3,24-26"`. Blank input or `"always"` means no restriction.
    pub fn parse_list(input: &str) -> anyhow::Result<Vec<DayRange>> {
        let input = input.trim();
        if input.is_empty() || input.eq_ignore_ascii_case("always") {
            return Ok(Vec::new());
        }
        input.split(',').map(str::parse).collect()
    }
}

impl FromStr for DayRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (first, last) = s.split_once('-').unwrap_or((s, s));
        let first: u32 = first
            .trim()
            .parse()
            .with_context(|| format!("invalid day in window {s:?}"))?;
        let last: u32 = last
            .trim()
            .parse()
            .with_context(|| format!("invalid day in window {s:?}"))?;
        if first == 0 || last > 31 || first > last {
            bail!("window {s:?} is not a valid day range");
        }
        Ok(Self { first, last })
    }
}

pub fn default_windows() -> Vec<DayRange> {
    vec![
        DayRange { first: 1, last: 3 },
        DayRange { first: 24, last: 26 },
    ]
}

/// Quota period key, one per calendar month.
pub fn period_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    OutsideWindow { day: u32 },
    NotAllowed,
    QuotaReached { runs: u32, cap: u32 },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::OutsideWindow { day } => write!(f, "day {day} is outside the run windows"),
            DenyReason::NotAllowed => write!(f, "runs are disabled for this period"),
            DenyReason::QuotaReached { runs, cap } => {
                write!(f, "{runs} runs this period reached the cap of {cap}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Permitted,
    Denied(DenyReason),
}

#[derive(Debug, Clone)]
pub struct ScheduleGate {
    windows: Vec<DayRange>,
    cap: u32,
}

impl Default for ScheduleGate {
    fn default() -> Self {
        Self::new(default_windows(), DEFAULT_RUN_CAP)
    }
}

impl ScheduleGate {
    pub fn new(windows: Vec<DayRange>, cap: u32) -> Self {
        Self { windows, cap }
    }

    /// Resets `progress` on period rollover, then checks window, flag, and quota.
    pub fn decide(&self, now: DateTime<Utc>, progress: &mut Progress) -> GateDecision {
        let current = period_key(now);
        if progress.period_key != current {
            *progress = Progress::for_period(current);
        }

        let day = now.day();
        if !self.windows.is_empty() && !self.windows.iter().any(|w| w.contains(day)) {
            return GateDecision::Denied(DenyReason::OutsideWindow { day });
        }
        if !progress.allowed_to_run {
            return GateDecision::Denied(DenyReason::NotAllowed);
        }
        if progress.runs_this_period >= self.cap {
            return GateDecision::Denied(DenyReason::QuotaReached {
                runs: progress.runs_this_period,
                cap: self.cap,
            });
        }
        GateDecision::Permitted
    }

    pub fn permitted(&self, now: DateTime<Utc>, progress: &mut Progress) -> bool {
        self.decide(now, progress) == GateDecision::Permitted
    }
}
