//! Window identity and the per-window refresh state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AggregationError;
use crate::types::Granularity;

/// Refresh state of one gold window.
///
/// ```text
/// Stale ──► Dirty ──► Refreshing ──► Fresh
///             ▲  ▲         │           │
///             │  └─────────┘ (failed)  │
///             └────────────────────────┘ (late data)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    /// No silver data since the last refresh. Implicit for unseen windows.
    Stale,
    Dirty,
    Refreshing,
    Fresh,
}

impl WindowState {
    pub fn can_transition_to(self, to: WindowState) -> bool {
        use WindowState::*;
        matches!(
            (self, to),
            (Stale, Dirty)
                | (Dirty, Dirty)
                | (Fresh, Dirty)
                | (Refreshing, Dirty)
                | (Dirty, Refreshing)
                | (Refreshing, Fresh)
        )
    }

    pub fn transition(self, to: WindowState) -> Result<WindowState, AggregationError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(AggregationError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Whether the window waits for a refresh. Refreshing counts so a window
    /// abandoned mid-refresh is picked up again.
    pub fn is_pending(self) -> bool {
        matches!(self, WindowState::Dirty | WindowState::Refreshing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WindowState::Stale => "stale",
            WindowState::Dirty => "dirty",
            WindowState::Refreshing => "refreshing",
            WindowState::Fresh => "fresh",
        }
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WindowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stale" => Ok(WindowState::Stale),
            "dirty" => Ok(WindowState::Dirty),
            "refreshing" => Ok(WindowState::Refreshing),
            "fresh" => Ok(WindowState::Fresh),
            other => Err(format!("unknown window state: {other}")),
        }
    }
}

/// Identity of one gold window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub dataset: String,
    pub entity_key: String,
    pub granularity: Granularity,
    pub window_start: DateTime<Utc>,
}

impl WindowKey {
    /// Window of `granularity` containing `t`.
    pub fn containing(
        dataset: &str,
        entity_key: &str,
        granularity: Granularity,
        t: DateTime<Utc>,
    ) -> Self {
        Self {
            dataset: dataset.to_string(),
            entity_key: entity_key.to_string(),
            granularity,
            window_start: granularity.window_start(t),
        }
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.granularity.window_end(self.window_start)
    }

    /// Whether a materialised window no longer accepts rows: it is Fresh and
    /// ended more than `horizon` before the event-time `watermark`.
    pub fn is_closed(
        &self,
        state: WindowState,
        horizon: Duration,
        watermark: DateTime<Utc>,
    ) -> bool {
        state == WindowState::Fresh && self.window_end() + horizon < watermark
    }

    /// The Day window this window falls in.
    pub fn day(&self) -> WindowKey {
        WindowKey::containing(
            &self.dataset,
            &self.entity_key,
            Granularity::Day,
            self.window_start,
        )
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.dataset,
            self.entity_key,
            self.granularity,
            self.window_start.to_rfc3339()
        )
    }
}

/// Stored state of a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub key: WindowKey,
    pub state: WindowState,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_valid_transitions() {
        use WindowState::*;
        assert_eq!(Stale.transition(Dirty).unwrap(), Dirty);
        assert_eq!(Dirty.transition(Refreshing).unwrap(), Refreshing);
        assert_eq!(Refreshing.transition(Fresh).unwrap(), Fresh);
        assert_eq!(Fresh.transition(Dirty).unwrap(), Dirty);
        assert_eq!(Refreshing.transition(Dirty).unwrap(), Dirty);
    }

    #[test]
    fn test_invalid_transitions() {
        use WindowState::*;
        for (from, to) in [
            (Stale, Fresh),
            (Stale, Refreshing),
            (Dirty, Fresh),
            (Fresh, Refreshing),
            (Fresh, Stale),
        ] {
            let err = from.transition(to).unwrap_err();
            assert!(matches!(err, AggregationError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn test_is_closed_only_when_fresh_and_past_horizon() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let key = WindowKey::containing("ds", "S1", Granularity::Hour, t);
        let horizon = Duration::hours(48);
        let inside = Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap();
        let beyond = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert!(!key.is_closed(WindowState::Fresh, horizon, inside));
        assert!(key.is_closed(WindowState::Fresh, horizon, beyond));
        assert!(!key.is_closed(WindowState::Dirty, horizon, beyond));
        assert!(!key.is_closed(WindowState::Stale, horizon, beyond));
    }

    #[test]
    fn test_window_key_day() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 13, 20, 0).unwrap();
        let hour = WindowKey::containing("sensors", "S1", Granularity::Hour, t);
        assert_eq!(
            hour.window_end(),
            Utc.with_ymd_and_hms(2024, 1, 1, 14, 0, 0).unwrap()
        );
        let day = hour.day();
        assert_eq!(day.granularity, Granularity::Day);
        assert_eq!(
            day.window_start,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_state_roundtrip_str() {
        for s in ["stale", "dirty", "refreshing", "fresh"] {
            assert_eq!(s.parse::<WindowState>().unwrap().as_str(), s);
        }
    }
}
