//! Escalation engine.
//!
//! A pure function of `(now, history observation, config)`. Thresholds are
//! counted from the last heartbeat in whole steps, so a late run lands on the
//! same step an on-time run would have, and re-running against unchanged
//! history always yields the same decision.

use crate::config::SwitchConfig;
use crate::history::Observation;
use crate::marker::EscalationState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    None,
    SendWarning,
    SendFinal,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::None => "none",
            Action::SendWarning => "send-warning",
            Action::SendFinal => "send-final",
        }
    }

    pub fn is_none(self) -> bool {
        self == Action::None
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub previous: EscalationState,
    pub next: EscalationState,
    pub action: Action,
    /// Warning count the next marker records if the action is carried out.
    pub warnings_issued: u32,
    pub elapsed_hours: f64,
    /// Inactivity at which the next step is due; `None` once triggered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_hours: Option<i64>,
    /// A heartbeat newer than the last marker wiped the previous episode.
    pub reset: bool,
}

impl Decision {
    pub fn triggered(&self) -> bool {
        self.next == EscalationState::Triggered
    }
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

pub fn evaluate(now: DateTime<Utc>, obs: &Observation, config: &SwitchConfig) -> Decision {
    let elapsed = (now - obs.last_activity_at).max(Duration::zero());
    let elapsed_hours = elapsed.num_seconds() as f64 / 3600.0;

    let (reset, warnings, triggered) = match &obs.last_marker {
        Some(marker) if obs.last_activity_at > marker.recorded_at => (true, 0, false),
        Some(marker) => (false, marker.warnings_issued, marker.triggered),
        None => (false, 0, false),
    };

    if triggered {
        return Decision {
            previous: EscalationState::Triggered,
            next: EscalationState::Triggered,
            action: Action::None,
            warnings_issued: warnings.min(config.warning_count),
            elapsed_hours,
            threshold_hours: None,
            reset,
        };
    }

    // A marker can outrun a lowered warning count; never report past the ladder.
    let steps = warnings.min(config.warning_count);
    let previous = state_for(steps);
    let threshold = config.threshold_for_step(steps);

    let (action, next, warnings_issued) = if elapsed < threshold {
        (Action::None, previous, steps)
    } else if steps < config.warning_count {
        (
            Action::SendWarning,
            EscalationState::Warned(steps + 1),
            steps + 1,
        )
    } else {
        (Action::SendFinal, EscalationState::Triggered, steps)
    };

    Decision {
        previous,
        next,
        action,
        warnings_issued,
        elapsed_hours,
        threshold_hours: Some(threshold.num_hours()),
        reset,
    }
}

fn state_for(steps: u32) -> EscalationState {
    if steps == 0 {
        EscalationState::Active
    } else {
        EscalationState::Warned(steps)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
