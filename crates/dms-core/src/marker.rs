//! State markers: the switch's only persisted state.
//!
//! Each escalation step appends one empty commit authored by the bot identity.
//! The message carries git trailers that encode the step:
//!
//! ```text
//! dms: warning 1 of 2 issued
//!
//! Dms-Warnings-Issued: 1
//! Dms-Triggered: false
//! Dms-Trigger: scheduled
//! ```
//!
//! Markers are never edited; the newest one is the current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SUBJECT_PREFIX: &str = "dms:";
pub const TRAILER_WARNINGS_ISSUED: &str = "Dms-Warnings-Issued";
pub const TRAILER_TRIGGERED: &str = "Dms-Triggered";
pub const TRAILER_TRIGGER: &str = "Dms-Trigger";

/// Subjects written by earlier releases, which carried no trailers.
pub const LEGACY_WARNING_SUBJECT: &str = "warning issued";
pub const LEGACY_FINAL_SUBJECT: &str = "passed away";

// ---------------------------------------------------------------------------
// EscalationState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Active,
    Warned(u32),
    Triggered,
}

impl fmt::Display for EscalationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationState::Active => f.write_str("active"),
            EscalationState::Warned(n) => write!(f, "warned({n})"),
            EscalationState::Triggered => f.write_str("triggered"),
        }
    }
}

// ---------------------------------------------------------------------------
// StateMarker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMarker {
    pub warnings_issued: u32,
    pub triggered: bool,
    pub recorded_at: DateTime<Utc>,
}

impl StateMarker {
    pub fn state(&self) -> EscalationState {
        if self.triggered {
            EscalationState::Triggered
        } else if self.warnings_issued == 0 {
            EscalationState::Active
        } else {
            EscalationState::Warned(self.warnings_issued)
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How the run was started. Labels logs and markers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn from_manual_dispatch(manual: bool) -> Self {
        if manual {
            Trigger::Manual
        } else {
            Trigger::Scheduled
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Commit message codec
// ---------------------------------------------------------------------------

/// What a bot commit message says, before folding it against its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerRecord {
    Step { warnings_issued: u32, triggered: bool },
    LegacyWarning,
    LegacyFinal,
}

pub fn encode_marker(
    warnings_issued: u32,
    triggered: bool,
    warning_count: u32,
    trigger: Trigger,
) -> String {
    let subject = if triggered {
        format!("{SUBJECT_PREFIX} final messages sent")
    } else {
        format!("{SUBJECT_PREFIX} warning {warnings_issued} of {warning_count} issued")
    };
    format!(
        "{subject}\n\n\
         {TRAILER_WARNINGS_ISSUED}: {warnings_issued}\n\
         {TRAILER_TRIGGERED}: {triggered}\n\
         {TRAILER_TRIGGER}: {trigger}\n"
    )
}

/// Decode a bot commit message. `Err` carries a human-readable reason.
pub fn decode_marker(message: &str) -> std::result::Result<MarkerRecord, String> {
    let subject = message.lines().next().unwrap_or("").trim();
    match subject {
        LEGACY_WARNING_SUBJECT => return Ok(MarkerRecord::LegacyWarning),
        LEGACY_FINAL_SUBJECT => return Ok(MarkerRecord::LegacyFinal),
        _ => {}
    }

    let warnings = trailer(message, TRAILER_WARNINGS_ISSUED)
        .ok_or_else(|| format!("missing {TRAILER_WARNINGS_ISSUED} trailer"))?;
    let warnings_issued = warnings
        .parse::<u32>()
        .map_err(|_| format!("{TRAILER_WARNINGS_ISSUED} is not a count: '{warnings}'"))?;

    let triggered = trailer(message, TRAILER_TRIGGERED)
        .ok_or_else(|| format!("missing {TRAILER_TRIGGERED} trailer"))?;
    let triggered = match triggered {
        "true" => true,
        "false" => false,
        other => return Err(format!("{TRAILER_TRIGGERED} is not a boolean: '{other}'")),
    };

    Ok(MarkerRecord::Step {
        warnings_issued,
        triggered,
    })
}

fn trailer<'a>(message: &'a str, key: &str) -> Option<&'a str> {
    message.lines().rev().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_marker_encodes_subject_and_trailers() {
        let msg = encode_marker(1, false, 2, Trigger::Scheduled);
        assert!(msg.starts_with("dms: warning 1 of 2 issued\n\n"));
        assert!(msg.contains("Dms-Warnings-Issued: 1"));
        assert!(msg.contains("Dms-Triggered: false"));
        assert!(msg.contains("Dms-Trigger: scheduled"));
    }

    #[test]
    fn final_marker_decodes_as_triggered() {
        let msg = encode_marker(2, true, 2, Trigger::Manual);
        assert!(msg.starts_with("dms: final messages sent"));
        assert_eq!(
            decode_marker(&msg).unwrap(),
            MarkerRecord::Step {
                warnings_issued: 2,
                triggered: true
            }
        );
    }

    #[test]
    fn legacy_subjects_are_recognised() {
        assert_eq!(
            decode_marker("warning issued").unwrap(),
            MarkerRecord::LegacyWarning
        );
        assert_eq!(
            decode_marker("passed away\n").unwrap(),
            MarkerRecord::LegacyFinal
        );
    }

    #[test]
    fn missing_trailer_is_rejected() {
        let err = decode_marker("dms: warning 1 of 2 issued\n\nDms-Triggered: false").unwrap_err();
        assert!(err.contains("Dms-Warnings-Issued"));
    }

    #[test]
    fn garbage_count_is_rejected() {
        let err =
            decode_marker("dms: x\n\nDms-Warnings-Issued: two\nDms-Triggered: false").unwrap_err();
        assert!(err.contains("not a count"));
    }

    #[test]
    fn unrelated_message_is_rejected() {
        assert!(decode_marker("Update README").is_err());
    }

    #[test]
    fn marker_state_mapping() {
        let at = Utc::now();
        let m = |w, t| StateMarker {
            warnings_issued: w,
            triggered: t,
            recorded_at: at,
        };
        assert_eq!(m(0, false).state(), EscalationState::Active);
        assert_eq!(m(2, false).state(), EscalationState::Warned(2));
        assert_eq!(m(2, true).state(), EscalationState::Triggered);
    }

    #[test]
    fn state_display() {
        assert_eq!(EscalationState::Warned(3).to_string(), "warned(3)");
        assert_eq!(EscalationState::Triggered.to_string(), "triggered");
    }
}
