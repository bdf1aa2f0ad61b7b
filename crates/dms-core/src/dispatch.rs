//! Action dispatcher.
//!
//! Sends the rendered batch, then appends exactly one marker commit. The
//! marker is written only when every message in the batch was delivered;
//! otherwise the next run re-derives the same step and resends the batch
//! (at-least-once).

use crate::config::SwitchConfig;
use crate::engine::{Action, Decision};
use crate::error::{DmsError, Result};
use crate::history::HistoryLog;
use crate::mail::Mailer;
use crate::marker::{encode_marker, StateMarker, Trigger};
use crate::template::RenderedMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub source: String,
    pub recipient: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub action: Action,
    pub delivered: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedDelivery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<StateMarker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker_commit: Option<String>,
}

impl DispatchReport {
    fn empty(action: Action) -> Self {
        Self {
            action,
            delivered: Vec::new(),
            failed: Vec::new(),
            marker: None,
            marker_commit: None,
        }
    }

    pub fn marker_withheld(&self) -> bool {
        !self.action.is_none() && self.marker.is_none()
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

/// Everything the dispatcher needs besides its collaborators.
pub struct DispatchPlan<'a> {
    pub decision: &'a Decision,
    pub messages: &'a [RenderedMessage],
    pub config: &'a SwitchConfig,
    pub trigger: Trigger,
    pub now: DateTime<Utc>,
    /// Head commit observed when history was read.
    pub expected_head: Option<&'a str>,
    /// Pause between consecutive sends.
    pub pause: Duration,
}

pub fn dispatch(
    plan: &DispatchPlan<'_>,
    mailer: &dyn Mailer,
    history: &dyn HistoryLog,
) -> Result<DispatchReport> {
    let action = plan.decision.action;
    let mut report = DispatchReport::empty(action);
    if action.is_none() {
        return Ok(report);
    }
    if plan.messages.is_empty() {
        return Err(DmsError::NothingToSend(action.to_string()));
    }

    for (i, message) in plan.messages.iter().enumerate() {
        if i > 0 && !plan.pause.is_zero() {
            std::thread::sleep(plan.pause);
        }
        match mailer.send(message) {
            Ok(()) => {
                tracing::info!(recipient = %message.recipient, template = %message.source, "sent");
                report.delivered.push(message.recipient.clone());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(recipient = %message.recipient, error = %e, "delivery failed");
                report.failed.push(FailedDelivery {
                    source: message.source.clone(),
                    recipient: message.recipient.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if !report.failed.is_empty() {
        tracing::warn!(
            failed = report.failed.len(),
            attempted = report.attempted(),
            %action,
            "marker withheld; the batch will be retried on the next run"
        );
        return Ok(report);
    }

    let marker = StateMarker {
        warnings_issued: plan.decision.warnings_issued,
        triggered: plan.decision.triggered(),
        recorded_at: plan.now,
    };
    let message = encode_marker(
        marker.warnings_issued,
        marker.triggered,
        plan.config.warning_count,
        plan.trigger,
    );
    let commit = history.write_marker_commit(&message, plan.now, plan.expected_head)?;
    tracing::info!(commit = %commit, state = %plan.decision.next, "recorded state marker");

    report.marker = Some(marker);
    report.marker_commit = Some(commit);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
