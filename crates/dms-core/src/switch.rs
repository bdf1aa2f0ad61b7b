//! One scheduled (or manual) run of the switch.
//!
//! read history -> derive state -> decide -> render -> send -> record marker.
//! Each collaborator is passed in, so the whole run can be driven against
//! in-memory history and mail.

use crate::config::{BotIdentity, SwitchConfig, Variables};
use crate::dispatch::{dispatch, DispatchPlan, DispatchReport};
use crate::engine::{evaluate, Decision};
use crate::error::{DmsError, Result};
use crate::history::{observe, HistoryLog, Observation};
use crate::mail::Mailer;
use crate::marker::Trigger;
use crate::template::{render, MessageKind, Rendered, Routing, TemplateSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Variables every template can use in addition to the configured ones.
pub const VAR_OPERATOR: &str = "MY_EMAIL";
pub const VAR_WARNING_NUMBER: &str = "DMS_WARNING_NUMBER";
pub const VAR_WARNING_COUNT: &str = "DMS_WARNING_COUNT";
pub const VAR_REPOSITORY: &str = "DMS_REPOSITORY";
pub const VAR_HOURS_INACTIVE: &str = "DMS_HOURS_INACTIVE";
pub const VAR_FINAL_AFTER_HOURS: &str = "DMS_FINAL_AFTER_HOURS";

pub struct RunContext {
    pub config: SwitchConfig,
    pub bot: BotIdentity,
    pub trigger: Trigger,
    pub now: DateTime<Utc>,
    /// The owner's own address: sender, and recipient of everything in test mode.
    pub operator: Option<String>,
    pub repository: String,
    pub variables: Variables,
    pub send_pause: Duration,
    /// Evaluate and render, but neither send nor record a marker.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub trigger: Trigger,
    pub config: SwitchConfig,
    pub observation: Observation,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<Rendered>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DispatchReport>,
    pub dry_run: bool,
}

impl RunOutcome {
    /// The error a run ends with when its marker was withheld.
    pub fn incomplete(&self) -> Option<DmsError> {
        let report = self.report.as_ref()?;
        report
            .marker_withheld()
            .then(|| DmsError::DeliveryIncomplete {
                failed: report.failed.len(),
                attempted: report.attempted(),
            })
    }
}

pub fn run_once<F>(
    ctx: &RunContext,
    history: &dyn HistoryLog,
    templates: &dyn TemplateSource,
    connect_mailer: F,
) -> Result<RunOutcome>
where
    F: FnOnce() -> Result<Box<dyn Mailer>>,
{
    let config = ctx.config;
    tracing::info!(
        trigger = %ctx.trigger,
        mode = if config.armed { "armed" } else { "test" },
        interval_hours = config.heartbeat_interval_hours,
        warnings = config.warning_count,
        "checking for activity"
    );

    let snapshot = history.read_log()?;
    let observation = observe(&snapshot, &ctx.bot)?;
    let decision = evaluate(ctx.now, &observation, &config);
    tracing::info!(
        last_activity = %observation.last_activity_at,
        elapsed_hours = %format!("{:.1}", decision.elapsed_hours),
        state = %decision.previous,
        action = %decision.action,
        reset = decision.reset,
        "evaluated"
    );

    let mut outcome = RunOutcome {
        trigger: ctx.trigger,
        config,
        observation,
        decision,
        rendered: None,
        report: None,
        dry_run: ctx.dry_run,
    };

    let Some(kind) = MessageKind::for_action(outcome.decision.action) else {
        return Ok(outcome);
    };

    let operator = ctx.operator.clone().ok_or_else(|| {
        DmsError::Configuration(format!(
            "{VAR_OPERATOR} is not set; it is needed to send mail"
        ))
    })?;
    let routing = if config.armed {
        Routing::Armed
    } else {
        Routing::TestMode {
            operator: operator.clone(),
        }
    };

    let vars = run_variables(ctx, &outcome.decision, &operator);
    let rendered = render(templates.templates(kind)?, &vars, &routing);
    if rendered.messages.is_empty() {
        return Err(DmsError::NothingToSend(outcome.decision.action.to_string()));
    }
    outcome.rendered = Some(rendered);

    if ctx.dry_run {
        tracing::info!("dry run: nothing sent, no marker written");
        return Ok(outcome);
    }

    let mailer = connect_mailer()?;
    let messages = outcome
        .rendered
        .as_ref()
        .map(|r| r.messages.as_slice())
        .unwrap_or_default();
    let plan = DispatchPlan {
        decision: &outcome.decision,
        messages,
        config: &config,
        trigger: ctx.trigger,
        now: ctx.now,
        expected_head: outcome.observation.head.as_deref(),
        pause: ctx.send_pause,
    };
    let report = dispatch(&plan, mailer.as_ref(), history)?;
    outcome.report = Some(report);
    Ok(outcome)
}

fn run_variables(ctx: &RunContext, decision: &Decision, operator: &str) -> Variables {
    let mut vars = ctx.variables.clone();
    if vars.get(VAR_OPERATOR).is_none() {
        vars.insert(VAR_OPERATOR, operator);
    }
    vars.insert(VAR_WARNING_NUMBER, decision.warnings_issued.to_string());
    vars.insert(VAR_WARNING_COUNT, ctx.config.warning_count.to_string());
    vars.insert(VAR_REPOSITORY, ctx.repository.as_str());
    vars.insert(
        VAR_HOURS_INACTIVE,
        (decision.elapsed_hours.floor() as i64).to_string(),
    );
    vars.insert(
        VAR_FINAL_AFTER_HOURS,
        ctx.config
            .threshold_for_step(ctx.config.warning_count)
            .num_hours()
            .to_string(),
    );
    vars
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
