use crate::output::{print_fields, print_json, print_table};
use anyhow::Context;
use chrono::{DateTime, Utc};
use dms_core::config::{ConfigLayer, Settings, SwitchConfig, Variables};
use dms_core::history::GitHistory;
use dms_core::mail::{Credentials, Mailer, OutboxMailer, Provider, SmtpMailer};
use dms_core::marker::Trigger;
use dms_core::switch::{run_once, RunContext, RunOutcome};
use dms_core::template::DirTemplateSource;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_MAIL_PROVIDER: &str = "DMS_MAIL_PROVIDER";
/// Set by GitHub Actions as `owner/name`.
const ENV_REPOSITORY: &str = "GITHUB_REPOSITORY";

pub struct RunArgs {
    pub heartbeat_interval_hours: Option<u32>,
    pub number_of_warnings: Option<u32>,
    pub armed: bool,
    pub manual_dispatch: bool,
    pub dry_run: bool,
    pub push: bool,
    pub outbox: Option<PathBuf>,
    pub now: Option<DateTime<Utc>>,
}

pub fn run(root: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let settings = Settings::load(root)?;
    let env: Vec<(String, String)> = std::env::vars().collect();

    // An absent --armed defers to DMS_ARMED and the config file.
    let cli_layer = ConfigLayer {
        heartbeat_interval_hours: args.heartbeat_interval_hours,
        warning_count: args.number_of_warnings,
        armed: args.armed.then_some(true),
    };
    let env_layer = ConfigLayer::from_env(env.iter().map(|(k, v)| (k, v)))?;
    let config = SwitchConfig::resolve(&[&cli_layer, &env_layer, &settings.switch])?;

    let history = GitHistory::discover(root, settings.bot.clone())?.with_push(args.push);
    let templates = DirTemplateSource::new(settings.templates_dir(root));

    let ctx = RunContext {
        config,
        bot: settings.bot.clone(),
        trigger: Trigger::from_manual_dispatch(args.manual_dispatch),
        now: args.now.unwrap_or_else(Utc::now),
        operator: Credentials::address_from_env(env.iter().map(|(k, v)| (k, v))).ok(),
        repository: repository_name(root, &env),
        variables: Variables::layered(&settings.variables, env.iter().cloned()),
        send_pause: Duration::from_secs(settings.send_pause_secs),
        dry_run: args.dry_run,
    };

    let outcome = run_once(&ctx, &history, &templates, || {
        connect_mailer(&settings, args.outbox.as_deref(), &env)
    })
    .with_context(|| format!("dead man's switch run failed in {}", root.display()))?;

    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }

    if let Some(e) = outcome.incomplete() {
        return Err(e.into());
    }
    Ok(())
}

fn connect_mailer(
    settings: &Settings,
    outbox: Option<&Path>,
    env: &[(String, String)],
) -> dms_core::Result<Box<dyn Mailer>> {
    let vars = || env.iter().map(|(k, v)| (k, v));

    if let Some(dir) = outbox {
        let from = Credentials::address_from_env(vars())?;
        let mailer = OutboxMailer::new(dir, &from)?;
        tracing::info!(dir = %mailer.dir().display(), "writing messages to outbox");
        return Ok(Box::new(mailer));
    }

    let creds = Credentials::from_env(vars())?;
    let named = vars()
        .find(|(k, _)| k.as_str() == ENV_MAIL_PROVIDER)
        .map(|(_, v)| v.clone())
        .or_else(|| settings.mail_provider.clone());
    let provider = match named {
        Some(name) => Provider::by_name(&name)?,
        None => Provider::for_address(&creds.address)?,
    };
    let timeout = Duration::from_secs(settings.smtp_timeout_secs);
    Ok(Box::new(SmtpMailer::connect(&creds, provider, timeout)?))
}

fn repository_name(root: &Path, env: &[(String, String)]) -> String {
    env.iter()
        .find(|(k, v)| k == ENV_REPOSITORY && !v.is_empty())
        .map(|(_, v)| v.clone())
        .or_else(|| {
            root.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| root.display().to_string())
}

fn print_outcome(outcome: &RunOutcome) {
    let decision = &outcome.decision;
    let obs = &outcome.observation;

    let mut fields = vec![
        ("Trigger", outcome.trigger.to_string()),
        (
            "Mode",
            if outcome.config.armed { "armed" } else { "test" }.to_string(),
        ),
        (
            "Last activity",
            format!(
                "{} ({})",
                obs.last_activity_at.format("%Y-%m-%d %H:%M UTC"),
                &obs.last_activity_commit[..obs.last_activity_commit.len().min(8)]
            ),
        ),
        ("Inactive", format!("{:.1} hours", decision.elapsed_hours)),
        ("State", format!("{} -> {}", decision.previous, decision.next)),
        ("Action", decision.action.to_string()),
    ];
    if let Some(hours) = decision.threshold_hours {
        fields.push(("Next step at", format!("{hours} hours inactive")));
    }
    if decision.reset {
        fields.push(("Reset", "activity since the last marker".to_string()));
    }
    print_fields(&fields);

    if let Some(rendered) = &outcome.rendered {
        println!();
        let rows = rendered
            .messages
            .iter()
            .map(|m| vec![m.recipient.clone(), m.subject.clone(), m.source.clone()])
            .collect();
        print_table(&["TO", "SUBJECT", "TEMPLATE"], rows);
        for skipped in &rendered.skipped {
            println!("skipped {}: {}", skipped.source, skipped.reason);
        }
        if !rendered.unresolved.is_empty() {
            let names: Vec<&str> = rendered.unresolved.iter().map(String::as_str).collect();
            println!("unresolved variables: {}", names.join(", "));
        }
    }

    if outcome.dry_run && outcome.rendered.is_some() {
        println!("\ndry run: nothing sent, no marker written");
    }

    if let Some(report) = &outcome.report {
        println!();
        match &report.marker_commit {
            Some(commit) => println!(
                "Delivered {} message(s); marker {} recorded",
                report.delivered.len(),
                &commit[..commit.len().min(8)]
            ),
            None => println!(
                "Delivered {} of {} message(s); marker withheld",
                report.delivered.len(),
                report.attempted()
            ),
        }
    }
}
