//! Run configuration.
//!
//! Three inputs feed every run, highest precedence first:
//!   1. CLI arguments (manual override)
//!   2. `DMS_*` environment variables (persisted variables, as CI exposes them)
//!   3. `.dms/config.yaml`
//!
//! Anything still unset falls back to the built-in defaults below. Layer
//! resolution is pure so the engine never reads process-wide state.

use crate::error::{DmsError, Result};
use crate::paths;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The scheduler checks once a day, so a shorter heartbeat could be missed.
pub const MIN_HEARTBEAT_INTERVAL_HOURS: u32 = 24;
pub const DEFAULT_HEARTBEAT_INTERVAL_HOURS: u32 = 168;
pub const DEFAULT_WARNING_COUNT: u32 = 2;
pub const DEFAULT_SEND_PAUSE_SECS: u64 = 5;
pub const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_BOT_NAME: &str = "dms_bot";
pub const DEFAULT_BOT_EMAIL: &str = "dms-bot@users.noreply.github.com";

pub const ENV_HEARTBEAT_INTERVAL_HOURS: &str = "DMS_HEARTBEAT_INTERVAL_HOURS";
pub const ENV_WARNING_COUNT: &str = "DMS_WARNING_COUNT";
pub const ENV_ARMED: &str = "DMS_ARMED";

/// Variables that must never be substituted into a message body.
pub const SECRET_VARIABLES: &[&str] = &["MY_PASSWORD"];

// ---------------------------------------------------------------------------
// ConfigLayer
// ---------------------------------------------------------------------------

/// One source of switch settings. Unset fields defer to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_hours: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
}

impl ConfigLayer {
    /// Build a layer from environment-style key/value pairs.
    pub fn from_env<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut layer = ConfigLayer::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                ENV_HEARTBEAT_INTERVAL_HOURS => {
                    layer.heartbeat_interval_hours = Some(parse_count(key.as_ref(), value)?);
                }
                ENV_WARNING_COUNT => {
                    layer.warning_count = Some(parse_count(key.as_ref(), value)?);
                }
                ENV_ARMED => layer.armed = Some(parse_bool(key.as_ref(), value)?),
                _ => {}
            }
        }
        Ok(layer)
    }
}

fn parse_count(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| {
        DmsError::Configuration(format!(
            "{key}='{value}' must be an integer greater than or equal to 0"
        ))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DmsError::Configuration(format!(
            "{key}='{value}' must be a boolean (true/false)"
        ))),
    }
}

// ---------------------------------------------------------------------------
// SwitchConfig
// ---------------------------------------------------------------------------

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub heartbeat_interval_hours: u32,
    pub warning_count: u32,
    pub armed: bool,
}

impl SwitchConfig {
    pub fn new(heartbeat_interval_hours: u32, warning_count: u32, armed: bool) -> Result<Self> {
        if heartbeat_interval_hours < MIN_HEARTBEAT_INTERVAL_HOURS {
            return Err(DmsError::Configuration(format!(
                "heartbeat interval must be at least {MIN_HEARTBEAT_INTERVAL_HOURS} hours \
                 (got {heartbeat_interval_hours}); heartbeat checks run once every \
                 {MIN_HEARTBEAT_INTERVAL_HOURS} hours, so make the schedule more frequent \
                 before lowering the interval"
            )));
        }
        let final_after = i64::from(heartbeat_interval_hours)
            .checked_mul(i64::from(warning_count) + 1)
            .and_then(Duration::try_hours);
        if final_after.is_none() {
            return Err(DmsError::Configuration(format!(
                "{warning_count} warnings every {heartbeat_interval_hours} hours puts the final \
                 messages too far in the future; lower the interval or the warning count"
            )));
        }
        Ok(Self {
            heartbeat_interval_hours,
            warning_count,
            armed,
        })
    }

    /// Resolve the first value set in `layers` (highest precedence first),
    /// falling back to the built-in defaults.
    pub fn resolve(layers: &[&ConfigLayer]) -> Result<Self> {
        let heartbeat = layers
            .iter()
            .find_map(|l| l.heartbeat_interval_hours)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_HOURS);
        let warnings = layers
            .iter()
            .find_map(|l| l.warning_count)
            .unwrap_or(DEFAULT_WARNING_COUNT);
        let armed = layers.iter().find_map(|l| l.armed).unwrap_or(false);
        Self::new(heartbeat, warnings, armed)
    }

    /// Inactivity needed before the step after `steps_taken` becomes due.
    /// Saturates at `Duration::MAX` past the representable range.
    pub fn threshold_for_step(&self, steps_taken: u32) -> Duration {
        i64::from(self.heartbeat_interval_hours)
            .checked_mul(i64::from(steps_taken) + 1)
            .and_then(Duration::try_hours)
            .unwrap_or(Duration::MAX)
    }
}

// ---------------------------------------------------------------------------
// BotIdentity
// ---------------------------------------------------------------------------

/// The identity marker commits are authored with. Commits by anyone else are heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    pub name: String,
    pub email: String,
}

impl Default for BotIdentity {
    fn default() -> Self {
        Self {
            name: DEFAULT_BOT_NAME.to_string(),
            email: DEFAULT_BOT_EMAIL.to_string(),
        }
    }
}

impl BotIdentity {
    pub fn authored(&self, author_name: &str, author_email: &str) -> bool {
        author_name == self.name || author_email.eq_ignore_ascii_case(&self.email)
    }
}

// ---------------------------------------------------------------------------
// Settings (.dms/config.yaml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub switch: ConfigLayer,
    /// Template directory, relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,
    #[serde(default)]
    pub bot: BotIdentity,
    #[serde(default = "default_send_pause_secs")]
    pub send_pause_secs: u64,
    #[serde(default = "default_smtp_timeout_secs")]
    pub smtp_timeout_secs: u64,
    /// Explicit provider name; otherwise derived from the sender's domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_provider: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

fn default_send_pause_secs() -> u64 {
    DEFAULT_SEND_PAUSE_SECS
}

fn default_smtp_timeout_secs() -> u64 {
    DEFAULT_SMTP_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            switch: ConfigLayer::default(),
            templates_dir: None,
            bot: BotIdentity::default(),
            send_pause_secs: DEFAULT_SEND_PAUSE_SECS,
            smtp_timeout_secs: DEFAULT_SMTP_TIMEOUT_SECS,
            mail_provider: None,
            variables: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load `.dms/config.yaml`. A missing file means all defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Settings::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(&data)
            .map_err(|e| DmsError::Configuration(format!("{}: {e}", path.display())))
    }

    pub fn templates_dir(&self, root: &Path) -> PathBuf {
        match &self.templates_dir {
            Some(dir) => root.join(dir),
            None => paths::emails_dir(root),
        }
    }
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Named string values available to `${NAME}` substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables(BTreeMap<String, String>);

impl Variables {
    /// `configured` values overlaid with `env` (environment wins). Secrets are dropped.
    pub fn layered<I>(configured: &BTreeMap<String, String>, env: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = configured.clone();
        map.extend(env);
        map.retain(|k, _| !SECRET_VARIABLES.contains(&k.as_str()));
        Variables(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Variables(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
