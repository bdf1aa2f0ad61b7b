//! Message templates and rendering.
//!
//! Layout (default `emails/`, configurable):
//!   emails/*.txt            final messages, sent once the switch triggers
//!   emails/warnings/*.txt   warnings to the owner (built-in default if absent)
//!   *.example.txt           samples, listed but never sent
//!
//! File format:
//!
//! ```text
//! To: someone@example.com
//! Subject: Subject line
//!
//! Body with ${PLACEHOLDERS}...
//! ```

use crate::config::Variables;
use crate::engine::Action;
use crate::error::{DmsError, Result};
use crate::paths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const TEST_SUBJECT_PREFIX: &str = "Dead Man's Switch Test Email: ";
pub const TEST_BODY_PREAMBLE: &str = "Dear DMS User,\n\n\
    This is a test email to check if the dead man's switch is working.\n\
    The switch is not armed, so this message was routed to you instead of its recipient.\n\
    Once you arm the switch, you will not receive these test emails.\n\n";

pub const BUILTIN_WARNING_SOURCE: &str = "<built-in warning>";
const BUILTIN_WARNING: &str = "To: ${MY_EMAIL}
Subject: Dead Man's Switch warning ${DMS_WARNING_NUMBER} of ${DMS_WARNING_COUNT}

No activity has been detected in ${DMS_REPOSITORY} for ${DMS_HOURS_INACTIVE} hours.

Push a commit to the repository to reset the switch. If nothing happens, the
final messages will be sent once ${DMS_FINAL_AFTER_HOURS} hours have passed
without activity.
";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Warning,
    Final,
}

impl MessageKind {
    pub fn for_action(action: Action) -> Option<Self> {
        match action {
            Action::None => None,
            Action::SendWarning => Some(MessageKind::Warning),
            Action::SendFinal => Some(MessageKind::Final),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub source: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub example: bool,
}

/// One enumerated template: parsed, or the reason it could not be.
pub type TemplateEntry = Result<Template>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub source: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTemplate {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub messages: Vec<RenderedMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedTemplate>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub unresolved: BTreeSet<String>,
}

/// Where rendered messages go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Each message goes to its declared recipient.
    Armed,
    /// Every message goes to the operator, marked as a test.
    TestMode { operator: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Template {
    pub fn parse(source: &str, content: &str) -> Result<Self> {
        let malformed = |reason: &str| DmsError::Template {
            path: source.to_string(),
            reason: reason.to_string(),
        };

        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let mut lines = content.trim().lines().peekable();
        let mut recipient = None;
        for line in lines.by_ref() {
            if let Some(rest) = strip_header(line, "to:") {
                recipient = Some(rest);
                break;
            }
        }
        let mut subject = None;
        for line in lines.by_ref() {
            if let Some(rest) = strip_header(line, "subject:") {
                subject = Some(rest);
                break;
            }
        }
        while lines.peek().is_some_and(|l| l.trim().is_empty()) {
            lines.next();
        }
        let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();

        let recipient = recipient
            .filter(|r| !r.is_empty())
            .ok_or_else(|| malformed("no 'To:' line"))?;
        let subject = subject
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("no 'Subject:' line"))?;

        Ok(Template {
            source: source.to_string(),
            recipient,
            subject,
            body,
            example: paths::is_example_template(Path::new(source)),
        })
    }
}

fn strip_header(line: &str, header: &str) -> Option<String> {
    let line = line.trim();
    let head = line.get(..header.len())?;
    head.eq_ignore_ascii_case(header)
        .then(|| line[header.len()..].trim().to_string())
}

// ---------------------------------------------------------------------------
// TemplateSource
// ---------------------------------------------------------------------------

pub trait TemplateSource {
    fn templates(&self, kind: MessageKind) -> Result<Vec<TemplateEntry>>;
}

pub struct DirTemplateSource {
    dir: PathBuf,
}

impl DirTemplateSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load_dir(dir: &Path) -> Result<Vec<TemplateEntry>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(paths::TEMPLATE_EXT))
            .collect();
        files.sort();

        Ok(files
            .iter()
            .map(|path| {
                let source = path.display().to_string();
                let content =
                    std::fs::read_to_string(path).map_err(|e| DmsError::Template {
                        path: source.clone(),
                        reason: e.to_string(),
                    })?;
                Template::parse(&source, &content)
            })
            .collect())
    }
}

impl TemplateSource for DirTemplateSource {
    fn templates(&self, kind: MessageKind) -> Result<Vec<TemplateEntry>> {
        match kind {
            MessageKind::Final => Self::load_dir(&self.dir),
            MessageKind::Warning => {
                let entries = Self::load_dir(&paths::warnings_dir(&self.dir))?;
                let has_live = entries
                    .iter()
                    .any(|e| e.as_ref().map_or(true, |t| !t.example));
                if has_live {
                    Ok(entries)
                } else {
                    Ok(vec![builtin_warning()])
                }
            }
        }
    }
}

pub fn builtin_warning() -> TemplateEntry {
    Template::parse(BUILTIN_WARNING_SOURCE, BUILTIN_WARNING)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
static ADDRESS_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

fn address_re() -> &'static Regex {
    ADDRESS_RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap())
}

/// Replace `${NAME}` with its value. Unknown names stay verbatim and are
/// appended to `unresolved`.
pub fn substitute(text: &str, vars: &Variables, unresolved: &mut BTreeSet<String>) -> String {
    placeholder_re()
        .replace_all(text, |caps: &regex::Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => {
                unresolved.insert(caps[1].to_string());
                caps[0].to_string()
            }
        })
        .into_owned()
}

pub fn is_address(s: &str) -> bool {
    address_re().is_match(s)
}

/// Render every live template. Broken templates are skipped and logged; the
/// rest still render.
pub fn render(entries: Vec<TemplateEntry>, vars: &Variables, routing: &Routing) -> Rendered {
    let mut rendered = Rendered::default();

    for entry in entries {
        let template = match entry {
            Ok(t) if t.example => {
                tracing::debug!(template = %t.source, "skipping example template");
                continue;
            }
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "skipping template");
                rendered.skipped.push(SkippedTemplate {
                    source: template_source(&e),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let mut missing = BTreeSet::new();
        let recipient = substitute(&template.recipient, vars, &mut missing);
        let subject = substitute(&template.subject, vars, &mut missing);
        let body = substitute(&template.body, vars, &mut missing);

        if !missing.is_empty() {
            tracing::warn!(
                template = %template.source,
                variables = ?missing,
                "unresolved placeholders left verbatim"
            );
            rendered.unresolved.extend(missing);
        }

        if !is_address(&recipient) {
            let e = DmsError::Template {
                path: template.source.clone(),
                reason: format!("invalid recipient address '{recipient}'"),
            };
            tracing::warn!(error = %e, "skipping template");
            rendered.skipped.push(SkippedTemplate {
                source: template.source,
                reason: e.to_string(),
            });
            continue;
        }

        let message = match routing {
            Routing::Armed => RenderedMessage {
                source: template.source,
                recipient,
                subject,
                body,
            },
            Routing::TestMode { operator } => RenderedMessage {
                source: template.source,
                recipient: operator.clone(),
                subject: format!("{TEST_SUBJECT_PREFIX}{subject}"),
                body: format!("{TEST_BODY_PREAMBLE}{body}"),
            },
        };
        rendered.messages.push(message);
    }

    rendered
}

fn template_source(e: &DmsError) -> String {
    match e {
        DmsError::Template { path, .. } => path.clone(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
