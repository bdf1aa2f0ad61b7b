//! In-memory stand-ins for git, mail and the template directory.

use crate::config::BotIdentity;
use crate::error::{DmsError, Result};
use crate::history::{Commit, HistoryLog, LogSnapshot};
use crate::mail::Mailer;
use crate::template::{
    builtin_warning, MessageKind, RenderedMessage, Template, TemplateEntry, TemplateSource,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::cell::RefCell;

/// A fixed instant plus `hours`.
pub fn t(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
}

pub fn owner_commit(id: &str, at: DateTime<Utc>, message: &str) -> Commit {
    Commit {
        id: id.to_string(),
        author_name: "Owner".to_string(),
        author_email: "owner@example.com".to_string(),
        timestamp: at,
        message: message.to_string(),
    }
}

pub fn bot_commit(id: &str, at: DateTime<Utc>, message: &str) -> Commit {
    let bot = BotIdentity::default();
    Commit {
        id: id.to_string(),
        author_name: bot.name,
        author_email: bot.email,
        timestamp: at,
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// MemoryHistory
// ---------------------------------------------------------------------------

/// Newest-first commit list. Marker writes are prepended as bot commits.
#[derive(Default)]
pub struct MemoryHistory {
    commits: RefCell<Vec<Commit>>,
    writes: RefCell<usize>,
}

impl MemoryHistory {
    pub fn new(commits: Vec<Commit>) -> Self {
        Self {
            commits: RefCell::new(commits),
            writes: RefCell::new(0),
        }
    }

    pub fn snapshot(&self) -> LogSnapshot {
        let commits = self.commits.borrow().clone();
        LogSnapshot {
            head: commits.first().map(|c| c.id.clone()),
            commits,
        }
    }

    pub fn writes(&self) -> usize {
        *self.writes.borrow()
    }

    /// Simulate the owner pushing a commit.
    pub fn push_owner(&self, id: &str, at: DateTime<Utc>) {
        self.commits
            .borrow_mut()
            .insert(0, owner_commit(id, at, "heartbeat"));
    }
}

impl HistoryLog for MemoryHistory {
    fn read_log(&self) -> Result<LogSnapshot> {
        Ok(self.snapshot())
    }

    fn write_marker_commit(
        &self,
        message: &str,
        recorded_at: DateTime<Utc>,
        expected_head: Option<&str>,
    ) -> Result<String> {
        let head = self.snapshot().head;
        if head.as_deref() != expected_head {
            return Err(DmsError::HistoryConflict {
                expected: expected_head.unwrap_or("(none)").to_string(),
                found: head.unwrap_or_else(|| "(none)".to_string()),
            });
        }
        let mut writes = self.writes.borrow_mut();
        *writes += 1;
        let id = format!("marker{writes}");
        self.commits
            .borrow_mut()
            .insert(0, bot_commit(&id, recorded_at, message));
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// RecordingMailer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingMailer {
    sent: RefCell<Vec<RenderedMessage>>,
    fail_for: Vec<String>,
    /// Lose the connection after this many successful sends.
    broken_after: Option<usize>,
}

impl RecordingMailer {
    /// A mailer that rejects every message addressed to one of `recipients`.
    pub fn failing(recipients: &[&str]) -> Self {
        Self {
            fail_for: recipients.iter().map(|r| r.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn broken_after(sends: usize) -> Self {
        Self {
            broken_after: Some(sends),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<RenderedMessage> {
        self.sent.borrow().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, message: &RenderedMessage) -> Result<()> {
        if self.broken_after == Some(self.sent.borrow().len()) {
            return Err(DmsError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }
        if self.fail_for.contains(&message.recipient) {
            return Err(DmsError::Delivery {
                recipient: message.recipient.clone(),
                reason: "mailbox unavailable".to_string(),
            });
        }
        self.sent.borrow_mut().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTemplates
// ---------------------------------------------------------------------------

/// Template text keyed by kind, parsed on every lookup. Falls back to the
/// built-in warning like the directory source.
#[derive(Default)]
pub struct MemoryTemplates {
    pub warnings: Vec<(String, String)>,
    pub finals: Vec<(String, String)>,
}

impl MemoryTemplates {
    pub fn with_warning(mut self, source: &str, content: &str) -> Self {
        self.warnings.push((source.to_string(), content.to_string()));
        self
    }

    pub fn with_final(mut self, source: &str, content: &str) -> Self {
        self.finals.push((source.to_string(), content.to_string()));
        self
    }
}

impl TemplateSource for MemoryTemplates {
    fn templates(&self, kind: MessageKind) -> Result<Vec<TemplateEntry>> {
        let list = match kind {
            MessageKind::Warning => &self.warnings,
            MessageKind::Final => &self.finals,
        };
        if list.is_empty() && kind == MessageKind::Warning {
            return Ok(vec![builtin_warning()]);
        }
        Ok(list
            .iter()
            .map(|(source, content)| Template::parse(source, content))
            .collect())
    }
}
