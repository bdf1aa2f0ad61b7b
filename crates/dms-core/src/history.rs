//! Clock/history reader.
//!
//! Reads the commit log (newest first) and derives the two facts the engine
//! needs: when the owner last showed a sign of life, and the newest marker the
//! switch itself wrote. The git implementation shells out to the `git` binary.

use crate::config::BotIdentity;
use crate::error::{DmsError, Result};
use crate::marker::{decode_marker, MarkerRecord, StateMarker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// How far back `git log` reads. Each inactivity episode adds at most
/// `warning_count + 1` bot commits on top of the last heartbeat.
pub const HISTORY_DEPTH: usize = 1000;

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub author_name: String,
    pub author_email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl Commit {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// The log as read at one instant, newest commit first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSnapshot {
    pub head: Option<String>,
    pub commits: Vec<Commit>,
}

/// What the engine needs to know about history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub last_activity_at: DateTime<Utc>,
    pub last_activity_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_marker: Option<StateMarker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
}

// ---------------------------------------------------------------------------
// HistoryLog
// ---------------------------------------------------------------------------

pub trait HistoryLog {
    /// Read the log, newest first.
    fn read_log(&self) -> Result<LogSnapshot>;

    /// Append one marker commit authored by the bot identity, dated `recorded_at`.
    ///
    /// Fails with [`DmsError::HistoryConflict`] if the head moved away from
    /// `expected_head` since the log was read. Returns the new commit id.
    fn write_marker_commit(
        &self,
        message: &str,
        recorded_at: DateTime<Utc>,
        expected_head: Option<&str>,
    ) -> Result<String>;
}

// ---------------------------------------------------------------------------
// observe
// ---------------------------------------------------------------------------

/// Fold a snapshot into the latest heartbeat and the current marker.
pub fn observe(snapshot: &LogSnapshot, bot: &BotIdentity) -> Result<Observation> {
    let commits = &snapshot.commits;
    let by_bot = |c: &Commit| bot.authored(&c.author_name, &c.author_email);

    let activity = commits.iter().find(|c| !by_bot(c)).ok_or_else(|| {
        DmsError::HistoryRead(format!(
            "no commit by anyone other than '{}' in the last {} commits",
            bot.name,
            commits.len()
        ))
    })?;

    let last_marker = match commits.iter().position(by_bot) {
        Some(idx) => Some(fold_marker(commits, idx, bot)?),
        None => None,
    };

    Ok(Observation {
        last_activity_at: activity.timestamp,
        last_activity_commit: activity.id.clone(),
        last_marker,
        head: snapshot.head.clone(),
    })
}

fn fold_marker(commits: &[Commit], idx: usize, bot: &BotIdentity) -> Result<StateMarker> {
    let newest = &commits[idx];
    let decode = |c: &Commit| {
        decode_marker(&c.message).map_err(|reason| DmsError::CorruptMarker {
            commit: c.short_id().to_string(),
            reason,
        })
    };

    let (warnings_issued, triggered) = match decode(newest)? {
        MarkerRecord::Step {
            warnings_issued,
            triggered,
        } => (warnings_issued, triggered),
        MarkerRecord::LegacyWarning => (legacy_warnings_from(commits, idx, bot, decode)?, false),
        MarkerRecord::LegacyFinal => (legacy_warnings_from(commits, idx + 1, bot, decode)?, true),
    };

    Ok(StateMarker {
        warnings_issued,
        triggered,
        recorded_at: newest.timestamp,
    })
}

/// Legacy warning markers carry no count: count the unbroken run of them
/// starting at `start`, stopping at the first heartbeat.
fn legacy_warnings_from<F>(
    commits: &[Commit],
    start: usize,
    bot: &BotIdentity,
    decode: F,
) -> Result<u32>
where
    F: Fn(&Commit) -> Result<MarkerRecord>,
{
    let mut count = 0;
    for commit in commits.iter().skip(start) {
        if !bot.authored(&commit.author_name, &commit.author_email) {
            break;
        }
        match decode(commit)? {
            MarkerRecord::LegacyWarning => count += 1,
            MarkerRecord::Step {
                warnings_issued, ..
            } => {
                count += warnings_issued;
                break;
            }
            MarkerRecord::LegacyFinal => break,
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// GitHistory
// ---------------------------------------------------------------------------

pub struct GitHistory {
    repo: PathBuf,
    git: PathBuf,
    bot: BotIdentity,
    push: bool,
}

impl GitHistory {
    /// Locate the `git` binary and bind to the repository at `repo`.
    pub fn discover(repo: impl AsRef<Path>, bot: BotIdentity) -> Result<Self> {
        let git = which::which("git").map_err(|_| DmsError::GitNotInstalled)?;
        Ok(Self {
            repo: repo.as_ref().to_path_buf(),
            git,
            bot,
            push: false,
        })
    }

    /// Push each marker commit to the default remote after writing it.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    fn run_git(&self, args: &[&str], envs: &[(&str, String)]) -> Result<String> {
        let output = Command::new(&self.git)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .current_dir(&self.repo)
            .output()
            .map_err(|e| DmsError::Git {
                command: args.first().copied().unwrap_or("").to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DmsError::Git {
                command: args.join(" "),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn head(&self) -> Result<Option<String>> {
        match self.run_git(&["rev-parse", "--verify", "--quiet", "HEAD"], &[]) {
            Ok(out) => Ok(Some(out.trim().to_string())),
            // An unborn branch has no HEAD commit yet.
            Err(DmsError::Git { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl HistoryLog for GitHistory {
    fn read_log(&self) -> Result<LogSnapshot> {
        let head = self
            .head()
            .map_err(|e| DmsError::HistoryRead(e.to_string()))?;
        if head.is_none() {
            return Err(DmsError::HistoryRead(format!(
                "{} has no commits or is not a git repository",
                self.repo.display()
            )));
        }

        let max_count = format!("--max-count={HISTORY_DEPTH}");
        let out = self
            .run_git(
                &[
                    "log",
                    &max_count,
                    "--format=%H%x1f%an%x1f%ae%x1f%cI%x1f%B%x1e",
                ],
                &[],
            )
            .map_err(|e| DmsError::HistoryRead(e.to_string()))?;

        Ok(LogSnapshot {
            head,
            commits: parse_log(&out)?,
        })
    }

    fn write_marker_commit(
        &self,
        message: &str,
        recorded_at: DateTime<Utc>,
        expected_head: Option<&str>,
    ) -> Result<String> {
        let current = self.head()?;
        if current.as_deref() != expected_head {
            return Err(DmsError::HistoryConflict {
                expected: expected_head.unwrap_or("(none)").to_string(),
                found: current.unwrap_or_else(|| "(none)".to_string()),
            });
        }

        let date = recorded_at.format("%Y-%m-%dT%H:%M:%S+00:00").to_string();
        let envs = [
            ("GIT_AUTHOR_NAME", self.bot.name.clone()),
            ("GIT_AUTHOR_EMAIL", self.bot.email.clone()),
            ("GIT_COMMITTER_NAME", self.bot.name.clone()),
            ("GIT_COMMITTER_EMAIL", self.bot.email.clone()),
            ("GIT_AUTHOR_DATE", date.clone()),
            ("GIT_COMMITTER_DATE", date),
        ];
        self.run_git(
            &[
                "-c",
                "commit.gpgsign=false",
                "commit",
                "--allow-empty",
                "--no-verify",
                "--message",
                message,
            ],
            &envs,
        )?;

        let id = self
            .head()?
            .ok_or_else(|| DmsError::HistoryRead("HEAD missing after marker commit".into()))?;

        if self.push {
            self.run_git(&["push"], &[])?;
            tracing::info!(commit = %id, "pushed marker commit");
        }
        Ok(id)
    }
}

fn parse_log(out: &str) -> Result<Vec<Commit>> {
    out.split(RECORD_SEP)
        .map(|record| record.trim_start_matches('\n'))
        .filter(|record| !record.trim().is_empty())
        .map(parse_record)
        .collect()
}

fn parse_record(record: &str) -> Result<Commit> {
    let fields: Vec<&str> = record.splitn(5, FIELD_SEP).collect();
    let [id, author_name, author_email, timestamp, message] = fields[..] else {
        return Err(DmsError::HistoryRead(format!(
            "unexpected git log record: {record:?}"
        )));
    };
    let timestamp = DateTime::parse_from_rfc3339(timestamp.trim())
        .map_err(|e| {
            DmsError::HistoryRead(format!("bad timestamp '{timestamp}' on commit {id}: {e}"))
        })?
        .with_timezone(&Utc);
    Ok(Commit {
        id: id.trim().to_string(),
        author_name: author_name.to_string(),
        author_email: author_email.to_string(),
        timestamp,
        message: message.trim_end().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
