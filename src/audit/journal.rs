// =============================================================================
// Audit Journal — append-only JSON Lines, one fsync'd line per event
// =============================================================================
//
// One file per session. The write path validates the per-kind required-field
// schema before serialising; an event missing a required field is refused
// with an error rather than silently written incomplete.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::audit::events::{AuditEvent, AuditKind};

/// Append-only JSONL journal, flushed after every write.
pub struct AuditJournal {
    filepath: PathBuf,
    file: File,
    event_count: u64,
}

impl AuditJournal {
    /// Open (or create) the journal file `audit_events.jsonl` under
    /// `output_dir`, creating the directory if needed.
    pub fn open(output_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = output_dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;

        let filepath = dir.join("audit_events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filepath)
            .with_context(|| format!("failed to open journal at {}", filepath.display()))?;

        debug!(path = %filepath.display(), "audit journal opened");

        Ok(Self {
            filepath,
            file,
            event_count: 0,
        })
    }

    /// Append one event as a JSON line and flush immediately.
    ///
    /// Refuses events that fail their kind's required-field schema.
    pub fn write(&mut self, event: &AuditEvent) -> Result<()> {
        if !event.required_fields_ok() {
            bail!(
                "audit event of kind {} is missing required fields (reason: {})",
                event.kind,
                event.reason
            );
        }

        let line = serde_json::to_string(event).context("failed to serialise audit event")?;
        writeln!(self.file, "{line}").context("failed to append to audit journal")?;
        self.file.flush().context("failed to flush audit journal")?;

        self.event_count += 1;
        Ok(())
    }

    /// Events written through this handle so far.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn path(&self) -> &Path {
        &self.filepath
    }

    /// Read the journal back, filtered by kind / session / time range.
    /// Lines that fail to parse are skipped.
    pub fn query(
        &self,
        kinds: Option<&[AuditKind]>,
        session_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>> {
        let file = File::open(&self.filepath)
            .with_context(|| format!("failed to open journal at {}", self.filepath.display()))?;
        let reader = BufReader::new(file);

        let mut results = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<AuditEvent>(&line) else {
                continue;
            };

            if let Some(kinds) = kinds {
                if !kinds.contains(&event.kind) {
                    continue;
                }
            }
            if let Some(session) = session_id {
                if event.session_id != session {
                    continue;
                }
            }
            if let Some(start) = start {
                if event.timestamp < start {
                    continue;
                }
            }
            if let Some(end) = end {
                if event.timestamp > end {
                    continue;
                }
            }
            results.push(event);
        }

        Ok(results)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    fn journal() -> (tempfile::TempDir, AuditJournal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        (dir, journal)
    }

    #[test]
    fn write_and_query_roundtrip() {
        let (_dir, mut journal) = journal();

        let ev = AuditEvent::state_change(
            "s20250629_143000",
            Utc::now(),
            "Normal",
            "Defensive",
            "inventory_warn: ratio=0.56",
            Snapshot::default(),
        );
        journal.write(&ev).unwrap();
        journal
            .write(&AuditEvent::cancel_rate_exceeded(
                "s20250629_143000",
                Utc::now(),
                "cancel_rate_limit",
            ))
            .unwrap();

        assert_eq!(journal.event_count(), 2);

        let all = journal.query(None, None, None, None).unwrap();
        assert_eq!(all.len(), 2);

        let changes = journal
            .query(Some(&[AuditKind::StateChange]), None, None, None)
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].from_state.as_deref(), Some("Normal"));
        assert_eq!(changes[0].to_state.as_deref(), Some("Defensive"));
    }

    #[test]
    fn query_filters_by_session() {
        let (_dir, mut journal) = journal();
        journal
            .write(&AuditEvent::cancel_rate_exceeded("s_a", Utc::now(), "x"))
            .unwrap();
        journal
            .write(&AuditEvent::cancel_rate_exceeded("s_b", Utc::now(), "x"))
            .unwrap();

        let a = journal.query(None, Some("s_a"), None, None).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].session_id, "s_a");
    }

    #[test]
    fn incomplete_event_refused() {
        let (_dir, mut journal) = journal();

        let mut ev = AuditEvent::state_change(
            "s1",
            Utc::now(),
            "Normal",
            "Defensive",
            "x",
            Snapshot::default(),
        );
        ev.snapshot = None; // now violates the state_change schema
        assert!(journal.write(&ev).is_err());
        assert_eq!(journal.event_count(), 0);
    }

    #[test]
    fn journal_is_one_json_object_per_line() {
        let (_dir, mut journal) = journal();
        for i in 0..3 {
            journal
                .write(&AuditEvent::cancel_rate_exceeded(
                    "s1",
                    Utc::now(),
                    &format!("reason_{i}"),
                ))
                .unwrap();
        }

        let content = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("type").is_some());
            assert!(parsed.get("session").is_some());
        }
    }
}
