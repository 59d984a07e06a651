//! Run outcome and the terminal summary table.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::phase1::Phase1Report;
use crate::phase2::Phase2Report;
use crate::types::{RecordKind, RowIssue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub created: usize,
    pub reused: usize,
    pub updated: usize,
    pub skipped: usize,
    pub orphaned: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationOutcome {
    /// Only kinds whose create phase finished.
    pub kinds: BTreeMap<RecordKind, KindCounts>,
    pub deleted: usize,
    pub issues: Vec<RowIssue>,
    #[serde(skip)]
    pub elapsed: Duration,
    pub completed: bool,
}

impl MigrationOutcome {
    pub fn from_phases(phase1: &Phase1Report, phase2: Option<&Phase2Report>) -> Self {
        let count = |map: &BTreeMap<RecordKind, usize>, kind: RecordKind| map.get(&kind).copied().unwrap_or(0);
        let mut outcome = MigrationOutcome::default();
        for &kind in &phase1.completed {
            outcome.kinds.insert(
                kind,
                KindCounts {
                    created: count(&phase1.created, kind),
                    reused: count(&phase1.reused, kind),
                    skipped: count(&phase1.skipped, kind),
                    updated: phase2.map_or(0, |p| count(&p.updated, kind)),
                    orphaned: phase2.map_or(0, |p| count(&p.orphaned, kind)),
                },
            );
        }
        outcome.issues.extend(phase1.issues.iter().cloned());
        if let Some(phase2) = phase2 {
            outcome.issues.extend(phase2.issues.iter().cloned());
        }
        outcome
    }

    pub fn created(&self, kind: RecordKind) -> usize {
        self.kinds.get(&kind).map_or(0, |c| c.created)
    }

    pub fn updated(&self, kind: RecordKind) -> usize {
        self.kinds.get(&kind).map_or(0, |c| c.updated)
    }

    pub fn total_updated(&self) -> usize {
        self.kinds.values().map(|c| c.updated).sum()
    }

    /// Fixed-width table of per-kind counts followed by the elapsed time.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<16} {:>8} {:>8} {:>8} {:>8} {:>8}",
            "Object", "Created", "Reused", "Updated", "Skipped", "Removed"
        );
        let _ = writeln!(out, "{}", "-".repeat(61));
        for (kind, counts) in &self.kinds {
            let _ = writeln!(
                out,
                "{:<16} {:>8} {:>8} {:>8} {:>8} {:>8}",
                kind.plural(),
                counts.created,
                counts.reused,
                counts.updated,
                counts.skipped,
                counts.orphaned
            );
        }
        if self.kinds.is_empty() {
            let _ = writeln!(out, "(no object completed)");
        }
        let _ = writeln!(out, "{}", "-".repeat(61));
        if self.deleted > 0 {
            let _ = writeln!(out, "Deleted before migration: {}", self.deleted);
        }
        if !self.issues.is_empty() {
            let _ = writeln!(out, "Issues logged: {}", self.issues.len());
        }
        let _ = write!(out, "Elapsed: {}", format_elapsed(self.elapsed));
        out
    }
}

/// `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
