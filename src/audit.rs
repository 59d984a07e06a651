//! Audit trail for migration runs.
//!
//! Two artifacts live under the working directory:
//! - `migration_data/{kind}_migration.csv`: source id, target id and the
//!   record as copied. The next run's deletion guard reads it to find what
//!   this run created.
//! - `logs/queries.csv`: one line per request sent to either org.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::RecordKind;

pub const LEDGER_DIR: &str = "migration_data";
pub const LOG_DIR: &str = "logs";

// =============================================================================
// Migration ledger
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(alias = "production_id")]
    pub source_id: String,
    #[serde(alias = "sandbox_id")]
    pub target_id: String,
    #[serde(default)]
    pub record_data: String,
}

pub fn ledger_path(work_dir: &Path, kind: RecordKind) -> PathBuf {
    work_dir
        .join(LEDGER_DIR)
        .join(format!("{}_migration.csv", kind.file_stem()))
}

/// Write through a sibling temp file so a crash never leaves half a ledger.
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Replace the ledger for one kind. Returns the path written.
pub fn write_ledger(
    work_dir: &Path,
    kind: RecordKind,
    entries: &[LedgerEntry],
) -> Result<PathBuf, csv::Error> {
    let path = ledger_path(work_dir, kind);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if entries.is_empty() {
        writer.write_record(["source_id", "target_id", "record_data"])?;
    }
    for entry in entries {
        writer.serialize(entry)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    atomic_write(&path, &bytes)?;
    Ok(path)
}

/// Read a kind's ledger; a missing file is an empty ledger.
pub fn read_ledger(work_dir: &Path, kind: RecordKind) -> Result<Vec<LedgerEntry>, csv::Error> {
    let path = ledger_path(work_dir, kind);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(&path)?;
    reader.deserialize().collect()
}

// =============================================================================
// Query log
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct QueryLogEntry {
    pub timestamp: String,
    pub store: String,
    pub operation: String,
    pub object: String,
    pub detail: String,
    pub rows: usize,
    pub elapsed_ms: u128,
    pub outcome: String,
}

/// Append-only CSV of every request, shared by both stores.
pub struct QueryLog {
    writer: Mutex<csv::Writer<File>>,
    path: PathBuf,
}

impl QueryLog {
    pub fn open(work_dir: &Path) -> Result<Self, csv::Error> {
        let dir = work_dir.join(LOG_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join("queries.csv");
        let fresh = !path.exists() || fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);
        Ok(Self {
            writer: Mutex::new(writer),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Failures are logged, never raised: the query log must not stop a run.
    pub fn record(&self, mut entry: QueryLogEntry) {
        if entry.timestamp.is_empty() {
            entry.timestamp = Utc::now().to_rfc3339();
        }
        let mut writer = self.writer.lock();
        if let Err(e) = writer.serialize(&entry).and_then(|_| writer.flush().map_err(Into::into)) {
            log::warn!("Query log write failed: {}", e);
        }
    }
}

// =============================================================================
// Retention
// =============================================================================

/// Delete run logs older than `retention_days`. Returns the number pruned.
pub fn prune_run_logs(work_dir: &Path, retention_days: u64) -> usize {
    let log_dir = work_dir.join(LOG_DIR);
    let entries = match fs::read_dir(&log_dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };

    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let cutoff_ts = cutoff.timestamp();

    let mut pruned = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_run_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("migration_") && n.ends_with(".log"));
        if !path.is_file() || !is_run_log {
            continue;
        }
        let mtime = match path.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let mtime_secs = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        if mtime_secs < cutoff_ts && fs::remove_file(&path).is_ok() {
            pruned += 1;
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, target: &str) -> LedgerEntry {
        LedgerEntry {
            source_id: source.into(),
            target_id: target.into(),
            record_data: r#"{"Name":"Acme, Inc."}"#.into(),
        }
    }

    #[test]
    fn ledger_round_trips_and_missing_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(read_ledger(dir.path(), RecordKind::Account).unwrap().is_empty());

        let path = write_ledger(
            dir.path(),
            RecordKind::QuoteLine,
            &[entry("0QL1", "0QLa"), entry("0QL2", "0QLb")],
        )
        .unwrap();
        assert!(path.ends_with("migration_data/quote_line_item_migration.csv"));

        let read = read_ledger(dir.path(), RecordKind::QuoteLine).unwrap();
        assert_eq!(read, vec![entry("0QL1", "0QLa"), entry("0QL2", "0QLb")]);
    }

    #[test]
    fn empty_ledger_replaces_previous_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_ledger(dir.path(), RecordKind::Case, &[entry("500A", "500B")]).unwrap();
        write_ledger(dir.path(), RecordKind::Case, &[]).unwrap();
        assert!(read_ledger(dir.path(), RecordKind::Case).unwrap().is_empty());
    }

    #[test]
    fn legacy_ledger_headers_are_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = ledger_path(dir.path(), RecordKind::Contact);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "production_id,sandbox_id,record_data\n003A,003B,{}\n").unwrap();
        let read = read_ledger(dir.path(), RecordKind::Contact).unwrap();
        assert_eq!(read[0].target_id, "003B");
    }

    #[test]
    fn query_log_appends_with_single_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        for _ in 0..2 {
            let log = QueryLog::open(dir.path()).unwrap();
            log.record(QueryLogEntry {
                timestamp: String::new(),
                store: "prod".into(),
                operation: "query".into(),
                object: "Account".into(),
                detail: "SELECT Id FROM Account".into(),
                rows: 3,
                elapsed_ms: 12,
                outcome: "ok".into(),
            });
        }
        let content = fs::read_to_string(dir.path().join("logs/queries.csv")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,store,operation"));
        assert!(lines[2].contains("SELECT Id FROM Account"));
    }

    #[test]
    fn prune_removes_old_run_logs_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join(LOG_DIR);
        fs::create_dir_all(&logs).unwrap();
        let old = logs.join("migration_20240101_000000.log");
        let recent = logs.join("migration_20991231_000000.log");
        let queries = logs.join("queries.csv");
        for path in [&old, &recent, &queries] {
            fs::write(path, "x").unwrap();
        }

        let old_time =
            std::time::SystemTime::now() - std::time::Duration::from_secs(60 * 24 * 3600);
        for path in [&old, &queries] {
            filetime::set_file_mtime(path, filetime::FileTime::from_system_time(old_time))
                .expect("set mtime");
        }

        assert_eq!(prune_run_logs(dir.path(), 30), 1);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(queries.exists(), "query log is not a run log");
    }
}
