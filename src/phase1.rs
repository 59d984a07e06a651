//! Create phase.
//!
//! Kinds are inserted parents first. Each record is shaped for the target,
//! its in-scope lookups substituted, and its record type resolved (or
//! bypassed for Opportunity). Successful rows are written to the identifier
//! map here and nowhere else.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::audit::LedgerEntry;
use crate::dummy::{PendingRewrite, ReferenceSubstituter, Substitution};
use crate::error::MigrationError;
use crate::id_map::IdentifierMap;
use crate::migration::RunContext;
use crate::record_types::TypeCodeResolution;
use crate::transform::RecordTransformer;
use crate::types::{IssueReason, RecordKind, Row, RowIssue, SourceRecord};

const TYPE_CODE_FIELD: &str = "RecordTypeId";

fn duplicate_id_re() -> &'static Regex {
    static DUPLICATE_ID_RE: OnceLock<Regex> = OnceLock::new();
    DUPLICATE_ID_RE.get_or_init(|| {
        Regex::new(r"(?i)duplicate value found.*?record with id:\s*([A-Za-z0-9]{15,18})")
            .expect("duplicate id regex should compile")
    })
}

/// Id of the existing record a create error says this row duplicates.
pub fn duplicate_of(error: &str) -> Option<String> {
    duplicate_id_re()
        .captures(error)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, Default)]
pub struct Phase1Report {
    pub created: BTreeMap<RecordKind, usize>,
    pub reused: BTreeMap<RecordKind, usize>,
    pub skipped: BTreeMap<RecordKind, usize>,
    /// Kinds whose every batch reported a final status.
    pub completed: Vec<RecordKind>,
    pub rewrites: Vec<PendingRewrite>,
    pub issues: Vec<RowIssue>,
    /// Records that existed in the target before this run.
    pub reused_ids: BTreeSet<(RecordKind, String)>,
    pub ledger: BTreeMap<RecordKind, Vec<LedgerEntry>>,
}

impl Phase1Report {
    fn skip(&mut self, kind: RecordKind, issue: RowIssue) {
        *self.skipped.entry(kind).or_default() += 1;
        self.issues.push(issue);
    }

    fn reuse(&mut self, kind: RecordKind, source_id: &str) {
        *self.reused.entry(kind).or_default() += 1;
        self.reused_ids.insert((kind, source_id.to_string()));
    }

    pub fn created(&self, kind: RecordKind) -> usize {
        self.created.get(&kind).copied().unwrap_or(0)
    }
}

struct PendingRow<'r> {
    record: &'r SourceRecord,
    rewrites: Vec<PendingRewrite>,
}

/// Insert every kind in creation order.
///
/// `retained` holds ledger entries for target records the deletion guard
/// kept; they are mapped without being created again. On a batch failure the
/// report keeps everything applied so far and the error is returned.
pub async fn run_phase1(
    ctx: &RunContext<'_>,
    ids: &mut IdentifierMap,
    retained: &BTreeMap<RecordKind, Vec<LedgerEntry>>,
    report: &mut Phase1Report,
) -> Result<(), MigrationError> {
    let transformer = RecordTransformer::new(ctx.schema, ctx.directory, ctx.config);
    let substituter = ReferenceSubstituter::new(
        ctx.graph,
        ctx.schema,
        ctx.placeholders,
        ctx.config.defer_optional_references,
    );

    for kind in RecordKind::CREATION_ORDER {
        let records = ctx.graph.records(kind);
        if records.is_empty() {
            report.completed.push(kind);
            continue;
        }

        for entry in retained.get(&kind).into_iter().flatten() {
            if ctx.graph.contains(kind, &entry.source_id) && !ids.contains(kind, &entry.source_id) {
                ids.insert(kind, &entry.source_id, &entry.target_id)?;
                report.reuse(kind, &entry.source_id);
                report.ledger.entry(kind).or_default().push(entry.clone());
                log::info!("{} {} kept in target as {}", kind, entry.source_id, entry.target_id);
            }
        }

        let mut pending = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        for record in records.iter().filter(|r| !ids.contains(kind, &r.id)) {
            let prepared = transformer.prepare(record)?;
            report.issues.extend(prepared.issues);
            let mut payload = prepared.payload;

            let rewrites = match substituter.substitute(record, &mut payload, ids)? {
                Substitution::Ready { rewrites } => rewrites,
                Substitution::Skip(issue) => {
                    report.skip(kind, issue);
                    continue;
                }
            };
            if let Some(issue) = apply_type_code(ctx, record, &mut payload)? {
                report.issues.push(issue);
            }
            pending.push(PendingRow { record, rewrites });
            rows.push(payload);
        }

        log::info!("Creating {} {}", rows.len(), kind.plural());
        let dispatched = ctx.dispatcher.create(kind, rows.clone()).await;

        let mut outcomes = dispatched.outcomes;
        outcomes.sort_by_key(|o| o.row_index);
        for outcome in outcomes {
            let (Some(row), Some(payload)) = (pending.get_mut(outcome.row_index), rows.get(outcome.row_index)) else {
                continue;
            };
            let source_id = row.record.id.as_str();
            match outcome.result {
                Ok(target_id) => {
                    ids.insert(kind, source_id, &target_id)?;
                    *report.created.entry(kind).or_default() += 1;
                    report.rewrites.append(&mut row.rewrites);
                    report.ledger.entry(kind).or_default().push(LedgerEntry {
                        source_id: source_id.to_string(),
                        target_id,
                        record_data: Value::Object(payload.clone()).to_string(),
                    });
                }
                Err(error) => match duplicate_of(&error) {
                    Some(existing) => {
                        log::warn!("{} {} duplicates {}; reusing it", kind, source_id, existing);
                        ids.insert(kind, source_id, &existing)?;
                        report.reuse(kind, source_id);
                    }
                    None => {
                        let issue = RowIssue::new(kind, IssueReason::Rejected, error)
                            .record(source_id)
                            .logged();
                        report.skip(kind, issue);
                    }
                },
            }
        }

        if let Some(failure) = dispatched.failure {
            return Err(failure.into());
        }
        log::info!(
            "{}: {} created, {} reused, {} skipped",
            kind,
            report.created(kind),
            report.reused.get(&kind).copied().unwrap_or(0),
            report.skipped.get(&kind).copied().unwrap_or(0)
        );
        report.completed.push(kind);
    }
    Ok(())
}

/// Set the create-time record type. Opportunity gets the bypass value (or
/// none); every other kind gets its resolved value.
fn apply_type_code(
    ctx: &RunContext<'_>,
    record: &SourceRecord,
    payload: &mut Row,
) -> Result<Option<RowIssue>, MigrationError> {
    let writable = ctx
        .schema
        .target(record.kind)?
        .get(TYPE_CODE_FIELD)
        .is_some_and(|f| f.createable);
    if !writable {
        return Ok(None);
    }

    if record.kind == RecordKind::Opportunity {
        match ctx.config.opportunity_bypass_record_type_id.as_deref() {
            Some(bypass) => {
                payload.insert(TYPE_CODE_FIELD.to_string(), Value::String(bypass.to_string()));
            }
            None => {
                payload.remove(TYPE_CODE_FIELD);
            }
        }
        return Ok(None);
    }

    let Some(source_type) = record.str_field(TYPE_CODE_FIELD) else {
        return Ok(None);
    };
    match ctx.type_codes.resolve(record.kind, source_type) {
        TypeCodeResolution::Resolved(target_type) => {
            payload.insert(TYPE_CODE_FIELD.to_string(), Value::String(target_type));
            Ok(None)
        }
        TypeCodeResolution::Missing { developer_name } => {
            payload.remove(TYPE_CODE_FIELD);
            Ok(Some(
                RowIssue::new(
                    record.kind,
                    IssueReason::MissingTypeCode,
                    format!("record type {} does not exist in target", developer_name),
                )
                .record(record.id.clone())
                .field(TYPE_CODE_FIELD)
                .logged(),
            ))
        }
        TypeCodeResolution::Unknown => {
            payload.remove(TYPE_CODE_FIELD);
            log::debug!("{} {}: unknown record type {}", record.kind, record.id, source_type);
            Ok(None)
        }
    }
}
