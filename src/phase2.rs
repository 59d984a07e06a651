//! Update phase.
//!
//! Runs once every create batch has settled. Each created record gets one
//! update carrying its real lookups in place of placeholders or omitted
//! fields, plus the true record type for Opportunity. A record whose
//! placeholder cannot be replaced is removed, so no placeholder reference
//! outlives a successful run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::dummy::PendingRewrite;
use crate::error::MigrationError;
use crate::graph::EdgeTarget;
use crate::id_map::IdentifierMap;
use crate::migration::RunContext;
use crate::phase1::Phase1Report;
use crate::record_types::TypeCodeResolution;
use crate::types::{IssueReason, RecordKind, Row, RowIssue, SourceRecord};

#[derive(Debug, Clone, Default)]
pub struct Phase2Report {
    pub updated: BTreeMap<RecordKind, usize>,
    pub orphaned: BTreeMap<RecordKind, usize>,
    pub completed: Vec<RecordKind>,
    pub issues: Vec<RowIssue>,
}

impl Phase2Report {
    pub fn updated(&self, kind: RecordKind) -> usize {
        self.updated.get(&kind).copied().unwrap_or(0)
    }
}

/// Update rows for one kind, with the records that must be removed instead.
#[derive(Debug, Default)]
struct KindPlan {
    rows: Vec<Row>,
    /// target id -> (source id, carries a placeholder)
    owners: HashMap<String, (String, bool)>,
    orphans: Vec<(String, String)>,
    issues: Vec<RowIssue>,
}

struct Planner<'c, 'a> {
    ctx: &'c RunContext<'a>,
    ids: &'c IdentifierMap,
    phase1: &'c Phase1Report,
    removed: &'c HashSet<(RecordKind, String)>,
}

impl Planner<'_, '_> {
    fn resolve(&self, kind: RecordKind, source_id: &str) -> Option<&str> {
        if self.removed.contains(&(kind, source_id.to_string())) {
            return None;
        }
        self.ids.get(kind, source_id)
    }

    fn plan(&self, kind: RecordKind, rewrites: &HashMap<&str, Vec<&PendingRewrite>>) -> Result<KindPlan, MigrationError> {
        let mut plan = KindPlan::default();
        for record in self.ctx.graph.records(kind) {
            let Some(target_id) = self.resolve(kind, &record.id) else {
                continue;
            };
            let mut row = Row::new();
            row.insert("Id".to_string(), Value::String(target_id.to_string()));

            let reused = self.phase1.reused_ids.contains(&(kind, record.id.clone()));
            let mut orphan = false;
            let mut has_placeholder = false;
            if reused {
                self.relink_reused(record, &mut row)?;
            } else {
                for rewrite in rewrites.get(record.id.as_str()).into_iter().flatten() {
                    has_placeholder |= rewrite.placeholder.is_some();
                    match self.resolve(rewrite.target_kind, &rewrite.target_source_id) {
                        Some(id) => {
                            row.insert(rewrite.field.clone(), Value::String(id.to_string()));
                        }
                        None if rewrite.placeholder.is_some() => orphan = true,
                        None => plan.issues.push(
                            RowIssue::new(
                                kind,
                                IssueReason::ParentMissing,
                                format!("{} {} was not created", rewrite.target_kind, rewrite.target_source_id),
                            )
                            .record(record.id.clone())
                            .field(rewrite.field.clone())
                            .logged(),
                        ),
                    }
                }
                if kind == RecordKind::Opportunity {
                    if let Some(issue) = self.restore_type_code(record, &mut row)? {
                        plan.issues.push(issue);
                    }
                }
            }

            if orphan {
                plan.orphans.push((target_id.to_string(), record.id.clone()));
                continue;
            }
            if row.len() > 1 {
                plan.owners
                    .insert(target_id.to_string(), (record.id.clone(), has_placeholder));
                plan.rows.push(row);
            }
        }
        Ok(plan)
    }

    /// A record kept from an earlier run points at that run's records; point
    /// every updateable in-scope lookup at this run's.
    fn relink_reused(&self, record: &SourceRecord, row: &mut Row) -> Result<(), MigrationError> {
        let target = self.ctx.schema.target(record.kind)?;
        for edge in self.ctx.graph.edges_from(record.kind, &record.id) {
            let EdgeTarget::InGraph { kind, id } = &edge.target else {
                continue;
            };
            if !target.get(&edge.field).is_some_and(|f| f.updateable) {
                continue;
            }
            if let Some(target_id) = self.resolve(*kind, id) {
                row.insert(edge.field.clone(), Value::String(target_id.to_string()));
            }
        }
        Ok(())
    }

    fn restore_type_code(&self, record: &SourceRecord, row: &mut Row) -> Result<Option<RowIssue>, MigrationError> {
        let field = "RecordTypeId";
        let updateable = self
            .ctx
            .schema
            .target(record.kind)?
            .get(field)
            .is_some_and(|f| f.updateable);
        let Some(source_type) = record.str_field(field).filter(|_| updateable) else {
            return Ok(None);
        };
        Ok(match self.ctx.type_codes.resolve(record.kind, source_type) {
            TypeCodeResolution::Resolved(target_type) => {
                row.insert(field.to_string(), Value::String(target_type));
                None
            }
            TypeCodeResolution::Missing { developer_name } => Some(
                RowIssue::new(
                    record.kind,
                    IssueReason::MissingTypeCode,
                    format!("record type {} does not exist in target; not restored", developer_name),
                )
                .record(record.id.clone())
                .field(field)
                .logged(),
            ),
            TypeCodeResolution::Unknown => None,
        })
    }
}

/// Rewrite every created record. Returns after the first kind whose update
/// or orphan removal fails wholesale, or when a record created on a
/// placeholder was neither updated nor removed.
pub async fn run_phase2(
    ctx: &RunContext<'_>,
    ids: &IdentifierMap,
    phase1: &Phase1Report,
    report: &mut Phase2Report,
) -> Result<(), MigrationError> {
    let mut removed: HashSet<(RecordKind, String)> = HashSet::new();
    let mut rewritten: HashSet<(RecordKind, String)> = HashSet::new();

    for kind in RecordKind::CREATION_ORDER {
        let mut rewrites: HashMap<&str, Vec<&PendingRewrite>> = HashMap::new();
        for rewrite in phase1.rewrites.iter().filter(|r| r.kind == kind) {
            rewrites.entry(rewrite.source_id.as_str()).or_default().push(rewrite);
        }

        let plan = Planner {
            ctx,
            ids,
            phase1,
            removed: &removed,
        }
        .plan(kind, &rewrites)?;
        report.issues.extend(plan.issues);
        let mut orphans = plan.orphans;

        if !plan.rows.is_empty() {
            log::info!("Updating {} {}", plan.rows.len(), kind.plural());
            let dispatched = ctx.dispatcher.update(kind, plan.rows).await;
            for outcome in dispatched.outcomes {
                let Some((source_id, has_placeholder)) = plan.owners.get(&outcome.id) else {
                    continue;
                };
                match outcome.result {
                    Ok(()) => {
                        *report.updated.entry(kind).or_default() += 1;
                        rewritten.insert((kind, source_id.clone()));
                    }
                    Err(error) if *has_placeholder => {
                        log::warn!("{} {} update failed with a placeholder in place: {}", kind, source_id, error);
                        orphans.push((outcome.id.clone(), source_id.clone()));
                    }
                    Err(error) => report.issues.push(
                        RowIssue::new(kind, IssueReason::Rejected, error)
                            .record(source_id.clone())
                            .logged(),
                    ),
                }
            }
            if let Some(failure) = dispatched.failure {
                return Err(failure.into());
            }
        }

        if !orphans.is_empty() {
            remove_orphans(ctx, kind, orphans, &mut removed, report).await?;
        }
        report.completed.push(kind);
    }

    let settled: HashSet<(RecordKind, String)> = rewritten.union(&removed).cloned().collect();
    if let Some((kind, count)) = unsettled_placeholders(&phase1.rewrites, &settled).into_iter().next() {
        log::error!("{} {} created on a placeholder were never rewritten", count, kind.plural());
        return Err(MigrationError::PlaceholderLeak { kind, count });
    }
    Ok(())
}

/// Records created with a placeholder that are in neither `settled` set,
/// counted per kind.
fn unsettled_placeholders(
    rewrites: &[PendingRewrite],
    settled: &HashSet<(RecordKind, String)>,
) -> BTreeMap<RecordKind, usize> {
    let open: BTreeSet<(RecordKind, &str)> = rewrites
        .iter()
        .filter(|r| r.placeholder.is_some())
        .filter(|r| !settled.contains(&(r.kind, r.source_id.clone())))
        .map(|r| (r.kind, r.source_id.as_str()))
        .collect();
    let mut counts = BTreeMap::new();
    for (kind, _) in open {
        *counts.entry(kind).or_default() += 1;
    }
    counts
}

async fn remove_orphans(
    ctx: &RunContext<'_>,
    kind: RecordKind,
    orphans: Vec<(String, String)>,
    removed: &mut HashSet<(RecordKind, String)>,
    report: &mut Phase2Report,
) -> Result<(), MigrationError> {
    log::warn!("Removing {} {} left pointing at a placeholder", orphans.len(), kind.plural());
    let sources: HashMap<String, String> = orphans.iter().cloned().collect();
    let dispatched = ctx
        .dispatcher
        .delete(kind, orphans.into_iter().map(|(target, _)| target).collect())
        .await;
    if let Some(failure) = dispatched.failure {
        return Err(failure.into());
    }

    let mut leaked = 0;
    for outcome in dispatched.outcomes {
        let source_id = sources.get(&outcome.id).cloned().unwrap_or_default();
        match outcome.result {
            Ok(()) => {
                *report.orphaned.entry(kind).or_default() += 1;
                report.issues.push(
                    RowIssue::new(kind, IssueReason::OrphanRemoved, format!("target record {} deleted", outcome.id))
                        .record(source_id.clone())
                        .logged(),
                );
                removed.insert((kind, source_id));
            }
            Err(error) => {
                log::error!("{} {} could not be removed: {}", kind, outcome.id, error);
                leaked += 1;
            }
        }
    }
    if leaked > 0 {
        return Err(MigrationError::PlaceholderLeak { kind, count: leaked });
    }
    Ok(())
}
