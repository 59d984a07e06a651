//! Placeholder references.
//!
//! A record is created before the records it points at exist in the target,
//! so its in-scope lookups are either left out (optional) or pointed at a
//! well-known placeholder record (required). Each substitution is recorded
//! as a [`PendingRewrite`] and put right by the update phase.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, Local};
use serde_json::{json, Value};

use crate::error::MigrationError;
use crate::graph::{EdgeTarget, MigrationGraph};
use crate::id_map::IdentifierMap;
use crate::schema::{FieldSchema, SchemaError, SchemaRegistry};
use crate::store::{Filter, Query, RecordStore};
use crate::types::{IssueReason, RecordKind, Row, RowIssue, SourceRecord};

// =============================================================================
// Placeholder records
// =============================================================================

/// Field and value identifying a kind's placeholder record.
fn marker(kind: RecordKind) -> Option<(&'static str, &'static str)> {
    match kind {
        RecordKind::Account => Some(("Name", "NO ACCOUNT")),
        RecordKind::Contact => Some(("LastName", "NO CONTACT")),
        RecordKind::Opportunity => Some(("Name", "NO OPPORTUNITY")),
        RecordKind::Quote => Some(("Name", "NO QUOTE")),
        RecordKind::Order => Some(("Name", "NO ORDER")),
        RecordKind::Case => Some(("Subject", "NO CASE")),
        RecordKind::QuoteLine | RecordKind::OrderItem => None,
    }
}

fn prerequisites(kind: RecordKind) -> &'static [RecordKind] {
    match kind {
        RecordKind::Contact | RecordKind::Opportunity | RecordKind::Order => &[RecordKind::Account],
        RecordKind::Quote => &[RecordKind::Account, RecordKind::Opportunity],
        _ => &[],
    }
}

/// Target ids of the placeholder records for this run.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    ids: BTreeMap<RecordKind, String>,
}

impl Placeholders {
    pub fn has_placeholder(kind: RecordKind) -> bool {
        marker(kind).is_some()
    }

    pub fn get(&self, kind: RecordKind) -> Option<&str> {
        self.ids.get(&kind).map(String::as_str)
    }

    pub fn is_placeholder(&self, id: &str) -> bool {
        self.ids.values().any(|p| p == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[cfg(test)]
    pub fn fixed(ids: impl IntoIterator<Item = (RecordKind, &'static str)>) -> Self {
        Self {
            ids: ids.into_iter().map(|(k, id)| (k, id.to_string())).collect(),
        }
    }

    /// Find or create a placeholder for every kind in `needed`, plus the
    /// placeholders those depend on.
    pub async fn ensure(target: &dyn RecordStore, needed: &BTreeSet<RecordKind>) -> Result<Self, MigrationError> {
        let mut all: BTreeSet<RecordKind> = BTreeSet::new();
        for &kind in needed.iter().filter(|k| Self::has_placeholder(**k)) {
            all.extend(prerequisites(kind));
            all.insert(kind);
        }

        let mut placeholders = Placeholders::default();
        for kind in RecordKind::CREATION_ORDER.into_iter().filter(|k| all.contains(k)) {
            let id = match placeholders.find(target, kind).await? {
                Some(id) => {
                    log::info!("Reusing placeholder {} {}", kind, id);
                    id
                }
                None => placeholders.create(target, kind).await?,
            };
            placeholders.ids.insert(kind, id);
        }
        Ok(placeholders)
    }

    async fn find(&self, target: &dyn RecordStore, kind: RecordKind) -> Result<Option<String>, MigrationError> {
        let Some((field, value)) = marker(kind) else {
            return Ok(None);
        };
        let query = Query::select(kind.api_name(), ["Id"])
            .filter(Filter::eq(field, value))
            .order_by("Id")
            .limit(1);
        let rows = target.query(&query).await.map_err(|e| MigrationError::Placeholder {
            kind,
            reason: e.to_string(),
        })?;
        Ok(rows
            .first()
            .and_then(|r| r.get("Id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn payload(&self, kind: RecordKind) -> Result<Row, MigrationError> {
        let parent = |k: RecordKind| {
            self.get(k).map(str::to_string).ok_or_else(|| MigrationError::Placeholder {
                kind,
                reason: format!("placeholder {} is not available", k),
            })
        };
        let today = Local::now().date_naive();
        let value = match kind {
            RecordKind::Account => json!({"Name": "NO ACCOUNT"}),
            RecordKind::Contact => json!({"LastName": "NO CONTACT", "AccountId": parent(RecordKind::Account)?}),
            RecordKind::Opportunity => json!({
                "Name": "NO OPPORTUNITY",
                "StageName": "Prospecting",
                "CloseDate": (today + Duration::days(30)).format("%Y-%m-%d").to_string(),
                "AccountId": parent(RecordKind::Account)?,
            }),
            RecordKind::Quote => json!({"Name": "NO QUOTE", "OpportunityId": parent(RecordKind::Opportunity)?}),
            RecordKind::Order => json!({
                "Name": "NO ORDER",
                "Status": "Draft",
                "EffectiveDate": today.format("%Y-%m-%d").to_string(),
                "AccountId": parent(RecordKind::Account)?,
            }),
            RecordKind::Case => json!({"Subject": "NO CASE"}),
            RecordKind::QuoteLine | RecordKind::OrderItem => {
                return Err(MigrationError::Placeholder {
                    kind,
                    reason: "kind has no placeholder record".to_string(),
                })
            }
        };
        match value {
            Value::Object(row) => Ok(row),
            _ => Ok(Row::new()),
        }
    }

    async fn create(&self, target: &dyn RecordStore, kind: RecordKind) -> Result<String, MigrationError> {
        let row = self.payload(kind)?;
        let outcomes = target
            .bulk_create(kind.api_name(), &[row])
            .await
            .map_err(|e| MigrationError::Placeholder {
                kind,
                reason: e.to_string(),
            })?;
        match outcomes.into_iter().next().map(|o| o.result) {
            Some(Ok(id)) => {
                log::info!("Created placeholder {} {}", kind, id);
                Ok(id)
            }
            Some(Err(reason)) => Err(MigrationError::Placeholder { kind, reason }),
            None => Err(MigrationError::Placeholder {
                kind,
                reason: "no result returned".to_string(),
            }),
        }
    }
}

// =============================================================================
// Substitution
// =============================================================================

/// One lookup that was left out or pointed at a placeholder at create time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRewrite {
    pub kind: RecordKind,
    pub source_id: String,
    pub field: String,
    pub target_kind: RecordKind,
    pub target_source_id: String,
    /// `None` when the field was omitted rather than substituted.
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Substitution {
    Ready { rewrites: Vec<PendingRewrite> },
    Skip(RowIssue),
}

pub struct ReferenceSubstituter<'a> {
    graph: &'a MigrationGraph,
    schema: &'a SchemaRegistry,
    placeholders: &'a Placeholders,
    defer_optional: bool,
}

/// How a single in-scope lookup is carried into the create payload.
enum Plan {
    RealId,
    Placeholder,
    Defer,
}

fn plan_for(field: &FieldSchema, defer_optional: bool) -> Plan {
    if !field.updateable {
        Plan::RealId
    } else if field.required_on_create() || !defer_optional {
        Plan::Placeholder
    } else {
        Plan::Defer
    }
}

/// Placeholder kinds a graph will need at create time.
pub fn needed_placeholders(
    graph: &MigrationGraph,
    schema: &SchemaRegistry,
    defer_optional: bool,
) -> BTreeSet<RecordKind> {
    let mut needed = BTreeSet::new();
    for edge in graph.edges() {
        let EdgeTarget::InGraph { kind, .. } = &edge.target else {
            continue;
        };
        let Some(field) = schema
            .target(edge.from_kind)
            .ok()
            .and_then(|s| s.get(&edge.field))
            .filter(|f| f.createable)
        else {
            continue;
        };
        if matches!(plan_for(field, defer_optional), Plan::Placeholder) && Placeholders::has_placeholder(*kind) {
            needed.insert(*kind);
        }
    }
    needed
}

impl<'a> ReferenceSubstituter<'a> {
    pub fn new(
        graph: &'a MigrationGraph,
        schema: &'a SchemaRegistry,
        placeholders: &'a Placeholders,
        defer_optional: bool,
    ) -> Self {
        Self {
            graph,
            schema,
            placeholders,
            defer_optional,
        }
    }

    /// Fill `payload` with create-time values for every in-scope lookup of `record`.
    pub fn substitute(
        &self,
        record: &SourceRecord,
        payload: &mut Row,
        ids: &IdentifierMap,
    ) -> Result<Substitution, SchemaError> {
        let target = self.schema.target(record.kind)?;
        let mut rewrites = Vec::new();

        for edge in self.graph.edges_from(record.kind, &record.id) {
            let (to_kind, to_id) = match &edge.target {
                EdgeTarget::InGraph { kind, id } => (*kind, id),
                EdgeTarget::OutOfGraph { kind, id } => {
                    log::debug!(
                        "{} {}: {} points at {} {} outside this run; left unset",
                        record.kind,
                        record.id,
                        edge.field,
                        kind,
                        id
                    );
                    payload.remove(&edge.field);
                    continue;
                }
                EdgeTarget::TypeCode { .. } | EdgeTarget::External { .. } => continue,
            };
            let Some(field) = target.get(&edge.field).filter(|f| f.createable) else {
                continue;
            };
            let real = ids.get(to_kind, to_id);
            let parent_missing = || {
                RowIssue::new(
                    record.kind,
                    IssueReason::ParentMissing,
                    format!("{} {} was not created", to_kind, to_id),
                )
                .record(record.id.clone())
                .field(edge.field.clone())
                .logged()
            };
            let rewrite = |placeholder: Option<&str>| PendingRewrite {
                kind: record.kind,
                source_id: record.id.clone(),
                field: edge.field.clone(),
                target_kind: to_kind,
                target_source_id: to_id.clone(),
                placeholder: placeholder.map(str::to_string),
            };

            match plan_for(field, self.defer_optional) {
                Plan::RealId => match real {
                    Some(id) => {
                        payload.insert(edge.field.clone(), Value::String(id.to_string()));
                    }
                    None => return Ok(Substitution::Skip(parent_missing())),
                },
                Plan::Placeholder => match (self.placeholders.get(to_kind), real) {
                    (Some(placeholder), _) => {
                        payload.insert(edge.field.clone(), Value::String(placeholder.to_string()));
                        rewrites.push(rewrite(Some(placeholder)));
                    }
                    (None, Some(id)) => {
                        payload.insert(edge.field.clone(), Value::String(id.to_string()));
                    }
                    (None, None) if field.required_on_create() => {
                        return Ok(Substitution::Skip(parent_missing()));
                    }
                    (None, None) => {
                        payload.remove(&edge.field);
                        rewrites.push(rewrite(None));
                    }
                },
                Plan::Defer => {
                    payload.remove(&edge.field);
                    rewrites.push(rewrite(None));
                }
            }
        }
        Ok(Substitution::Ready { rewrites })
    }
}
