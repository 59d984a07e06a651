//! Record shaping for insert.
//!
//! Turns a source record into a payload the target will accept: only
//! creatable fields, sandbox-safe emails, picklist values the target knows,
//! owners and shared references that exist there. Lookups to copied kinds
//! and record types are left out here and filled in by the phase that owns
//! them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use crate::config::Config;
use crate::error::MigrationError;
use crate::graph::{EdgeTarget, MigrationGraph};
use crate::schema::{FieldType, ReferenceTarget, SchemaError, SchemaRegistry};
use crate::store::{Filter, Query, RecordStore};
use crate::types::{IssueReason, RecordKind, Row, RowIssue, SourceRecord};

const EXISTENCE_CHUNK: usize = 200;
const MULTIPICKLIST_MAX: usize = 255;

// =============================================================================
// Target directory
// =============================================================================

/// Which shared-reference ids exist in the target, plus the owner used when
/// a record's own owner does not. Source ids of catalog records found or
/// created under another id are remapped.
#[derive(Debug, Clone, Default)]
pub struct TargetDirectory {
    existing: HashMap<String, HashSet<String>>,
    remapped: HashMap<String, HashMap<String, String>>,
    fallback_owner: Option<String>,
}

impl TargetDirectory {
    pub fn new(fallback_owner: Option<String>) -> Self {
        Self {
            existing: HashMap::new(),
            remapped: HashMap::new(),
            fallback_owner,
        }
    }

    pub fn with_remapped(mut self, object: &str, source_id: &str, target_id: &str) -> Self {
        self.remap(object, source_id, target_id);
        self
    }

    pub fn remap(&mut self, object: &str, source_id: &str, target_id: &str) {
        self.remapped
            .entry(object.to_string())
            .or_default()
            .insert(source_id.to_string(), target_id.to_string());
    }

    pub fn remapped(&self, objects: &[String], id: &str) -> Option<&str> {
        objects
            .iter()
            .find_map(|o| self.remapped.get(o).and_then(|ids| ids.get(id)))
            .map(String::as_str)
    }

    pub fn with_existing(mut self, object: &str, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.existing
            .entry(object.to_string())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn exists(&self, objects: &[String], id: &str) -> bool {
        objects
            .iter()
            .any(|o| self.existing.get(o).is_some_and(|ids| ids.contains(id)))
    }

    pub fn fallback_owner(&self) -> Option<&str> {
        self.fallback_owner.as_deref()
    }

    /// Verify every shared reference in the graph against the target.
    pub async fn load(target: &dyn RecordStore, graph: &MigrationGraph) -> Result<Self, MigrationError> {
        let mut wanted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in graph.edges() {
            if let EdgeTarget::External { objects, id } = &edge.target {
                for object in objects {
                    wanted.entry(object.clone()).or_default().insert(id.clone());
                }
            }
        }

        let mut directory = TargetDirectory::new(None);
        for (object, ids) in wanted {
            let ids: Vec<String> = ids.into_iter().collect();
            let mut found = HashSet::new();
            for chunk in ids.chunks(EXISTENCE_CHUNK) {
                let mut filter = Filter::is_in("Id", chunk.iter().cloned());
                if object == "User" {
                    filter = Filter::And(vec![filter, Filter::eq("IsActive", true)]);
                }
                let query = Query::select(object.as_str(), ["Id"]).filter(filter);
                let rows = target.query(&query).await.map_err(|e| {
                    MigrationError::store(format!("Checking {} references in {}", object, target.label()), e)
                })?;
                found.extend(
                    rows.iter()
                        .filter_map(|r| r.get("Id").and_then(Value::as_str).map(str::to_string)),
                );
            }
            log::info!("{} of {} referenced {} record(s) exist in target", found.len(), ids.len(), object);
            directory.existing.insert(object, found);
        }

        let query = Query::select("User", ["Id"])
            .filter(Filter::And(vec![
                Filter::eq("IsActive", true),
                Filter::eq("UserType", "Standard"),
            ]))
            .limit(1);
        let rows = target
            .query(&query)
            .await
            .map_err(|e| MigrationError::store("Finding a default owner", e))?;
        directory.fallback_owner = rows
            .first()
            .and_then(|r| r.get("Id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if directory.fallback_owner.is_none() {
            log::warn!("No active standard user in target; records with unknown owners keep the running user");
        }
        Ok(directory)
    }
}

// =============================================================================
// Transformer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub payload: Row,
    pub issues: Vec<RowIssue>,
}

pub struct RecordTransformer<'a> {
    schema: &'a SchemaRegistry,
    directory: &'a TargetDirectory,
    config: &'a Config,
}

impl<'a> RecordTransformer<'a> {
    pub fn new(schema: &'a SchemaRegistry, directory: &'a TargetDirectory, config: &'a Config) -> Self {
        Self {
            schema,
            directory,
            config,
        }
    }

    pub fn prepare(&self, record: &SourceRecord) -> Result<Prepared, SchemaError> {
        let target = self.schema.target(record.kind)?;
        let mut payload = Row::new();
        let mut issues = Vec::new();

        for (name, value) in &record.fields {
            if name == "Id" || value.is_null() || value.is_object() || value.is_array() {
                continue;
            }
            if self.config.is_excluded(record.kind, name) {
                continue;
            }
            let Some(field) = target.get(name).filter(|f| f.createable) else {
                continue;
            };
            let issue = |reason, detail: String| {
                RowIssue::new(record.kind, reason, detail)
                    .record(record.id.clone())
                    .field(name.clone())
                    .logged()
            };

            let value = match &field.field_type {
                FieldType::Reference => match field.reference_target() {
                    Some(ReferenceTarget::External(objects)) => {
                        let Some(id) = value.as_str() else { continue };
                        if self.directory.exists(&objects, id) {
                            value.clone()
                        } else if let Some(mapped) = self.directory.remapped(&objects, id) {
                            Value::String(mapped.to_string())
                        } else if name == "OwnerId" {
                            match self.directory.fallback_owner() {
                                Some(owner) => Value::String(owner.to_string()),
                                None => continue,
                            }
                        } else {
                            issues.push(issue(
                                IssueReason::DanglingReference,
                                format!("{} {} does not exist in target", objects.join("/"), id),
                            ));
                            continue;
                        }
                    }
                    _ => continue,
                },
                FieldType::Email => match value.as_str() {
                    Some(email) if !email.ends_with(".invalid") => Value::String(format!("{email}.invalid")),
                    _ => value.clone(),
                },
                FieldType::Picklist => {
                    let Some(text) = value.as_str() else { continue };
                    if field.allows(text) {
                        value.clone()
                    } else {
                        let replacement = if field.allows("Other") {
                            Some("Other")
                        } else if !field.nillable {
                            field.picklist_values.first().map(String::as_str)
                        } else {
                            None
                        };
                        issues.push(issue(
                            IssueReason::InvalidPicklist,
                            format!("`{}` replaced by {:?}", text, replacement.unwrap_or("nothing")),
                        ));
                        match replacement {
                            Some(v) => Value::String(v.to_string()),
                            None => continue,
                        }
                    }
                }
                FieldType::MultiPicklist => {
                    let Some(text) = value.as_str() else { continue };
                    let kept = filter_multipicklist(text, |v| field.allows(v));
                    if kept.is_empty() {
                        continue;
                    }
                    Value::String(kept)
                }
                FieldType::Boolean => match value.as_str().map(str::to_ascii_lowercase).as_deref() {
                    Some("true") => Value::Bool(true),
                    Some("false") => Value::Bool(false),
                    _ => value.clone(),
                },
                _ => value.clone(),
            };
            payload.insert(name.clone(), value);
        }

        if record.kind == RecordKind::QuoteLine {
            if let Some(price) = payload.get("UnitPrice").and_then(Value::as_f64) {
                if price < 0.0 {
                    payload.insert("UnitPrice".to_string(), serde_json::json!(0.01));
                }
            }
        }

        Ok(Prepared { payload, issues })
    }
}

/// Keep valid `;`-separated values, capped at 255 characters on a value boundary.
fn filter_multipicklist(text: &str, valid: impl Fn(&str) -> bool) -> String {
    let mut kept = String::new();
    for value in text.split(';').map(str::trim).filter(|v| !v.is_empty() && valid(v)) {
        let extra = if kept.is_empty() { value.len() } else { value.len() + 1 };
        if kept.len() + extra > MULTIPICKLIST_MAX {
            break;
        }
        if !kept.is_empty() {
            kept.push(';');
        }
        kept.push_str(value);
    }
    kept
}
