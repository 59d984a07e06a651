//! Dependency graph construction.
//!
//! Starting from the root accounts, each kind is fetched through its parents
//! in the hierarchy, one batched query per chunk of parent ids. Candidates are
//! ordered by source id and capped per parent before their own children are
//! fetched, so a limit of 0 removes a kind and everything under it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::{Config, ConfigError, KindLimit};
use crate::error::MigrationError;
use crate::schema::{ReferenceTarget, SchemaRegistry};
use crate::store::{Filter, Query, RecordStore};
use crate::types::{RecordKind, Row, SourceRecord};

/// Parent ids per `IN (...)` clause.
pub const FETCH_CHUNK: usize = 100;

// =============================================================================
// Graph
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget {
    /// A record this run copies.
    InGraph { kind: RecordKind, id: String },
    /// A copied kind, but a record outside the fetched slice. Dropped on create.
    OutOfGraph { kind: RecordKind, id: String },
    /// A record type, mapped by developer name.
    TypeCode { id: String },
    /// Shared reference data expected to exist in the target.
    External { objects: Vec<String>, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEdge {
    pub from_kind: RecordKind,
    pub from_id: String,
    pub field: String,
    pub target: EdgeTarget,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    records: BTreeMap<RecordKind, Vec<SourceRecord>>,
    members: HashSet<(RecordKind, String)>,
    edges: Vec<ReferenceEdge>,
    edges_by_record: HashMap<(RecordKind, String), Vec<usize>>,
}

impl MigrationGraph {
    /// Records must already be sorted by id within each kind.
    pub fn new(records: BTreeMap<RecordKind, Vec<SourceRecord>>, schema: &SchemaRegistry) -> Self {
        let members = records
            .values()
            .flatten()
            .map(|r| (r.kind, r.id.clone()))
            .collect();
        let mut graph = MigrationGraph {
            records,
            members,
            ..MigrationGraph::default()
        };
        graph.link(schema);
        graph
    }

    fn link(&mut self, schema: &SchemaRegistry) {
        let mut edges = Vec::new();
        for record in self.records.values().flatten() {
            let Ok(object) = schema.source(record.kind) else {
                continue;
            };
            for (field, target) in object.reference_fields() {
                let Some(id) = record.str_field(&field.name) else {
                    continue;
                };
                let id = id.to_string();
                let target = match target {
                    ReferenceTarget::Migrated(kind) if self.members.contains(&(kind, id.clone())) => {
                        EdgeTarget::InGraph { kind, id }
                    }
                    ReferenceTarget::Migrated(kind) => EdgeTarget::OutOfGraph { kind, id },
                    ReferenceTarget::TypeCode => EdgeTarget::TypeCode { id },
                    ReferenceTarget::External(objects) => EdgeTarget::External { objects, id },
                };
                edges.push(ReferenceEdge {
                    from_kind: record.kind,
                    from_id: record.id.clone(),
                    field: field.name.clone(),
                    target,
                });
            }
        }
        for (i, edge) in edges.iter().enumerate() {
            self.edges_by_record
                .entry((edge.from_kind, edge.from_id.clone()))
                .or_default()
                .push(i);
        }
        self.edges = edges;
    }

    pub fn records(&self, kind: RecordKind) -> &[SourceRecord] {
        self.records.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, kind: RecordKind, id: &str) -> bool {
        self.members.contains(&(kind, id.to_string()))
    }

    pub fn edges(&self) -> &[ReferenceEdge] {
        &self.edges
    }

    pub fn edges_from(&self, kind: RecordKind, id: &str) -> impl Iterator<Item = &ReferenceEdge> {
        self.edges_by_record
            .get(&(kind, id.to_string()))
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records(kind).len()
    }

    pub fn total(&self) -> usize {
        self.members.len()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Which kinds take part in a run, and their per-parent caps.
#[derive(Debug, Clone)]
pub struct GraphLimits {
    per_kind: HashMap<RecordKind, KindLimit>,
    locations: KindLimit,
}

impl GraphLimits {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut per_kind = HashMap::new();
        for kind in RecordKind::CREATION_ORDER {
            per_kind.insert(kind, config.limit_for(kind)?);
        }
        Ok(Self {
            per_kind,
            locations: config.locations_limit()?,
        })
    }

    pub fn unlimited() -> Self {
        Self {
            per_kind: RecordKind::CREATION_ORDER
                .into_iter()
                .map(|k| (k, KindLimit::Unlimited))
                .collect(),
            locations: KindLimit::Unlimited,
        }
    }

    pub fn with(mut self, kind: RecordKind, limit: KindLimit) -> Self {
        self.per_kind.insert(kind, limit);
        self
    }

    pub fn with_locations(mut self, limit: KindLimit) -> Self {
        self.locations = limit;
        self
    }

    pub fn limit(&self, kind: RecordKind) -> KindLimit {
        self.per_kind
            .get(&kind)
            .copied()
            .unwrap_or(KindLimit::Unlimited)
    }

    /// Kinds that can hold records: not skipped, and reachable through at
    /// least one active parent.
    pub fn active_kinds(&self) -> Vec<RecordKind> {
        let mut active: Vec<RecordKind> = Vec::new();
        for kind in RecordKind::CREATION_ORDER {
            let parents = kind.hierarchy_parents();
            let reachable = parents.is_empty() || parents.iter().any(|p| active.contains(p));
            if reachable && !self.limit(kind).is_skip() {
                active.push(kind);
            }
        }
        active
    }
}

/// Fields on `kind` that tie it to `parent`: the standard `{Parent}Id`
/// lookup when there is one, otherwise every lookup to the parent.
pub fn link_fields(schema: &SchemaRegistry, kind: RecordKind, parent: RecordKind) -> Vec<String> {
    let Ok(object) = schema.source(kind) else {
        return Vec::new();
    };
    let candidates = object.fields_referencing(parent);
    let standard = format!("{}Id", parent.api_name());
    if candidates.contains(&standard) {
        vec![standard]
    } else {
        candidates
    }
}

pub struct GraphBuilder<'a> {
    store: &'a dyn RecordStore,
    schema: &'a SchemaRegistry,
    limits: GraphLimits,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(store: &'a dyn RecordStore, schema: &'a SchemaRegistry, limits: GraphLimits) -> Self {
        Self {
            store,
            schema,
            limits,
        }
    }

    pub async fn build(&self, roots: &[String]) -> Result<MigrationGraph, MigrationError> {
        let mut records: BTreeMap<RecordKind, Vec<SourceRecord>> = BTreeMap::new();
        records.insert(RecordKind::Account, self.fetch_accounts(roots).await?);

        for kind in self.limits.active_kinds() {
            if kind == RecordKind::Account {
                continue;
            }
            let fetched = self.fetch_children(kind, &records).await?;
            log::info!("Graph: {} {}", fetched.len(), kind.plural());
            records.insert(kind, fetched);
        }

        let graph = MigrationGraph::new(records, self.schema);
        log::info!(
            "Graph complete: {} records, {} references",
            graph.total(),
            graph.edges().len()
        );
        Ok(graph)
    }

    async fn fetch(
        &self,
        kind: RecordKind,
        links: &[String],
        filter_for: impl Fn(&[String]) -> Filter,
        ids: &[String],
    ) -> Result<Vec<Row>, MigrationError> {
        let fields = self.schema.queryable_fields(kind, links)?;
        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for chunk in ids.chunks(FETCH_CHUNK) {
            let query = Query::select(kind.api_name(), fields.iter().cloned())
                .filter(filter_for(chunk))
                .order_by("Id");
            let fetched = self
                .store
                .query(&query)
                .await
                .map_err(|source| MigrationError::Fetch { kind, source })?;
            for row in fetched {
                let id = row_id(&row);
                if !id.is_empty() && seen.insert(id) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn fetch_accounts(&self, roots: &[String]) -> Result<Vec<SourceRecord>, MigrationError> {
        let kind = RecordKind::Account;
        let self_links = link_fields(self.schema, kind, kind);

        let found = self
            .fetch(kind, &[], |chunk| Filter::is_in("Id", chunk.iter().cloned()), roots)
            .await?;
        let found_ids: BTreeSet<String> = found.iter().map(row_id).collect();
        for root in roots.iter().filter(|r| !found_ids.contains(*r)) {
            log::warn!("Root account {} was not found in {}", root, self.store.label());
        }
        if found.is_empty() {
            return Err(ConfigError::Invalid {
                key: "accounts".to_string(),
                message: format!("none of the root accounts exist in {}", self.store.label()),
            }
            .into());
        }

        let mut accounts: Vec<SourceRecord> = found
            .into_iter()
            .map(|row| to_record(kind, row))
            .collect();

        if !self_links.is_empty() && !self.limits.locations.is_skip() {
            let roots: Vec<String> = found_ids.iter().cloned().collect();
            let related = self
                .fetch(kind, &self_links, |chunk| any_in(&self_links, chunk), &roots)
                .await?;
            let related = related
                .into_iter()
                .filter(|row| !found_ids.contains(&row_id(row)))
                .collect();
            let kept = cap_per_parent(related, &self_links, &found_ids, self.limits.locations);
            log::info!("Graph: {} root and {} related Accounts", accounts.len(), kept.len());
            accounts.extend(kept.into_iter().map(|row| to_record(kind, row)));
        }

        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn fetch_children(
        &self,
        kind: RecordKind,
        records: &BTreeMap<RecordKind, Vec<SourceRecord>>,
    ) -> Result<Vec<SourceRecord>, MigrationError> {
        let mut by_id: BTreeMap<String, SourceRecord> = BTreeMap::new();
        for &parent in kind.hierarchy_parents() {
            let parents = records.get(&parent).map(Vec::as_slice).unwrap_or(&[]);
            if parents.is_empty() {
                continue;
            }
            let links = link_fields(self.schema, kind, parent);
            if links.is_empty() {
                log::warn!("{} has no lookup to {}; skipping that path", kind, parent);
                continue;
            }
            let parent_ids: Vec<String> = parents.iter().map(|r| r.id.clone()).collect();
            let parent_set: BTreeSet<String> = parent_ids.iter().cloned().collect();

            let rows = self
                .fetch(kind, &links, |chunk| any_in(&links, chunk), &parent_ids)
                .await?;
            let rows = rows
                .into_iter()
                .filter(|row| !by_id.contains_key(&row_id(row)))
                .collect();
            for row in cap_per_parent(rows, &links, &parent_set, self.limits.limit(kind)) {
                let record = to_record(kind, row);
                by_id.entry(record.id.clone()).or_insert(record);
            }
        }
        Ok(by_id.into_values().collect())
    }
}

fn any_in(fields: &[String], ids: &[String]) -> Filter {
    let parts: Vec<Filter> = fields
        .iter()
        .map(|f| Filter::is_in(f.clone(), ids.iter().cloned()))
        .collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or(Filter::And(Vec::new()))
    } else {
        Filter::Or(parts)
    }
}

fn row_id(row: &Row) -> String {
    row.get("Id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn to_record(kind: RecordKind, row: Row) -> SourceRecord {
    let id = row_id(&row);
    SourceRecord::new(kind, id, row)
}

/// Group rows by the first link field that names a known parent, order each
/// group by id, and keep at most `limit` per parent.
fn cap_per_parent(
    rows: Vec<Row>,
    links: &[String],
    parents: &BTreeSet<String>,
    limit: KindLimit,
) -> Vec<Row> {
    let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for row in rows {
        let parent = links.iter().find_map(|field| {
            row.get(field)
                .and_then(|v| v.as_str())
                .filter(|id| parents.contains(*id))
                .map(str::to_string)
        });
        if let Some(parent) = parent {
            groups.entry(parent).or_default().push(row);
        }
    }

    let mut kept = Vec::new();
    for (_, mut group) in groups {
        group.sort_by_key(row_id);
        kept.extend(limit.apply(group));
    }
    kept.sort_by_key(row_id);
    kept
}
