//! Record type reconciliation.
//!
//! Record type ids differ per org, so they are matched by `DeveloperName`
//! within each object. A name that exists only in the source is a gap: the
//! field is left unset on affected records.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::store::{Filter, Query, RecordStore, StoreError};
use crate::types::{RecordKind, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeCodeResolution {
    Resolved(String),
    /// Known in the source, absent from the target.
    Missing { developer_name: String },
    /// Not a record type id the source knows for this kind.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCodePair {
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct TypeCodeMap {
    shared: HashMap<(RecordKind, String), TypeCodePair>,
    source_names: HashMap<(RecordKind, String), String>,
    gaps: BTreeSet<(RecordKind, String)>,
}

struct RecordTypeRow {
    kind: RecordKind,
    id: String,
    developer_name: String,
}

fn parse_rows(rows: Vec<Row>) -> Vec<RecordTypeRow> {
    rows.into_iter()
        .filter_map(|row| {
            let text = |f: &str| row.get(f).and_then(Value::as_str).map(str::to_string);
            Some(RecordTypeRow {
                kind: RecordKind::from_api_name(&text("SobjectType")?)?,
                id: text("Id")?,
                developer_name: text("DeveloperName")?,
            })
        })
        .collect()
}

impl TypeCodeMap {
    pub fn from_rows(source: Vec<Row>, target: Vec<Row>) -> Self {
        let target_ids: HashMap<(RecordKind, String), String> = parse_rows(target)
            .into_iter()
            .map(|r| ((r.kind, r.developer_name), r.id))
            .collect();

        let mut map = TypeCodeMap::default();
        for row in parse_rows(source) {
            let key = (row.kind, row.developer_name.clone());
            map.source_names
                .insert((row.kind, row.id.clone()), row.developer_name.clone());
            match target_ids.get(&key) {
                Some(target_id) => {
                    map.shared.insert(
                        key,
                        TypeCodePair {
                            source_id: row.id,
                            target_id: target_id.clone(),
                        },
                    );
                }
                None => {
                    map.gaps.insert(key);
                }
            }
        }
        map
    }

    /// Map a source record type id to the target's equivalent.
    pub fn resolve(&self, kind: RecordKind, source_id: &str) -> TypeCodeResolution {
        let Some(name) = self.source_names.get(&(kind, source_id.to_string())) else {
            return TypeCodeResolution::Unknown;
        };
        match self.shared.get(&(kind, name.clone())) {
            Some(pair) => TypeCodeResolution::Resolved(pair.target_id.clone()),
            None => TypeCodeResolution::Missing {
                developer_name: name.clone(),
            },
        }
    }

    pub fn pair(&self, kind: RecordKind, developer_name: &str) -> Option<&TypeCodePair> {
        self.shared.get(&(kind, developer_name.to_string()))
    }

    pub fn gaps(&self) -> impl Iterator<Item = &(RecordKind, String)> {
        self.gaps.iter()
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }
}

fn record_type_query(kinds: &[RecordKind]) -> Query {
    Query::select("RecordType", ["Id", "DeveloperName", "SobjectType"])
        .filter(Filter::is_in("SobjectType", kinds.iter().map(|k| k.api_name())))
        .order_by("DeveloperName")
}

/// Build the map for every kind that carries a record type.
pub async fn resolve_type_codes(
    source: &dyn RecordStore,
    target: &dyn RecordStore,
    kinds: &[RecordKind],
) -> Result<TypeCodeMap, StoreError> {
    if kinds.is_empty() {
        return Ok(TypeCodeMap::default());
    }
    let query = record_type_query(kinds);
    let source_rows = source.query(&query).await?;
    let target_rows = target.query(&query).await?;

    let map = TypeCodeMap::from_rows(source_rows, target_rows);
    log::info!("Record types matched by developer name: {}", map.len());
    for (kind, name) in map.gaps() {
        log::warn!(
            "Record type {}.{} exists in {} but not in {}; affected records keep no record type",
            kind,
            name,
            source.label(),
            target.label()
        );
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn record_type(id: &str, object: &str, name: &str) -> Row {
        json!({"Id": id, "SobjectType": object, "DeveloperName": name})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn resolves_by_developer_name_per_kind() {
        let map = TypeCodeMap::from_rows(
            vec![
                record_type("012S1", "Opportunity", "New_Business"),
                record_type("012S2", "Opportunity", "Renewal"),
                record_type("012S3", "Case", "Support"),
            ],
            vec![
                record_type("012T1", "Opportunity", "New_Business"),
                record_type("012T3", "Case", "Support"),
                record_type("012T9", "Account", "Support"),
            ],
        );

        assert_eq!(
            map.resolve(RecordKind::Opportunity, "012S1"),
            TypeCodeResolution::Resolved("012T1".into())
        );
        assert_eq!(
            map.resolve(RecordKind::Case, "012S3"),
            TypeCodeResolution::Resolved("012T3".into())
        );
        assert_eq!(
            map.resolve(RecordKind::Opportunity, "012S2"),
            TypeCodeResolution::Missing {
                developer_name: "Renewal".into()
            }
        );
        assert_eq!(map.resolve(RecordKind::Case, "012S1"), TypeCodeResolution::Unknown);
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.gaps().collect::<Vec<_>>(),
            vec![&(RecordKind::Opportunity, "Renewal".to_string())]
        );
        assert_eq!(map.pair(RecordKind::Case, "Support").unwrap().source_id, "012S3");
    }

    #[tokio::test]
    async fn queries_both_orgs_for_requested_kinds_only() {
        let source = MemoryStore::new("prod", "https://prod");
        source.seed("RecordType", record_type("012S1", "Opportunity", "New_Business"));
        source.seed("RecordType", record_type("012S5", "Lead", "Inbound"));
        let target = MemoryStore::new("qa", "https://qa");
        target.seed("RecordType", record_type("012T1", "Opportunity", "New_Business"));

        let map = resolve_type_codes(&source, &target, &[RecordKind::Opportunity])
            .await
            .unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(source.query_count(), 1);
        assert_eq!(target.query_count(), 1);

        let empty = resolve_type_codes(&source, &target, &[]).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(source.query_count(), 1);
    }
}
