//! Schema introspection.
//!
//! Both orgs are described for every migrated kind. The source side decides
//! what can be read, the target side decides what can be written, which
//! fields are lookups, and which categorical values are valid.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::store::{FieldDescribe, ObjectDescribe, RecordStore, StoreError};
use crate::types::RecordKind;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{object} has no field `{field}`")]
    UnknownField { object: String, field: String },

    #[error("No schema loaded for {0}")]
    UnknownObject(RecordKind),

    #[error("Describe of {object} on {store} failed: {source}")]
    Describe {
        object: String,
        store: String,
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Id,
    Reference,
    Picklist,
    MultiPicklist,
    Boolean,
    Email,
    Compound,
    Other(String),
}

impl FieldType {
    pub fn from_describe(value: &str) -> Self {
        match value {
            "id" => FieldType::Id,
            "reference" => FieldType::Reference,
            "picklist" => FieldType::Picklist,
            "multipicklist" => FieldType::MultiPicklist,
            "boolean" => FieldType::Boolean,
            "email" => FieldType::Email,
            "address" | "location" => FieldType::Compound,
            other => FieldType::Other(other.to_string()),
        }
    }
}

/// Where a lookup field points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceTarget {
    /// A kind this run copies; resolved through the identifier map.
    Migrated(RecordKind),
    /// `RecordType`; resolved by developer name.
    TypeCode,
    /// Anything else; expected to already exist in the target.
    External(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub reference_to: Vec<String>,
    pub createable: bool,
    pub updateable: bool,
    pub nillable: bool,
    pub defaulted_on_create: bool,
    /// Active picklist values in describe order.
    pub picklist_values: Vec<String>,
}

impl From<&FieldDescribe> for FieldSchema {
    fn from(field: &FieldDescribe) -> Self {
        Self {
            name: field.name.clone(),
            field_type: FieldType::from_describe(&field.field_type),
            reference_to: field.reference_to.clone(),
            createable: field.createable,
            updateable: field.updateable,
            nillable: field.nillable,
            defaulted_on_create: field.defaulted_on_create,
            picklist_values: field
                .picklist_values
                .iter()
                .filter(|p| p.active)
                .map(|p| p.value.clone())
                .collect(),
        }
    }
}

impl FieldSchema {
    pub fn is_reference(&self) -> bool {
        self.field_type == FieldType::Reference
    }

    /// Must carry a value on insert.
    pub fn required_on_create(&self) -> bool {
        self.createable && !self.nillable && !self.defaulted_on_create
    }

    pub fn reference_target(&self) -> Option<ReferenceTarget> {
        if !self.is_reference() {
            return None;
        }
        let migrated: Vec<RecordKind> = self
            .reference_to
            .iter()
            .filter_map(|o| RecordKind::from_api_name(o))
            .collect();
        if self.reference_to.len() == 1 && migrated.len() == 1 {
            return Some(ReferenceTarget::Migrated(migrated[0]));
        }
        if self.reference_to.iter().any(|o| o == "RecordType") {
            return Some(ReferenceTarget::TypeCode);
        }
        Some(ReferenceTarget::External(self.reference_to.clone()))
    }

    pub fn allows(&self, value: &str) -> bool {
        self.picklist_values.iter().any(|v| v == value)
    }
}

#[derive(Debug, Clone)]
pub struct ObjectSchema {
    pub kind: RecordKind,
    fields: BTreeMap<String, FieldSchema>,
}

impl ObjectSchema {
    pub fn from_describe(kind: RecordKind, describe: &ObjectDescribe) -> Self {
        Self {
            kind,
            fields: describe
                .fields
                .iter()
                .map(|f| (f.name.clone(), FieldSchema::from(f)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn field(&self, name: &str) -> Result<&FieldSchema, SchemaError> {
        self.get(name).ok_or_else(|| SchemaError::UnknownField {
            object: self.kind.api_name().to_string(),
            field: name.to_string(),
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.values()
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = (&FieldSchema, ReferenceTarget)> {
        self.fields
            .values()
            .filter_map(|f| f.reference_target().map(|t| (f, t)))
    }

    /// Lookup fields on this object that point at `kind`.
    pub fn fields_referencing(&self, kind: RecordKind) -> Vec<String> {
        self.reference_fields()
            .filter(|(_, t)| *t == ReferenceTarget::Migrated(kind))
            .map(|(f, _)| f.name.clone())
            .collect()
    }

    pub fn picklist_values(&self, name: &str) -> Result<&[String], SchemaError> {
        Ok(&self.field(name)?.picklist_values)
    }
}

/// Described schemas of both orgs.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    source: HashMap<RecordKind, ObjectSchema>,
    target: HashMap<RecordKind, ObjectSchema>,
}

impl SchemaRegistry {
    pub fn new(
        source: impl IntoIterator<Item = ObjectSchema>,
        target: impl IntoIterator<Item = ObjectSchema>,
    ) -> Self {
        Self {
            source: source.into_iter().map(|s| (s.kind, s)).collect(),
            target: target.into_iter().map(|s| (s.kind, s)).collect(),
        }
    }

    pub fn source(&self, kind: RecordKind) -> Result<&ObjectSchema, SchemaError> {
        self.source.get(&kind).ok_or(SchemaError::UnknownObject(kind))
    }

    pub fn target(&self, kind: RecordKind) -> Result<&ObjectSchema, SchemaError> {
        self.target.get(&kind).ok_or(SchemaError::UnknownObject(kind))
    }

    /// Fields to select from the source: `Id`, every field the target can
    /// accept on insert, and any `links` the traversal needs.
    pub fn queryable_fields(&self, kind: RecordKind, links: &[String]) -> Result<Vec<String>, SchemaError> {
        let source = self.source(kind)?;
        let target = self.target(kind)?;

        let mut fields = vec!["Id".to_string()];
        for field in source.fields() {
            if field.name == "Id" || field.field_type == FieldType::Compound {
                continue;
            }
            let writable = target.get(&field.name).is_some_and(|t| t.createable);
            if writable || links.contains(&field.name) {
                fields.push(field.name.clone());
            }
        }
        for link in links {
            source.field(link)?;
        }
        Ok(fields)
    }
}

async fn describe_kind(
    store: &dyn RecordStore,
    kind: RecordKind,
) -> Result<ObjectSchema, SchemaError> {
    let describe = store
        .describe(kind.api_name())
        .await
        .map_err(|source| SchemaError::Describe {
            object: kind.api_name().to_string(),
            store: store.label().to_string(),
            source,
        })?;
    Ok(ObjectSchema::from_describe(kind, &describe))
}

/// Describe every kind on both sides.
pub async fn introspect(
    source: &dyn RecordStore,
    target: &dyn RecordStore,
    kinds: &[RecordKind],
) -> Result<SchemaRegistry, SchemaError> {
    let mut source_schemas = Vec::with_capacity(kinds.len());
    let mut target_schemas = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        source_schemas.push(describe_kind(source, kind).await?);
        let target_schema = describe_kind(target, kind).await?;
        log::debug!(
            "{}: {} lookup field(s) in target",
            kind,
            target_schema.reference_fields().count()
        );
        target_schemas.push(target_schema);
    }
    Ok(SchemaRegistry::new(source_schemas, target_schemas))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PicklistEntry};

    fn field(name: &str, kind: &str) -> FieldDescribe {
        FieldDescribe {
            name: name.into(),
            field_type: kind.into(),
            createable: true,
            updateable: true,
            nillable: true,
            ..FieldDescribe::default()
        }
    }

    fn reference(name: &str, to: &[&str]) -> FieldDescribe {
        FieldDescribe {
            reference_to: to.iter().map(|s| s.to_string()).collect(),
            ..field(name, "reference")
        }
    }

    fn opportunity() -> ObjectDescribe {
        ObjectDescribe {
            name: "Opportunity".into(),
            fields: vec![
                FieldDescribe {
                    createable: false,
                    updateable: false,
                    ..field("Id", "id")
                },
                reference("AccountId", &["Account"]),
                reference("RecordTypeId", &["RecordType"]),
                reference("OwnerId", &["Group", "User"]),
                FieldDescribe {
                    nillable: false,
                    picklist_values: vec![
                        PicklistEntry { value: "Prospecting".into(), active: true },
                        PicklistEntry { value: "Legacy".into(), active: false },
                        PicklistEntry { value: "Closed Won".into(), active: true },
                    ],
                    ..field("StageName", "picklist")
                },
                field("BillingAddress", "address"),
                FieldDescribe {
                    createable: false,
                    ..field("ExpectedRevenue", "currency")
                },
            ],
        }
    }

    #[test]
    fn classifies_reference_targets() {
        let schema = ObjectSchema::from_describe(RecordKind::Opportunity, &opportunity());
        assert_eq!(
            schema.field("AccountId").unwrap().reference_target(),
            Some(ReferenceTarget::Migrated(RecordKind::Account))
        );
        assert_eq!(
            schema.field("RecordTypeId").unwrap().reference_target(),
            Some(ReferenceTarget::TypeCode)
        );
        assert_eq!(
            schema.field("OwnerId").unwrap().reference_target(),
            Some(ReferenceTarget::External(vec!["Group".into(), "User".into()]))
        );
        assert_eq!(schema.field("StageName").unwrap().reference_target(), None);
        assert_eq!(schema.fields_referencing(RecordKind::Account), vec!["AccountId"]);
    }

    #[test]
    fn picklists_keep_only_active_values_in_order() {
        let schema = ObjectSchema::from_describe(RecordKind::Opportunity, &opportunity());
        assert_eq!(
            schema.picklist_values("StageName").unwrap(),
            &["Prospecting".to_string(), "Closed Won".to_string()]
        );
        assert!(schema.field("StageName").unwrap().required_on_create());
        assert!(matches!(
            schema.picklist_values("Nope"),
            Err(SchemaError::UnknownField { field, .. }) if field == "Nope"
        ));
    }

    #[tokio::test]
    async fn introspect_describes_both_sides_and_selects_writable_fields() {
        let source = MemoryStore::new("prod", "https://prod").with_describe(opportunity());
        let target = MemoryStore::new("qa", "https://qa").with_describe(opportunity());

        let registry = introspect(&source, &target, &[RecordKind::Opportunity])
            .await
            .unwrap();
        let fields = registry
            .queryable_fields(RecordKind::Opportunity, &[])
            .unwrap();
        assert_eq!(
            fields,
            vec!["Id", "AccountId", "OwnerId", "RecordTypeId", "StageName"]
        );

        let with_link = registry
            .queryable_fields(RecordKind::Opportunity, &["ExpectedRevenue".to_string()])
            .unwrap();
        assert!(with_link.contains(&"ExpectedRevenue".to_string()));
        assert!(registry.queryable_fields(RecordKind::Opportunity, &["Bogus".into()]).is_err());
    }

    #[tokio::test]
    async fn missing_describe_is_reported_with_store_and_object() {
        let source = MemoryStore::new("prod", "https://prod");
        let target = MemoryStore::new("qa", "https://qa");
        let err = introspect(&source, &target, &[RecordKind::Case])
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Describe of Case on prod failed"));
    }
}
