//! Source id to target id mapping, filled as records are created.

use std::collections::HashMap;

use crate::types::RecordKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} {source_id} is already mapped to {existing}")]
pub struct AlreadyMapped {
    pub kind: RecordKind,
    pub source_id: String,
    pub existing: String,
}

/// Append-only: once a key is written it is never replaced.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    entries: HashMap<(RecordKind, String), String>,
    order: Vec<(RecordKind, String)>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        kind: RecordKind,
        source_id: &str,
        target_id: &str,
    ) -> Result<(), AlreadyMapped> {
        let key = (kind, source_id.to_string());
        if let Some(existing) = self.entries.get(&key) {
            return Err(AlreadyMapped {
                kind,
                source_id: source_id.to_string(),
                existing: existing.clone(),
            });
        }
        self.entries.insert(key.clone(), target_id.to_string());
        self.order.push(key);
        Ok(())
    }

    pub fn get(&self, kind: RecordKind, source_id: &str) -> Option<&str> {
        self.entries
            .get(&(kind, source_id.to_string()))
            .map(String::as_str)
    }

    pub fn contains(&self, kind: RecordKind, source_id: &str) -> bool {
        self.get(kind, source_id).is_some()
    }

    /// `(source_id, target_id)` pairs for one kind, in insertion order.
    pub fn entries_for(&self, kind: RecordKind) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.order
            .iter()
            .filter(move |(k, _)| *k == kind)
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|target| (key.1.as_str(), target.as_str()))
            })
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.order.iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
