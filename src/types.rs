//! Core record types shared by every stage of a migration run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A record as a flat field map, exactly as the REST and Bulk APIs hand it back.
pub type Row = serde_json::Map<String, Value>;

// =============================================================================
// Record kinds
// =============================================================================

/// The fixed set of objects a run copies, declared in creation order
/// (parents before children).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Account,
    Contact,
    Opportunity,
    Quote,
    QuoteLine,
    Order,
    OrderItem,
    Case,
}

impl RecordKind {
    pub const CREATION_ORDER: [RecordKind; 8] = [
        RecordKind::Account,
        RecordKind::Contact,
        RecordKind::Opportunity,
        RecordKind::Quote,
        RecordKind::QuoteLine,
        RecordKind::Order,
        RecordKind::OrderItem,
        RecordKind::Case,
    ];

    /// Children first, so no delete trips over a record that still has dependents.
    pub fn deletion_order() -> impl Iterator<Item = RecordKind> {
        Self::CREATION_ORDER.into_iter().rev()
    }

    /// The sObject name used in queries and bulk jobs.
    pub fn api_name(self) -> &'static str {
        match self {
            RecordKind::Account => "Account",
            RecordKind::Contact => "Contact",
            RecordKind::Opportunity => "Opportunity",
            RecordKind::Quote => "Quote",
            RecordKind::QuoteLine => "QuoteLineItem",
            RecordKind::Order => "Order",
            RecordKind::OrderItem => "OrderItem",
            RecordKind::Case => "Case",
        }
    }

    pub fn from_api_name(name: &str) -> Option<RecordKind> {
        Self::CREATION_ORDER
            .into_iter()
            .find(|kind| kind.api_name().eq_ignore_ascii_case(name))
    }

    /// Label used in the summary table.
    pub fn plural(self) -> &'static str {
        match self {
            RecordKind::Account => "Accounts",
            RecordKind::Contact => "Contacts",
            RecordKind::Opportunity => "Opportunities",
            RecordKind::Quote => "Quotes",
            RecordKind::QuoteLine => "Quote Line Items",
            RecordKind::Order => "Orders",
            RecordKind::OrderItem => "Order Items",
            RecordKind::Case => "Cases",
        }
    }

    /// Snake-case stem for per-kind files (`quote_line_item_migration.csv`).
    pub fn file_stem(self) -> &'static str {
        match self {
            RecordKind::Account => "account",
            RecordKind::Contact => "contact",
            RecordKind::Opportunity => "opportunity",
            RecordKind::Quote => "quote",
            RecordKind::QuoteLine => "quote_line_item",
            RecordKind::Order => "order",
            RecordKind::OrderItem => "order_item",
            RecordKind::Case => "case",
        }
    }

    /// Kinds a record of this kind is fetched through.
    pub fn hierarchy_parents(self) -> &'static [RecordKind] {
        match self {
            RecordKind::Account => &[],
            RecordKind::Contact | RecordKind::Opportunity => &[RecordKind::Account],
            RecordKind::Quote => &[RecordKind::Opportunity],
            RecordKind::QuoteLine | RecordKind::Order => &[RecordKind::Quote],
            RecordKind::OrderItem => &[RecordKind::Order],
            RecordKind::Case => &[RecordKind::Account, RecordKind::Opportunity],
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_name())
    }
}

// =============================================================================
// Records
// =============================================================================

/// One record read from the source store. Never mutated after the graph is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub kind: RecordKind,
    pub id: String,
    pub fields: Row,
}

impl SourceRecord {
    pub fn new(kind: RecordKind, id: impl Into<String>, fields: Row) -> Self {
        Self {
            kind,
            id: id.into(),
            fields,
        }
    }

    /// Non-empty string value of a field.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// True for a 15- or 18-character alphanumeric record identifier.
pub fn is_record_id(value: &str) -> bool {
    matches!(value.len(), 15 | 18) && value.chars().all(|c| c.is_ascii_alphanumeric())
}

// =============================================================================
// Recoverable issues
// =============================================================================

/// Why a record or field was skipped without stopping the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueReason {
    Rejected,
    MissingTypeCode,
    PortalProtected,
    ParentMissing,
    DanglingReference,
    InvalidPicklist,
    OrphanRemoved,
    DeleteFailed,
}

impl IssueReason {
    /// Reconciliation gaps leave a field unset; every other reason concerns a whole row.
    pub fn is_reconciliation(self) -> bool {
        matches!(self, IssueReason::MissingTypeCode)
    }
}

impl std::fmt::Display for IssueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            IssueReason::Rejected => "rejected",
            IssueReason::MissingTypeCode => "missing record type",
            IssueReason::PortalProtected => "portal protected",
            IssueReason::ParentMissing => "parent missing",
            IssueReason::DanglingReference => "dangling reference",
            IssueReason::InvalidPicklist => "invalid picklist value",
            IssueReason::OrphanRemoved => "orphan removed",
            IssueReason::DeleteFailed => "delete failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowIssue {
    pub kind: RecordKind,
    pub record_id: Option<String>,
    pub field: Option<String>,
    pub reason: IssueReason,
    pub detail: String,
}

impl RowIssue {
    pub fn new(kind: RecordKind, reason: IssueReason, detail: impl Into<String>) -> Self {
        Self {
            kind,
            record_id: None,
            field: None,
            reason,
            detail: detail.into(),
        }
    }

    pub fn record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Emit at warn level; called once, where the issue is raised.
    pub fn logged(self) -> Self {
        log::warn!("{}", self);
        self
    }
}

impl std::fmt::Display for RowIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.reason)?;
        if let Some(id) = &self.record_id {
            write!(f, " [{}]", id)?;
        }
        if let Some(field) = &self.field {
            write!(f, " field {}", field)?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_names_round_trip_case_insensitively() {
        for kind in RecordKind::CREATION_ORDER {
            assert_eq!(RecordKind::from_api_name(kind.api_name()), Some(kind));
        }
        assert_eq!(
            RecordKind::from_api_name("quotelineitem"),
            Some(RecordKind::QuoteLine)
        );
        assert_eq!(RecordKind::from_api_name("Lead"), None);
    }

    #[test]
    fn deletion_runs_children_first() {
        let order: Vec<_> = RecordKind::deletion_order().collect();
        assert_eq!(order.first(), Some(&RecordKind::Case));
        assert_eq!(order.last(), Some(&RecordKind::Account));
        let order_item = order.iter().position(|k| *k == RecordKind::OrderItem);
        let order_pos = order.iter().position(|k| *k == RecordKind::Order);
        assert!(order_item < order_pos);
    }

    #[test]
    fn every_parent_is_created_before_its_children() {
        for kind in RecordKind::CREATION_ORDER {
            for parent in kind.hierarchy_parents() {
                assert!(parent < &kind, "{parent} must precede {kind}");
            }
        }
    }

    #[test]
    fn record_ids_are_15_or_18_alphanumerics() {
        assert!(is_record_id("001000000000001"));
        assert!(is_record_id("001000000000001AAA"));
        assert!(!is_record_id("001000000000001AA"));
        assert!(!is_record_id("001-00000000001"));
        assert!(!is_record_id(""));
    }

    #[test]
    fn issue_display_names_kind_record_and_field() {
        let issue = RowIssue::new(RecordKind::Opportunity, IssueReason::MissingTypeCode, "Renewal")
            .record("006000000000001")
            .field("RecordTypeId");
        assert_eq!(
            issue.to_string(),
            "Opportunity missing record type [006000000000001] field RecordTypeId: Renewal"
        );
        assert!(issue.reason.is_reconciliation());
    }
}
