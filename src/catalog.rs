//! Product catalog resolution.
//!
//! Quote and order lines point at `Product2` and `PricebookEntry` records the
//! run does not copy. When a referenced catalog record is missing from the
//! target, an equivalent one is found (products by `ProductCode`, then by
//! `Name`; entries by product and pricebook) or created, and the source id is
//! remapped to it in the target directory. Catalog records are shared
//! reference data: they are never ledgered, so a rerun finds them again
//! instead of deleting them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{json, Value};

use crate::error::MigrationError;
use crate::graph::{EdgeTarget, MigrationGraph};
use crate::store::{Filter, Query, RecordStore};
use crate::transform::TargetDirectory;
use crate::types::Row;

const PRODUCT: &str = "Product2";
const ENTRY: &str = "PricebookEntry";
const PRICEBOOK: &str = "Pricebook2";
const CHUNK: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogReport {
    pub products_matched: usize,
    pub products_created: usize,
    pub entries_matched: usize,
    pub entries_created: usize,
}

fn text<'r>(row: &'r Row, field: &str) -> Option<&'r str> {
    row.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn ids(rows: &[Row]) -> BTreeSet<String> {
    rows.iter().filter_map(|r| text(r, "Id").map(str::to_string)).collect()
}

async fn fetch(
    store: &dyn RecordStore,
    object: &str,
    fields: &[&str],
    key: &str,
    values: &BTreeSet<String>,
) -> Result<Vec<Row>, MigrationError> {
    let values: Vec<&String> = values.iter().collect();
    let mut rows = Vec::new();
    for chunk in values.chunks(CHUNK) {
        let query = Query::select(object, fields.iter().copied())
            .filter(Filter::is_in(key, chunk.iter().map(|v| v.as_str())));
        let mut page = store
            .query(&query)
            .await
            .map_err(|e| MigrationError::store(format!("Reading {} from {}", object, store.label()), e))?;
        rows.append(&mut page);
    }
    Ok(rows)
}

/// Create `rows` in the target and return the new id per row index. Rows the
/// target rejects are logged and left out.
async fn create(
    target: &dyn RecordStore,
    object: &str,
    rows: &[Row],
) -> Result<HashMap<usize, String>, MigrationError> {
    if rows.is_empty() {
        return Ok(HashMap::new());
    }
    let outcomes = target
        .bulk_create(object, rows)
        .await
        .map_err(|e| MigrationError::store(format!("Creating {} in {}", object, target.label()), e))?;
    let mut created = HashMap::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(id) => {
                created.insert(outcome.row_index, id);
            }
            Err(error) => log::warn!("{} row {} was not created: {}", object, outcome.row_index, error),
        }
    }
    Ok(created)
}

/// Catalog ids referenced by the graph that the target does not have.
fn missing_references(graph: &MigrationGraph, directory: &TargetDirectory) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut products = BTreeSet::new();
    let mut entries = BTreeSet::new();
    for edge in graph.edges() {
        let EdgeTarget::External { objects, id } = &edge.target else {
            continue;
        };
        if directory.exists(objects, id) {
            continue;
        }
        if objects.iter().any(|o| o == ENTRY) {
            entries.insert(id.clone());
        } else if objects.iter().any(|o| o == PRODUCT) {
            products.insert(id.clone());
        }
    }
    (products, entries)
}

/// Find or create the missing products. Returns source id -> target id for
/// every product resolved, including those that already exist under their
/// source id.
async fn resolve_products(
    source: &dyn RecordStore,
    target: &dyn RecordStore,
    wanted: &BTreeSet<String>,
    report: &mut CatalogReport,
) -> Result<BTreeMap<String, String>, MigrationError> {
    let mut resolved: BTreeMap<String, String> = fetch(target, PRODUCT, &["Id"], "Id", wanted)
        .await?
        .iter()
        .filter_map(|r| text(r, "Id").map(|id| (id.to_string(), id.to_string())))
        .collect();

    let absent: BTreeSet<String> = wanted.iter().filter(|id| !resolved.contains_key(*id)).cloned().collect();
    if absent.is_empty() {
        return Ok(resolved);
    }
    let products = fetch(
        source,
        PRODUCT,
        &["Id", "Name", "ProductCode", "Description", "IsActive"],
        "Id",
        &absent,
    )
    .await?;

    let codes: BTreeSet<String> = products.iter().filter_map(|p| text(p, "ProductCode").map(str::to_string)).collect();
    let names: BTreeSet<String> = products.iter().filter_map(|p| text(p, "Name").map(str::to_string)).collect();
    let mut by_code = HashMap::new();
    for row in fetch(target, PRODUCT, &["Id", "ProductCode"], "ProductCode", &codes).await? {
        if let (Some(code), Some(id)) = (text(&row, "ProductCode"), text(&row, "Id")) {
            by_code.entry(code.to_string()).or_insert_with(|| id.to_string());
        }
    }
    let mut by_name = HashMap::new();
    for row in fetch(target, PRODUCT, &["Id", "Name"], "Name", &names).await? {
        if let (Some(name), Some(id)) = (text(&row, "Name"), text(&row, "Id")) {
            by_name.entry(name.to_string()).or_insert_with(|| id.to_string());
        }
    }

    let mut to_create: Vec<(String, Row)> = Vec::new();
    for product in &products {
        let Some(source_id) = text(product, "Id") else { continue };
        let matched = text(product, "ProductCode")
            .and_then(|code| by_code.get(code))
            .or_else(|| text(product, "Name").and_then(|name| by_name.get(name)));
        match matched {
            Some(target_id) => {
                log::info!("{} {} matched to {}", PRODUCT, source_id, target_id);
                resolved.insert(source_id.to_string(), target_id.clone());
                report.products_matched += 1;
            }
            None => {
                let mut row = Row::new();
                for field in ["Name", "ProductCode", "Description"] {
                    if let Some(value) = text(product, field) {
                        row.insert(field.to_string(), Value::String(value.to_string()));
                    }
                }
                row.insert("IsActive".to_string(), Value::Bool(true));
                to_create.push((source_id.to_string(), row));
            }
        }
    }

    let rows: Vec<Row> = to_create.iter().map(|(_, row)| row.clone()).collect();
    let created = create(target, PRODUCT, &rows).await?;
    for (index, (source_id, _)) in to_create.iter().enumerate() {
        if let Some(target_id) = created.get(&index) {
            resolved.insert(source_id.clone(), target_id.clone());
            report.products_created += 1;
        }
    }
    for id in &absent {
        if !resolved.contains_key(id) {
            log::warn!("{} {} could not be found or created in target", PRODUCT, id);
        }
    }
    Ok(resolved)
}

async fn standard_pricebook(target: &dyn RecordStore) -> Result<Option<String>, MigrationError> {
    let query = Query::select(PRICEBOOK, ["Id"]).filter(Filter::eq("IsStandard", true)).limit(1);
    let rows = target
        .query(&query)
        .await
        .map_err(|e| MigrationError::store("Finding the standard pricebook", e))?;
    Ok(rows.first().and_then(|r| text(r, "Id")).map(str::to_string))
}

struct WantedEntry {
    source_id: String,
    product: String,
    pricebook: String,
    unit_price: Value,
}

fn entry_row(product: &str, pricebook: &str, unit_price: &Value) -> Row {
    let mut row = Row::new();
    row.insert("Product2Id".to_string(), json!(product));
    row.insert("Pricebook2Id".to_string(), json!(pricebook));
    row.insert("UnitPrice".to_string(), unit_price.clone());
    row.insert("IsActive".to_string(), Value::Bool(true));
    row
}

/// Find or create every missing catalog record the graph references and
/// remap its source id in `directory`.
pub async fn resolve_catalog(
    source: &dyn RecordStore,
    target: &dyn RecordStore,
    graph: &MigrationGraph,
    directory: &mut TargetDirectory,
) -> Result<CatalogReport, MigrationError> {
    let mut report = CatalogReport::default();
    let (mut products, entry_ids) = missing_references(graph, directory);
    if products.is_empty() && entry_ids.is_empty() {
        return Ok(report);
    }

    let source_entries = fetch(
        source,
        ENTRY,
        &["Id", "Product2Id", "Pricebook2Id", "UnitPrice"],
        "Id",
        &entry_ids,
    )
    .await?;
    products.extend(source_entries.iter().filter_map(|e| text(e, "Product2Id").map(str::to_string)));

    let resolved = resolve_products(source, target, &products, &mut report).await?;
    for (source_id, target_id) in &resolved {
        if source_id != target_id {
            directory.remap(PRODUCT, source_id, target_id);
        }
    }
    if source_entries.is_empty() {
        log::info!("Catalog: {} product(s) matched, {} created", report.products_matched, report.products_created);
        return Ok(report);
    }

    let pricebooks: BTreeSet<String> = source_entries
        .iter()
        .filter_map(|e| text(e, "Pricebook2Id").map(str::to_string))
        .collect();
    let known_pricebooks = ids(&fetch(target, PRICEBOOK, &["Id"], "Id", &pricebooks).await?);
    let standard = standard_pricebook(target).await?;

    let mut wanted = Vec::new();
    for entry in &source_entries {
        let Some(source_id) = text(entry, "Id") else { continue };
        let Some(product) = text(entry, "Product2Id").and_then(|p| resolved.get(p)) else {
            log::warn!("{} {}: its product is unavailable in target", ENTRY, source_id);
            continue;
        };
        let pricebook = text(entry, "Pricebook2Id")
            .filter(|p| known_pricebooks.contains(*p))
            .map(str::to_string)
            .or_else(|| standard.clone());
        let Some(pricebook) = pricebook else {
            log::warn!("{} {}: no usable pricebook in target", ENTRY, source_id);
            continue;
        };
        wanted.push(WantedEntry {
            source_id: source_id.to_string(),
            product: product.clone(),
            pricebook,
            unit_price: entry.get("UnitPrice").filter(|v| v.is_number()).cloned().unwrap_or(json!(0)),
        });
    }

    let target_products: BTreeSet<String> = wanted.iter().map(|w| w.product.clone()).collect();
    let mut existing: HashMap<(String, String), String> = HashMap::new();
    for row in fetch(target, ENTRY, &["Id", "Product2Id", "Pricebook2Id"], "Product2Id", &target_products).await? {
        if let (Some(id), Some(product), Some(pricebook)) =
            (text(&row, "Id"), text(&row, "Product2Id"), text(&row, "Pricebook2Id"))
        {
            existing.insert((product.to_string(), pricebook.to_string()), id.to_string());
        }
    }

    // A custom pricebook entry needs a standard one for the same product.
    if let Some(standard) = &standard {
        let mut needed: Vec<(String, Value)> = Vec::new();
        for w in wanted.iter().filter(|w| &w.pricebook != standard) {
            let key = (w.product.clone(), standard.clone());
            if !existing.contains_key(&key) && !needed.iter().any(|(p, _)| *p == w.product) {
                needed.push((w.product.clone(), w.unit_price.clone()));
            }
        }
        let rows: Vec<Row> = needed.iter().map(|(p, price)| entry_row(p, standard, price)).collect();
        let created = create(target, ENTRY, &rows).await?;
        for (index, (product, _)) in needed.iter().enumerate() {
            if let Some(id) = created.get(&index) {
                existing.insert((product.clone(), standard.clone()), id.clone());
                report.entries_created += 1;
            }
        }
    }

    let mut to_create: Vec<&WantedEntry> = Vec::new();
    for w in &wanted {
        match existing.get(&(w.product.clone(), w.pricebook.clone())) {
            Some(id) => {
                directory.remap(ENTRY, &w.source_id, id);
                report.entries_matched += 1;
            }
            None if to_create.iter().any(|c| c.product == w.product && c.pricebook == w.pricebook) => {}
            None => to_create.push(w),
        }
    }
    let rows: Vec<Row> = to_create.iter().map(|w| entry_row(&w.product, &w.pricebook, &w.unit_price)).collect();
    let created = create(target, ENTRY, &rows).await?;
    for (index, w) in to_create.iter().enumerate() {
        if let Some(id) = created.get(&index) {
            existing.insert((w.product.clone(), w.pricebook.clone()), id.clone());
            report.entries_created += 1;
        }
    }
    // Entries sharing a product and pricebook with one created above.
    for w in &wanted {
        if directory.remapped(&[ENTRY.to_string()], &w.source_id).is_some() {
            continue;
        }
        match existing.get(&(w.product.clone(), w.pricebook.clone())) {
            Some(id) => directory.remap(ENTRY, &w.source_id, id),
            None => log::warn!("{} {} could not be found or created in target", ENTRY, w.source_id),
        }
    }

    log::info!(
        "Catalog: {} product(s) matched, {} created; {} pricebook entr(ies) matched, {} created",
        report.products_matched,
        report.products_created,
        report.entries_matched,
        report.entries_created
    );
    Ok(report)
}
