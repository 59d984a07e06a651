//! Seed a Salesforce sandbox with a connected slice of production records.
//!
//! Root accounts and everything they own are read from the source org and
//! recreated in the target in two passes: create with placeholder lookups,
//! then update with the real ones.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod deletion;
pub mod dispatch;
pub mod dummy;
pub mod error;
pub mod graph;
pub mod id_map;
pub mod logging;
pub mod migration;
pub mod phase1;
pub mod phase2;
pub mod record_types;
pub mod schema;
pub mod store;
pub mod summary;
pub mod transform;
pub mod types;

use std::sync::Arc;

use audit::QueryLog;
use config::Config;
use error::MigrationError;
use migration::{Aborted, Migration};
use store::session::session_from_cli;
use store::{LoggedStore, RecordStore, SalesforceStore};
use summary::MigrationOutcome;

async fn connect(
    alias: &str,
    config: &Config,
    log: &Arc<QueryLog>,
) -> Result<Arc<dyn RecordStore>, MigrationError> {
    let session = session_from_cli(alias, &config.api_version)
        .await
        .map_err(|e| MigrationError::store(format!("Connecting to {alias}"), e))?;
    log::info!("Connected to {} at {}", alias, session.instance_url);
    let store = SalesforceStore::new(session, &config.bulk)
        .map_err(|e| MigrationError::store(format!("Building client for {alias}"), e))?;
    Ok(Arc::new(LoggedStore::new(Arc::new(store), log.clone())))
}

/// Connect to both orgs through the Salesforce CLI and run one migration.
pub async fn run(config: Config) -> Result<MigrationOutcome, Aborted> {
    let aborted = |error: MigrationError| Aborted {
        error,
        outcome: MigrationOutcome::default(),
    };
    config.validate().map_err(|e| aborted(e.into()))?;

    let query_log = QueryLog::open(&config.work_dir())
        .map(Arc::new)
        .map_err(|e| aborted(e.into()))?;
    log::info!("Query log: {}", query_log.path().display());

    let source = connect(config.source_alias().map_err(|e| aborted(e.into()))?, &config, &query_log)
        .await
        .map_err(aborted)?;
    let target = connect(config.target_alias().map_err(|e| aborted(e.into()))?, &config, &query_log)
        .await
        .map_err(aborted)?;

    Migration::new(config, source, target).run().await
}
