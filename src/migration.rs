//! Run orchestration.
//!
//! Order of a run: safety checks, deletion, schema, record types, graph,
//! target lookups, product catalog, placeholders, create phase (ledger written whatever its
//! result), update phase. Any error ends the run; the outcome still lists
//! the kinds that finished before it.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::audit::write_ledger;
use crate::catalog::resolve_catalog;
use crate::config::Config;
use crate::deletion::{ensure_distinct, verify_sandbox, DeletionGuard, DeletionReport};
use crate::dispatch::Dispatcher;
use crate::dummy::{needed_placeholders, Placeholders};
use crate::error::MigrationError;
use crate::graph::{GraphBuilder, GraphLimits, MigrationGraph};
use crate::id_map::IdentifierMap;
use crate::phase1::{run_phase1, Phase1Report};
use crate::phase2::{run_phase2, Phase2Report};
use crate::record_types::{resolve_type_codes, TypeCodeMap};
use crate::schema::{introspect, SchemaRegistry};
use crate::store::RecordStore;
use crate::summary::MigrationOutcome;
use crate::transform::TargetDirectory;
use crate::types::RecordKind;

/// Read-only state shared by both phases.
pub struct RunContext<'a> {
    pub config: &'a Config,
    pub graph: &'a MigrationGraph,
    pub schema: &'a SchemaRegistry,
    pub type_codes: &'a TypeCodeMap,
    pub directory: &'a TargetDirectory,
    pub placeholders: &'a Placeholders,
    pub dispatcher: &'a Dispatcher,
}

/// A run that stopped early, with what it got done.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Aborted {
    pub error: MigrationError,
    pub outcome: MigrationOutcome,
}

#[derive(Default)]
struct RunState {
    deletion: DeletionReport,
    phase1: Phase1Report,
    phase2: Option<Phase2Report>,
}

pub struct Migration {
    config: Config,
    source: Arc<dyn RecordStore>,
    target: Arc<dyn RecordStore>,
}

impl Migration {
    pub fn new(config: Config, source: Arc<dyn RecordStore>, target: Arc<dyn RecordStore>) -> Self {
        Self {
            config,
            source,
            target,
        }
    }

    pub async fn run(&self) -> Result<MigrationOutcome, Aborted> {
        let started = Instant::now();
        let mut state = RunState::default();
        let result = self.execute(&mut state).await;

        let mut outcome = MigrationOutcome::from_phases(&state.phase1, state.phase2.as_ref());
        outcome.deleted = state.deletion.total_deleted();
        let mut issues = state.deletion.issues;
        issues.append(&mut outcome.issues);
        outcome.issues = issues;
        outcome.elapsed = started.elapsed();
        outcome.completed = result.is_ok();

        match result {
            Ok(()) => {
                log::info!("Migration finished in {}", crate::summary::format_elapsed(outcome.elapsed));
                Ok(outcome)
            }
            Err(error) => {
                log::error!("Migration aborted: {}", error);
                Err(Aborted { error, outcome })
            }
        }
    }

    async fn execute(&self, state: &mut RunState) -> Result<(), MigrationError> {
        let config = &self.config;
        config.validate()?;
        let source = self.source.as_ref();
        let target = self.target.as_ref();

        ensure_distinct(source, target)?;
        verify_sandbox(target).await?;

        let work_dir = config.work_dir();
        let dispatcher = Dispatcher::new(self.target.clone(), &config.bulk);
        if config.delete_existing_records {
            state.deletion = DeletionGuard::new(target, &dispatcher, config.delete_scope, &work_dir)
                .run()
                .await?;
        } else {
            log::info!("Deletion disabled; existing target records are left in place");
        }

        let limits = GraphLimits::from_config(config)?;
        let kinds = limits.active_kinds();
        let schema = introspect(source, target, &kinds).await?;
        let type_codes = resolve_type_codes(source, target, &kinds)
            .await
            .map_err(|e| MigrationError::store("Resolving record types", e))?;
        let graph = GraphBuilder::new(source, &schema, limits)
            .build(&config.accounts)
            .await?;
        let mut directory = TargetDirectory::load(target, &graph).await?;
        resolve_catalog(source, target, &graph, &mut directory).await?;
        let placeholders = Placeholders::ensure(
            target,
            &needed_placeholders(&graph, &schema, config.defer_optional_references),
        )
        .await?;

        let ctx = RunContext {
            config,
            graph: &graph,
            schema: &schema,
            type_codes: &type_codes,
            directory: &directory,
            placeholders: &placeholders,
            dispatcher: &dispatcher,
        };

        let mut ids = IdentifierMap::new();
        let created = run_phase1(&ctx, &mut ids, &state.deletion.retained, &mut state.phase1).await;
        let ledger = write_ledgers(&work_dir, &state.phase1);
        created?;
        ledger?;
        log::info!("Create phase complete: {} record(s) mapped", ids.len());

        let mut phase2 = Phase2Report::default();
        let updated = run_phase2(&ctx, &ids, &state.phase1, &mut phase2).await;
        state.phase2 = Some(phase2);
        updated
    }
}

fn write_ledgers(work_dir: &Path, phase1: &Phase1Report) -> Result<(), MigrationError> {
    for kind in RecordKind::CREATION_ORDER {
        let entries = phase1.ledger.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        let path = write_ledger(work_dir, kind, entries)?;
        log::debug!("Ledger {} written ({} entries)", path.display(), entries.len());
    }
    Ok(())
}
