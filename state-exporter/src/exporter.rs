use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::destination::{save_stream, ExportStatusSink, SaveStats, StateRepository};
use crate::error::ExportError;
use crate::flow::FlowConverter;
use crate::metrics_constants::{
    DROPPED_STATES, EXPORT_RUNS, EXPORT_RUN_DURATION, LAST_EXPORTED_STATE, LOADED_STATES,
    SAVED_STATES, STATUS_SAVE_FAILURES, TRACKED_ENTITIES, UNTRACKED_ENTITIES,
};
use crate::pipeline::StatePipeline;
use crate::scheduler::Clock;
use crate::source::{EntityMetadata, EntityMetadataProvider, SourceStateProvider, SourceStateQuery};
use crate::strategy::{EntityStateTime, ProcessingStrategyResolver};

/// Summary of one export run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportStatus {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub loaded_states: usize,
    pub saved_states: usize,
    pub entities: usize,
    pub first_state_time: Option<DateTime<Utc>>,
    pub last_state_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExporterSettings {
    /// Source page size.
    pub batch_size: usize,
    /// Maximum number of source states read in one run.
    pub processing_limit: usize,
    /// Maximum number of states per destination write.
    pub write_batch_size: usize,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            processing_limit: 100_000,
            write_batch_size: 5_000,
        }
    }
}

pub struct ExporterPorts {
    pub metadata: Arc<dyn EntityMetadataProvider>,
    pub source: Arc<dyn SourceStateProvider>,
    pub repository: Arc<dyn StateRepository>,
    pub status_sink: Option<Arc<dyn ExportStatusSink>>,
}

#[derive(Debug, Default)]
struct RunStats {
    entities: usize,
    loaded: usize,
    produced: usize,
    saved: SaveStats,
}

pub struct StateExporter {
    ports: ExporterPorts,
    pipeline: StatePipeline,
    strategy_resolver: ProcessingStrategyResolver,
    settings: ExporterSettings,
    clock: Arc<dyn Clock>,
}

impl StateExporter {
    pub fn new(
        ports: ExporterPorts,
        pipeline: StatePipeline,
        strategy_resolver: ProcessingStrategyResolver,
        settings: ExporterSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ports,
            pipeline,
            strategy_resolver,
            settings,
            clock,
        }
    }

    /// Runs one export. Failures end the run and are reported in the returned status,
    /// which is also handed to the status sink when there is one.
    pub async fn export(&self) -> ExportStatus {
        let started_at = self.clock.now();
        let timer = Instant::now();
        info!("starting export");

        let mut stats = RunStats::default();
        let result = self.run(&mut stats).await;

        let status = ExportStatus {
            started_at,
            finished_at: self.clock.now(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            loaded_states: stats.loaded,
            saved_states: stats.saved.saved,
            entities: stats.entities,
            first_state_time: stats.saved.first,
            last_state_time: stats.saved.last,
        };

        let outcome = match &result {
            Ok(()) => {
                info!(
                    loaded = status.loaded_states,
                    saved = status.saved_states,
                    entities = status.entities,
                    first = ?status.first_state_time,
                    last = ?status.last_state_time,
                    "export finished"
                );
                "success"
            }
            Err(e) => {
                error!(
                    error = %e,
                    loaded = status.loaded_states,
                    saved = status.saved_states,
                    "export failed"
                );
                "failure"
            }
        };

        metrics::counter!(EXPORT_RUNS, "outcome" => outcome).increment(1);
        metrics::histogram!(EXPORT_RUN_DURATION).record(timer.elapsed().as_secs_f64());
        metrics::counter!(LOADED_STATES).increment(stats.loaded as u64);
        metrics::counter!(SAVED_STATES).increment(stats.saved.saved as u64);
        metrics::counter!(DROPPED_STATES)
            .increment(stats.loaded.saturating_sub(stats.produced) as u64);
        if let Some(last) = status.last_state_time {
            metrics::gauge!(LAST_EXPORTED_STATE).set(last.timestamp() as f64);
        }

        self.save_status(&status).await;
        status
    }

    async fn run(&self, stats: &mut RunStats) -> Result<(), ExportError> {
        let metadata = self.ports.metadata.get_entity_metadata().await?;
        let tracked = self.track(metadata);
        stats.entities = tracked.len();

        let strategy = self.strategy_resolver.resolve(&tracked).await?;
        let units = strategy.work_units();
        if units.is_empty() {
            return Ok(());
        }

        let source = Arc::clone(&self.ports.source);
        let flow = FlowConverter::new(
            self.settings.batch_size,
            self.settings.processing_limit,
            move |query: SourceStateQuery| {
                let source = Arc::clone(&source);
                async move { source.get_states(&query).await.map_err(ExportError::from) }
            },
        );

        let mut loaded = 0;
        let mut produced = 0;
        let records = flow.execute(units).inspect(|record| {
            if record.is_ok() {
                loaded += 1;
            }
        });
        let states = self.pipeline.execute(records).inspect(|state| {
            if state.is_ok() {
                produced += 1;
            }
        });

        let result = save_stream(
            self.ports.repository.as_ref(),
            states,
            self.settings.write_batch_size,
            &mut stats.saved,
        )
        .await;

        stats.loaded = loaded;
        stats.produced = produced;
        result
    }

    /// Entities to follow this run, keyed by the identity their points are stored under.
    fn track(&self, metadata: Vec<EntityMetadata>) -> Vec<EntityStateTime> {
        let mut tracked: BTreeMap<_, (DateTime<Utc>, BTreeSet<String>)> = BTreeMap::new();
        let mut untracked = 0usize;

        for entity in metadata {
            let Some(entity_id) = self.pipeline.resolve_entity_id(&entity.entity_id) else {
                untracked += 1;
                continue;
            };
            let Some(schema) = self.pipeline.resolve_schema(&entity_id) else {
                untracked += 1;
                continue;
            };

            let stored_as = schema.destination_entity(&entity_id);
            let (last_updated, source_ids) = tracked
                .entry(stored_as)
                .or_insert_with(|| (entity.last_updated, BTreeSet::new()));
            *last_updated = (*last_updated).max(entity.last_updated);
            source_ids.insert(entity.entity_id);
        }

        if untracked > 0 {
            debug!(untracked, "skipped entities without configuration");
        }
        metrics::gauge!(TRACKED_ENTITIES).set(tracked.len() as f64);
        metrics::gauge!(UNTRACKED_ENTITIES).set(untracked as f64);

        tracked
            .into_iter()
            .map(|(entity, (last_updated, source_ids))| {
                EntityStateTime::new(entity, last_updated).with_source_ids(source_ids)
            })
            .collect()
    }

    async fn save_status(&self, status: &ExportStatus) {
        let Some(sink) = &self.ports.status_sink else {
            return;
        };

        if let Err(e) = sink.save(status).await {
            warn!(error = %e, "failed to save export status");
            metrics::counter!(STATUS_SAVE_FAILURES).increment(1);
        }
    }
}
