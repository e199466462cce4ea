pub const EXPORT_RUNS: &str = "state_exporter_runs_total";
pub const EXPORT_RUN_DURATION: &str = "state_exporter_run_duration_seconds";
pub const LOADED_STATES: &str = "state_exporter_loaded_states_total";
pub const SAVED_STATES: &str = "state_exporter_saved_states_total";
pub const DROPPED_STATES: &str = "state_exporter_dropped_states_total";
pub const TRACKED_ENTITIES: &str = "state_exporter_tracked_entities";
pub const UNTRACKED_ENTITIES: &str = "state_exporter_untracked_entities";
pub const LAST_EXPORTED_STATE: &str = "state_exporter_last_exported_state_timestamp_seconds";
pub const STATUS_SAVE_FAILURES: &str = "state_exporter_status_save_failures_total";
