pub mod config;
pub mod enrichment;
pub mod importer;
pub mod migrate;
pub mod notify;
pub mod pipeline;
pub mod remote_db;
pub mod run_log;
pub mod upsert;

pub use config::{LandingMode, PipelineConfig};
pub use enrichment::{enrich_pending, pending_offers, Enricher, PendingOffer};
pub use importer::{Importer, QuarantineSink, RecordOutcome};
pub use notify::{notifier_for, NoopNotifier, Notifier, WebhookNotifier};
pub use pipeline::{
    import_source, landing_writer, open_object_store, remote_database, run_fetch, run_import,
    run_synced_import, FetchOptions,
};
pub use remote_db::{Lease, LeaseSettings, RemoteDatabase, SyncedRun};
pub use run_log::{run_log_key, ship_run_log, upload_run_log, RunKind};
pub use upsert::{upsert_by_natural_key, SqlValue};

pub const CRATE_NAME: &str = "jjop-sync";
