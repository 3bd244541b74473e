/*!
This module contains the definitions of the metrics emitted by the runtime.
*/

// Gauges
pub(crate) static METRIC_PENDING_REQUESTS: &str = "pending_requests";
pub(crate) static METRIC_ACTIVE_WORKERS: &str = "active_workers";

// Counters
pub(crate) static METRIC_INVOCATIONS: &str = "invocations_total";
pub(crate) static METRIC_QUEUE_FULL_REJECTIONS: &str = "queue_full_rejections_total";
pub(crate) static METRIC_WORKER_REPLACEMENTS: &str = "worker_replacements_total";
pub(crate) static METRIC_CONSENTED_LOG_RECORDS: &str = "consented_log_records_total";
