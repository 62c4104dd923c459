//! Metric name constants, shared so emitters and dashboards agree.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! installs a recorder.

/// Dispatch submissions total (counter, labels: `mode` = awaited | detached).
pub const DISPATCH_SUBMITTED_TOTAL: &str = "dispatch_submitted_total";
/// Submissions folded into an already-queued entry (counter).
pub const DISPATCH_COMPACTED_TOTAL: &str = "dispatch_compacted_total";
/// Dispatched calls that completed successfully (counter).
pub const DISPATCH_EXECUTED_TOTAL: &str = "dispatch_executed_total";
/// Dispatched calls that failed permanently (counter).
pub const DISPATCH_FAILED_TOTAL: &str = "dispatch_failed_total";
/// Throttle signals received from downstream (counter).
pub const DISPATCH_THROTTLED_TOTAL: &str = "dispatch_throttled_total";
/// Entries waiting in the dispatch queue (gauge).
pub const DISPATCH_QUEUE_DEPTH: &str = "dispatch_queue_depth";
/// Trees with a running worker (gauge).
pub const TREE_WORKERS_ACTIVE: &str = "tree_workers_active";
/// Nodes handed to a processor (counter).
pub const TREE_NODES_PROCESSED_TOTAL: &str = "tree_nodes_processed_total";
/// Processor failures, including panics (counter).
pub const TREE_PROCESSOR_FAILURES_TOTAL: &str = "tree_processor_failures_total";
/// Nodes moved to CANCELLED (counter).
pub const TREE_NODES_CANCELLED_TOTAL: &str = "tree_nodes_cancelled_total";
