pub mod cluster;
pub mod controller;
pub mod storage;

// Labels stamped on every cluster resource created for a pipeline instance.
// They are the only authority used for reconciliation and deletion.
pub const LABEL_PIPELINE: &str = "pipeline";
pub const LABEL_INSTANCE_ID: &str = "id";
pub const LABEL_TASK: &str = "task";

// Job condition types reported by the workload manager.
pub const CONDITION_COMPLETE: &str = "Complete";
pub const CONDITION_FAILED: &str = "Failed";

// Capacity of the executor event channel. Producers block when the loop
// falls behind; that backpressure is intentional.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

// A job is aborted once its failure count exceeds
// max(FAILURE_THRESHOLD_MIN, completions).
pub const FAILURE_THRESHOLD_MIN: i32 = 4;

// Delay before a watcher re-opens its upstream streams after either closes.
pub const WATCH_RECONNECT_SECS: u64 = 5;
