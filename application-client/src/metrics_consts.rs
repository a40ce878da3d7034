// ==== Consumer lifecycle metrics ====
/// Gauge for consumers currently between RUNNING and CLOSED
pub const CONSUMERS_ACTIVE: &str = "application_consumer_active";

/// Counter for state machine transitions, labelled with from/to state
pub const CONSUMER_STATE_TRANSITIONS: &str = "application_consumer_state_transitions_total";

/// Counter for consumers that failed to subscribe
pub const CONSUMER_SUBSCRIPTION_FAILURES: &str = "application_consumer_subscription_failures_total";

// ==== Poll / dispatch metrics ====
/// Histogram for number of records returned by a non-empty poll
pub const CONSUMER_BATCH_SIZE: &str = "application_consumer_batch_size";

/// Counter for poll operations that failed (always fatal)
pub const CONSUMER_POLL_FAILURES: &str = "application_consumer_poll_failures_total";

/// Counter for messages whose handler returned successfully
pub const CONSUMER_MESSAGES_HANDLED: &str = "application_consumer_messages_handled_total";

/// Counter for handler errors (always fatal, never reported to the close handler)
pub const CONSUMER_HANDLER_FAILURES: &str = "application_consumer_handler_failures_total";

/// Counter for records skipped because their offset was already handled
pub const CONSUMER_STALE_RECORDS_SKIPPED: &str = "application_consumer_stale_records_skipped_total";

// ==== Commit metrics ====
/// Counter for partition offsets committed
pub const CONSUMER_OFFSETS_COMMITTED: &str = "application_consumer_offsets_committed_total";

/// Counter for commit operations that failed (always fatal)
pub const CONSUMER_COMMIT_FAILURES: &str = "application_consumer_commit_failures_total";

/// Histogram for commit round trip in milliseconds
pub const CONSUMER_COMMIT_DURATION_MS: &str = "application_consumer_commit_duration_ms";

/// Counter for handled offsets that did not advance the tracker
pub const OFFSET_TRACKER_OUT_OF_ORDER: &str = "application_consumer_offset_out_of_order_total";
