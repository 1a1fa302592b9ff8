// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, gauge, histogram};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $( let _ = &$label_value; )*
    }};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $( let _ = &$label_value; )*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $( let _ = &$label_value; )*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, gauge, histogram};

/// Registers metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_counter!("replay_events_total", "Transfer events folded into a ledger.");
    describe_counter!(
        "replay_negative_clamps_total",
        "Transfers whose sender balance would have gone negative and was clamped to zero."
    );
    describe_counter!("holders_classified_total", "Addresses classified (contract / blacklist) on first sight.");
    describe_counter!("rpc_calls_total", "RPC calls issued, by method.");
    describe_counter!("persisted_rows_total", "Rows written by committed checkpoints and rounds, by table.");
    describe_counter!("reconciliation_mismatches_total", "Discrepancies found by reconciliation and audits.");
    describe_gauge!("checkpoint_block", "Block height of the last persisted snapshot.");
}

pub fn increment_replayed_events(count: usize) {
    counter!("replay_events_total", count as u64);
}

pub fn increment_negative_clamps() {
    counter!("replay_negative_clamps_total", 1);
}

pub fn increment_classified(count: usize) {
    counter!("holders_classified_total", count as u64);
}

pub fn increment_rpc_call(method: &str) {
    counter!("rpc_calls_total", 1, "method" => method.to_string());
}

pub fn record_multicall_batch_size(size: usize) {
    histogram!("multicall_batch_size", size as f64);
}

pub fn increment_persisted_rows(table: &str, rows: usize) {
    counter!("persisted_rows_total", rows as u64, "table" => table.to_string());
}

pub fn increment_mismatches(count: usize) {
    counter!("reconciliation_mismatches_total", count as u64);
}

pub fn set_checkpoint_block(block: u64) {
    gauge!("checkpoint_block", block as f64);
}
