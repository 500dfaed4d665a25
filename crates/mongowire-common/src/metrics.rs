//! Metrics for MongoWire
//!
//! Thin wrappers over the `metrics` facade. The library never installs an
//! exporter; applications choose their own recorder.
#![allow(clippy::cast_precision_loss)]

use metrics::{counter, gauge, histogram};

// ============================================================================
// Wire Metrics
// ============================================================================

/// Record an outbound message
pub fn record_message_sent(op_code: &'static str, bytes: usize) {
    counter!("mongowire_messages_sent_total", "op" => op_code).increment(1);
    counter!("mongowire_bytes_sent_total").increment(bytes as u64);
}

/// Record a reply matched to its waiter
pub fn record_reply_received() {
    counter!("mongowire_replies_received_total").increment(1);
}

/// Record a reply whose `responseTo` matched no waiter
pub fn record_unmatched_reply() {
    counter!("mongowire_unmatched_replies_total").increment(1);
}

// ============================================================================
// Query Metrics
// ============================================================================

/// Record a request that timed out waiting for its reply
pub fn record_query_timeout() {
    counter!("mongowire_query_timeouts_total").increment(1);
}

/// Record the round-trip latency of a request
pub fn record_query_latency(command: &str, latency_ms: f64) {
    histogram!("mongowire_query_duration_ms", "command" => command.to_string()).record(latency_ms);
}

/// Record a getMore issued by a cursor
pub fn record_get_more(documents: usize) {
    counter!("mongowire_get_more_total").increment(1);
    counter!("mongowire_get_more_documents_total").increment(documents as u64);
}

/// Record a server cursor released by the client
pub fn record_cursor_killed() {
    counter!("mongowire_cursors_killed_total").increment(1);
}

// ============================================================================
// Connection Metrics
// ============================================================================

/// Record new connection
pub fn record_connection_opened(host: &str) {
    counter!("mongowire_connections_opened_total", "host" => host.to_string()).increment(1);
}

/// Record closed connection
pub fn record_connection_closed(host: &str) {
    counter!("mongowire_connections_closed_total", "host" => host.to_string()).increment(1);
}

/// Update pool size gauge
pub fn set_pool_size(count: usize) {
    gauge!("mongowire_pool_connections").set(count as f64);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record a freshly generated server session
pub fn record_session_allocated() {
    counter!("mongowire_sessions_allocated_total").increment(1);
}

/// Record a server session handed out from the reuse stack
pub fn record_session_reused() {
    counter!("mongowire_sessions_reused_total").increment(1);
}
