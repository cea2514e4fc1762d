//! Metric names and descriptions
//!
//! Components record through the `metrics` facade; exporting is left to the
//! embedding process.

use metrics::{describe_counter, describe_gauge, Unit};

/// Open client connections on this gateway
pub const GATEWAY_CONNECTIONS: &str = "microman_gateway_connections";
/// Requests forwarded to the work channel
pub const GATEWAY_REQUESTS: &str = "microman_gateway_requests_total";
/// Requests refused, labelled by `reason`
pub const GATEWAY_REJECTED: &str = "microman_gateway_rejected_total";
/// Frames delivered from the publish channel, labelled by `kind`
pub const GATEWAY_DELIVERIES: &str = "microman_gateway_deliveries_total";
/// Work messages settled, labelled by `outcome`
pub const WORKER_MESSAGES: &str = "microman_worker_messages_total";
/// Broker reconnect attempts, labelled by `role`
pub const BROKER_RECONNECTS: &str = "microman_broker_reconnects_total";

/// Register descriptions for every metric name
pub fn describe_metrics() {
    describe_gauge!(GATEWAY_CONNECTIONS, Unit::Count, "Open client connections");
    describe_counter!(
        GATEWAY_REQUESTS,
        Unit::Count,
        "Requests forwarded to the work channel"
    );
    describe_counter!(
        GATEWAY_REJECTED,
        Unit::Count,
        "Requests refused by validation, throttling or capacity"
    );
    describe_counter!(
        GATEWAY_DELIVERIES,
        Unit::Count,
        "Replies and broadcasts delivered to local connections"
    );
    describe_counter!(
        WORKER_MESSAGES,
        Unit::Count,
        "Work messages settled by workers"
    );
    describe_counter!(
        BROKER_RECONNECTS,
        Unit::Count,
        "Broker reconnect attempts"
    );
}
