//! Metrics recorded by the client and the workers of a single process.
//!
//! Every counter with a `queue` label is incremented once per job and
//! event. Aggregation across processes happens at the Prometheus level.

use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder};

metrics! {
    pub struct QueueMetrics {
        /// Number of jobs inserted by enqueue calls
        pub jobs_enqueued_total: IntCounterVec["queue"],
        /// Number of enqueue calls that returned an existing job with the same unique key
        pub jobs_deduplicated_total: IntCounterVec["queue"],
        /// Number of jobs leased by workers
        pub jobs_claimed_total: IntCounterVec["queue"],
        /// Number of jobs acknowledged as completed
        pub jobs_completed_total: IntCounterVec["queue"],
        /// Number of failed deliveries that were rescheduled
        pub jobs_retried_total: IntCounterVec["queue"],
        /// Number of jobs moved to the history table as dead letters
        pub jobs_dead_lettered_total: IntCounterVec["queue"],
        /// Number of dispositions rejected because the lease was no longer held
        pub lease_conflicts_total: IntCounterVec["queue"],
        /// Number of expired leases cleared by the reaper
        pub jobs_recovered_total: IntCounter,
        /// Number of jobs currently being handled by workers of this process
        pub jobs_in_flight: IntGauge,
    }

    // All queue metrics will be prefixed with this namespace.
    namespace: "lease_queue",
}

impl QueueMetrics {
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut output = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut output)?;
        String::from_utf8(output).map_err(|error| prometheus::Error::Msg(error.to_string()))
    }

    pub(crate) fn queue_counter(counter: &IntCounterVec, queue_name: &str) {
        counter.with_label_values(&[queue_name]).inc();
    }
}
