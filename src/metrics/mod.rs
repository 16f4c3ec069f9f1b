use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_acked_total: CounterVec,
    pub messages_requeued_total: CounterVec,
    pub messages_discarded_total: CounterVec,
    pub message_processing_duration_seconds: HistogramVec,
    pub active_consumers: Gauge,
    pub messages_published_total: CounterVec,
    pub publish_failures_total: CounterVec,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_acked_total = CounterVec::new(
            Opts::new(
                "task_broker_messages_acked_total",
                "Total number of messages processed and acknowledged",
            ),
            &["queue", "action"],
        )?;

        let messages_requeued_total = CounterVec::new(
            Opts::new(
                "task_broker_messages_requeued_total",
                "Total number of messages rejected with requeue for retry",
            ),
            &["queue", "action"],
        )?;

        let messages_discarded_total = CounterVec::new(
            Opts::new(
                "task_broker_messages_discarded_total",
                "Total number of messages rejected without requeue",
            ),
            &["queue", "reason"],
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "task_broker_message_processing_duration_seconds",
                "Time taken to process a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["queue", "outcome"],
        )?;

        let active_consumers = Gauge::new(
            "task_broker_active_consumers",
            "Number of active consumer loops",
        )?;

        let messages_published_total = CounterVec::new(
            Opts::new(
                "task_broker_messages_published_total",
                "Total number of messages confirmed by the broker",
            ),
            &["queue"],
        )?;

        let publish_failures_total = CounterVec::new(
            Opts::new(
                "task_broker_publish_failures_total",
                "Total number of publishes that failed",
            ),
            &["queue"],
        )?;

        registry.register(Box::new(messages_acked_total.clone()))?;
        registry.register(Box::new(messages_requeued_total.clone()))?;
        registry.register(Box::new(messages_discarded_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;
        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(publish_failures_total.clone()))?;

        Ok(Arc::new(Self {
            messages_acked_total,
            messages_requeued_total,
            messages_discarded_total,
            message_processing_duration_seconds,
            active_consumers,
            messages_published_total,
            publish_failures_total,
            registry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_collectors_registered() {
        let metrics = Metrics::new().unwrap();
        metrics
            .messages_discarded_total
            .with_label_values(&["p_email", "no_handler"])
            .inc();
        metrics.active_consumers.inc();

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"task_broker_messages_discarded_total".to_string()));
        assert!(names.contains(&"task_broker_active_consumers".to_string()));
    }
}
