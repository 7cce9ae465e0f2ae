//! # Failure Handling
//!
//! A failed delivery is held for the requeue delay and then nacked with
//! requeue; it is never acked on failure and does not stall the queue.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use rapid_bus::{BusConfig, HandlerSet};

    use crate::integration::support::{
        config, eventually, AuditHandler, Harness, RecordingHandler, Sample, QUEUE,
    };

    #[tokio::test]
    async fn test_failed_handler_is_requeued_after_delay() {
        let h = Harness::new();
        h.script.fail_once("e1");
        let bus = h.start_recording().await;

        let started = Instant::now();
        bus.publish(&Sample::new("e1")).await.unwrap();

        eventually("e1 nacked", || h.broker.stats().nacks == 1).await;
        assert!(started.elapsed() >= Duration::from_millis(config().requeue_delay_ms));
        assert_eq!(h.broker.stats().requeued, 1);

        eventually("e1 acked on redelivery", || h.broker.stats().acks == 1).await;
        assert_eq!(h.journal.count("recording:e1"), 2);
        assert_eq!(h.broker.queue_depth(QUEUE), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_messages() {
        let h = Harness::new();
        h.script.fail_once("e1");
        let bus = h.start_recording().await;

        bus.publish(&Sample::new("e1")).await.unwrap();
        bus.publish(&Sample::new("e2")).await.unwrap();

        eventually("both acked", || h.broker.stats().acks == 2).await;

        // e2 finished while e1 was waiting out its requeue delay.
        let entries = h.journal.entries();
        let e2 = entries.iter().position(|e| e == "recording:e2").unwrap();
        let e1_retry = entries.iter().rposition(|e| e == "recording:e1").unwrap();
        assert!(e2 < e1_retry, "unexpected order: {entries:?}");
        assert_eq!(h.broker.stats().nacks, 1);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_fan_out_failure_redelivers_whole_message() {
        let h = Harness::new();
        h.script.fail_once("e1");
        let journal = h.journal.clone();
        let (recording_journal, script) = (h.journal.clone(), h.script.clone());
        let bus = h
            .builder()
            .register_handlers(
                HandlerSet::new()
                    .with::<Sample, _, _>(move |_| RecordingHandler {
                        journal: recording_journal.clone(),
                        script: script.clone(),
                    })
                    .with::<Sample, _, _>(move |_| AuditHandler {
                        journal: journal.clone(),
                    }),
            )
            .build()
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(&Sample::new("e1")).await.unwrap();

        eventually("e1 acked", || h.broker.stats().acks == 1).await;
        // At-least-once: the healthy handler ran on both deliveries.
        assert_eq!(h.journal.count("audit:e1"), 2);
        assert_eq!(h.journal.count("recording:e1"), 2);
        assert_eq!(h.broker.stats().nacks, 1);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_requeue_leaves_redelivery_to_broker() {
        let h = Harness::new();
        h.script.fail_once("e1");
        let bus = h
            .builder()
            .config(BusConfig {
                requeue_delay_ms: 300,
                ..config()
            })
            .build()
            .unwrap();
        bus.subscribe::<Sample, RecordingHandler>().await.unwrap();
        bus.start().await.unwrap();

        bus.publish(&Sample::new("e1")).await.unwrap();
        eventually("e1 failed", || h.journal.count("recording:e1") == 1).await;
        assert_eq!(h.broker.unacked_count(), 1);

        // Channel dies while the failed delivery waits out its requeue delay.
        h.broker.break_consumer_channels();
        assert_eq!(h.broker.stats().acks, 0);
        assert_eq!(h.broker.stats().nacks, 0);
        assert_eq!(h.broker.stats().requeued, 1);

        eventually("redelivered and acked", || h.broker.stats().acks == 1).await;
        assert_eq!(h.journal.count("recording:e1"), 2);

        // The late nack hits the dead channel and is only logged.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = h.broker.stats();
        assert_eq!(stats.nacks, 0);
        assert_eq!(stats.acks, 1);
        assert_eq!(h.journal.count("recording:e1"), 2);
        assert_eq!(h.broker.queue_depth(QUEUE), 0);
        assert_eq!(h.broker.unacked_count(), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_concurrency_is_bounded_end_to_end() {
        let h = Harness::new();
        h.script.set_delay(Duration::from_millis(20));
        let bus = h.start_recording().await;

        for i in 0..8 {
            bus.publish(&Sample::new(&format!("c{i}"))).await.unwrap();
        }

        eventually("all acked", || h.broker.stats().acks == 8).await;
        let max = h.script.max_concurrent.load(Ordering::SeqCst);
        assert!(max <= config().max_concurrent_handlers, "max in flight was {max}");
        assert_eq!(bus.dispatcher().available_permits(), 2);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_returns_pending_message_to_queue() {
        let h = Harness::new();
        h.script.set_delay(Duration::from_millis(200));
        let bus = h.start_recording().await;

        bus.publish(&Sample::new("slow")).await.unwrap();
        eventually("delivery in flight", || h.broker.unacked_count() == 1).await;

        bus.shutdown().await;

        assert_eq!(h.broker.unacked_count(), 0);
        assert_eq!(h.broker.queue_depth(QUEUE), 1);
        assert_eq!(h.broker.stats().acks, 0);
    }
}
