//! # End-to-End Flows
//!
//! Publish through a built bus, consume on the same bus, check what ran and
//! what the broker saw.
//!
//! ## Flows Tested
//!
//! 1. Publish → single handler → ack
//! 2. Delivery for an unsubscribed name → ack and drop
//! 3. Fan-out to several handlers of one event
//! 4. Pipeline steps wrap the handler in registration order
//! 5. Middleware short-circuit
//! 6. Runtime subscribe / unsubscribe and queue bindings

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::time::Duration;

    use rapid_bus::{
        delegate, BusError, EventContext, EventDelegate, HandlerResult, HandlerSet, Middleware,
    };

    use crate::integration::support::{
        eventually, AuditHandler, Harness, Journal, Other, RecordingHandler, Sample, EXCHANGE,
        QUEUE,
    };

    fn recording_step(label: &'static str, journal: Journal) -> impl Fn(EventDelegate) -> EventDelegate {
        move |next: EventDelegate| {
            let journal = journal.clone();
            delegate(move |ctx: EventContext| {
                let (next, journal) = (next.clone(), journal.clone());
                async move {
                    journal.push(format!("{label}-before"));
                    ctx.update_item::<Vec<String>, _>("trail", |trail| trail.push(label.to_string()));
                    let result = next(ctx.clone()).await;
                    journal.push(format!("{label}-after"));
                    result
                }
            })
        }
    }

    /// Skips events whose id starts with `skip-`.
    struct SkipFilter;

    #[async_trait]
    impl Middleware for SkipFilter {
        async fn invoke(&self, ctx: EventContext, next: EventDelegate) -> HandlerResult {
            if ctx
                .event::<Sample>()
                .is_some_and(|sample| sample.id.starts_with("skip-"))
            {
                return Ok(());
            }
            next(ctx).await
        }
    }

    // =========================================================================
    // PUBLISH / CONSUME
    // =========================================================================

    #[tokio::test]
    async fn test_published_event_is_handled_once_and_acked() {
        let h = Harness::new();
        let bus = h.start_recording().await;

        bus.publish(&Sample::new("e1")).await.unwrap();

        eventually("e1 acked", || h.broker.stats().acks == 1).await;
        assert_eq!(h.journal.entries(), vec!["recording:e1"]);

        let published = h.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, EXCHANGE);
        assert_eq!(published[0].routing_key, "Sample");
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&published[0].body).unwrap(),
            serde_json::json!({ "id": "e1" })
        );

        // Nothing left behind, nothing redelivered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.journal.count("recording:e1"), 1);
        assert_eq!(h.broker.unacked_count(), 0);
        assert_eq!(h.broker.queue_depth(QUEUE), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_delivery_is_acked_and_dropped() {
        let h = Harness::new();
        let bus = h.start_recording().await;

        h.broker
            .enqueue(QUEUE, "Other", serde_json::to_vec(&Other { n: 1 }).unwrap())
            .unwrap();

        eventually("Other acked", || h.broker.stats().acks == 1).await;
        assert!(h.journal.entries().is_empty());
        assert_eq!(h.broker.stats().nacks, 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_unroutable() {
        let h = Harness::new();
        let bus = h.start_recording().await;

        let err = bus.publish(&Other { n: 1 }).await.unwrap_err();
        assert!(matches!(err, BusError::Unroutable { .. }));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_fan_out_runs_every_handler() {
        let h = Harness::new();
        let journal = h.journal.clone();
        let bus = h
            .builder()
            .register_handlers(
                HandlerSet::new()
                    .with::<Sample, _, _>({
                        let (journal, script) = (h.journal.clone(), h.script.clone());
                        move |_| RecordingHandler {
                            journal: journal.clone(),
                            script: script.clone(),
                        }
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
        let mut entries = h.journal.entries();
        entries.sort();
        assert_eq!(entries, vec!["audit:e1", "recording:e1"]);

        bus.shutdown().await;
    }

    // =========================================================================
    // PIPELINE
    // =========================================================================

    #[tokio::test]
    async fn test_steps_wrap_handler_in_registration_order() {
        let h = Harness::new();
        let bus = h
            .builder()
            .use_step(recording_step("A", h.journal.clone()))
            .use_step(recording_step("B", h.journal.clone()))
            .build()
            .unwrap();
        bus.subscribe::<Sample, RecordingHandler>().await.unwrap();
        bus.start().await.unwrap();

        bus.publish(&Sample::new("e1")).await.unwrap();

        eventually("e1 acked", || h.broker.stats().acks == 1).await;
        assert_eq!(
            h.journal.entries(),
            vec!["A-before", "B-before", "recording:e1", "B-after", "A-after"]
        );

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_middleware_short_circuit_still_acks() {
        let h = Harness::new();
        let bus = h
            .builder()
            .use_middleware_instance(SkipFilter)
            .build()
            .unwrap();
        bus.subscribe::<Sample, RecordingHandler>().await.unwrap();
        bus.start().await.unwrap();

        bus.publish(&Sample::new("skip-1")).await.unwrap();
        bus.publish(&Sample::new("e2")).await.unwrap();

        eventually("both acked", || h.broker.stats().acks == 2).await;
        assert_eq!(h.journal.entries(), vec!["recording:e2"]);

        bus.shutdown().await;
    }

    // =========================================================================
    // RUNTIME SUBSCRIPTIONS
    // =========================================================================

    #[tokio::test]
    async fn test_runtime_subscribe_and_unsubscribe() {
        let h = Harness::new();
        let bus = h.start_recording().await;
        assert_eq!(h.broker.bound_routing_keys(EXCHANGE, QUEUE), vec!["Sample"]);

        bus.subscribe::<Other, AuditHandler>().await.unwrap();
        assert_eq!(
            h.broker.bound_routing_keys(EXCHANGE, QUEUE),
            vec!["Sample", "Other"]
        );

        bus.publish(&Other { n: 3 }).await.unwrap();
        eventually("Other handled", || h.journal.count("audit-other:3") == 1).await;

        assert!(bus.unsubscribe::<Other, AuditHandler>());
        assert!(!bus.unsubscribe::<Other, AuditHandler>());
        eventually("Other unbound", || {
            h.broker.bound_routing_keys(EXCHANGE, QUEUE) == vec!["Sample".to_string()]
        })
        .await;

        let err = bus.publish(&Other { n: 4 }).await.unwrap_err();
        assert!(matches!(err, BusError::Unroutable { .. }));

        // The queue keeps consuming the remaining name.
        bus.publish(&Sample::new("e5")).await.unwrap();
        eventually("e5 handled", || h.journal.count("recording:e5") == 1).await;

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_immediate_resubscribe_keeps_binding() {
        let h = Harness::new();
        let bus = h.start_recording().await;

        bus.subscribe::<Other, AuditHandler>().await.unwrap();
        assert!(bus.unsubscribe::<Other, AuditHandler>());
        bus.subscribe::<Other, AuditHandler>().await.unwrap();

        // Let the removal notice for the first subscription play out.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(bus.registry().has_subscriptions("Other"));
        assert!(h
            .broker
            .bound_routing_keys(EXCHANGE, QUEUE)
            .contains(&"Other".to_string()));

        bus.publish(&Other { n: 9 }).await.unwrap();
        eventually("Other handled", || h.journal.count("audit-other:9") == 1).await;

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_removing_last_subscription_idles_the_queue() {
        let h = Harness::new();
        let bus = h.start_recording().await;
        assert_eq!(h.broker.consumer_count(QUEUE), 1);

        assert!(bus.unsubscribe::<Sample, RecordingHandler>());

        eventually("consumer gone", || h.broker.consumer_count(QUEUE) == 0).await;
        assert!(h.broker.bound_routing_keys(EXCHANGE, QUEUE).is_empty());
        assert!(bus.registry().is_empty());

        bus.subscribe::<Sample, RecordingHandler>().await.unwrap();
        assert_eq!(h.broker.consumer_count(QUEUE), 1);
        bus.publish(&Sample::new("again")).await.unwrap();
        eventually("handled after resubscribe", || {
            h.journal.count("recording:again") == 1
        })
        .await;

        bus.shutdown().await;
    }
}
