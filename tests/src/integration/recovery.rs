//! # Connection Recovery
//!
//! The bus survives broker-side failures without application involvement.
//!
//! ## Scenarios
//!
//! - Connection reset: one `Recovered`, full re-declare and re-bind, then
//!   consume again
//! - Broker restart: exchange and bindings are gone, durable queue stays
//! - Consumer channel callback error: channel rebuilt on the same connection
//! - Broker unreachable for a while: publish waits and then succeeds

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    use rapid_bus::adapters::BrokerOp;
    use rapid_bus::ConnectionState;

    use crate::integration::support::{
        eventually, AuditHandler, Harness, Other, Sample, EXCHANGE, QUEUE, WAIT,
    };

    fn consume_count(ops: &[BrokerOp]) -> usize {
        ops.iter()
            .filter(|op| matches!(op, BrokerOp::Consume { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_connection_drop_rebinds_every_name_before_consuming() {
        let h = Harness::new();
        let bus = h.start_recording().await;
        bus.subscribe::<Other, AuditHandler>().await.unwrap();
        let mut recovered = bus.connection().recovered();
        let before = h.broker.journal().len();

        h.broker.drop_connections();

        timeout(WAIT, recovered.recv()).await.unwrap().unwrap();
        eventually("consumer back", || consume_count(&h.broker.journal()[before..]) == 1).await;

        let replay: Vec<BrokerOp> = h.broker.journal()[before..].to_vec();
        assert_eq!(
            replay,
            vec![
                BrokerOp::ExchangeDeclare(EXCHANGE.into()),
                BrokerOp::QueueDeclare(QUEUE.into()),
                BrokerOp::QueueBind {
                    queue: QUEUE.into(),
                    routing_key: "Other".into()
                },
                BrokerOp::QueueBind {
                    queue: QUEUE.into(),
                    routing_key: "Sample".into()
                },
                BrokerOp::Consume { queue: QUEUE.into() },
            ]
        );

        // Exactly one recovery notification.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(recovered.try_recv(), Err(TryRecvError::Empty)));

        bus.publish(&Sample::new("after")).await.unwrap();
        eventually("handled after recovery", || {
            h.journal.count("recording:after") == 1
        })
        .await;

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_broker_restart_restores_topology_and_keeps_queue() {
        let h = Harness::new();
        let bus = h.start_recording().await;
        let mut recovered = bus.connection().recovered();

        h.broker.restart();
        assert!(h.broker.has_queue(QUEUE));

        timeout(WAIT, recovered.recv()).await.unwrap().unwrap();
        eventually("topology restored", || {
            h.broker.has_exchange(EXCHANGE)
                && h.broker.bound_routing_keys(EXCHANGE, QUEUE) == vec!["Sample".to_string()]
                && h.broker.consumer_count(QUEUE) == 1
        })
        .await;

        bus.publish(&Sample::new("e1")).await.unwrap();
        eventually("e1 handled", || h.journal.count("recording:e1") == 1).await;

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_in_flight_delivery_is_redelivered_after_drop() {
        let h = Harness::new();
        h.script.set_delay(Duration::from_millis(100));
        let bus = h.start_recording().await;

        bus.publish(&Sample::new("e1")).await.unwrap();
        eventually("delivery in flight", || h.broker.unacked_count() == 1).await;

        h.broker.drop_connections();

        // First attempt cannot ack on the dead channel; the broker redelivers.
        eventually("redelivered and acked", || h.broker.stats().acks == 1).await;
        assert!(h.journal.count("recording:e1") >= 2);
        assert_eq!(h.broker.queue_depth(QUEUE), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_channel_callback_error_rebuilds_channel_only() {
        let h = Harness::new();
        let bus = h.start_recording().await;

        h.broker.break_consumer_channels();

        eventually("channel rebuilt", || {
            consume_count(&h.broker.journal()) == 2 && h.broker.consumer_count(QUEUE) == 1
        })
        .await;
        assert_eq!(h.broker.stats().connect_attempts, 1);
        assert_eq!(bus.connection().state(), ConnectionState::Connected);

        bus.publish(&Sample::new("e1")).await.unwrap();
        eventually("e1 handled", || h.journal.count("recording:e1") == 1).await;

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_waits_for_unreachable_broker() {
        let h = Harness::new();
        let bus = h.start_recording().await;

        h.broker.set_unreachable(true);
        h.broker.drop_connections();
        eventually("connection lost", || !bus.connection().is_connected()).await;

        let broker = h.broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            broker.set_unreachable(false);
        });

        timeout(WAIT, bus.publish(&Sample::new("late")))
            .await
            .expect("publish finished")
            .unwrap();
        eventually("late handled", || h.journal.count("recording:late") == 1).await;

        bus.shutdown().await;
    }
}
