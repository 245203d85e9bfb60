// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Runtime
//!
//! Pulls deliveries from a queue and runs the handler on a bounded pool of
//! worker tasks. Each message goes through
//! `Received -> Dispatched -> {Acked, Requeued, DeadLettered}`:
//!
//! 1. A delivery is pulled only when a worker slot is free and fewer than
//!    `prefetch` messages are unacknowledged
//! 2. The handler runs in its own task; a panic becomes `PermanentFailure`
//!    and a timeout becomes `RetriableFailure`
//! 3. The delivery policy turns the outcome into a disposition
//! 4. The acknowledgement tracker finalizes the delivery
//! 5. The broker is told: ack, republish with a bumped retry counter then
//!    ack, or dead-letter
//!
//! Dispositions are applied from the dispatch loop only, so the transport
//! never sees concurrent calls. A failed settlement is not retried: the loop
//! stops with `BrokerDisconnected` and the broker redelivers whatever was
//! left unacknowledged.

use crate::{
    configs::ConsumerConfigs,
    errors::AmqpError,
    events::{DeliveryEvent, DeliveryObserver, TracingObserver},
    handler::ConsumerHandler,
    message::{Message, PublishMessage},
    otel,
    policy::{DeliveryOutcome, DeliveryPolicy, Disposition},
    queue::{DeadLetter, QueueDefinition},
    tracker::{AckTracker, Ticket},
    transport::{Subscription, Transport},
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    task::{JoinError, JoinSet},
    time::{self, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A handler run that finished, carrying the message back to the loop.
struct Completion {
    ticket: Ticket,
    message: Message,
    attempt: u32,
    outcome: DeliveryOutcome,
    panic: Option<String>,
}

/// Consumer loop owning the delivery policy and the acknowledgement tracker.
pub struct ConsumerRuntime {
    transport: Arc<dyn Transport>,
    configs: ConsumerConfigs,
    policy: DeliveryPolicy,
    tracker: AckTracker,
    observer: Arc<dyn DeliveryObserver>,
    dead_letter_target: Option<(String, String)>,
    queue_wiring: Option<(String, Option<DeadLetter>)>,
}

impl ConsumerRuntime {
    /// Creates a consumer runtime on top of `transport`.
    ///
    /// # Parameters
    /// * `transport` - Broker transport owned by this runtime; it must not be
    ///   shared with another consumer loop
    /// * `configs` - Concurrency, prefetch, retry budget and deadlines
    ///
    /// # Returns
    /// The runtime, or `InvalidConfigs` when `configs` fail validation
    pub fn new(
        transport: Arc<dyn Transport>,
        configs: ConsumerConfigs,
    ) -> Result<ConsumerRuntime, AmqpError> {
        configs.validate()?;

        Ok(ConsumerRuntime {
            transport,
            policy: DeliveryPolicy::new(configs.max_retries),
            configs,
            tracker: AckTracker::new(),
            observer: Arc::new(TracingObserver),
            dead_letter_target: None,
            queue_wiring: None,
        })
    }

    /// Receives every delivery event instead of the default `TracingObserver`.
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Publishes dead-lettered messages to `exchange` with `routing_key`,
    /// then acks them, instead of rejecting them to the queue's own
    /// dead-letter exchange.
    pub fn with_dead_letter_target(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_target = Some((exchange.to_owned(), routing_key.to_owned()));
        self
    }

    /// Declares how the consumed queue is set up, so `run` can tell whether
    /// rejected messages have somewhere to go.
    pub fn with_queue_definition(mut self, def: &QueueDefinition) -> Self {
        self.queue_wiring = Some((def.name().to_owned(), def.dead_letter().cloned()));
        self
    }

    pub fn tracker(&self) -> &AckTracker {
        &self.tracker
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Consumes `queue` until `cancel` fires or the broker goes away.
    ///
    /// On cancellation the broker consumer is cancelled and no new delivery is
    /// pulled; in-flight handlers get `shutdown_deadline_ms` to finish, after
    /// which they are abandoned with their messages unacknowledged.
    ///
    /// # Returns
    /// Ok(()) after a cancellation, `BrokerDisconnected` when the consumer
    /// stream or a settlement fails
    pub async fn run(
        &mut self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        cancel: CancellationToken,
    ) -> Result<(), AmqpError> {
        let concurrency = self.configs.effective_concurrency();
        let prefetch = usize::from(self.configs.prefetch);

        self.check_dead_letter_wiring(queue);

        self.transport.qos(self.configs.prefetch).await?;
        let Subscription {
            consumer_tag,
            mut deliveries,
        } = self
            .transport
            .consume(queue, &self.configs.consumer_tag)
            .await?;

        debug!(queue, consumer_tag = %consumer_tag, concurrency, prefetch, "consumer started");

        let mut subscribed = true;

        let mut workers: JoinSet<Completion> = JoinSet::new();
        let mut stuck_check = self.configs.stuck_after_duration().map(|max_age| {
            let mut interval = time::interval(max_age);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let result = loop {
            let has_slot = workers.len() < concurrency && self.tracker.len() < prefetch;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(queue, in_flight = workers.len(), "consumer cancelled, draining handlers");
                    self.unsubscribe(queue, &consumer_tag).await;
                    subscribed = false;
                    break self.drain(queue, &mut workers).await;
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = self.complete(queue, joined).await {
                        break Err(err);
                    }
                }

                next = deliveries.next(), if has_slot => match next {
                    Some(Ok(msg)) => {
                        if let Err(err) = self.dispatch(queue, msg, &handler, &mut workers) {
                            break Err(err);
                        }
                    }
                    Some(Err(err)) => break Err(self.disconnected(queue, None, err)),
                    None => {
                        break Err(self.disconnected(
                            queue,
                            None,
                            AmqpError::BrokerDisconnected("consumer stream closed".to_owned()),
                        ))
                    }
                },

                _ = tick(&mut stuck_check) => self.report_stuck(queue),
            }
        };

        if subscribed && !matches!(result, Err(AmqpError::BrokerDisconnected(_))) {
            self.unsubscribe(queue, &consumer_tag).await;
        }

        if !workers.is_empty() || !self.tracker.is_empty() {
            self.abandon(queue, &mut workers);
        }

        debug!(queue, "consumer stopped");

        result
    }

    /// Warns once when rejected messages would be dropped by the broker.
    fn check_dead_letter_wiring(&self, queue: &str) {
        if self.dead_letter_target.is_some() {
            return;
        }

        let wired = matches!(
            &self.queue_wiring,
            Some((name, Some(_))) if name == queue
        );

        if !wired {
            self.observer.on_event(&DeliveryEvent::DeadLetterUnrouted {
                queue: queue.to_owned(),
            });
        }
    }

    async fn unsubscribe(&self, queue: &str, consumer_tag: &str) {
        if let Err(err) = self.transport.cancel(consumer_tag).await {
            warn!(
                queue,
                consumer_tag,
                error = err.to_string(),
                "failure to cancel the consumer"
            );
        }
    }

    fn dispatch(
        &mut self,
        queue: &str,
        msg: Message,
        handler: &Arc<dyn ConsumerHandler>,
        workers: &mut JoinSet<Completion>,
    ) -> Result<(), AmqpError> {
        let ticket = self.tracker.acquire(msg.delivery_tag())?;
        let attempt = self.policy.attempt_of(&msg);

        self.observer.on_event(&DeliveryEvent::Dispatched {
            queue: queue.to_owned(),
            delivery_tag: msg.delivery_tag(),
            attempt,
        });

        let handler = handler.clone();
        let timeout = self.configs.handler_timeout_duration();
        let span_name = msg.kind().unwrap_or(queue).to_owned();

        workers.spawn(async move {
            let tracer = global::tracer("amqp consumer");
            let (ctx, mut span) = otel::new_span(msg.header_map(), &tracer, &span_name);

            let (outcome, panic) = execute(&handler, &ctx, &msg, timeout).await;

            match outcome {
                DeliveryOutcome::Success => span.set_status(Status::Ok),
                _ => span.set_status(Status::Error {
                    description: Cow::from("failure to handle message"),
                }),
            }

            Completion {
                ticket,
                message: msg,
                attempt,
                outcome,
                panic,
            }
        });

        Ok(())
    }

    async fn complete(
        &mut self,
        queue: &str,
        joined: Result<Completion, JoinError>,
    ) -> Result<(), AmqpError> {
        let done = match joined {
            Ok(done) => done,
            Err(err) => {
                error!(queue, error = err.to_string(), "worker task failed");
                return Err(AmqpError::HandlerFailure(err.to_string()));
            }
        };

        if let Some(reason) = &done.panic {
            self.observer.on_event(&DeliveryEvent::HandlerPanic {
                queue: queue.to_owned(),
                delivery_tag: done.message.delivery_tag(),
                reason: reason.clone(),
            });
        }

        let disposition = self.policy.decide(done.outcome, done.attempt);
        self.tracker.finalize(&done.ticket, disposition)?;

        self.settle(queue, &done, disposition).await
    }

    async fn settle(
        &self,
        queue: &str,
        done: &Completion,
        disposition: Disposition,
    ) -> Result<(), AmqpError> {
        let tag = done.message.delivery_tag();

        let settled = match disposition {
            Disposition::Ack => self
                .transport
                .ack(tag)
                .await
                .map(|_| DeliveryEvent::Acked {
                    queue: queue.to_owned(),
                    delivery_tag: tag,
                }),
            Disposition::Requeue => self
                .requeue(queue, &done.message, done.attempt)
                .await
                .map(|_| DeliveryEvent::Requeued {
                    queue: queue.to_owned(),
                    delivery_tag: tag,
                    next_attempt: done.attempt + 1,
                }),
            Disposition::DeadLetter => {
                self.dead_letter(&done.message)
                    .await
                    .map(|_| DeliveryEvent::DeadLettered {
                        queue: queue.to_owned(),
                        delivery_tag: tag,
                        outcome: done.outcome,
                        attempt: done.attempt,
                    })
            }
        };

        match settled {
            Ok(event) => {
                self.observer.on_event(&event);
                Ok(())
            }
            Err(err) => Err(self.disconnected(queue, Some(tag), err)),
        }
    }

    /// Republishes the message to its queue with the next retry count, then
    /// acks the original delivery. Properties and other headers are kept as
    /// received.
    async fn requeue(&self, queue: &str, msg: &Message, attempt: u32) -> Result<(), AmqpError> {
        let mut retry = PublishMessage::republish(msg, "", queue);
        retry.headers = self.policy.requeue_headers(msg, attempt);

        if let Err(err) = self.transport.publish(&retry).await {
            error!(error = err.to_string(), "error whiling requeuing");
            return Err(republish_error(err, AmqpError::RequeuingMessageError));
        }

        self.transport.ack(msg.delivery_tag()).await
    }

    async fn dead_letter(&self, msg: &Message) -> Result<(), AmqpError> {
        let Some((exchange, routing_key)) = &self.dead_letter_target else {
            return self.transport.nack(msg.delivery_tag(), false).await;
        };

        let quarantined = PublishMessage::republish(msg, exchange, routing_key);

        if let Err(err) = self.transport.publish(&quarantined).await {
            error!(error = err.to_string(), "error whiling sending to dlq");
            return Err(republish_error(err, AmqpError::PublishingToDLQError));
        }

        self.transport.ack(msg.delivery_tag()).await
    }

    /// Waits for in-flight handlers up to the shutdown deadline.
    async fn drain(
        &mut self,
        queue: &str,
        workers: &mut JoinSet<Completion>,
    ) -> Result<(), AmqpError> {
        let deadline = self.configs.shutdown_deadline_duration();

        let drained = time::timeout(deadline, async {
            while let Some(joined) = workers.join_next().await {
                self.complete(queue, joined).await?;
            }
            Ok::<(), AmqpError>(())
        })
        .await;

        match drained {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    queue,
                    abandoned = workers.len(),
                    "shutdown deadline reached before handlers finished"
                );
                Ok(())
            }
        }
    }

    /// Stops every running handler and forgets its delivery; the broker
    /// redelivers those messages once the channel is closed.
    fn abandon(&mut self, queue: &str, workers: &mut JoinSet<Completion>) {
        workers.abort_all();

        let abandoned = self.tracker.abandon_all();
        if !abandoned.is_empty() {
            warn!(queue, delivery_tags = ?abandoned, "leaving messages unacknowledged");
        }
    }

    fn report_stuck(&self, queue: &str) {
        let Some(max_age) = self.configs.stuck_after_duration() else {
            return;
        };

        for delivery_tag in self.tracker.expired(max_age) {
            let held_for = self.tracker.held_for(delivery_tag).unwrap_or(max_age);
            self.observer.on_event(&DeliveryEvent::Stuck {
                queue: queue.to_owned(),
                delivery_tag,
                held_for,
            });
        }
    }

    fn disconnected(&self, queue: &str, delivery_tag: Option<u64>, err: AmqpError) -> AmqpError {
        let reason = match err {
            AmqpError::BrokerDisconnected(reason) => reason,
            other => other.to_string(),
        };

        self.observer.on_event(&DeliveryEvent::BrokerDisconnected {
            queue: queue.to_owned(),
            delivery_tag,
            reason: reason.clone(),
        });

        AmqpError::BrokerDisconnected(reason)
    }
}

fn republish_error(err: AmqpError, fallback: AmqpError) -> AmqpError {
    match err {
        AmqpError::BrokerDisconnected(_) => err,
        _ => fallback,
    }
}

/// Runs the handler, turning panics and timeouts into outcomes.
async fn execute(
    handler: &Arc<dyn ConsumerHandler>,
    ctx: &Context,
    msg: &Message,
    timeout: Option<Duration>,
) -> (DeliveryOutcome, Option<String>) {
    let execution = AssertUnwindSafe(handler.exec(ctx, msg)).catch_unwind();

    let result = match timeout {
        Some(limit) => match time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    delivery_tag = msg.delivery_tag(),
                    timeout_ms = limit.as_millis() as u64,
                    "handler timed out"
                );
                return (DeliveryOutcome::RetriableFailure, None);
            }
        },
        None => execution.await,
    };

    match result {
        Ok(outcome) => (outcome, None),
        Err(panic) => {
            let reason = panic_message(panic);
            error!(
                delivery_tag = msg.delivery_tag(),
                reason = %reason,
                "handler panicked"
            );
            (DeliveryOutcome::PermanentFailure, Some(reason))
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{HeaderValue, Headers, MessageProperties, DELIVERY_MODE_PERSISTENT},
        policy::{AMQP_HEADERS_COUNT, AMQP_HEADERS_RETRY_COUNT, AMQP_HEADERS_X_DEATH},
        test_utils::{Call, InMemoryTransport, RecordingObserver},
        transport::MockTransport,
    };
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::task::JoinHandle;

    const QUEUE: &str = "orders";

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Answers from a script indexed by the message's retry count.
    struct Scripted {
        script: Vec<DeliveryOutcome>,
        journal: Journal,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<DeliveryOutcome>, journal: Journal) -> Arc<Self> {
            Scripted::slow(script, journal, Duration::ZERO)
        }

        fn slow(script: Vec<DeliveryOutcome>, journal: Journal, delay: Duration) -> Arc<Self> {
            Arc::new(Scripted {
                script,
                journal,
                delay,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConsumerHandler for Scripted {
        async fn exec(&self, _ctx: &Context, msg: &Message) -> DeliveryOutcome {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.journal
                .lock()
                .unwrap()
                .push(format!("start:{}", msg.delivery_tag()));

            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }

            let attempt = msg
                .get_header(AMQP_HEADERS_RETRY_COUNT)
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.script[attempt.min(self.script.len() - 1)]
        }
    }

    struct Panicking;

    #[async_trait]
    impl ConsumerHandler for Panicking {
        async fn exec(&self, _ctx: &Context, _msg: &Message) -> DeliveryOutcome {
            panic!("kyc service returned garbage")
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(vec![]))
    }

    fn start(
        mut runtime: ConsumerRuntime,
        handler: Arc<dyn ConsumerHandler>,
    ) -> (
        CancellationToken,
        JoinHandle<(ConsumerRuntime, Result<(), AmqpError>)>,
    ) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let result = runtime.run(QUEUE, handler, token).await;
            (runtime, result)
        });

        (cancel, handle)
    }

    fn dispositions(events: Vec<DeliveryEvent>) -> Vec<Disposition> {
        events
            .into_iter()
            .filter_map(|event| match event {
                DeliveryEvent::Acked { .. } => Some(Disposition::Ack),
                DeliveryEvent::Requeued { .. } => Some(Disposition::Requeue),
                DeliveryEvent::DeadLettered { .. } => Some(Disposition::DeadLetter),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_messages_are_acked() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::new(2, 4)).unwrap();
        let handler = Scripted::new(vec![DeliveryOutcome::Success], journal());

        for payload in ["a", "b", "c"] {
            transport.push(payload);
        }

        let (cancel, handle) = start(runtime, handler);
        transport.wait_for_settlements(3).await;
        cancel.cancel();

        let (runtime, result) = handle.await.unwrap();
        assert_eq!(result, Ok(()));
        assert!(runtime.tracker().is_empty());
        assert_eq!(runtime.tracker().stats().acked, 3);

        let calls = transport.calls();
        assert_eq!(calls[0], Call::Qos(4));
        assert_eq!(calls[1], Call::Consume(QUEUE.to_owned()));

        let mut acked: Vec<Call> = transport.settlements();
        acked.sort_by_key(|call| match call {
            Call::Ack(tag) => *tag,
            _ => u64::MAX,
        });
        assert_eq!(acked, vec![Call::Ack(1), Call::Ack(2), Call::Ack(3)]);
    }

    #[tokio::test]
    async fn retriable_failures_are_requeued_until_success() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).max_retries(2),
        )
        .unwrap()
        .with_observer(observer.clone());

        let handler = Scripted::new(
            vec![
                DeliveryOutcome::RetriableFailure,
                DeliveryOutcome::RetriableFailure,
                DeliveryOutcome::Success,
            ],
            journal(),
        );

        transport.push("m");

        let (cancel, handle) = start(runtime, handler);
        transport.wait_for_settlements(3).await;
        cancel.cancel();

        let (runtime, result) = handle.await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(
            dispositions(observer.events()),
            vec![Disposition::Requeue, Disposition::Requeue, Disposition::Ack]
        );
        assert_eq!(runtime.tracker().stats().requeued, 2);

        let retry_counts: Vec<Option<u64>> = transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(msg) => Some(
                    msg.headers
                        .get(AMQP_HEADERS_RETRY_COUNT)
                        .and_then(|v| v.as_u64()),
                ),
                _ => None,
            })
            .collect();
        assert_eq!(retry_counts, vec![Some(1), Some(2)]);

        let dispatched: Vec<(u64, u32)> = observer
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DeliveryEvent::Dispatched {
                    delivery_tag,
                    attempt,
                    ..
                } => Some((delivery_tag, attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(dispatched, vec![(1, 0), (2, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn requeued_copy_keeps_headers_and_properties() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).max_retries(1),
        )
        .unwrap();

        let mut death = Headers::default();
        death.insert(AMQP_HEADERS_COUNT.to_owned(), HeaderValue::Int(1));
        death.insert("queue".to_owned(), HeaderValue::from("orders-delay"));
        death.insert("time".to_owned(), HeaderValue::Timestamp(1_700_000_000));

        let properties = MessageProperties {
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            message_id: Some("order-1".to_owned()),
            correlation_id: Some("checkout-9".to_owned()),
            content_type: Some("application/vnd.orders+json".to_owned()),
            ..Default::default()
        };

        transport.push_message(
            Message::new(1, b"{}".to_vec())
                .routing_key(QUEUE)
                .msg_type("OrderCreated")
                .header(AMQP_HEADERS_X_DEATH, HeaderValue::Array(vec![HeaderValue::Table(death.clone())]))
                .header("sent-at", HeaderValue::Timestamp(1_700_000_100))
                .header("signature", HeaderValue::Bytes(vec![0xde, 0xad]))
                .properties(properties.clone()),
        );

        let (cancel, handle) = start(
            runtime,
            Scripted::new(
                vec![DeliveryOutcome::RetriableFailure, DeliveryOutcome::Success],
                journal(),
            ),
        );
        transport.wait_for_settlements(2).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        let republished: Vec<PublishMessage> = transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(msg) => Some(msg),
                _ => None,
            })
            .collect();
        assert_eq!(republished.len(), 1);

        let copy = &republished[0];
        assert_eq!(copy.routing_key, QUEUE);
        assert_eq!(copy.msg_type.as_deref(), Some("OrderCreated"));
        assert_eq!(copy.properties, properties);
        assert_eq!(
            copy.headers.get(AMQP_HEADERS_X_DEATH),
            Some(&HeaderValue::Array(vec![HeaderValue::Table(death)]))
        );
        assert_eq!(
            copy.headers.get("sent-at"),
            Some(&HeaderValue::Timestamp(1_700_000_100))
        );
        assert_eq!(
            copy.headers.get("signature"),
            Some(&HeaderValue::Bytes(vec![0xde, 0xad]))
        );
        assert_eq!(copy.headers.get(AMQP_HEADERS_RETRY_COUNT), Some(&HeaderValue::UInt(1)));
        assert_eq!(copy.headers.len(), 4);
    }

    #[tokio::test]
    async fn no_retry_budget_dead_letters_immediately() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).max_retries(0),
        )
        .unwrap()
        .with_observer(observer.clone());

        let tag = transport.push("m");

        let (cancel, handle) = start(
            runtime,
            Scripted::new(vec![DeliveryOutcome::RetriableFailure], journal()),
        );
        transport.wait_for_settlements(1).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        assert_eq!(transport.settlements(), vec![Call::Nack(tag, false)]);
        assert_eq!(
            dispositions(observer.events()),
            vec![Disposition::DeadLetter]
        );
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).max_retries(5),
        )
        .unwrap();

        let tag = transport.push("m");

        let (cancel, handle) = start(
            runtime,
            Scripted::new(vec![DeliveryOutcome::PermanentFailure], journal()),
        );
        transport.wait_for_settlements(1).await;
        cancel.cancel();

        let (runtime, _) = handle.await.unwrap();
        assert_eq!(transport.settlements(), vec![Call::Nack(tag, false)]);
        assert_eq!(runtime.tracker().stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn dead_letter_target_receives_a_copy() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::default())
            .unwrap()
            .with_dead_letter_target("dead-letter-exchange", "dead-letter-queue");

        let tag = transport.push("poison");

        let (cancel, handle) = start(
            runtime,
            Scripted::new(vec![DeliveryOutcome::PermanentFailure], journal()),
        );
        transport.wait_for_settlements(1).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        let calls = transport.calls();
        assert!(calls.contains(&Call::Publish(PublishMessage::new(
            "dead-letter-exchange",
            "dead-letter-queue",
            b"poison".to_vec()
        ))));
        assert_eq!(transport.settlements(), vec![Call::Ack(tag)]);
    }

    #[tokio::test]
    async fn redelivery_without_counter_is_quarantined() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).max_retries(3),
        )
        .unwrap();

        transport.push_message(Message::new(9, b"m".to_vec()).redelivered(true));

        let (cancel, handle) = start(
            runtime,
            Scripted::new(vec![DeliveryOutcome::RetriableFailure], journal()),
        );
        transport.wait_for_settlements(1).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        assert_eq!(transport.settlements(), vec![Call::Nack(9, false)]);
    }

    #[tokio::test]
    async fn single_worker_dispatches_in_order() {
        let journal = journal();
        let transport = InMemoryTransport::new(QUEUE, journal.clone());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::new(1, 10)).unwrap();
        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal.clone(),
            Duration::from_millis(5),
        );

        for payload in ["m1", "m2", "m3"] {
            transport.push(payload);
        }

        let (cancel, handle) = start(runtime, handler.clone());
        transport.wait_for_settlements(3).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        assert_eq!(
            journal.lock().unwrap().clone(),
            vec!["start:1", "ack:1", "start:2", "ack:2", "start:3", "ack:3"]
        );
        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_bounds_running_handlers() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::new(3, 10)).unwrap();
        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal(),
            Duration::from_millis(20),
        );

        for i in 0..9 {
            transport.push(&format!("m{i}"));
        }

        let (cancel, handle) = start(runtime, handler.clone());
        transport.wait_for_settlements(9).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        let max_active = handler.max_active.load(Ordering::SeqCst);
        assert!(max_active <= 3, "{max_active} handlers ran at once");
        assert!(max_active > 1);
    }

    #[tokio::test]
    async fn prefetch_caps_the_worker_pool() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::new(8, 2)).unwrap();
        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal(),
            Duration::from_millis(10),
        );

        for i in 0..6 {
            transport.push(&format!("m{i}"));
        }

        let (cancel, handle) = start(runtime, handler.clone());
        transport.wait_for_settlements(6).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        assert!(handler.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(transport.calls()[0], Call::Qos(2));
    }

    #[tokio::test]
    async fn panicking_handler_is_dead_lettered() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::default())
            .unwrap()
            .with_observer(observer.clone());

        let tag = transport.push("m");

        let (cancel, handle) = start(runtime, Arc::new(Panicking));
        transport.wait_for_settlements(1).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().1, Ok(()));

        assert_eq!(transport.settlements(), vec![Call::Nack(tag, false)]);
        assert!(observer.events().contains(&DeliveryEvent::HandlerPanic {
            queue: QUEUE.to_owned(),
            delivery_tag: tag,
            reason: "kyc service returned garbage".to_owned(),
        }));
    }

    #[tokio::test]
    async fn slow_handler_times_out_as_retriable() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1)
                .max_retries(1)
                .handler_timeout(Duration::from_millis(10)),
        )
        .unwrap()
        .with_observer(observer.clone());

        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal(),
            Duration::from_secs(10),
        );

        transport.push("m");

        let (cancel, handle) = start(runtime, handler);
        transport.wait_for_settlements(2).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        assert_eq!(
            dispositions(observer.events()),
            vec![Disposition::Requeue, Disposition::DeadLetter]
        );
    }

    #[tokio::test]
    async fn cancellation_drains_in_flight_handlers() {
        let journal = journal();
        let transport = InMemoryTransport::new(QUEUE, journal.clone());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(2, 2).shutdown_deadline(Duration::from_secs(5)),
        )
        .unwrap();
        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal.clone(),
            Duration::from_millis(50),
        );

        let tag = transport.push("m");

        let (cancel, handle) = start(runtime, handler);
        while !journal.lock().unwrap().contains(&format!("start:{tag}")) {
            time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        transport.push("never dispatched");

        let (runtime, result) = handle.await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(transport.settlements(), vec![Call::Ack(tag)]);
        assert!(runtime.tracker().is_empty());

        let calls = transport.calls();
        let cancelled_at = calls
            .iter()
            .position(|call| *call == Call::Cancel("amq.ctag-1".to_owned()))
            .expect("consumer cancelled");
        let acked_at = calls
            .iter()
            .position(|call| *call == Call::Ack(tag))
            .expect("message acked");
        assert!(cancelled_at < acked_at);
    }

    #[tokio::test]
    async fn cancellation_cancels_the_broker_consumer() {
        let mut transport = MockTransport::new();
        transport.expect_qos().returning(|_| Ok(()));
        transport
            .expect_consume()
            .withf(|queue, tag| queue == QUEUE && tag == "orders-worker")
            .returning(|_, tag| {
                Ok(Subscription {
                    consumer_tag: tag.to_owned(),
                    deliveries: stream::pending::<Result<Message, AmqpError>>().boxed(),
                })
            });
        transport
            .expect_cancel()
            .withf(|tag| tag == "orders-worker")
            .times(1)
            .returning(|_| Ok(()));

        let mut runtime = ConsumerRuntime::new(
            Arc::new(transport),
            ConsumerConfigs::default().consumer_tag("orders-worker"),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runtime
            .run(
                QUEUE,
                Scripted::new(vec![DeliveryOutcome::Success], journal()),
                cancel,
            )
            .await;

        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn failed_requeue_stops_the_loop() {
        let mut transport = MockTransport::new();
        transport.expect_qos().returning(|_| Ok(()));
        transport.expect_consume().returning(|_, _| {
            Ok(Subscription {
                consumer_tag: "amq.ctag-1".to_owned(),
                deliveries: stream::iter(vec![Ok(Message::new(1, b"{}".to_vec()))])
                    .chain(stream::pending())
                    .boxed(),
            })
        });
        transport
            .expect_publish()
            .times(1)
            .returning(|_| Err(AmqpError::PublishingError));
        transport.expect_ack().never();
        transport.expect_cancel().never();

        let mut runtime = ConsumerRuntime::new(
            Arc::new(transport),
            ConsumerConfigs::default().max_retries(1),
        )
        .unwrap();

        let result = runtime
            .run(
                QUEUE,
                Scripted::new(vec![DeliveryOutcome::RetriableFailure], journal()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(
            result,
            Err(AmqpError::BrokerDisconnected(
                AmqpError::RequeuingMessageError.to_string()
            ))
        );
    }

    #[tokio::test]
    async fn unrouted_dead_letters_are_reported_once() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::default())
            .unwrap()
            .with_observer(observer.clone());

        transport.push("a");
        transport.push("b");

        let (cancel, handle) = start(
            runtime,
            Scripted::new(vec![DeliveryOutcome::PermanentFailure], journal()),
        );
        transport.wait_for_settlements(2).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        let unrouted = observer
            .events()
            .into_iter()
            .filter(|event| matches!(event, DeliveryEvent::DeadLetterUnrouted { .. }))
            .count();
        assert_eq!(unrouted, 1);
    }

    #[tokio::test]
    async fn wired_queue_is_not_reported() {
        for runtime in [
            ConsumerRuntime::new(
                InMemoryTransport::new(QUEUE, journal()),
                ConsumerConfigs::default(),
            )
            .unwrap()
            .with_queue_definition(
                &QueueDefinition::new(QUEUE).with_dead_letter("orders-dlx", "orders-dlq"),
            ),
            ConsumerRuntime::new(
                InMemoryTransport::new(QUEUE, journal()),
                ConsumerConfigs::default(),
            )
            .unwrap()
            .with_dead_letter_target("orders-dlx", "orders-dlq"),
        ] {
            let observer = Arc::new(RecordingObserver::default());
            let mut runtime = runtime.with_observer(observer.clone());

            let cancel = CancellationToken::new();
            cancel.cancel();
            runtime
                .run(
                    QUEUE,
                    Scripted::new(vec![DeliveryOutcome::Success], journal()),
                    cancel,
                )
                .await
                .unwrap();

            assert!(observer.events().is_empty());
        }
    }

    #[test]
    fn wiring_of_another_queue_does_not_count() {
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(
            InMemoryTransport::new(QUEUE, journal()),
            ConsumerConfigs::default(),
        )
        .unwrap()
        .with_queue_definition(
            &QueueDefinition::new("payments").with_dead_letter("payments-dlx", "payments-dlq"),
        )
        .with_observer(observer.clone());

        runtime.check_dead_letter_wiring(QUEUE);

        assert_eq!(
            observer.events(),
            vec![DeliveryEvent::DeadLetterUnrouted {
                queue: QUEUE.to_owned()
            }]
        );
    }

    #[tokio::test]
    async fn shutdown_deadline_abandons_handlers() {
        let journal = journal();
        let transport = InMemoryTransport::new(QUEUE, journal.clone());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).shutdown_deadline(Duration::from_millis(20)),
        )
        .unwrap();
        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal.clone(),
            Duration::from_secs(30),
        );

        let tag = transport.push("m");

        let (cancel, handle) = start(runtime, handler);
        while !journal.lock().unwrap().contains(&format!("start:{tag}")) {
            time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();

        let (runtime, result) = time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run returns after the deadline")
            .unwrap();

        assert_eq!(result, Ok(()));
        assert!(transport.settlements().is_empty());
        assert!(runtime.tracker().is_empty());
    }

    #[tokio::test]
    async fn failed_settlement_stops_the_loop() {
        let journal = journal();
        let transport = InMemoryTransport::new(QUEUE, journal.clone());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::default())
            .unwrap()
            .with_observer(observer.clone());
        let handler = Scripted::slow(
            vec![DeliveryOutcome::Success],
            journal.clone(),
            Duration::from_millis(20),
        );

        let tag = transport.push("m");

        let (_cancel, handle) = start(runtime, handler);
        while !journal.lock().unwrap().contains(&format!("start:{tag}")) {
            time::sleep(Duration::from_millis(1)).await;
        }
        transport.break_connection();

        let (runtime, result) = handle.await.unwrap();
        assert_eq!(
            result,
            Err(AmqpError::BrokerDisconnected("connection reset".to_owned()))
        );
        assert!(runtime.tracker().is_empty());
        assert!(observer.events().contains(&DeliveryEvent::BrokerDisconnected {
            queue: QUEUE.to_owned(),
            delivery_tag: Some(tag),
            reason: "connection reset".to_owned(),
        }));
    }

    #[tokio::test]
    async fn consumer_stream_error_stops_the_loop() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let runtime = ConsumerRuntime::new(transport.clone(), ConsumerConfigs::default()).unwrap();

        transport.push_error(AmqpError::BrokerDisconnected("channel closed".to_owned()));

        let (_cancel, handle) = start(
            runtime,
            Scripted::new(vec![DeliveryOutcome::Success], journal()),
        );

        let (_, result) = handle.await.unwrap();
        assert_eq!(
            result,
            Err(AmqpError::BrokerDisconnected("channel closed".to_owned()))
        );
    }

    #[tokio::test]
    async fn long_running_handler_is_reported_as_stuck() {
        let transport = InMemoryTransport::new(QUEUE, journal());
        let observer = Arc::new(RecordingObserver::default());
        let runtime = ConsumerRuntime::new(
            transport.clone(),
            ConsumerConfigs::new(1, 1).stuck_after(Duration::from_millis(10)),
        )
        .unwrap()
        .with_observer(observer.clone());

        let tag = transport.push("m");

        let (cancel, handle) = start(
            runtime,
            Scripted::slow(
                vec![DeliveryOutcome::Success],
                journal(),
                Duration::from_millis(60),
            ),
        );
        transport.wait_for_settlements(1).await;
        cancel.cancel();
        handle.await.unwrap().1.unwrap();

        assert!(observer.events().iter().any(|event| matches!(
            event,
            DeliveryEvent::Stuck { delivery_tag, held_for, .. }
                if *delivery_tag == tag && *held_for >= Duration::from_millis(10)
        )));
    }

    #[tokio::test]
    async fn qos_failure_is_surfaced_before_consuming() {
        let mut transport = MockTransport::new();
        transport
            .expect_qos()
            .returning(|_| Err(AmqpError::QoSDeclarationError("closed".to_owned())));
        transport.expect_consume().never();

        let mut runtime =
            ConsumerRuntime::new(Arc::new(transport), ConsumerConfigs::default()).unwrap();

        let result = runtime
            .run(
                QUEUE,
                Scripted::new(vec![DeliveryOutcome::Success], journal()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(
            result,
            Err(AmqpError::QoSDeclarationError("closed".to_owned()))
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let transport = InMemoryTransport::new(QUEUE, journal());

        assert!(matches!(
            ConsumerRuntime::new(transport, ConsumerConfigs::new(0, 1)),
            Err(AmqpError::InvalidConfigs(_))
        ));
    }
}
