// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    errors::AmqpError,
    events::{DeliveryEvent, DeliveryObserver},
    exchange::ExchangeDefinition,
    message::{Message, PublishMessage},
    queue::{QueueBinding, QueueDefinition},
    transport::{Subscription, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl DeliveryObserver for RecordingObserver {
    fn on_event(&self, event: &DeliveryEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Qos(u16),
    Consume(String),
    Cancel(String),
    Ack(u64),
    Nack(u64, bool),
    Publish(PublishMessage),
}

/// A single-queue broker: deliveries are fed by the test, and messages
/// republished to the queue through the default exchange are delivered
/// again with a fresh tag.
pub(crate) struct InMemoryTransport {
    queue: String,
    sender: mpsc::UnboundedSender<Result<Message, AmqpError>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<Message, AmqpError>>>>,
    calls: Mutex<Vec<Call>>,
    journal: Arc<Mutex<Vec<String>>>,
    next_tag: AtomicU64,
    broken: AtomicBool,
}

impl InMemoryTransport {
    pub(crate) fn new(queue: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();

        Arc::new(InMemoryTransport {
            queue: queue.to_owned(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            calls: Mutex::new(vec![]),
            journal,
            next_tag: AtomicU64::new(1),
            broken: AtomicBool::new(false),
        })
    }

    /// Delivers `payload` with the next free tag and returns the tag.
    pub(crate) fn push(&self, payload: &str) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.push_message(Message::new(tag, payload.as_bytes().to_vec()).routing_key(&self.queue));
        tag
    }

    pub(crate) fn push_message(&self, msg: Message) {
        self.next_tag
            .fetch_max(msg.delivery_tag() + 1, Ordering::SeqCst);
        self.sender.send(Ok(msg)).unwrap();
    }

    pub(crate) fn push_error(&self, err: AmqpError) {
        self.sender.send(Err(err)).unwrap();
    }

    /// Makes every later settlement fail as if the connection dropped.
    pub(crate) fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn settlements(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Ack(_) | Call::Nack(_, _)))
            .collect()
    }

    /// Polls until `settled` settlements were recorded.
    pub(crate) async fn wait_for_settlements(&self, settled: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.settlements().len() < settled {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("settlements within 5s");
    }

    fn record(&self, call: Call) -> Result<(), AmqpError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AmqpError::BrokerDisconnected("connection reset".to_owned()));
        }

        match &call {
            Call::Ack(tag) => self.journal.lock().unwrap().push(format!("ack:{tag}")),
            Call::Nack(tag, _) => self.journal.lock().unwrap().push(format!("nack:{tag}")),
            _ => {}
        }

        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn declare_exchange(&self, _def: &ExchangeDefinition) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn declare_queue(&self, _def: &QueueDefinition) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn bind_queue(&self, _binding: &QueueBinding) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.record(Call::Qos(prefetch))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, AmqpError> {
        self.record(Call::Consume(queue.to_owned()))?;

        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;

        let consumer_tag = match consumer_tag {
            "" => "amq.ctag-1".to_owned(),
            tag => tag.to_owned(),
        };

        Ok(Subscription {
            consumer_tag,
            deliveries: stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            })
            .boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.record(Call::Cancel(consumer_tag.to_owned()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record(Call::Ack(delivery_tag))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(Call::Nack(delivery_tag, requeue))
    }

    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError> {
        self.record(Call::Publish(msg.clone()))?;

        if msg.exchange.is_empty() && msg.routing_key == self.queue {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            let mut redelivery = Message::new(tag, msg.payload.clone())
                .routing_key(&msg.routing_key)
                .headers(msg.headers.clone())
                .properties(msg.properties.clone());
            if let Some(msg_type) = &msg.msg_type {
                redelivery = redelivery.msg_type(msg_type);
            }
            self.sender.send(Ok(redelivery)).unwrap();
        }

        Ok(())
    }
}
