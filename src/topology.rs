// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and declaring RabbitMQ topology.
//! The topology includes exchanges, queues, and the bindings between them, with
//! dead-letter wiring for queues whose rejected messages must be quarantined.
//!
//! The main components are:
//! - `Topology`: the set of declarations to install
//! - `TopologyManager`: declares a `Topology` through a `Transport`, idempotently
//!
//! Declarations happen in dependency order: exchanges first, then queues
//! without dead-letter wiring and their bindings, then dead-letter-enabled
//! queues and their bindings. The dead-letter target of a queue is therefore
//! in place before the queue that references it.
//!
//! The manager remembers every declared entity. Declaring an identical entity
//! again is a no-op; declaring an existing name with different parameters
//! fails with `TopologyConflict` before anything is sent to the broker.

use crate::{
    errors::AmqpError,
    events::{DeliveryEvent, DeliveryObserver, TracingObserver},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error};

/// Exchanges, queues and bindings to declare.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Adds `queue` together with its quarantine: a durable fanout
    /// dead-letter exchange `dlx`, a durable queue `dlq` bound to it, and the
    /// dead-letter wiring of `queue` towards `dlx` with `routing_key`.
    pub fn dead_letter(self, queue: QueueDefinition, dlx: &str, dlq: &str, routing_key: &str) -> Self {
        self.exchange(ExchangeDefinition::new(dlx).fanout().durable())
            .queue(QueueDefinition::new(dlq).durable())
            .queue_binding(QueueBinding::new(dlq).exchange(dlx).routing_key(routing_key))
            .queue(queue.with_dead_letter(dlx, routing_key))
    }
}

/// Declares topologies through a transport and remembers what was declared.
pub struct TopologyManager {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn DeliveryObserver>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
    bindings: HashSet<QueueBinding>,
}

/// The declarations of a topology that still have to reach the broker.
struct Plan<'tp> {
    exchanges: Vec<&'tp ExchangeDefinition>,
    plain_queues: Vec<&'tp QueueDefinition>,
    plain_bindings: Vec<&'tp QueueBinding>,
    dead_lettered_queues: Vec<&'tp QueueDefinition>,
    dead_lettered_bindings: Vec<&'tp QueueBinding>,
}

impl TopologyManager {
    pub fn new(transport: Arc<dyn Transport>) -> TopologyManager {
        TopologyManager {
            transport,
            observer: Arc::new(TracingObserver),
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: HashSet::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Declares every entity of `topology` that wasn't declared yet.
    ///
    /// The whole topology is validated first: a conflict or a dangling
    /// reference fails the call without any broker round-trip.
    pub async fn declare_topology(&mut self, topology: &Topology) -> Result<(), AmqpError> {
        let plan = self.plan(topology)?;

        for exch in plan.exchanges {
            self.declare_exchange(exch).await?;
        }

        for queue in plan.plain_queues {
            self.declare_queue(queue).await?;
        }

        for binding in plan.plain_bindings {
            self.bind_queue(binding).await?;
        }

        for queue in plan.dead_lettered_queues {
            self.declare_queue(queue).await?;
        }

        for binding in plan.dead_lettered_bindings {
            self.bind_queue(binding).await?;
        }

        debug!("topology installed");

        Ok(())
    }

    /// Forgets every declared entity.
    ///
    /// Call it after a reconnect: the broker drops non-durable entities with
    /// the connection, so the next `declare_topology` must send everything again.
    pub fn invalidate(&mut self) {
        self.exchanges.clear();
        self.queues.clear();
        self.bindings.clear();
    }

    pub fn is_exchange_declared(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub fn declared_queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name)
    }

    fn plan<'tp>(&self, topology: &'tp Topology) -> Result<Plan<'tp>, AmqpError> {
        let mut exchanges: HashMap<&str, &ExchangeDefinition> = HashMap::default();
        let mut plan = Plan {
            exchanges: vec![],
            plain_queues: vec![],
            plain_bindings: vec![],
            dead_lettered_queues: vec![],
            dead_lettered_bindings: vec![],
        };

        for exch in &topology.exchanges {
            if exch.name.is_empty() {
                return Err(self.invalid("the default exchange can't be declared".to_owned()));
            }

            let known = self
                .exchanges
                .get(&exch.name)
                .or_else(|| exchanges.get(exch.name.as_str()).copied());

            match known {
                Some(existing) if existing != exch => return Err(self.conflict(&exch.name)),
                Some(_) => {}
                None => {
                    exchanges.insert(&exch.name, exch);
                    plan.exchanges.push(exch);
                }
            }
        }

        let mut queues: HashMap<&str, &QueueDefinition> = HashMap::default();
        for queue in &topology.queues {
            let known = self
                .queues
                .get(&queue.name)
                .or_else(|| queues.get(queue.name.as_str()).copied());

            match known {
                Some(existing) if existing != queue => return Err(self.conflict(&queue.name)),
                Some(_) => continue,
                None => {}
            }

            queues.insert(&queue.name, queue);

            match &queue.dead_letter {
                Some(dl) => {
                    if !dl.exchange.is_empty()
                        && !self.exchanges.contains_key(&dl.exchange)
                        && !exchanges.contains_key(dl.exchange.as_str())
                    {
                        return Err(self.invalid(format!(
                            "queue `{}` dead-letters to undeclared exchange `{}`",
                            queue.name, dl.exchange
                        )));
                    }
                    plan.dead_lettered_queues.push(queue);
                }
                None => plan.plain_queues.push(queue),
            }
        }

        let mut bindings: HashSet<&QueueBinding> = HashSet::default();
        for binding in &topology.bindings {
            if self.bindings.contains(binding) || !bindings.insert(binding) {
                continue;
            }

            let queue = self
                .queues
                .get(&binding.queue_name)
                .or_else(|| queues.get(binding.queue_name.as_str()).copied())
                .ok_or_else(|| {
                    self.invalid(format!(
                        "binding references undeclared queue `{}`",
                        binding.queue_name
                    ))
                })?;

            if binding.exchange_name.is_empty()
                || (!self.exchanges.contains_key(&binding.exchange_name)
                    && !exchanges.contains_key(binding.exchange_name.as_str()))
            {
                return Err(self.invalid(format!(
                    "binding references undeclared exchange `{}`",
                    binding.exchange_name
                )));
            }

            if queue.dead_letter.is_some() {
                plan.dead_lettered_bindings.push(binding);
            } else {
                plan.plain_bindings.push(binding);
            }
        }

        Ok(plan)
    }

    async fn declare_exchange(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.transport
            .declare_exchange(def)
            .await
            .map_err(|err| self.reported(err))?;

        self.exchanges.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn declare_queue(&mut self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.transport
            .declare_queue(def)
            .await
            .map_err(|err| self.reported(err))?;

        self.queues.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn bind_queue(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.transport.bind_queue(binding).await?;

        self.bindings.insert(binding.clone());
        Ok(())
    }

    fn conflict(&self, name: &str) -> AmqpError {
        self.reported(AmqpError::TopologyConflict(name.to_owned()))
    }

    fn invalid(&self, reason: String) -> AmqpError {
        error!(reason, "invalid topology");
        AmqpError::InvalidTopology(reason)
    }

    /// Emits the conflict event for broker-side and local conflicts alike.
    fn reported(&self, err: AmqpError) -> AmqpError {
        if let AmqpError::TopologyConflict(name) = &err {
            self.observer
                .on_event(&DeliveryEvent::TopologyConflict { name: name.clone() });
        }
        err
    }
}
