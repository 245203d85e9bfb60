// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Tracker
//!
//! Keeps the set of deliveries currently held by handlers. Every delivery is
//! acquired once when dispatched and finalized once with its disposition; a
//! second finalization of the same ticket is reported as `AlreadyFinalized`.

use crate::{errors::AmqpError, policy::Disposition};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::error;

/// Handle on an in-flight delivery.
///
/// The sequence number tells apart two deliveries sharing a tag, which
/// happens when delivery tags restart on a new channel.
#[derive(Debug)]
pub struct Ticket {
    id: u64,
    seq: u64,
    acquired_at: Instant,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Terminal dispositions recorded so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    in_flight: HashMap<u64, (u64, Instant)>,
    next_seq: u64,
    stats: TrackerStats,
}

impl AckTracker {
    pub fn new() -> Self {
        AckTracker::default()
    }

    /// Marks delivery `id` as held by a handler.
    ///
    /// # Parameters
    /// * `id` - Delivery tag of the message being dispatched
    ///
    /// # Returns
    /// The ticket to finalize the delivery with, or `DuplicateDelivery` when
    /// `id` is already held
    pub fn acquire(&mut self, id: u64) -> Result<Ticket, AmqpError> {
        if self.in_flight.contains_key(&id) {
            error!(delivery_tag = id, "delivery acquired twice");
            return Err(AmqpError::DuplicateDelivery(id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let acquired_at = Instant::now();
        self.in_flight.insert(id, (seq, acquired_at));

        Ok(Ticket {
            id,
            seq,
            acquired_at,
        })
    }

    /// Releases the delivery of `ticket` and records its disposition.
    ///
    /// # Parameters
    /// * `ticket` - Ticket returned by `acquire`
    /// * `disposition` - What is about to be sent to the broker
    ///
    /// # Returns
    /// `AlreadyFinalized` when the ticket was finalized before, or when its tag
    /// was since reused by another delivery; the in-flight set is left as is
    pub fn finalize(&mut self, ticket: &Ticket, disposition: Disposition) -> Result<(), AmqpError> {
        match self.in_flight.get(&ticket.id) {
            Some((seq, _)) if *seq == ticket.seq => {
                self.in_flight.remove(&ticket.id);
            }
            _ => {
                error!(
                    delivery_tag = ticket.id,
                    "disposition applied to a finalized delivery"
                );
                return Err(AmqpError::AlreadyFinalized(ticket.id));
            }
        }

        match disposition {
            Disposition::Ack => self.stats.acked += 1,
            Disposition::Requeue => self.stats.requeued += 1,
            Disposition::DeadLetter => self.stats.dead_lettered += 1,
        }

        Ok(())
    }

    /// Deliveries held for at least `max_age`, oldest first.
    pub fn expired(&self, max_age: Duration) -> Vec<u64> {
        let mut expired: Vec<(Instant, u64)> = self
            .in_flight
            .iter()
            .filter(|(_, (_, acquired_at))| acquired_at.elapsed() >= max_age)
            .map(|(id, (_, acquired_at))| (*acquired_at, *id))
            .collect();

        expired.sort();
        expired.into_iter().map(|(_, id)| id).collect()
    }

    /// Forgets every in-flight delivery without a disposition, returning their ids.
    ///
    /// Used when handlers are abandoned: their messages stay unacknowledged and
    /// the broker redelivers them.
    pub fn abandon_all(&mut self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.in_flight.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn held_for(&self, id: u64) -> Option<Duration> {
        self.in_flight
            .get(&id)
            .map(|(_, acquired_at)| acquired_at.elapsed())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }
}
