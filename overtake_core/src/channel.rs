//! Simulated V2V message channel.
//!
//! Messages are scheduled into a pending set keyed by
//! `(deliver_at, send sequence)`, so draining the due prefix yields them in
//! non-decreasing delivery order with ties broken by send order. A dropped
//! message is never enqueued; senders notice loss only through timeouts.
//!
//! Two implementations share the pending set:
//!
//! - [`SimChannel`]: random delay and loss from an injectable RNG
//! - [`ReliableChannel`]: fixed delay, no loss

use crate::attempt::AttemptId;
use crate::config::{DelayDistribution, OvertakingConfig};
use crate::message::{Message, MessageId, Payload, Recipient, Step};
use overtake_env::VehicleId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

/// Result of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    /// Enqueued for delivery at `deliver_at`
    Scheduled { id: MessageId, deliver_at: Step },
    /// Silently lost
    Dropped { id: MessageId },
}

impl SendReceipt {
    pub fn id(&self) -> MessageId {
        match self {
            SendReceipt::Scheduled { id, .. } | SendReceipt::Dropped { id } => *id,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, SendReceipt::Dropped { .. })
    }
}

/// Channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub pending: u64,
}

/// Message delivery between vehicles.
pub trait Channel {
    /// Schedules a message, or drops it.
    fn send(&mut self, from: VehicleId, to: Recipient, attempt: AttemptId, payload: Payload, now: Step)
        -> SendReceipt;

    /// Removes and returns every pending message with `deliver_at <= now`,
    /// in non-decreasing `deliver_at` order (ties by send order).
    fn deliver_due(&mut self, now: Step) -> Vec<Message>;

    /// Current counters.
    fn stats(&self) -> ChannelStats;
}

/// Pending-message set shared by the channel implementations.
#[derive(Debug, Default)]
struct PendingQueue {
    pending: BTreeMap<(Step, u64), Message>,
    next_seq: u64,
    stats: ChannelStats,
}

impl PendingQueue {
    fn next_id(&mut self) -> MessageId {
        let id = MessageId(self.next_seq);
        self.next_seq += 1;
        self.stats.sent += 1;
        id
    }

    fn drop_message(&mut self, id: MessageId, from: VehicleId, to: Recipient, payload: &Payload) -> SendReceipt {
        self.stats.dropped += 1;
        trace!("Dropped {} {} -> {} ({:?})", payload.kind(), from, to, id);
        SendReceipt::Dropped { id }
    }

    fn schedule(&mut self, message: Message) -> SendReceipt {
        let receipt = SendReceipt::Scheduled {
            id: message.id,
            deliver_at: message.deliver_at,
        };
        trace!(
            "Scheduled {} {} -> {} for step {}",
            message.payload.kind(),
            message.from,
            message.to,
            message.deliver_at
        );
        self.pending.insert((message.deliver_at, message.id.0), message);
        self.stats.pending = self.pending.len() as u64;
        receipt
    }

    fn drain_due(&mut self, now: Step) -> Vec<Message> {
        // Everything strictly after `now` stays pending
        let later = match now.checked_add(1) {
            Some(next) => self.pending.split_off(&(next, 0)),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut self.pending, later);
        self.stats.delivered += due.len() as u64;
        self.stats.pending = self.pending.len() as u64;
        due.into_values().collect()
    }
}

/// Channel with random delay and loss.
///
/// Deterministic for a given RNG seed: the same sequence of sends yields the
/// same delays and drops.
pub struct SimChannel<R: Rng = ChaCha8Rng> {
    rng: R,
    mean_delay: f64,
    distribution: DelayDistribution,
    loss_probability: f64,
    queue: PendingQueue,
}

impl SimChannel<ChaCha8Rng> {
    /// Creates a channel from the protocol configuration with a seeded ChaCha8 RNG.
    pub fn seeded(seed: u64, config: &OvertakingConfig) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed), config)
    }
}

impl<R: Rng> SimChannel<R> {
    /// Creates a channel drawing from `rng`.
    pub fn with_rng(rng: R, config: &OvertakingConfig) -> Self {
        Self::new(
            rng,
            config.mean_step_duration_msg_delivery,
            config.delay_distribution,
            config.message_loss_probability,
        )
    }

    /// Creates a channel with explicit delay and loss parameters.
    pub fn new(rng: R, mean_delay: f64, distribution: DelayDistribution, loss_probability: f64) -> Self {
        Self {
            rng,
            mean_delay: mean_delay.max(0.0),
            distribution,
            loss_probability: loss_probability.clamp(0.0, 1.0),
            queue: PendingQueue::default(),
        }
    }

    /// Draws a delivery delay in whole steps.
    fn draw_delay(&mut self) -> Step {
        if self.mean_delay <= 0.0 {
            return 0;
        }
        match self.distribution {
            DelayDistribution::Exponential => match Exp::new(1.0 / self.mean_delay) {
                // Truncated to whole steps
                Ok(exp) => exp.sample(&mut self.rng).floor() as Step,
                Err(_) => 0,
            },
            DelayDistribution::Constant => self.mean_delay.round() as Step,
            DelayDistribution::Uniform => {
                let max = (2.0 * self.mean_delay).round() as Step;
                self.rng.gen_range(0..=max)
            }
        }
    }

    /// Number of messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.queue.pending.len()
    }
}

impl<R: Rng> Channel for SimChannel<R> {
    fn send(
        &mut self,
        from: VehicleId,
        to: Recipient,
        attempt: AttemptId,
        payload: Payload,
        now: Step,
    ) -> SendReceipt {
        let id = self.queue.next_id();
        if self.loss_probability > 0.0 && self.rng.gen_bool(self.loss_probability) {
            return self.queue.drop_message(id, from, to, &payload);
        }
        let delay = self.draw_delay();
        self.queue.schedule(Message {
            id,
            from,
            to,
            attempt,
            payload,
            created_at: now,
            deliver_at: now.saturating_add(delay),
        })
    }

    fn deliver_due(&mut self, now: Step) -> Vec<Message> {
        self.queue.drain_due(now)
    }

    fn stats(&self) -> ChannelStats {
        self.queue.stats
    }
}

/// Lossless channel with a fixed delay.
#[derive(Debug, Default)]
pub struct ReliableChannel {
    delay: Step,
    queue: PendingQueue,
}

impl ReliableChannel {
    /// Same-step delivery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivery exactly `delay` steps after sending.
    pub fn with_delay(delay: Step) -> Self {
        Self {
            delay,
            queue: PendingQueue::default(),
        }
    }
}

impl Channel for ReliableChannel {
    fn send(
        &mut self,
        from: VehicleId,
        to: Recipient,
        attempt: AttemptId,
        payload: Payload,
        now: Step,
    ) -> SendReceipt {
        let id = self.queue.next_id();
        self.queue.schedule(Message {
            id,
            from,
            to,
            attempt,
            payload,
            created_at: now,
            deliver_at: now.saturating_add(self.delay),
        })
    }

    fn deliver_due(&mut self, now: Step) -> Vec<Message> {
        self.queue.drain_due(now)
    }

    fn stats(&self) -> ChannelStats {
        self.queue.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: AttemptId = AttemptId(1);

    fn lossy(loss: f64, mean: f64, seed: u64) -> SimChannel {
        let config = OvertakingConfig {
            message_loss_probability: loss,
            mean_step_duration_msg_delivery: mean,
            ..Default::default()
        };
        SimChannel::seeded(seed, &config)
    }

    #[test]
    fn test_zero_mean_delivers_same_step() {
        let mut channel = lossy(0.0, 0.0, 1);
        let receipt = channel.send(VehicleId(0), Recipient::Vehicle(VehicleId(1)), A, Payload::Ack, 7);
        assert_eq!(receipt, SendReceipt::Scheduled { id: MessageId(0), deliver_at: 7 });

        let due = channel.deliver_due(7);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].payload, Payload::Ack);
        assert!(channel.deliver_due(7).is_empty());
    }

    #[test]
    fn test_total_loss_never_delivers() {
        let mut channel = lossy(1.0, 0.0, 1);
        for step in 0..50 {
            assert!(channel
                .send(VehicleId(0), Recipient::Broadcast, A, Payload::Complete, step)
                .is_dropped());
        }
        assert!(channel.deliver_due(1000).is_empty());
        let stats = channel.stats();
        assert_eq!(stats.sent, 50);
        assert_eq!(stats.dropped, 50);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let mut a = lossy(0.3, 4.0, 42);
        let mut b = lossy(0.3, 4.0, 42);
        for step in 0..100 {
            let ra = a.send(VehicleId(0), Recipient::Broadcast, A, Payload::Ack, step);
            let rb = b.send(VehicleId(0), Recipient::Broadcast, A, Payload::Ack, step);
            assert_eq!(ra, rb);
        }
    }

    #[test]
    fn test_ties_broken_by_send_order() {
        let mut channel = ReliableChannel::with_delay(2);
        channel.send(VehicleId(3), Recipient::Broadcast, A, Payload::Ack, 0);
        channel.send(VehicleId(1), Recipient::Broadcast, A, Payload::Complete, 0);
        assert!(channel.deliver_due(1).is_empty());

        let due = channel.deliver_due(2);
        assert_eq!(due.iter().map(|m| m.from).collect::<Vec<_>>(), vec![VehicleId(3), VehicleId(1)]);
    }

    #[test]
    fn test_constant_delay() {
        let config = OvertakingConfig {
            mean_step_duration_msg_delivery: 3.0,
            delay_distribution: DelayDistribution::Constant,
            ..Default::default()
        };
        let mut channel = SimChannel::seeded(9, &config);
        let receipt = channel.send(VehicleId(0), Recipient::Broadcast, A, Payload::Ack, 10);
        assert_eq!(receipt, SendReceipt::Scheduled { id: MessageId(0), deliver_at: 13 });
    }

    proptest! {
        #[test]
        fn prop_round_trip_exactly_once(
            seed in any::<u64>(),
            mean in 0.0f64..20.0,
            sends in prop::collection::vec(0u64..50, 1..40),
        ) {
            let mut channel = lossy(0.0, mean, seed);
            let mut expected = BTreeMap::new();
            let mut sorted = sends.clone();
            sorted.sort_unstable();
            for now in sorted {
                match channel.send(VehicleId(0), Recipient::Broadcast, A, Payload::Ack, now) {
                    SendReceipt::Scheduled { id, deliver_at } => {
                        prop_assert!(deliver_at >= now);
                        expected.insert(id, deliver_at);
                    }
                    SendReceipt::Dropped { .. } => prop_assert!(false, "loss is zero"),
                }
            }

            let mut seen = BTreeMap::new();
            let mut last_deliver_at = 0;
            for now in 0..2_000u64 {
                for message in channel.deliver_due(now) {
                    prop_assert!(message.deliver_at <= now);
                    prop_assert!(message.deliver_at >= last_deliver_at);
                    last_deliver_at = message.deliver_at;
                    prop_assert!(seen.insert(message.id, message.deliver_at).is_none());
                }
                if seen.len() == expected.len() && channel.pending() == 0 {
                    break;
                }
            }
            prop_assert_eq!(seen, expected);
        }

        #[test]
        fn prop_nothing_delivered_early(seed in any::<u64>(), mean in 1.0f64..10.0) {
            let mut channel = lossy(0.0, mean, seed);
            if let SendReceipt::Scheduled { deliver_at, .. } =
                channel.send(VehicleId(0), Recipient::Broadcast, A, Payload::Ack, 100)
            {
                if deliver_at > 100 {
                    prop_assert!(channel.deliver_due(deliver_at - 1).is_empty());
                }
                prop_assert_eq!(channel.deliver_due(deliver_at).len(), 1);
            }
        }
    }
}
