use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use mqtt_core::{PacketId, QoS, SubscribeReturnCode};

use crate::error::{Error, Result};
use crate::retry::{Interval, IntervalLinear};
use crate::timer::Handle;

/// A publisher-originated PUBLISH awaiting PUBACK (QoS 1) or PUBREC (QoS 2),
/// or still sitting in `queue_publish_tx` waiting on window admission.
///
/// `interval` is the packet's own bandwidth-weighted backoff generator
/// (§4.4.2): it is created once, when the request is built, and every
/// retransmit calls `.next()` on this same instance so `k` keeps growing
/// across retries instead of resetting.
pub struct PublishRequest {
    pub packet_id: PacketId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub completion: Option<oneshot::Sender<Result<PacketId>>>,
    pub retry_handle: Option<Handle>,
    pub interval: IntervalLinear,
}

/// A PUBREL awaiting PUBCOMP (QoS 2, publisher side). Carries forward the
/// completion signal of the PUBLISH it replaced in the outbound window, and
/// gets its own `interval`, started fresh when the PUBREC arrives (the
/// same persist-and-reuse discipline as [`PublishRequest::interval`]).
pub struct ReleaseRequest {
    pub packet_id: PacketId,
    pub completion: Option<oneshot::Sender<Result<PacketId>>>,
    pub retry_handle: Option<Handle>,
    pub interval: Interval,
}

/// A subscriber-received QoS-2 PUBLISH held between PUBREC-out and
/// PUBREL-in, so the message can be delivered exactly once after PUBREL.
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// A SUBSCRIBE awaiting SUBACK.
pub struct SubscribeRequest {
    pub packet_id: PacketId,
    pub subscriptions: Vec<(String, QoS)>,
    pub completion: Option<oneshot::Sender<Result<Vec<SubscribeReturnCode>>>>,
    pub retry_handle: Option<Handle>,
    pub interval: Interval,
}

/// An UNSUBSCRIBE awaiting UNSUBACK.
pub struct UnsubscribeRequest {
    pub packet_id: PacketId,
    pub topic_filters: Vec<String>,
    pub completion: Option<oneshot::Sender<Result<PacketId>>>,
    pub retry_handle: Option<Handle>,
    pub interval: Interval,
}

/// Per-broker-address session state: the packet-id generator plus the six
/// tables of §4.2. Owned by the factory so it survives across the
/// successive protocol instances a single endpoint goes through as
/// transports connect and drop.
#[derive(Default)]
pub struct SessionState {
    last_id: u16,
    pub window_publish: HashMap<PacketId, PublishRequest>,
    pub window_pub_release: HashMap<PacketId, ReleaseRequest>,
    pub window_pub_rx: HashMap<PacketId, IncomingMessage>,
    pub window_subscribe: HashMap<PacketId, SubscribeRequest>,
    pub window_unsubscribe: HashMap<PacketId, UnsubscribeRequest>,
    pub queue_publish_tx: VecDeque<PublishRequest>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next packet-id: increments, wraps at 65536, skips 0.
    pub fn next_id(&mut self) -> PacketId {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        self.last_id
    }

    /// `|windowSubscribe| + |windowUnsubscribe| + |windowPublish| +
    /// |windowPubRelease|`, the quantity §8 bounds at `4 * window_size`.
    pub fn outbound_in_flight(&self) -> usize {
        self.window_publish.len()
            + self.window_pub_release.len()
            + self.window_subscribe.len()
            + self.window_unsubscribe.len()
    }

    /// Discards every outbound table and the pending queue, failing every
    /// completion signal still attached with [`Error::SessionCleared`].
    /// Called after a clean-start CONNACK, per invariant 4 of §3.
    pub fn purge(&mut self) {
        for (_, mut req) in self.window_publish.drain() {
            fail(&mut req.completion, Error::SessionCleared);
        }
        for (_, mut req) in self.window_pub_release.drain() {
            fail(&mut req.completion, Error::SessionCleared);
        }
        self.window_pub_rx.clear();
        for (_, mut req) in self.window_subscribe.drain() {
            fail(&mut req.completion, Error::SessionCleared);
        }
        for (_, mut req) in self.window_unsubscribe.drain() {
            fail(&mut req.completion, Error::SessionCleared);
        }
        for mut req in self.queue_publish_tx.drain(..) {
            fail(&mut req.completion, Error::SessionCleared);
        }
    }

    /// Fails every pending signal with `reason` without discarding the
    /// tables themselves — used on transport loss when `clean_session` is
    /// false and the tables must survive for the next reconnect's resync.
    pub fn fail_pending(&mut self, reason: Error) {
        // Only subscribe/unsubscribe signals are inherently tied to this
        // transport instance: SUBSCRIBE/UNSUBSCRIBE state is not resent on
        // reconnect (§4.4.5), so their signals cannot be satisfied later.
        for (_, mut req) in self.window_subscribe.drain() {
            fail(&mut req.completion, reason.clone());
        }
        for (_, mut req) in self.window_unsubscribe.drain() {
            fail(&mut req.completion, reason.clone());
        }
    }
}

fn fail<T>(slot: &mut Option<oneshot::Sender<Result<T>>>, reason: Error) {
    if let Some(tx) = slot.take() {
        let _ = tx.send(Err(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_skips_zero_and_wraps() {
        let mut session = SessionState::new();
        session.last_id = 0xFFFF;

        assert_eq!(session.next_id(), 1);
        assert_eq!(session.next_id(), 2);
    }

    #[test]
    fn next_id_visits_every_nonzero_value_once() {
        let mut session = SessionState::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..65535u32 {
            let id = session.next_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id), "id {} issued twice", id);
        }

        assert_eq!(seen.len(), 65535);
    }

    #[test]
    fn purge_fails_every_table_and_the_queue() {
        let mut session = SessionState::new();
        let (tx, rx) = oneshot::channel();

        session.queue_publish_tx.push_back(PublishRequest {
            packet_id: 1,
            topic: "t".into(),
            payload: vec![],
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            completion: Some(tx),
            retry_handle: None,
            interval: IntervalLinear::new(
                std::time::Duration::from_secs(1),
                1024.0,
                2.0,
            ),
        });

        session.purge();

        assert!(session.queue_publish_tx.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::SessionCleared)
        ));
    }
}
