use bytes::BytesMut;
use tokio::sync::oneshot;

use mqtt_core::{Packet, PacketId, QoS, Subscribe, SubscribeReturnCode, Unsubscribe};

use crate::error::{Error, Result};
use crate::retry::{window_occupancy_bonus, Interval};
use crate::session::{SubscribeRequest, UnsubscribeRequest};
use crate::transport::Transport;

use super::connect::resolve;
use super::{Engine, SharedEngine};

/// One `(topic filter, requested QoS)` pair, the unit `subscribe()` accepts
/// either a single instance of or a `Vec` of, per spec.md §4.4.4.
pub type Subscription = (String, QoS);

impl<T: Transport + 'static> Engine<T> {
    /// `subscribe(topics, qos)`. Fails immediately with `WindowExceeded` if
    /// `windowSubscribe` is already at `window_size`; otherwise allocates a
    /// packet-id, writes SUBSCRIBE, and arms a retry timer.
    pub async fn subscribe(
        shared: &SharedEngine<T>,
        subscriptions: Vec<Subscription>,
    ) -> oneshot::Receiver<Result<Vec<SubscribeReturnCode>>> {
        let (tx, rx) = oneshot::channel();
        let mut engine = shared.lock().await;

        if !engine.state.allows_session_ops() {
            let _ = tx.send(Err(Error::ProtocolState { state: engine.state }));
            return rx;
        }

        for (_, qos) in &subscriptions {
            if *qos as u8 > QoS::ExactlyOnce as u8 {
                let _ = tx.send(Err(Error::InvalidQoS(*qos as u8)));
                return rx;
            }
        }

        let window_size = engine.config.window_size();
        let (packet_id, window_len) = {
            let mut session = engine.session.lock().unwrap();
            if session.window_subscribe.len() >= window_size {
                let _ = tx.send(Err(Error::WindowExceeded(window_size)));
                return rx;
            }
            (session.next_id(), session.window_subscribe.len())
        };

        let bytes = encode_subscribe(packet_id, &subscriptions, false);

        if let Err(err) = engine.write_packet(&bytes).await {
            let _ = tx.send(Err(err));
            return rx;
        }

        let mut request = SubscribeRequest {
            packet_id,
            subscriptions,
            completion: Some(tx),
            retry_handle: None,
            interval: Interval::new(
                engine.config.retry_initial(),
                engine.config.factor(),
                engine.config.retry_max_delay(),
            ),
        };

        engine.arm_subscribe_retry(shared, &mut request, window_len);

        engine
            .session
            .lock()
            .unwrap()
            .window_subscribe
            .insert(packet_id, request);

        rx
    }

    /// Advances `request.interval` — created once in [`Engine::subscribe`] —
    /// and adds the window-occupancy bonus of §11 on top, the same
    /// persist-and-reuse pattern as [`Engine::arm_publish_retry`].
    fn arm_subscribe_retry(&self, shared: &SharedEngine<T>, request: &mut SubscribeRequest, window_len: usize) {
        let delay = request.interval.next() + window_occupancy_bonus(window_len);
        let packet_id = request.packet_id;

        request.retry_handle = Some(schedule_subscribe_retry(&self.timer, shared, delay, packet_id));
    }

    async fn retry_subscribe(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) {
        if !self.state.allows_session_ops() {
            return;
        }

        let present = self
            .session
            .lock()
            .unwrap()
            .window_subscribe
            .contains_key(&packet_id);

        if !present {
            return;
        }

        let bytes = {
            let session = self.session.lock().unwrap();
            match session.window_subscribe.get(&packet_id) {
                Some(request) => encode_subscribe(packet_id, &request.subscriptions, true),
                None => return,
            }
        };

        log::warn!("retransmitting SUBSCRIBE {}", packet_id);

        if self.write_packet(&bytes).await.is_err() {
            return;
        }

        let delay = {
            let mut session = self.session.lock().unwrap();
            let window_len = session.window_subscribe.len();
            match session.window_subscribe.get_mut(&packet_id) {
                Some(request) => request.interval.next() + window_occupancy_bonus(window_len),
                None => return,
            }
        };
        let handle = schedule_subscribe_retry(&self.timer, shared, delay, packet_id);

        if let Some(request) = self.session.lock().unwrap().window_subscribe.get_mut(&packet_id) {
            request.retry_handle = Some(handle);
        }
    }

    pub(super) async fn on_suback(
        &mut self,
        packet_id: PacketId,
        status: Vec<SubscribeReturnCode>,
    ) -> Result<()> {
        let request = {
            let mut session = self.session.lock().unwrap();
            session.window_subscribe.remove(&packet_id)
        };

        match request {
            Some(mut request) => {
                if let Some(handle) = request.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
                resolve(&mut request.completion, Ok(status));
            }
            None => {
                log::debug!("SUBACK for unknown packet-id {}, ignoring", packet_id);
            }
        }

        Ok(())
    }

    /// `unsubscribe(topics)`, symmetric with `subscribe` except its signal
    /// only ever carries back the packet-id (UNSUBACK has no per-topic
    /// status).
    pub async fn unsubscribe(
        shared: &SharedEngine<T>,
        topic_filters: Vec<String>,
    ) -> oneshot::Receiver<Result<PacketId>> {
        let (tx, rx) = oneshot::channel();
        let mut engine = shared.lock().await;

        if !engine.state.allows_session_ops() {
            let _ = tx.send(Err(Error::ProtocolState { state: engine.state }));
            return rx;
        }

        let window_size = engine.config.window_size();
        let (packet_id, window_len) = {
            let mut session = engine.session.lock().unwrap();
            if session.window_unsubscribe.len() >= window_size {
                let _ = tx.send(Err(Error::WindowExceeded(window_size)));
                return rx;
            }
            (session.next_id(), session.window_unsubscribe.len())
        };

        let bytes = encode_unsubscribe(packet_id, &topic_filters, false);

        if let Err(err) = engine.write_packet(&bytes).await {
            let _ = tx.send(Err(err));
            return rx;
        }

        let mut request = UnsubscribeRequest {
            packet_id,
            topic_filters,
            completion: Some(tx),
            retry_handle: None,
            interval: Interval::new(
                engine.config.retry_initial(),
                engine.config.factor(),
                engine.config.retry_max_delay(),
            ),
        };

        engine.arm_unsubscribe_retry(shared, &mut request, window_len);

        engine
            .session
            .lock()
            .unwrap()
            .window_unsubscribe
            .insert(packet_id, request);

        rx
    }

    /// Advances `request.interval` — created once in [`Engine::unsubscribe`]
    /// — the same persist-and-reuse pattern as [`Engine::arm_subscribe_retry`].
    fn arm_unsubscribe_retry(&self, shared: &SharedEngine<T>, request: &mut UnsubscribeRequest, window_len: usize) {
        let delay = request.interval.next() + window_occupancy_bonus(window_len);
        let packet_id = request.packet_id;

        request.retry_handle = Some(schedule_unsubscribe_retry(&self.timer, shared, delay, packet_id));
    }

    async fn retry_unsubscribe(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) {
        if !self.state.allows_session_ops() {
            return;
        }

        let present = self
            .session
            .lock()
            .unwrap()
            .window_unsubscribe
            .contains_key(&packet_id);

        if !present {
            return;
        }

        let bytes = {
            let session = self.session.lock().unwrap();
            match session.window_unsubscribe.get(&packet_id) {
                Some(request) => encode_unsubscribe(packet_id, &request.topic_filters, true),
                None => return,
            }
        };

        log::warn!("retransmitting UNSUBSCRIBE {}", packet_id);

        if self.write_packet(&bytes).await.is_err() {
            return;
        }

        let delay = {
            let mut session = self.session.lock().unwrap();
            let window_len = session.window_unsubscribe.len();
            match session.window_unsubscribe.get_mut(&packet_id) {
                Some(request) => request.interval.next() + window_occupancy_bonus(window_len),
                None => return,
            }
        };
        let handle = schedule_unsubscribe_retry(&self.timer, shared, delay, packet_id);

        if let Some(request) = self.session.lock().unwrap().window_unsubscribe.get_mut(&packet_id) {
            request.retry_handle = Some(handle);
        }
    }

    pub(super) async fn on_unsuback(&mut self, packet_id: PacketId) -> Result<()> {
        let request = {
            let mut session = self.session.lock().unwrap();
            session.window_unsubscribe.remove(&packet_id)
        };

        match request {
            Some(mut request) => {
                if let Some(handle) = request.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
                resolve(&mut request.completion, Ok(packet_id));
            }
            None => {
                log::debug!("UNSUBACK for unknown packet-id {}, ignoring", packet_id);
            }
        }

        Ok(())
    }
}

fn schedule_subscribe_retry<T: Transport + 'static>(
    timer: &std::sync::Arc<dyn crate::timer::Timer>,
    shared: &SharedEngine<T>,
    delay: std::time::Duration,
    packet_id: PacketId,
) -> crate::timer::Handle {
    let timer_engine = shared.clone();

    timer.schedule(
        delay,
        Box::new(move || {
            let timer_engine = timer_engine.clone();
            tokio::spawn(async move {
                let self_ref = timer_engine.clone();
                let mut engine = timer_engine.lock().await;
                engine.retry_subscribe(&self_ref, packet_id).await;
            });
        }),
    )
}

fn schedule_unsubscribe_retry<T: Transport + 'static>(
    timer: &std::sync::Arc<dyn crate::timer::Timer>,
    shared: &SharedEngine<T>,
    delay: std::time::Duration,
    packet_id: PacketId,
) -> crate::timer::Handle {
    let timer_engine = shared.clone();

    timer.schedule(
        delay,
        Box::new(move || {
            let timer_engine = timer_engine.clone();
            tokio::spawn(async move {
                let self_ref = timer_engine.clone();
                let mut engine = timer_engine.lock().await;
                engine.retry_unsubscribe(&self_ref, packet_id).await;
            });
        }),
    )
}

/// v3.1's SUBSCRIBE has no DUP bit of its own in the fixed header flags
/// (they are the fixed `0010` of §4.1's table); `dup` only affects logging
/// here, kept for symmetry with `encode_publish`'s signature.
fn encode_subscribe(packet_id: PacketId, subscriptions: &[Subscription], dup: bool) -> Vec<u8> {
    if dup {
        log::debug!("retransmitting SUBSCRIBE {}", packet_id);
    }

    let packet = Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions: subscriptions.iter().map(|(t, q)| (t.as_str(), *q)).collect(),
    });

    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}

fn encode_unsubscribe(packet_id: PacketId, topic_filters: &[String], dup: bool) -> Vec<u8> {
    if dup {
        log::debug!("retransmitting UNSUBSCRIBE {}", packet_id);
    }

    let packet = Packet::Unsubscribe(Unsubscribe {
        packet_id,
        topic_filters: topic_filters.iter().map(String::as_str).collect(),
    });

    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}
