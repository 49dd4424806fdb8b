use bytes::BytesMut;
use tokio::sync::oneshot;

use mqtt_core::{Packet, PacketId, Publish, PublishAck, PublishComplete, PublishReceived, PublishRelease, QoS};

use crate::error::{Error, Result};
use crate::retry::{Interval, IntervalLinear};
use crate::session::{IncomingMessage, PublishRequest, ReleaseRequest};
use crate::transport::Transport;

use super::connect::resolve;
use super::{Delivery, Engine, SharedEngine};

impl<T: Transport + 'static> Engine<T> {
    /// `publish(topic, payload, qos, retain)`: validates, encodes, and —
    /// for QoS ≥ 1 — enqueues the request for window admission. Returns a
    /// signal carrying the packet-id the PUBLISH was finally acknowledged
    /// under (0 for QoS 0, whose signal resolves once the bytes are written).
    pub async fn publish(
        shared: &SharedEngine<T>,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> oneshot::Receiver<Result<PacketId>> {
        let (tx, rx) = oneshot::channel();
        let mut engine = shared.lock().await;

        if !engine.state.allows_publish() {
            let _ = tx.send(Err(Error::ProtocolState { state: engine.state }));
            return rx;
        }

        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: &topic,
                packet_id: None,
                payload: &payload,
            });

            let mut buf = BytesMut::new();
            packet.write_to(&mut buf);

            let result = engine.write_packet(&buf).await;
            let _ = tx.send(result.map(|_| 0));
            return rx;
        }

        let packet_id = {
            let mut session = engine.session.lock().unwrap();
            session.next_id()
        };

        let request = PublishRequest {
            packet_id,
            topic,
            payload,
            qos,
            retain,
            dup: false,
            completion: Some(tx),
            retry_handle: None,
            interval: IntervalLinear::new(
                engine.config.retry_initial(),
                engine.config.bandwidth(),
                engine.config.factor(),
            ),
        };

        engine.session.lock().unwrap().queue_publish_tx.push_back(request);

        if let Err(err) = engine.refill_publish(shared).await {
            log::error!("failed to refill publish window: {}", err);
        }

        rx
    }

    /// While `|windowPublish| < window_size` and the queue is non-empty,
    /// admits the next queued PUBLISH into the window, writes it, and arms
    /// its retransmission timer.
    pub(super) async fn refill_publish(&mut self, shared: &SharedEngine<T>) -> Result<()> {
        loop {
            let next = {
                let mut session = self.session.lock().unwrap();
                if session.window_publish.len() >= self.config.window_size() {
                    None
                } else {
                    session.queue_publish_tx.pop_front()
                }
            };

            let mut request = match next {
                Some(request) => request,
                None => break,
            };

            let bytes = encode_publish(&request);

            if let Err(err) = self.write_packet(&bytes).await {
                resolve(&mut request.completion, Err(err.clone()));
                return Err(err);
            }

            self.arm_publish_retry(shared, &mut request, bytes.len());

            self.session
                .lock()
                .unwrap()
                .window_publish
                .insert(request.packet_id, request);
        }

        Ok(())
    }

    /// Advances `request.interval` — the packet's own persistent backoff
    /// generator, created once in [`Engine::publish`] — and schedules the
    /// next retransmit at the resulting delay. Reusing the same generator
    /// across every call is what lets `k` keep growing per §4.4.2.
    fn arm_publish_retry(&self, shared: &SharedEngine<T>, request: &mut PublishRequest, size: usize) {
        let delay = request.interval.next(size);
        let packet_id = request.packet_id;

        request.retry_handle = Some(schedule_publish_retry(&self.timer, shared, delay, packet_id));
    }

    /// Arms a fresh retransmit timer for an already-installed `windowPublish`
    /// entry, replacing any handle it carried over from a previous
    /// transport instance. Used by session resync (§4.4.5), which resends
    /// the window's contents wholesale rather than one completion at a time.
    pub(super) fn rearm_publish_retry(&self, shared: &SharedEngine<T>, packet_id: PacketId, size: usize) {
        let delay = match self
            .session
            .lock()
            .unwrap()
            .window_publish
            .get_mut(&packet_id)
        {
            Some(request) => request.interval.next(size),
            None => return,
        };
        let handle = schedule_publish_retry(&self.timer, shared, delay, packet_id);

        if let Some(request) = self.session.lock().unwrap().window_publish.get_mut(&packet_id) {
            if let Some(old) = request.retry_handle.replace(handle) {
                self.timer.cancel(&old);
            }
        }
    }

    async fn retry_publish(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) {
        if !self.state.allows_publish() {
            return;
        }

        let bytes = {
            let mut session = self.session.lock().unwrap();
            match session.window_publish.get_mut(&packet_id) {
                Some(request) => {
                    request.dup = true;
                    Some(encode_publish(request))
                }
                None => None,
            }
        };

        let bytes = match bytes {
            Some(bytes) => bytes,
            None => return,
        };

        log::warn!("retransmitting PUBLISH {}", packet_id);

        if self.write_packet(&bytes).await.is_err() {
            return;
        }

        let delay = match self
            .session
            .lock()
            .unwrap()
            .window_publish
            .get_mut(&packet_id)
        {
            Some(request) => request.interval.next(bytes.len()),
            None => return,
        };
        let handle = schedule_publish_retry(&self.timer, shared, delay, packet_id);

        if let Some(request) = self.session.lock().unwrap().window_publish.get_mut(&packet_id) {
            request.retry_handle = Some(handle);
        }
    }

    pub(super) async fn on_puback(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) -> Result<()> {
        let request = {
            let mut session = self.session.lock().unwrap();
            session.window_publish.remove(&packet_id)
        };

        match request {
            Some(mut request) => {
                if let Some(handle) = request.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
                resolve(&mut request.completion, Ok(packet_id));
                self.refill_publish(shared).await?;
            }
            None => {
                log::debug!("PUBACK for unknown packet-id {}, ignoring", packet_id);
            }
        }

        Ok(())
    }

    pub(super) async fn on_pubrec(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) -> Result<()> {
        let request = {
            let mut session = self.session.lock().unwrap();
            session.window_publish.remove(&packet_id)
        };

        let mut request = match request {
            Some(request) => request,
            None => {
                log::debug!("PUBREC for unknown packet-id {}, ignoring", packet_id);
                return Ok(());
            }
        };

        if let Some(handle) = request.retry_handle.take() {
            self.timer.cancel(&handle);
        }

        let mut release = ReleaseRequest {
            packet_id,
            completion: request.completion.take(),
            retry_handle: None,
            interval: Interval::new(
                self.config.retry_initial(),
                self.config.factor(),
                self.config.retry_max_delay(),
            ),
        };

        let bytes = encode_pubrel(packet_id);
        self.write_packet(&bytes).await?;

        self.arm_release_retry(shared, &mut release);

        self.session
            .lock()
            .unwrap()
            .window_pub_release
            .insert(packet_id, release);

        Ok(())
    }

    /// Advances `release.interval` — created once in [`Engine::on_pubrec`] —
    /// the same persist-and-reuse pattern as [`Engine::arm_publish_retry`].
    fn arm_release_retry(&self, shared: &SharedEngine<T>, release: &mut ReleaseRequest) {
        let delay = release.interval.next();
        let packet_id = release.packet_id;

        release.retry_handle = Some(schedule_release_retry(&self.timer, shared, delay, packet_id));
    }

    /// The `windowPubRelease` counterpart of [`Engine::rearm_publish_retry`],
    /// used by the same session-resync pass.
    pub(super) fn rearm_release_retry(&self, shared: &SharedEngine<T>, packet_id: PacketId) {
        let delay = match self
            .session
            .lock()
            .unwrap()
            .window_pub_release
            .get_mut(&packet_id)
        {
            Some(request) => request.interval.next(),
            None => return,
        };
        let handle = schedule_release_retry(&self.timer, shared, delay, packet_id);

        if let Some(request) = self.session.lock().unwrap().window_pub_release.get_mut(&packet_id) {
            if let Some(old) = request.retry_handle.replace(handle) {
                self.timer.cancel(&old);
            }
        }
    }

    async fn retry_release(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) {
        if !self.state.allows_publish() {
            return;
        }

        let present = self
            .session
            .lock()
            .unwrap()
            .window_pub_release
            .contains_key(&packet_id);

        if !present {
            return;
        }

        log::warn!("retransmitting PUBREL {}", packet_id);

        let bytes = encode_pubrel(packet_id);
        if self.write_packet(&bytes).await.is_err() {
            return;
        }

        let delay = match self
            .session
            .lock()
            .unwrap()
            .window_pub_release
            .get_mut(&packet_id)
        {
            Some(request) => request.interval.next(),
            None => return,
        };
        let handle = schedule_release_retry(&self.timer, shared, delay, packet_id);

        if let Some(request) = self.session.lock().unwrap().window_pub_release.get_mut(&packet_id) {
            request.retry_handle = Some(handle);
        }
    }

    pub(super) async fn on_pubcomp(&mut self, shared: &SharedEngine<T>, packet_id: PacketId) -> Result<()> {
        let request = {
            let mut session = self.session.lock().unwrap();
            session.window_pub_release.remove(&packet_id)
        };

        match request {
            Some(mut request) => {
                if let Some(handle) = request.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
                resolve(&mut request.completion, Ok(packet_id));
                self.refill_publish(shared).await?;
            }
            None => {
                log::debug!("PUBCOMP for unknown packet-id {}, ignoring", packet_id);
            }
        }

        Ok(())
    }

    /// §4.4.3, broker-to-client direction. QoS 0 delivers immediately; QoS 1
    /// acknowledges then delivers; QoS 2 holds the message in
    /// `window_pub_rx` until the matching PUBREL arrives, so a retransmitted
    /// PUBLISH (same packet-id, DUP set) never delivers twice.
    pub(super) async fn on_publish_recv(&mut self, delivery: Delivery) -> Result<()> {
        match delivery.qos {
            QoS::AtMostOnce => {
                self.deliver(delivery);
            }
            QoS::AtLeastOnce => {
                let packet_id = delivery.packet_id.unwrap_or(0);
                let bytes = encode_puback(packet_id);
                self.write_packet(&bytes).await?;
                self.deliver(delivery);
            }
            QoS::ExactlyOnce => {
                let packet_id = delivery.packet_id.unwrap_or(0);

                self.session.lock().unwrap().window_pub_rx.insert(
                    packet_id,
                    IncomingMessage {
                        topic: delivery.topic,
                        payload: delivery.payload,
                        retain: delivery.retain,
                    },
                );

                let bytes = encode_pubrec(packet_id);
                self.write_packet(&bytes).await?;
            }
        }

        Ok(())
    }

    pub(super) async fn on_pubrel(&mut self, packet_id: PacketId) -> Result<()> {
        let message = self.session.lock().unwrap().window_pub_rx.remove(&packet_id);

        if let Some(message) = message {
            self.deliver(Delivery {
                topic: message.topic,
                payload: message.payload,
                qos: QoS::ExactlyOnce,
                dup: false,
                retain: message.retain,
                packet_id: Some(packet_id),
            });
        } else {
            log::debug!("PUBREL for unknown packet-id {}, sending PUBCOMP anyway", packet_id);
        }

        let bytes = encode_pubcomp(packet_id);
        self.write_packet(&bytes).await
    }

    fn deliver(&self, delivery: Delivery) {
        if let Some(cb) = self.on_publish.clone() {
            cb(delivery);
        } else {
            log::warn!("received PUBLISH on topic {:?} with no on_publish handler set", delivery.topic);
        }
    }
}

fn schedule_publish_retry<T: Transport + 'static>(
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
                engine.retry_publish(&self_ref, packet_id).await;
            });
        }),
    )
}

fn schedule_release_retry<T: Transport + 'static>(
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
                engine.retry_release(&self_ref, packet_id).await;
            });
        }),
    )
}

pub(super) fn encode_publish(request: &PublishRequest) -> Vec<u8> {
    let packet = Packet::Publish(Publish {
        dup: request.dup,
        qos: request.qos,
        retain: request.retain,
        topic: &request.topic,
        packet_id: Some(request.packet_id),
        payload: &request.payload,
    });

    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}

fn encode_puback(packet_id: PacketId) -> Vec<u8> {
    let packet = Packet::PublishAck(PublishAck { packet_id });
    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}

fn encode_pubrec(packet_id: PacketId) -> Vec<u8> {
    let packet = Packet::PublishReceived(PublishReceived { packet_id });
    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}

pub(super) fn encode_pubrel(packet_id: PacketId) -> Vec<u8> {
    let packet = Packet::PublishRelease(PublishRelease { packet_id });
    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}

pub(super) fn encode_pubcomp(packet_id: PacketId) -> Vec<u8> {
    let packet = Packet::PublishComplete(PublishComplete { packet_id });
    let mut buf = BytesMut::new();
    packet.write_to(&mut buf);
    buf.to_vec()
}
