use std::time::Duration;

use bytes::BytesMut;

use mqtt_core::Packet;

use crate::state::State;
use crate::transport::Transport;

use super::{Engine, SharedEngine};

impl<T: Transport + 'static> Engine<T> {
    /// Starts the PINGREQ/PINGRESP cycle of §4.4.1. A no-op when
    /// `keep_alive == 0`: the mechanism is disabled entirely, per spec.
    pub(super) fn start_keepalive(&mut self, shared: &SharedEngine<T>) {
        if self.keep_alive == 0 {
            return;
        }

        self.arm_ping_timer(shared);
    }

    fn arm_ping_timer(&mut self, shared: &SharedEngine<T>) {
        let delay = Duration::from_secs(u64::from(self.keep_alive));
        let timer_engine = shared.clone();

        let handle = self.timer.schedule(
            delay,
            Box::new(move || {
                let timer_engine = timer_engine.clone();
                tokio::spawn(async move {
                    let self_ref = timer_engine.clone();
                    let mut engine = timer_engine.lock().await;
                    engine.send_pingreq(&self_ref).await;
                });
            }),
        );

        self.ping_timer = Some(handle);
    }

    async fn send_pingreq(&mut self, shared: &SharedEngine<T>) {
        if self.state != State::Connected || self.keep_alive == 0 {
            return;
        }

        let mut buf = BytesMut::new();
        Packet::Ping.write_to(&mut buf);

        if self.write_packet(&buf).await.is_err() {
            return;
        }

        log::debug!("PINGREQ sent");

        let timeout = Duration::from_secs(u64::from(self.keep_alive));
        let timer_engine = shared.clone();

        self.pong_timer = Some(self.timer.schedule(
            timeout,
            Box::new(move || {
                let timer_engine = timer_engine.clone();
                tokio::spawn(async move {
                    let mut engine = timer_engine.lock().await;
                    engine.on_pingresp_timeout().await;
                });
            }),
        ));
    }

    async fn on_pingresp_timeout(&mut self) {
        if self.state != State::Connected {
            return;
        }

        log::error!("PINGRESP not received within keepalive interval, aborting transport");

        self.transport.abort().await;
    }

    /// On PINGRESP: cancel the pending-pong timer and rearm the next
    /// PINGREQ `keep_alive` seconds out.
    pub(super) async fn on_pingresp(&mut self, shared: &SharedEngine<T>) -> crate::error::Result<()> {
        if let Some(handle) = self.pong_timer.take() {
            self.timer.cancel(&handle);
        }

        log::debug!("PINGRESP received");

        if self.keep_alive != 0 && self.state == State::Connected {
            self.arm_ping_timer(shared);
        }

        Ok(())
    }
}
