use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::oneshot;

use mqtt_core::{Connect, ConnectReturnCode, LastWill, Packet, QoS};

use crate::error::{Error, Result};
use crate::state::State;
use crate::transport::Transport;

use super::{Engine, SharedEngine, Will};

/// Parameters accepted by [`Engine::connect`], gathered the way
/// `connect(clientId, keepalive, willTopic?, ...)` is described in §6.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_ID_MAX_LEN_V31: usize = 23;

impl<T: Transport + 'static> Engine<T> {
    /// Validates `options`, writes CONNECT, and arms the CONNACK timer.
    /// Returns a signal that resolves with `session_present` on success.
    pub async fn connect(
        shared: &SharedEngine<T>,
        options: ConnectOptions,
    ) -> Result<oneshot::Receiver<Result<bool>>> {
        let (tx, rx) = oneshot::channel();

        let mut engine = shared.lock().await;

        if !engine.state.allows_connect() {
            let _ = tx.send(Err(Error::ProtocolState { state: engine.state }));
            return Ok(rx);
        }

        if let Err(err) = validate_connect(&engine, &options) {
            let _ = tx.send(Err(err.clone()));
            return Err(err);
        }

        engine.keep_alive = options.keep_alive;
        engine.will = options.will.clone();
        engine.username = options.username.clone();
        engine.password = options.password.clone();
        engine.connect_completion = Some(tx);

        let packet = Packet::Connect(Connect {
            protocol: engine.config.protocol,
            clean_session: engine.config.clean_session,
            keep_alive: options.keep_alive,
            client_id: &engine.client_id,
            last_will: options.will.as_ref().map(|w| LastWill {
                qos: w.qos,
                retain: w.retain,
                topic: &w.topic,
                message: &w.message,
            }),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
        });

        let mut buf = BytesMut::new();
        packet.write_to(&mut buf);

        engine.state = State::Connecting;
        log::info!("state -> Connecting");

        if let Err(err) = engine.write_packet(&buf).await {
            engine.state = State::Idle;
            if let Some(tx) = engine.connect_completion.take() {
                let _ = tx.send(Err(err.clone()));
            }
            return Err(err);
        }

        let timeout = Duration::from_secs(u64::from(options.keep_alive)).max(MIN_CONNECT_TIMEOUT);
        let timer_engine = shared.clone();

        let handle = engine.timer.schedule(
            timeout,
            Box::new(move || {
                tokio::spawn(async move {
                    let mut engine = timer_engine.lock().await;
                    engine.on_connect_timeout().await;
                });
            }),
        );
        engine.connect_timer = Some(handle);

        Ok(rx)
    }

    async fn on_connect_timeout(&mut self) {
        if self.state != State::Connecting {
            return;
        }

        log::error!("CONNACK not received within connect timeout");

        self.transport.abort().await;

        if let Some(tx) = self.connect_completion.take() {
            let _ = tx.send(Err(Error::ConnectTimeout));
        }

        self.state = State::Idle;
    }

    pub(super) async fn on_connect_ack(
        &mut self,
        shared: &SharedEngine<T>,
        session_present: bool,
        return_code: ConnectReturnCode,
    ) -> Result<()> {
        if self.state != State::Connecting {
            log::warn!("unsolicited CONNACK in state {:?}", self.state);
            return Ok(());
        }

        if let Some(handle) = self.connect_timer.take() {
            self.timer.cancel(&handle);
        }

        if return_code != ConnectReturnCode::ConnectionAccepted {
            self.state = State::Idle;
            if let Some(tx) = self.connect_completion.take() {
                let _ = tx.send(Err(Error::ConnectionRefused(return_code)));
            }
            return Ok(());
        }

        self.state = State::Connected;
        log::info!("state -> Connected (session_present={})", session_present);

        if !self.config.clean_session && !session_present {
            log::debug!("broker reports no prior session despite clean_session=false");
        }

        if !self.config.clean_session {
            self.resync_session(shared).await?;
        } else {
            self.session.lock().unwrap().purge();
        }

        if let Some(tx) = self.connect_completion.take() {
            let _ = tx.send(Ok(session_present));
        }

        self.start_keepalive(shared);

        Ok(())
    }
}

fn validate_connect<T: Transport>(engine: &Engine<T>, options: &ConnectOptions) -> Result<()> {
    // a will topic/message pair is captured together in `Will`, so "both
    // present or both absent" already holds by construction; only the QoS
    // value needs checking.
    if let Some(ref will) = options.will {
        if will.qos as u8 > QoS::ExactlyOnce as u8 {
            return Err(Error::InvalidQoS(will.qos as u8));
        }
    }

    if options.password.is_some() && options.username.is_none() {
        return Err(Error::MissingUsername);
    }

    if engine.config.protocol == mqtt_core::ProtocolVersion::V31
        && engine.client_id.len() > CLIENT_ID_MAX_LEN_V31
    {
        return Err(Error::ClientIdTooLong(engine.client_id.clone()));
    }

    Ok(())
}

/// Resolves a completion signal if it is still attached; a no-op if it was
/// already resolved (or never installed), matching the idempotent-
/// duplicate-ack rule used throughout §4.4.2/§4.4.4.
pub(super) fn resolve<U>(slot: &mut Option<oneshot::Sender<Result<U>>>, value: Result<U>) {
    if let Some(tx) = slot.take() {
        let _ = tx.send(value);
    }
}
