mod connect;
mod keepalive;
mod publish;
mod resync;
mod subscribe;

pub use connect::ConnectOptions;
pub use subscribe::Subscription;

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

use mqtt_core::{PacketId, QoS};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::session::SessionState;
use crate::state::State;
use crate::timer::Timer;
use crate::transport::{Accumulator, Transport};

/// A message delivered to the application via `on_publish`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    /// absent for QoS 0 deliveries.
    pub packet_id: Option<PacketId>,
}

/// An owned Will, captured at `connect()` time (the codec's `LastWill`
/// borrows from the caller's buffers, which do not outlive the call).
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

pub type OnPublish = Arc<dyn Fn(Delivery) + Send + Sync>;
pub type OnDisconnection = Arc<dyn Fn(Error) + Send + Sync>;

/// Drives one transport connection's worth of MQTT protocol: the state
/// machine of §4.3 plus every flow in §4.4, operating on a [`SessionState`]
/// shared with whatever protocol instance comes after it.
///
/// An `Engine` is always accessed through `Arc<tokio::sync::Mutex<..>>` (see
/// [`crate::client::Client`]) so that timer callbacks — which fire on a
/// separate spawned task — can reach back in to run a retry or a timeout
/// without the caller holding a borrow across an `.await`.
pub struct Engine<T: Transport> {
    pub(crate) config: ClientConfig,
    pub(crate) state: State,
    pub(crate) session: Arc<StdMutex<SessionState>>,
    pub(crate) transport: T,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) accumulator: Accumulator,

    pub(crate) client_id: String,
    pub(crate) keep_alive: u16,
    pub(crate) will: Option<Will>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,

    pub(crate) connect_completion: Option<tokio::sync::oneshot::Sender<Result<bool>>>,
    pub(crate) connect_timer: Option<crate::timer::Handle>,
    pub(crate) ping_timer: Option<crate::timer::Handle>,
    pub(crate) pong_timer: Option<crate::timer::Handle>,

    pub(crate) on_publish: Option<OnPublish>,
    pub(crate) on_disconnection: Option<OnDisconnection>,
}

impl<T: Transport + 'static> Engine<T> {
    pub fn new(
        config: ClientConfig,
        session: Arc<StdMutex<SessionState>>,
        transport: T,
        timer: Arc<dyn Timer>,
        client_id: String,
    ) -> Self {
        Engine {
            config,
            state: State::Idle,
            session,
            transport,
            timer,
            accumulator: Accumulator::new(),
            client_id,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
            connect_completion: None,
            connect_timer: None,
            ping_timer: None,
            pong_timer: None,
            on_publish: None,
            on_disconnection: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_on_publish(&mut self, cb: OnPublish) {
        self.on_publish = Some(cb);
    }

    pub fn set_on_disconnection(&mut self, cb: OnDisconnection) {
        self.on_disconnection = Some(cb);
    }

    /// Feeds newly-read bytes through the streaming accumulator and
    /// dispatches every complete packet it yields. On a decode error the
    /// transport is aborted, matching §4.1's "Errors" rule.
    ///
    /// Takes `shared` because several handlers (CONNACK resync/keepalive
    /// start, PUBREC's PUBREL retry) need to arm a timer whose callback
    /// reaches back into the engine through the same `Arc` the caller holds.
    pub async fn on_bytes(&mut self, shared: &SharedEngine<T>, bytes: &[u8]) -> Result<()> {
        let mut inbound = Vec::new();
        let decode_result = self.accumulator.accept(bytes, |packet| {
            inbound.push(OwnedPacket::from(packet));
            Ok(())
        });

        if let Err(err) = decode_result {
            self.transport.abort().await;
            return Err(err);
        }

        for packet in inbound {
            self.dispatch(shared, packet).await?;
        }

        Ok(())
    }

    async fn dispatch(&mut self, shared: &SharedEngine<T>, packet: OwnedPacket) -> Result<()> {
        match packet {
            OwnedPacket::ConnectAck { session_present, return_code } => {
                self.on_connect_ack(shared, session_present, return_code).await
            }
            OwnedPacket::Publish(delivery) => self.on_publish_recv(delivery).await,
            OwnedPacket::PublishAck { packet_id } => self.on_puback(shared, packet_id).await,
            OwnedPacket::PublishReceived { packet_id } => self.on_pubrec(shared, packet_id).await,
            OwnedPacket::PublishRelease { packet_id } => self.on_pubrel(packet_id).await,
            OwnedPacket::PublishComplete { packet_id } => self.on_pubcomp(shared, packet_id).await,
            OwnedPacket::SubscribeAck { packet_id, status } => {
                self.on_suback(packet_id, status).await
            }
            OwnedPacket::UnsubscribeAck { packet_id } => self.on_unsuback(packet_id).await,
            OwnedPacket::Pong => self.on_pingresp(shared).await,
            OwnedPacket::Disconnect | OwnedPacket::Connect | OwnedPacket::Subscribe
            | OwnedPacket::Unsubscribe | OwnedPacket::Ping => {
                // a client never receives these packet types from a broker.
                log::warn!("ignoring unexpected inbound packet type");
                Ok(())
            }
        }
    }

    /// §4.4.6: transport loss cleanup. Stops every timer, and either
    /// purges or preserves the session tables depending on `clean_session`.
    pub async fn on_transport_lost(&mut self, reason: Error) {
        log::info!("transport lost: {}", reason);

        if let Some(handle) = self.ping_timer.take() {
            self.timer.cancel(&handle);
        }
        if let Some(handle) = self.pong_timer.take() {
            self.timer.cancel(&handle);
        }
        if let Some(handle) = self.connect_timer.take() {
            self.timer.cancel(&handle);
        }

        {
            let mut session = self.session.lock().unwrap();

            for req in session.window_publish.values_mut() {
                if let Some(handle) = req.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
            }
            for req in session.window_pub_release.values_mut() {
                if let Some(handle) = req.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
            }
            for req in session.window_subscribe.values_mut() {
                if let Some(handle) = req.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
            }
            for req in session.window_unsubscribe.values_mut() {
                if let Some(handle) = req.retry_handle.take() {
                    self.timer.cancel(&handle);
                }
            }

            if self.config.clean_session {
                session.purge();
            } else {
                session.fail_pending(reason.clone());
            }
        }

        self.state = State::Idle;

        if let Some(tx) = self.connect_completion.take() {
            let _ = tx.send(Err(reason.clone()));
        }

        // §7: "iff no pending signal is still alive or cleanStart is true".
        // With `clean_session = false` the publish/release tables are left
        // untouched by `fail_pending` above — their signals are still alive,
        // waiting on the next reconnect's resync — so the callback is
        // withheld until that resync resolves or fails them.
        let still_pending = !self.config.clean_session && {
            let session = self.session.lock().unwrap();
            !session.window_publish.is_empty() || !session.window_pub_release.is_empty()
        };

        if still_pending {
            return;
        }

        if let Some(cb) = self.on_disconnection.clone() {
            let reason = reason.clone();
            // scheduled for the next tick, per §4.4.6/§7, so any cleanup
            // above is visible before the application is told.
            tokio::task::yield_now().await;
            cb(reason);
        }
    }

    pub(crate) async fn write_packet(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write(bytes).await
    }

    /// `disconnect()`: only valid while CONNECTED. Writes DISCONNECT, closes
    /// the transport gracefully, and runs the same cleanup as a transport
    /// loss (§4.3's CONNECTED → IDLE transition), tagged with
    /// `Error::TransportClosed` rather than whatever caused an unplanned
    /// drop.
    pub async fn disconnect(shared: &SharedEngine<T>) -> Result<()> {
        let mut engine = shared.lock().await;

        if !engine.state.allows_session_ops() {
            return Err(Error::ProtocolState { state: engine.state });
        }

        let mut buf = bytes::BytesMut::new();
        mqtt_core::Packet::Disconnect.write_to(&mut buf);
        let write_result = engine.write_packet(&buf).await;

        engine.transport.close().await;
        drop(engine);

        shared.lock().await.on_transport_lost(Error::TransportClosed).await;

        write_result
    }
}

/// An owned projection of `mqtt_core::Packet` used once a frame has been
/// decoded and must outlive the accumulator's borrow. Only the fields the
/// engine actually consumes are carried; e.g. CONNECT/SUBSCRIBE/PING, which
/// a client never receives, keep no payload.
enum OwnedPacket {
    Connect,
    ConnectAck {
        session_present: bool,
        return_code: mqtt_core::ConnectReturnCode,
    },
    Publish(Delivery),
    PublishAck { packet_id: PacketId },
    PublishReceived { packet_id: PacketId },
    PublishRelease { packet_id: PacketId },
    PublishComplete { packet_id: PacketId },
    Subscribe,
    SubscribeAck {
        packet_id: PacketId,
        status: Vec<mqtt_core::SubscribeReturnCode>,
    },
    Unsubscribe,
    UnsubscribeAck { packet_id: PacketId },
    Ping,
    Pong,
    Disconnect,
}

impl From<mqtt_core::Packet<'_>> for OwnedPacket {
    fn from(packet: mqtt_core::Packet<'_>) -> Self {
        use mqtt_core::Packet::*;

        match packet {
            Connect(_) => OwnedPacket::Connect,
            ConnectAck(ack) => OwnedPacket::ConnectAck {
                session_present: ack.session_present,
                return_code: ack.return_code,
            },
            Publish(publish) => OwnedPacket::Publish(Delivery {
                topic: publish.topic.to_owned(),
                payload: publish.payload.to_vec(),
                qos: publish.qos,
                dup: publish.dup,
                retain: publish.retain,
                packet_id: publish.packet_id,
            }),
            PublishAck(ack) => OwnedPacket::PublishAck { packet_id: ack.packet_id },
            PublishReceived(rec) => OwnedPacket::PublishReceived { packet_id: rec.packet_id },
            PublishRelease(rel) => OwnedPacket::PublishRelease { packet_id: rel.packet_id },
            PublishComplete(comp) => OwnedPacket::PublishComplete { packet_id: comp.packet_id },
            Subscribe(_) => OwnedPacket::Subscribe,
            SubscribeAck(ack) => OwnedPacket::SubscribeAck {
                packet_id: ack.packet_id,
                status: ack.status,
            },
            Unsubscribe(_) => OwnedPacket::Unsubscribe,
            UnsubscribeAck(ack) => OwnedPacket::UnsubscribeAck { packet_id: ack.packet_id },
            Ping => OwnedPacket::Ping,
            Pong => OwnedPacket::Pong,
            Disconnect => OwnedPacket::Disconnect,
        }
    }
}

/// An `Engine` shared between the public [`crate::client::Client`] handle
/// and the timer callbacks spawned for retries, keepalive and timeouts.
pub type SharedEngine<T> = Arc<AsyncMutex<Engine<T>>>;

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex as StdMutex};

    use bytes::BytesMut;

    use mqtt_core::{
        ConnectAck, ConnectReturnCode, Packet, PublishAck, QoS, SubscribeAck, SubscribeReturnCode,
    };

    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::error::{Error, Result};
    use crate::factory::Factory;
    use crate::timer::fake::FakeTimer;
    use crate::transport::Transport;

    use super::ConnectOptions;

    /// An in-memory [`Transport`] that records every frame written to it,
    /// for tests to assert against and to feed the broker's side of the
    /// conversation back in through `Client::on_bytes`.
    #[derive(Clone, Default)]
    struct FakeTransport {
        written: Arc<StdMutex<Vec<Vec<u8>>>>,
        closed: Arc<StdMutex<bool>>,
    }

    impl FakeTransport {
        fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.written.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        async fn abort(&mut self) {
            *self.closed.lock().unwrap() = true;
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn connack(session_present: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Packet::ConnectAck(ConnectAck {
            session_present,
            return_code: ConnectReturnCode::ConnectionAccepted,
        })
        .write_to(&mut buf);
        buf.to_vec()
    }

    fn puback(packet_id: u16) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Packet::PublishAck(PublishAck { packet_id }).write_to(&mut buf);
        buf.to_vec()
    }

    fn suback(packet_id: u16, status: Vec<SubscribeReturnCode>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Packet::SubscribeAck(SubscribeAck { packet_id, status }).write_to(&mut buf);
        buf.to_vec()
    }

    fn test_client(config: ClientConfig) -> (Client<FakeTransport>, FakeTransport) {
        let timer = Arc::new(FakeTimer::new());
        let factory = Factory::with_timer(config, timer);
        let transport = FakeTransport::default();
        let addr: SocketAddr = "127.0.0.1:1883".parse().unwrap();
        let engine = factory.build(addr, transport.clone(), "test-client".to_owned());
        (Client::new(engine), transport)
    }

    #[tokio::test]
    async fn connect_writes_connect_and_resolves_on_connack() {
        let (client, transport) = test_client(ClientConfig::new());

        let signal = client
            .connect(ConnectOptions {
                keep_alive: 30,
                ..Default::default()
            })
            .await
            .unwrap();

        let written = transport.written();
        assert_eq!(written.len(), 1, "CONNECT should be written synchronously");
        assert_eq!(mqtt_core::parse(&written[0]).unwrap().1.packet_type(), mqtt_core::Type::CONNECT);

        client.on_bytes(&connack(false)).await.unwrap();

        let session_present = signal.await.unwrap().unwrap();
        assert!(!session_present);
        assert_eq!(client.state().await, crate::state::State::Connected);
    }

    #[tokio::test]
    async fn connect_refused_fails_the_signal_and_returns_to_idle() {
        let (client, transport) = test_client(ClientConfig::new());

        let signal = client.connect(ConnectOptions::default()).await.unwrap();

        let mut buf = BytesMut::new();
        Packet::ConnectAck(ConnectAck {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        })
        .write_to(&mut buf);
        client.on_bytes(&buf).await.unwrap();

        let err = signal.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused(ConnectReturnCode::NotAuthorized)));
        assert_eq!(client.state().await, crate::state::State::Idle);
        assert_eq!(transport.written().len(), 1, "only the original CONNECT was written");
    }

    #[tokio::test]
    async fn publish_qos0_resolves_as_soon_as_the_bytes_are_written() {
        let (client, transport) = test_client(ClientConfig::new());

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        let signal = client.publish("a/b", b"hi".to_vec(), QoS::AtMostOnce, false).await;
        let packet_id = signal.await.unwrap().unwrap();

        assert_eq!(packet_id, 0);
        assert_eq!(transport.written().len(), 2, "CONNECT then PUBLISH");
    }

    #[tokio::test]
    async fn publish_qos1_completes_on_puback() {
        let (client, transport) = test_client(ClientConfig::new());

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        let signal = client
            .publish("a/b", b"hi".to_vec(), QoS::AtLeastOnce, false)
            .await;

        client.on_bytes(&puback(1)).await.unwrap();

        let packet_id = signal.await.unwrap().unwrap();
        assert_eq!(packet_id, 1);
        assert_eq!(transport.written().len(), 2, "CONNECT then PUBLISH");
    }

    #[tokio::test]
    async fn publish_window_admission_queues_overflow_until_acked() {
        let mut config = ClientConfig::new();
        config.set_window_size(1).unwrap();
        let (client, transport) = test_client(config);

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        let first = client.publish("a", b"1".to_vec(), QoS::AtLeastOnce, false).await;
        let second = client.publish("b", b"2".to_vec(), QoS::AtLeastOnce, false).await;

        // only the first should have gone out; the second sits in
        // `queue_publish_tx` until the window has room.
        assert_eq!(transport.written().len(), 2, "CONNECT + one PUBLISH");

        client.on_bytes(&puback(1)).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 1);

        assert_eq!(transport.written().len(), 3, "CONNECT + two PUBLISH");

        client.on_bytes(&puback(2)).await.unwrap();
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn subscribe_completes_with_granted_qos() {
        let (client, transport) = test_client(ClientConfig::new());

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        let signal = client
            .subscribe(vec![("a/b".to_owned(), QoS::AtLeastOnce)])
            .await;

        client
            .on_bytes(&suback(1, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]))
            .await
            .unwrap();

        let status = signal.await.unwrap().unwrap();
        assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)]);
        assert_eq!(transport.written().len(), 2, "CONNECT then SUBSCRIBE");
    }

    #[tokio::test]
    async fn clean_start_purges_in_flight_publishes_on_transport_loss() {
        let (client, transport) = test_client(ClientConfig::new());

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        let signal = client
            .publish("a/b", b"hi".to_vec(), QoS::AtLeastOnce, false)
            .await;

        client.on_transport_lost(Error::TransportClosed).await;

        assert!(matches!(
            signal.await.unwrap().unwrap_err(),
            Error::SessionCleared
        ));
        assert_eq!(client.state().await, crate::state::State::Idle);
        assert_eq!(transport.written().len(), 2, "CONNECT then PUBLISH");
    }

    #[tokio::test]
    async fn persistent_session_resync_resends_in_flight_publish_with_dup() {
        let mut config = ClientConfig::new();
        config.clean_session = false;
        let timer = Arc::new(FakeTimer::new());
        let factory = Factory::with_timer(config, timer);
        let addr: SocketAddr = "127.0.0.1:1883".parse().unwrap();

        let first_transport = FakeTransport::default();
        let client = Client::new(factory.build(addr, first_transport.clone(), "t".to_owned()));

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        let _signal = client
            .publish("a/b", b"hi".to_vec(), QoS::AtLeastOnce, false)
            .await;

        // the first transport drops without a PUBACK; the publish's signal
        // is deliberately left unresolved (it is still tracked for resync).
        client.on_transport_lost(Error::TransportClosed).await;

        // a fresh protocol instance reconnects over the same session.
        let second_transport = FakeTransport::default();
        let client = Client::new(factory.build(addr, second_transport.clone(), "t".to_owned()));

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(true)).await.unwrap();

        let written = second_transport.written();
        let last = mqtt_core::parse(written.last().unwrap()).unwrap().1;
        match last {
            Packet::Publish(publish) => assert!(publish.dup, "resent PUBLISH must carry DUP"),
            other => panic!("expected a resent PUBLISH, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_writes_disconnect_and_returns_to_idle() {
        let (client, transport) = test_client(ClientConfig::new());

        client.connect(ConnectOptions::default()).await.unwrap();
        client.on_bytes(&connack(false)).await.unwrap();

        client.disconnect().await.unwrap();

        assert_eq!(client.state().await, crate::state::State::Idle);
        assert!(transport.is_closed());
        let written = transport.written();
        let last = mqtt_core::parse(written.last().unwrap()).unwrap().1;
        assert!(matches!(last, Packet::Disconnect));
    }
}
