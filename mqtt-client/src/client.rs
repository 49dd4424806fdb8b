use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::sync::Mutex as AsyncMutex;

use mqtt_core::{PacketId, QoS, SubscribeReturnCode};

use crate::engine::{ConnectOptions, Engine, OnDisconnection, OnPublish, SharedEngine};
use crate::error::{Error, Result};
use crate::state::State;
use crate::transport::Transport;

/// The public, implementer-facing handle described in spec.md §6.
///
/// A thin `Arc<tokio::sync::Mutex<Engine<T>>>` wrapper: every method locks
/// the engine for the duration of one operation and returns, so it is
/// `Clone` and freely shareable between the task driving inbound bytes and
/// the tasks making user calls. `Engine`'s own methods take the `SharedEngine`
/// handle directly (not `&mut self`) because timer callbacks need to be able
/// to reacquire the lock independently; `Client` exists so callers don't have
/// to hold or thread that handle themselves.
#[derive(Clone)]
pub struct Client<T: Transport> {
    engine: SharedEngine<T>,
}

impl<T: Transport + 'static> Client<T> {
    /// Wraps an [`Engine`] — typically one just produced by
    /// [`crate::factory::Factory::build`] — in a sharable handle.
    pub fn new(engine: Engine<T>) -> Self {
        Client {
            engine: Arc::new(AsyncMutex::new(engine)),
        }
    }

    pub async fn state(&self) -> State {
        self.engine.lock().await.state()
    }

    /// `connect(clientId, keepalive, willTopic?, willMessage?, willQoS?,
    /// willRetain?, username?, password?, cleanStart, version)`. `cleanStart`
    /// and `version` are fixed per-factory config (see
    /// [`crate::config::ClientConfig`]); this takes the per-connect
    /// parameters only.
    pub async fn connect(&self, options: ConnectOptions) -> Result<oneshot::Receiver<Result<bool>>> {
        Engine::connect(&self.engine, options).await
    }

    /// `disconnect()`.
    pub async fn disconnect(&self) -> Result<()> {
        Engine::disconnect(&self.engine).await
    }

    /// `publish(topic, payload, qos, retain) -> Signal<packetId?>`. The
    /// signal carries `0` for QoS 0 (spec.md §6 describes the id as
    /// optional there; this core always resolves it, with `0` standing in
    /// for "none" since packet-id 0 is otherwise unused on the wire).
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> oneshot::Receiver<Result<PacketId>> {
        Engine::publish(&self.engine, topic.into(), payload.into(), qos, retain).await
    }

    /// `subscribe(topics, qos?) -> Signal<list<(grantedQos, failed)>>`.
    /// Accepts the list-of-`(topic, qos)` form directly; callers with a
    /// single topic-string-plus-shared-qos can build the one-element `Vec`
    /// themselves (`vec![(topic, qos)]`), which is what the single-topic
    /// and tuple forms spec.md §4.4.4 describes reduce to once the host
    /// language's argument-overloading sugar is gone.
    pub async fn subscribe(
        &self,
        subscriptions: Vec<(String, QoS)>,
    ) -> oneshot::Receiver<Result<Vec<SubscribeReturnCode>>> {
        Engine::subscribe(&self.engine, subscriptions).await
    }

    /// `unsubscribe(topics) -> Signal<packetId>`.
    pub async fn unsubscribe(&self, topic_filters: Vec<String>) -> oneshot::Receiver<Result<PacketId>> {
        Engine::unsubscribe(&self.engine, topic_filters).await
    }

    /// `set_window_size(n ∈ [1, 16])`.
    pub async fn set_window_size(&self, n: usize) -> Result<()> {
        self.engine.lock().await.config.set_window_size(n)
    }

    /// `set_timeout(seconds ∈ [1, 1024])`.
    pub async fn set_timeout(&self, seconds: u64) -> Result<()> {
        self.engine.lock().await.config.set_timeout(seconds)
    }

    /// `set_bandwidth(bytes_per_sec, factor)`.
    pub async fn set_bandwidth(&self, bytes_per_sec: f64, factor: f64) -> Result<()> {
        self.engine.lock().await.config.set_bandwidth(bytes_per_sec, factor)
    }

    /// `set_on_publish(cb(topic, payload, qos, dup, retain, packetId))`.
    pub async fn set_on_publish(&self, cb: OnPublish) {
        self.engine.lock().await.set_on_publish(cb);
    }

    /// `set_on_disconnection(cb(reason))`.
    pub async fn set_on_disconnection(&self, cb: OnDisconnection) {
        self.engine.lock().await.set_on_disconnection(cb);
    }

    /// Feeds bytes just read from the transport into the engine. The host
    /// application calls this from whatever read loop owns the socket; see
    /// spec.md §6's "Transport interface consumed".
    pub async fn on_bytes(&self, bytes: &[u8]) -> Result<()> {
        let shared = self.engine.clone();
        let mut engine = self.engine.lock().await;
        engine.on_bytes(&shared, bytes).await
    }

    /// Notifies the engine that the transport collaborator has reported the
    /// connection lost, running the §4.4.6 cleanup.
    pub async fn on_transport_lost(&self, reason: Error) {
        self.engine.lock().await.on_transport_lost(reason).await;
    }
}
