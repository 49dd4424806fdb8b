//! MQTT 3.1 / 3.1.1 client protocol engine.
//!
//! This crate owns the state machine, in-flight windows, retransmission
//! timers, packet-id allocation and session-persistence sync described in
//! the core's specification; the PDU codec lives in `mqtt-core` and the
//! transport (TCP/TLS/WebSocket) and reconnect/backoff policy are supplied
//! by the host application through the [`transport::Transport`] trait.

#[macro_use]
extern crate log;

pub extern crate mqtt_core as mqtt;

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod retry;
pub mod session;
pub mod state;
pub mod timer;
pub mod transport;

pub use client::Client;
pub use config::{ClientConfig, Role};
pub use engine::{ConnectOptions, Delivery, Engine, OnDisconnection, OnPublish, SharedEngine, Subscription, Will};
pub use error::{Error, Result};
pub use factory::Factory;
pub use state::State;
pub use transport::Transport;
