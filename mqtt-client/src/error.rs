use derive_more::Display;

use mqtt_core::{DecodeError, PacketId};

use crate::state::State;

/// Everything that can cause a client operation or a completion signal to
/// fail.
///
/// Grouped the way the protocol reacts to them, not by struct layout:
/// value/state/window errors fail synchronously, timeout/decode errors
/// abort the transport, and session-cleared/transport-closed fail whatever
/// signals the current `clean_session` policy says must fail.
#[derive(Debug, Display, Clone)]
pub enum Error {
    /// a QoS value outside `{0,1,2}` was passed to `publish`/`subscribe`.
    #[display(fmt = "invalid QoS value: {}", _0)]
    InvalidQoS(u8),

    /// `keep_alive` given to `connect` was out of `[0, 65535]`.
    #[display(fmt = "invalid keepalive value: {}", _0)]
    InvalidKeepAlive(u32),

    /// the client id exceeded 23 bytes under MQTT 3.1.
    #[display(fmt = "client id {:?} exceeds 23 bytes under MQTT 3.1", _0)]
    ClientIdTooLong(String),

    /// a will message was given without a will topic, or vice versa.
    #[display(fmt = "will topic and will message must both be present or both absent")]
    MissingWill,

    /// a password was given without a username.
    #[display(fmt = "password given without a username")]
    MissingUsername,

    /// `set_window_size` was given a value outside `[1, 16]`.
    #[display(fmt = "invalid window size: {}", _0)]
    InvalidWindowSize(usize),

    /// `set_timeout` was given a value outside `[1, 1024]` seconds.
    #[display(fmt = "invalid retry timeout: {}", _0)]
    InvalidTimeout(u64),

    /// `set_bandwidth` was given a non-positive bandwidth or factor.
    #[display(fmt = "invalid bandwidth/factor: {}", _0)]
    InvalidBandwidth(String),

    /// an unsupported client role profile was requested.
    #[display(fmt = "invalid client role profile: {}", _0)]
    InvalidProfile(String),

    /// an operation was attempted in a state that does not permit it.
    #[display(fmt = "operation is not allowed in state {:?}", state)]
    ProtocolState { state: State },

    /// a SUBSCRIBE or UNSUBSCRIBE was attempted while its window was full.
    #[display(fmt = "window is full ({} entries in flight)", _0)]
    WindowExceeded(usize),

    /// CONNACK did not arrive before the connect timer fired.
    #[display(fmt = "timed out waiting for CONNACK")]
    ConnectTimeout,

    /// PINGRESP did not arrive within one keepalive interval.
    #[display(fmt = "timed out waiting for PINGRESP")]
    PingTimeout,

    /// an inbound byte sequence failed to decode into a valid packet.
    #[display(fmt = "decode error: {}", _0)]
    Decode(DecodeError),

    /// the broker refused the connection; carries the CONNACK return code.
    #[display(fmt = "connection refused: {}", _0)]
    ConnectionRefused(mqtt_core::ConnectReturnCode),

    /// a pending operation was discarded by a clean-start reconnect.
    #[display(fmt = "session was cleared by a clean-start reconnect")]
    SessionCleared,

    /// the transport reported that it had closed or been aborted.
    #[display(fmt = "transport closed")]
    TransportClosed,
}

impl std::error::Error for Error {}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Decode(err)
    }
}

/// Shorthand used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The payload of a completion signal for a QoS≥1 PUBLISH: the packet-id it
/// was finally acknowledged under.
pub type PublishResult = Result<PacketId>;
