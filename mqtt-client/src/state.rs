/// The three states of a client protocol instance.
///
/// Transitions are driven entirely by `engine`: nothing outside this crate
/// mutates a `State` directly. Unlike the dynamic per-state objects some
/// MQTT client implementations use, this is a plain enum the engine matches
/// on — no behaviour lives on the variants themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// no transport, no pending CONNECT.
    Idle,
    /// CONNECT has been written; waiting for CONNACK or the connect timer.
    Connecting,
    /// CONNACK with result 0 has been received and the transport is open.
    Connected,
}

impl State {
    /// whether `publish` may be called in this state.
    ///
    /// MQTT allows a client to start publishing before CONNACK arrives; the
    /// server may still reject the connection afterward, in which case the
    /// pending publishes fail along with everything else in flight.
    pub fn allows_publish(self) -> bool {
        matches!(self, State::Connecting | State::Connected)
    }

    /// whether `subscribe`/`unsubscribe`/`disconnect`/`ping` may be called.
    pub fn allows_session_ops(self) -> bool {
        self == State::Connected
    }

    /// whether `connect` may be called.
    pub fn allows_connect(self) -> bool {
        self == State::Idle
    }
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}
