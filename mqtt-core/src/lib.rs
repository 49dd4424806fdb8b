//! MQTT 3.1 / 3.1.1 Control Packet codec.
//!
//! This crate only decodes and encodes the wire format; it knows nothing
//! about sessions, retries or transports. See `mqtt-client` for the
//! protocol engine built on top of it.

mod decode;
mod encode;
mod error;
mod packet;

pub use crate::decode::parse;
pub use crate::encode::encoded_len;
pub use crate::error::DecodeError;
pub use crate::packet::{
    Connect, ConnectAck, ConnectAckFlags, ConnectFlags, ConnectReturnCode, FixedHeader, LastWill,
    Packet, PacketId, ProtocolVersion, Publish, PublishAck, PublishComplete, PublishFlags,
    PublishReceived, PublishRelease, QoS, Subscribe, SubscribeAck, SubscribeReturnCode, Type,
    Unsubscribe, UnsubscribeAck, MAX_REMAINING_LENGTH,
};
