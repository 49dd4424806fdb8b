use derive_more::Display;

/// Reasons a byte buffer failed to decode into a [`Packet`](crate::packet::Packet).
#[derive(Debug, Display, Eq, PartialEq, Clone)]
pub enum DecodeError {
    /// the fixed header's packet type nibble or flags were malformed.
    #[display(fmt = "malformed fixed header")]
    MalformedFixedHeader,

    /// the remaining-length field used more than 4 continuation bytes, or
    /// decoded to a value over 268,435,455.
    #[display(fmt = "remaining length exceeds the maximum encodable value")]
    RemainingLengthTooLarge,

    /// a length-prefixed field was declared longer than the bytes available.
    #[display(fmt = "truncated packet: expected more bytes than were supplied")]
    Truncated,

    /// a UTF-8 string field contained invalid UTF-8.
    #[display(fmt = "invalid UTF-8 in a string field")]
    InvalidUtf8,

    /// the CONNECT protocol name/level pair did not match MQTT 3.1 or 3.1.1.
    #[display(fmt = "unsupported protocol name or level")]
    UnsupportedProtocol,

    /// a QoS field on the wire carried the reserved value 3.
    #[display(fmt = "reserved QoS value 3 is not valid on the wire")]
    InvalidQoS,

    /// a packet of a recognized type failed a structural check not covered
    /// by the other variants (e.g. a SUBACK return code byte outside
    /// {0,1,2,0x80}).
    #[display(fmt = "malformed packet body")]
    MalformedBody,
}

impl std::error::Error for DecodeError {}
