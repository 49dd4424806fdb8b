use mqtt_core::MAX_REMAINING_LENGTH;

use crate::error::{Error, Result};

/// The byte-oriented duplex the engine writes control packets to and reads
/// them from. Implemented over TCP/TLS/WebSocket streams by the host
/// application; the engine never constructs a transport itself.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Writes `bytes` to the underlying connection.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Aborts the connection immediately (used on decode/timeout errors).
    async fn abort(&mut self);

    /// Closes the connection gracefully (used after writing DISCONNECT).
    async fn close(&mut self);
}

/// Reassembles MQTT Control Packets out of a byte stream that may deliver
/// them split across arbitrary read boundaries.
///
/// Bytes are appended to a rolling buffer; [`Accumulator::accept`] then
/// greedily decodes every complete packet currently buffered, invoking
/// `handler` with each one in order, and leaves any partial trailing packet
/// buffered for the next call. The handler is given the packet borrowed
/// from a short-lived frame buffer — callers that need to retain data
/// beyond the call (a topic, a payload) must copy it out immediately,
/// which is exactly what the engine's packet handlers do.
#[derive(Debug, Default)]
pub struct Accumulator {
    buf: Vec<u8>,
}

impl Accumulator {
    pub fn new() -> Self {
        Accumulator { buf: Vec::new() }
    }

    /// Appends `bytes` and decodes every complete packet now available,
    /// calling `handler` once per packet in wire order.
    ///
    /// A decode error other than "not enough bytes yet" is terminal: it is
    /// returned immediately and the accumulator's buffer is left as-is, for
    /// the caller to abort the transport.
    pub fn accept<F>(&mut self, bytes: &[u8], mut handler: F) -> Result<()>
    where
        F: FnMut(mqtt_core::Packet<'_>) -> Result<()>,
    {
        self.buf.extend_from_slice(bytes);

        let mut offset = 0;

        loop {
            match frame_len(&self.buf[offset..]) {
                FrameStatus::Incomplete => break,
                FrameStatus::Invalid => {
                    return Err(Error::Decode(mqtt_core::DecodeError::RemainingLengthTooLarge))
                }
                FrameStatus::Complete(len) => {
                    let (_, packet) = mqtt_core::parse(&self.buf[offset..offset + len])?;
                    handler(packet)?;
                    offset += len;
                }
            }
        }

        self.buf.drain(..offset);

        Ok(())
    }
}

enum FrameStatus {
    /// fewer than `1 + lenLen + remaining` bytes are buffered so far.
    Incomplete,
    /// the remaining-length field used more than 4 bytes or overflowed.
    Invalid,
    /// a full frame of this many bytes (including fixed header) is ready.
    Complete(usize),
}

fn frame_len(buf: &[u8]) -> FrameStatus {
    if buf.is_empty() {
        return FrameStatus::Incomplete;
    }

    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    let mut len_len = 0;

    for &byte in buf.iter().skip(1).take(4) {
        len_len += 1;
        remaining += usize::from(byte & 0x7F) * multiplier;
        multiplier *= 128;

        if byte & 0x80 == 0 {
            if remaining > MAX_REMAINING_LENGTH {
                return FrameStatus::Invalid;
            }

            let total = 1 + len_len + remaining;
            return if buf.len() >= total {
                FrameStatus::Complete(total)
            } else {
                FrameStatus::Incomplete
            };
        }
    }

    if len_len == 4 {
        FrameStatus::Invalid
    } else {
        FrameStatus::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(acc: &mut Accumulator, bytes: &[u8]) -> usize {
        let mut n = 0;
        acc.accept(bytes, |_packet| {
            n += 1;
            Ok(())
        })
        .unwrap();
        n
    }

    #[test]
    fn accumulator_waits_for_a_full_frame() {
        let mut acc = Accumulator::new();

        assert_eq!(count(&mut acc, b"\xc0"), 0, "fixed header alone is incomplete");
        assert_eq!(count(&mut acc, b"\x00"), 1);
    }

    #[test]
    fn accumulator_decodes_several_frames_from_one_chunk() {
        let mut acc = Accumulator::new();

        assert_eq!(count(&mut acc, b"\xc0\x00\xc0\x00\xe0\x00"), 3);
    }

    #[test]
    fn accumulator_splits_a_frame_across_two_chunks() {
        let mut acc = Accumulator::new();

        assert_eq!(count(&mut acc, b"\x30\x0b\x00\x05topic"), 0);
        assert_eq!(count(&mut acc, b"data"), 1);
    }
}
