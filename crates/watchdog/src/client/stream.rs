//! Message stream utilities.

use pgward_types::messages::{DecodeError, Packet};

/// Message stream decoder.
///
/// Turns a byte stream into watchdog wire packets.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns [`None`] if a full frame
    /// is not buffered yet.
    pub fn decode_next(&mut self) -> Result<Option<Packet>, DecodeError> {
        match Packet::decode(self.unparsed.as_slice())? {
            Some((packet, used)) => {
                self.unparsed.drain(..used);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgward_types::messages::MessageType;

    #[test]
    fn decodes_frames_split_across_inputs() {
        let mut decoder = Decoder::new(64);
        let packet = Packet::minimal(MessageType::Accept, 42);
        let bytes = packet.encode();
        let (head, tail) = bytes.split_at(3);

        decoder.input(head);
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.input(tail);
        assert_eq!(decoder.decode_next().unwrap(), Some(packet));
        assert!(decoder.decode_next().unwrap().is_none());
    }
}
