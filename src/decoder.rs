use crate::framer::{FrameStatus, Framer};
use crate::record::{CellEncoding, Parser, Record};
use crate::Error;

/// Per connection decoder: notification chunks in, records out.
///
/// Combines a [`Framer`] with a [`Parser`]. Dropped input never surfaces as an
/// error, only a validated frame that fails to decode does.
#[derive(Debug, Default)]
pub struct Decoder {
    framer: Framer,
    parser: Parser,
}

impl Decoder {
    pub fn new(encoding: CellEncoding) -> Self {
        Self {
            framer: Framer::new(),
            parser: Parser::new(encoding),
        }
    }

    /// Feeds one notification chunk.
    ///
    /// Returns `None` while no complete frame is available.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Result<Record, Error>> {
        match self.framer.push(chunk) {
            FrameStatus::Complete(frame) => Some(self.parser.parse(&frame)),
            _ => None,
        }
    }

    /// Drops any partially received frame.
    pub fn reset(&mut self) {
        self.framer.reset();
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn encoding(&self) -> CellEncoding {
        self.parser.encoding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FramerState;
    use crate::protocol::{checksum, ACKNOWLEDGE_MARKER, START_OF_RECORD};
    use crate::record::Payload;

    fn extended_frame(sequence_number: u8) -> Vec<u8> {
        let mut bytes = START_OF_RECORD.to_vec();
        bytes.extend_from_slice(&[1, sequence_number]);
        bytes.resize(299, 0);
        bytes.push(checksum(&bytes));
        bytes
    }

    #[test]
    fn feed_chunks() {
        let mut decoder = Decoder::default();
        assert!(decoder.feed(&ACKNOWLEDGE_MARKER).is_none());

        let bytes = extended_frame(3);
        assert!(decoder.feed(&bytes[..20]).is_none());
        assert_eq!(decoder.framer().state(), FramerState::Accumulating);
        let record = decoder.feed(&bytes[20..]).unwrap().unwrap();
        assert_eq!(record.payload, Payload::Extended);
        assert_eq!(record.sequence_number, 3);
        assert_eq!(decoder.framer().state(), FramerState::Empty);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut decoder = Decoder::new(CellEncoding::FourByte);
        assert_eq!(decoder.encoding(), CellEncoding::FourByte);
        let bytes = extended_frame(1);
        assert!(decoder.feed(&bytes[..100]).is_none());
        decoder.reset();
        assert_eq!(decoder.framer().buffered_len(), 0);
        assert!(decoder.feed(&bytes).unwrap().is_ok());
    }

    #[test]
    fn invalid_record_surfaces() {
        let mut bytes = START_OF_RECORD.to_vec();
        bytes.extend_from_slice(&[3, 0]);
        bytes.resize(299, 0);
        bytes.push(checksum(&bytes));
        let mut decoder = Decoder::default();
        assert!(matches!(
            decoder.feed(&bytes),
            Some(Err(Error::InvalidInfoRecord { .. }))
        ));
    }
}
