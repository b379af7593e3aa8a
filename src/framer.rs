//! Reassembly of data frames from fragmented BLE notifications.
//!
//! The BMS splits every record over several notifications. [`Framer`] collects
//! them until a complete, checksum valid frame is available. Anything else
//! (acknowledgements, garbage, corrupted frames) is dropped silently: a frame
//! that cannot be trusted is never decoded and never raises an error.

use crate::protocol::{
    checksum, verify_checksum, ACKNOWLEDGE_MARKER, FRAME_LENGTHS, MAX_FRAME_LENGTH,
    START_OF_RECORD, TYPE_OFFSET,
};
use crate::Error;
use std::fmt;

const SHORT_FRAME_LENGTH: usize = FRAME_LENGTHS[0];

/// A complete data frame with a valid checksum, checksum byte included.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The record without its trailing checksum byte.
    pub fn body(&self) -> &[u8] {
        &self.0[..self.0.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn type_byte(&self) -> u8 {
        self.0[TYPE_OFFSET]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({} bytes: {:02X?})", self.0.len(), self.0)
    }
}

impl TryFrom<Vec<u8>> for Frame {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if !bytes.starts_with(&START_OF_RECORD) {
            return Err(Error::InvalidFrame("missing start of record marker"));
        }
        if !FRAME_LENGTHS.contains(&bytes.len()) {
            return Err(Error::InvalidFrame("unexpected length"));
        }
        if !verify_checksum(&bytes) {
            return Err(Error::InvalidFrame("checksum mismatch"));
        }
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    Empty,
    Accumulating,
}

/// Outcome of feeding one chunk to the [`Framer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// More chunks are needed.
    Pending,
    /// An acknowledgement frame was received and dropped.
    Acknowledged,
    /// The buffer did not start with the start of record marker and was dropped.
    Discarded,
    /// A frame of full length failed the checksum and was dropped.
    ChecksumMismatch,
    /// The buffer grew beyond the longest frame and was dropped.
    Overrun,
    /// A complete, valid frame.
    Complete(Frame),
}

impl FrameStatus {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            FrameStatus::Complete(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Accumulates notification chunks of one connection into frames.
///
/// There is no resynchronisation: a buffer that does not begin with the start
/// of record marker is dropped as a whole.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_LENGTH),
        }
    }

    pub fn state(&self) -> FramerState {
        if self.buffer.is_empty() {
            FramerState::Empty
        } else {
            FramerState::Accumulating
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Appends `chunk` and reports whether a frame is complete.
    pub fn push(&mut self, chunk: &[u8]) -> FrameStatus {
        log::trace!("Notification chunk ({} bytes): {:02X?}", chunk.len(), chunk);
        self.buffer.extend_from_slice(chunk);

        if self.buffer.starts_with(&ACKNOWLEDGE_MARKER) {
            log::debug!("Acknowledgement received");
            self.reset();
            return FrameStatus::Acknowledged;
        }

        if !self.buffer.starts_with(&START_OF_RECORD) {
            if self.is_marker_prefix() {
                return FrameStatus::Pending;
            }
            log::debug!(
                "No start of record marker, dropping {} byte(s)",
                self.buffer.len()
            );
            self.reset();
            return FrameStatus::Discarded;
        }

        if let Some(tail) = self.next_record_after_corrupt_short_frame() {
            log::warn!("Checksum mismatch at {SHORT_FRAME_LENGTH} bytes, dropping frame");
            self.reset();
            return match self.push(&tail) {
                FrameStatus::Complete(frame) => FrameStatus::Complete(frame),
                _ => FrameStatus::ChecksumMismatch,
            };
        }

        let len = self.buffer.len();
        if len > MAX_FRAME_LENGTH {
            log::warn!("Frame overrun at {len} bytes, dropping buffer");
            self.reset();
            return FrameStatus::Overrun;
        }
        if !FRAME_LENGTHS.contains(&len) {
            return FrameStatus::Pending;
        }

        if verify_checksum(&self.buffer) {
            let frame = Frame(std::mem::replace(
                &mut self.buffer,
                Vec::with_capacity(MAX_FRAME_LENGTH),
            ));
            log::debug!(
                "Frame complete: {} bytes, record type {}",
                frame.len(),
                frame.type_byte()
            );
            return FrameStatus::Complete(frame);
        }

        if len < MAX_FRAME_LENGTH {
            // may still be the head of a longer frame
            log::debug!("Checksum mismatch at {len} bytes, waiting for a longer frame");
            FrameStatus::Pending
        } else {
            log::warn!("Checksum mismatch at {len} bytes, dropping frame");
            self.reset();
            FrameStatus::ChecksumMismatch
        }
    }

    /// Bytes following a failed 300 byte head, if they open a new record.
    ///
    /// Such a head can no longer be the start of a 320 byte frame, so the
    /// framer continues with the new record instead of losing it too.
    fn next_record_after_corrupt_short_frame(&self) -> Option<Vec<u8>> {
        if self.buffer.len() < SHORT_FRAME_LENGTH + START_OF_RECORD.len() {
            return None;
        }
        let (head, tail) = self.buffer.split_at(SHORT_FRAME_LENGTH);
        if !(tail.starts_with(&START_OF_RECORD) || tail.starts_with(&ACKNOWLEDGE_MARKER)) {
            return None;
        }
        let (received, data) = head.split_last()?;
        (checksum(data) != *received).then(|| tail.to_vec())
    }

    /// A buffer shorter than a marker that could still become one.
    fn is_marker_prefix(&self) -> bool {
        self.buffer.len() < START_OF_RECORD.len()
            && (START_OF_RECORD.starts_with(&self.buffer)
                || ACKNOWLEDGE_MARKER.starts_with(&self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PAYLOAD_OFFSET;

    fn data_frame(len: usize, record_type: u8) -> Vec<u8> {
        let mut frame = vec![0; len];
        frame[..4].copy_from_slice(&START_OF_RECORD);
        frame[TYPE_OFFSET] = record_type;
        for (i, b) in frame.iter_mut().enumerate().take(len - 1).skip(PAYLOAD_OFFSET) {
            *b = (i * 7 % 251) as u8;
        }
        let crc = checksum(&frame[..len - 1]);
        frame[len - 1] = crc;
        frame
    }

    #[test]
    fn acknowledgement_is_dropped() {
        let mut framer = Framer::new();
        let mut chunk = ACKNOWLEDGE_MARKER.to_vec();
        chunk.extend_from_slice(&[0x55, 0xaa, 0xeb, 0x90, 0x02, 0x01]);
        assert_eq!(framer.push(&chunk), FrameStatus::Acknowledged);
        assert_eq!(framer.state(), FramerState::Empty);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn acknowledgement_split_over_chunks() {
        let mut framer = Framer::new();
        for b in &ACKNOWLEDGE_MARKER[..3] {
            assert_eq!(framer.push(&[*b]), FrameStatus::Pending);
        }
        assert_eq!(framer.push(&[ACKNOWLEDGE_MARKER[3], 0x01]), FrameStatus::Acknowledged);
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn garbage_is_discarded() {
        let mut framer = Framer::new();
        assert_eq!(framer.push(&[0x01, 0x02, 0x03]), FrameStatus::Discarded);
        assert_eq!(framer.state(), FramerState::Empty);

        // no resynchronisation on a marker later in the buffer
        let mut chunk = vec![0x00];
        chunk.extend_from_slice(&data_frame(300, 2));
        assert_eq!(framer.push(&chunk), FrameStatus::Discarded);
        assert_eq!(framer.buffered_len(), 0);

        assert_eq!(framer.push(&[0x55, 0xaa, 0x00]), FrameStatus::Discarded);
    }

    #[test]
    fn empty_chunk_keeps_state() {
        let mut framer = Framer::new();
        assert_eq!(framer.push(&[]), FrameStatus::Pending);
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn whole_frame_at_once() {
        let bytes = data_frame(300, 2);
        let mut framer = Framer::new();
        match framer.push(&bytes) {
            FrameStatus::Complete(frame) => {
                assert_eq!(frame.as_bytes(), bytes.as_slice());
                assert_eq!(frame.body(), &bytes[..299]);
                assert_eq!(frame.type_byte(), 2);
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn frame_one_byte_at_a_time() {
        let bytes = data_frame(300, 3);
        let mut framer = Framer::new();
        let mut frames = Vec::new();
        for b in &bytes {
            if let Some(frame) = framer.push(&[*b]).into_frame() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), bytes.as_slice());
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn long_frame_in_chunks() {
        let bytes = data_frame(320, 2);
        let mut framer = Framer::new();
        let statuses: Vec<FrameStatus> = bytes.chunks(64).map(|c| framer.push(c)).collect();
        assert!(statuses[..4].iter().all(|s| *s == FrameStatus::Pending));
        assert_eq!(
            statuses[4].clone().into_frame().map(Frame::into_bytes),
            Some(bytes)
        );
    }

    #[test]
    fn corrupted_long_frame_is_dropped() {
        let mut bytes = data_frame(320, 2);
        bytes[100] ^= 0x01;
        let mut framer = Framer::new();
        assert_eq!(framer.push(&bytes), FrameStatus::ChecksumMismatch);
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn corrupted_short_frame_never_completes() {
        let mut bytes = data_frame(300, 2);
        bytes[42] = bytes[42].wrapping_add(1);
        let mut framer = Framer::new();
        assert_eq!(framer.push(&bytes), FrameStatus::Pending);
        assert_eq!(framer.buffered_len(), 300);

        let mut tail = vec![0; 20];
        let mut all = bytes.clone();
        all.extend_from_slice(&tail[..19]);
        tail[19] = checksum(&all).wrapping_add(1);
        assert_eq!(framer.push(&tail), FrameStatus::ChecksumMismatch);
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn long_frame_in_notification_sized_chunks() {
        let bytes = data_frame(320, 2);
        let mut framer = Framer::new();
        let frames: Vec<Frame> = bytes
            .chunks(20)
            .filter_map(|c| framer.push(c).into_frame())
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), bytes.as_slice());
    }

    #[test]
    fn corrupted_short_frame_does_not_swallow_next_frame() {
        let mut corrupted = data_frame(300, 1);
        corrupted[100] ^= 0x01;
        let valid = data_frame(300, 2);

        let mut framer = Framer::new();
        assert_eq!(framer.push(&corrupted), FrameStatus::Pending);
        match framer.push(&valid) {
            FrameStatus::Complete(frame) => assert_eq!(frame.as_bytes(), valid.as_slice()),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(framer.state(), FramerState::Empty);

        let mut statuses = Vec::new();
        for chunk in corrupted.chunks(20).chain(valid.chunks(20)) {
            statuses.push(framer.push(chunk));
        }
        assert_eq!(statuses.len(), 30);
        assert_eq!(statuses[15], FrameStatus::ChecksumMismatch);
        assert!(statuses[16..29].iter().all(|s| *s == FrameStatus::Pending));
        assert_eq!(
            statuses[29].clone().into_frame().map(Frame::into_bytes),
            Some(valid)
        );
        assert_eq!(
            statuses.iter().filter(|s| matches!(s, FrameStatus::Complete(_))).count(),
            1
        );
    }

    #[test]
    fn corrupted_short_frame_followed_by_acknowledgement() {
        let mut corrupted = data_frame(300, 2);
        corrupted[7] ^= 0x10;
        let mut framer = Framer::new();
        assert_eq!(framer.push(&corrupted), FrameStatus::Pending);
        assert_eq!(framer.push(&ACKNOWLEDGE_MARKER), FrameStatus::ChecksumMismatch);
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn overrun_is_dropped() {
        let mut framer = Framer::new();
        let mut head = START_OF_RECORD.to_vec();
        head.resize(310, 0);
        assert_eq!(framer.push(&head), FrameStatus::Pending);
        assert_eq!(framer.push(&[0; 20]), FrameStatus::Overrun);
        assert_eq!(framer.state(), FramerState::Empty);
    }

    #[test]
    fn framer_recovers_after_drop() {
        let bytes = data_frame(300, 1);
        let mut framer = Framer::new();
        assert_eq!(framer.push(&[0xde, 0xad]), FrameStatus::Discarded);
        assert!(framer.push(&bytes).into_frame().is_some());
    }

    #[test]
    fn reset_and_replay() {
        let bytes = data_frame(300, 2);
        let mut framer = Framer::new();
        let first = framer.push(&bytes[..150]);
        assert_eq!(first, FrameStatus::Pending);
        framer.reset();
        assert_eq!(framer.state(), FramerState::Empty);
        let a = framer.push(&bytes).into_frame();
        let b = framer.push(&bytes).into_frame();
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn frame_try_from() {
        assert!(Frame::try_from(data_frame(300, 2)).is_ok());
        assert!(Frame::try_from(data_frame(320, 2)).is_ok());

        let mut bad = data_frame(300, 2);
        bad[299] = bad[299].wrapping_add(1);
        assert_eq!(
            Frame::try_from(bad),
            Err(Error::InvalidFrame("checksum mismatch"))
        );
        assert_eq!(
            Frame::try_from(vec![0x55, 0xaa, 0xeb, 0x90, 0x00]),
            Err(Error::InvalidFrame("unexpected length"))
        );
        assert_eq!(
            Frame::try_from(vec![0; 300]),
            Err(Error::InvalidFrame("missing start of record marker"))
        );
    }
}
