/// Errors raised while decoding a single record.
///
/// Framing problems never show up here: the [`Framer`](crate::framer::Framer)
/// drops bad input on its own and only hands validated frames to the parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A field read ran past the end of the record.
    #[error("Truncated record - needed {needed} byte(s) at offset {offset}, {available} available")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// The info record ended before all of its fields were read.
    #[error("Invalid info record - payload exhausted while reading {field}")]
    InvalidInfoRecord { field: &'static str },
    /// Bytes handed to `Frame::try_from` are not a complete, valid data frame.
    #[error("Invalid frame - {0}")]
    InvalidFrame(&'static str),
}
