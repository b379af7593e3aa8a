//! Field level decoders for the JK BMS byte layout.
//!
//! All multi-byte integers on the wire are little endian. Cell voltages and wire
//! resistances of older firmware use a proprietary 4 byte encoding, see
//! [`decode_jk_float`].

use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const SECONDS_PER_HOUR: u64 = 60 * 60;
const SECONDS_PER_MINUTE: u64 = 60;

/// Rounds to the 4 decimals published for every measurement.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn nibbles(byte: u8) -> (u8, u8) {
    (byte >> 4, byte & 0x0f)
}

/// Decodes the proprietary 4 byte voltage/resistance encoding.
///
/// Byte 3 carries a coarse power of four, bytes 2..0 add nibble sized
/// fractions of it. A zero byte 3 means "no reading".
pub fn decode_jk_float(bytes: [u8; 4]) -> f64 {
    let [b0, b1, b2, b3] = bytes;
    if b3 == 0 {
        return 0.0;
    }
    let exponent = (i32::from(b3) - 0x40) * 2;
    let mut value = 2f64.powi(exponent) * 2.0;

    let step1 = value / 8.0;
    let step2 = value / 128.0;
    let step3 = value / 2048.0;
    let step4 = value / 32768.0;
    let step5 = value / 524288.0;
    let step6 = value / 8388608.0;

    let (high, low) = nibbles(b2);
    if high & 0x08 != 0 {
        value += f64::from(high - 8) * step1 * 2.0 + 8.0 * step1 + f64::from(low) * step2;
    } else {
        value += f64::from(high) * step1 + f64::from(low) * step2;
    }

    let (high, low) = nibbles(b1);
    value += f64::from(high) * step3 + f64::from(low) * step4;

    let (high, low) = nibbles(b0);
    value += f64::from(high) * step5 + f64::from(low) * step6;

    log::trace!("decode_jk_float: {:02X?} -> {}", bytes, value);
    value
}

/// Time since the BMS was powered up, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Uptime(pub u64);

impl Uptime {
    /// Sums `byte[i] * 256^i`. Bytes beyond the eighth do not fit and are ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut value: u64 = 0;
        for (position, b) in bytes.iter().enumerate() {
            if position >= 8 {
                log::warn!(
                    "Uptime wider than 8 bytes, ignoring {} byte(s)",
                    bytes.len() - position
                );
                break;
            }
            value |= u64::from(*b) << (8 * position);
        }
        Self(value)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn days(&self) -> u64 {
        self.0 / SECONDS_PER_DAY
    }

    pub fn hours(&self) -> u64 {
        self.0 % SECONDS_PER_DAY / SECONDS_PER_HOUR
    }

    pub fn minutes(&self) -> u64 {
        self.0 % SECONDS_PER_HOUR / SECONDS_PER_MINUTE
    }

    pub fn seconds(&self) -> u64 {
        self.0 % SECONDS_PER_MINUTE
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}D{}H{}M{}S",
            self.days(),
            self.hours(),
            self.minutes(),
            self.seconds()
        )
    }
}

/// Read cursor over an immutable record.
///
/// Every read is bounds checked and fails with [`Error::TruncatedRecord`]
/// instead of reading past the end of the slice.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// A cursor starting at `position`, which may lie beyond the end.
    pub fn at(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.position)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.position).copied()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(Error::TruncatedRecord {
                offset: self.position,
                needed: n,
                available: self.remaining(),
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, Error> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn read_jk_float(&mut self) -> Result<f64, Error> {
        Ok(decode_jk_float(self.array()?))
    }

    /// Reads the 3 byte packed uptime of cell data records.
    pub fn read_uptime(&mut self) -> Result<Uptime, Error> {
        Ok(Uptime::from_le_bytes(self.take(3)?))
    }

    /// Consumes bytes up to and including the next zero byte and returns them
    /// without the terminator. Stops at the end of the record if there is none.
    pub fn take_until_nul(&mut self) -> &'a [u8] {
        let rest = self.bytes.get(self.position..).unwrap_or_default();
        match rest.iter().position(|b| *b == 0) {
            Some(n) => {
                self.position += n + 1;
                &rest[..n]
            }
            None => {
                self.position += rest.len();
                rest
            }
        }
    }

    /// Consumes consecutive zero bytes and returns how many were skipped.
    pub fn skip_nul_padding(&mut self) -> usize {
        let mut skipped = 0;
        while self.peek() == Some(0) {
            self.position += 1;
            skipped += 1;
        }
        skipped
    }
}
