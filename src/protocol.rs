use crate::record::RecordType;

/// Start-of-record marker of every data frame sent by the BMS.
pub const START_OF_RECORD: [u8; 4] = [0x55, 0xaa, 0xeb, 0x90];
/// Header of outbound commands. The BMS echoes it back as an acknowledgement.
pub const COMMAND_HEADER: [u8; 4] = [0xaa, 0x55, 0x90, 0xeb];
/// Acknowledgement frames carry the command header and nothing of interest.
pub const ACKNOWLEDGE_MARKER: [u8; 4] = COMMAND_HEADER;

/// Data frames come in exactly these lengths, checksum byte included.
pub const FRAME_LENGTHS: [usize; 2] = [300, 320];
pub const MAX_FRAME_LENGTH: usize = 320;

/// Offset of the record type byte.
pub const TYPE_OFFSET: usize = 4;
/// Offset of the record sequence number, which directly follows the 5 byte header.
pub const SEQUENCE_OFFSET: usize = 5;
/// First byte of the type specific payload.
pub const PAYLOAD_OFFSET: usize = 6;

const COMMAND_LENGTH: usize = 20;

/// Additive checksum of the JK protocol.
///
/// Often called "CRC8" in protocol notes, it is a plain sum modulo 256.
pub fn checksum(buffer: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    for b in buffer {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

fn calc_checksum_and_set(buffer: &mut [u8]) {
    if let Some((last, data)) = buffer.split_last_mut() {
        *last = checksum(data);
    }
}

/// Returns `true` when the last byte of `buffer` is the checksum of all preceding bytes.
pub fn verify_checksum(buffer: &[u8]) -> bool {
    match buffer.split_last() {
        Some((received, data)) => {
            let calculated = checksum(data);
            if calculated != *received {
                log::debug!(
                    "Invalid checksum - calculated={:02X?} received={:02X?} length={}",
                    calculated,
                    received,
                    buffer.len()
                );
                return false;
            }
            true
        }
        None => false,
    }
}

/// Commands understood by the BMS over the `FFE1` characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Makes the BMS stream cell data records.
    GetCellInfo = 0x96,
    /// Makes the BMS answer with a device info record.
    GetInfo = 0x97,
}

impl Command {
    /// The 20 byte command frame: header, command byte, zero padding and checksum.
    pub fn request(self) -> [u8; COMMAND_LENGTH] {
        let mut tx_buffer = [0; COMMAND_LENGTH];
        tx_buffer[..COMMAND_HEADER.len()].copy_from_slice(&COMMAND_HEADER);
        tx_buffer[COMMAND_HEADER.len()] = self as u8;
        calc_checksum_and_set(&mut tx_buffer);
        tx_buffer
    }

    /// The record type the BMS answers this command with.
    pub fn expected_record(self) -> RecordType {
        match self {
            Command::GetCellInfo => RecordType::CellData,
            Command::GetInfo => RecordType::Info,
        }
    }
}
