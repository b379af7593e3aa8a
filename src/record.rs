//! Typed records decoded from validated frames.

use crate::decode::{round4, Cursor, Uptime};
use crate::framer::Frame;
use crate::protocol::{PAYLOAD_OFFSET, TYPE_OFFSET};
use crate::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const CELL_COUNT: usize = 24;
pub const RESISTANCE_COUNT: usize = 25;
/// Number of cell data fields whose meaning is not known.
pub const UNKNOWN_COUNT: usize = 29;

/// Record type byte at offset 4 of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum RecordType {
    Extended = 1,
    CellData = 2,
    Info = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::Extended),
            2 => Ok(RecordType::CellData),
            3 => Ok(RecordType::Info),
            other => Err(other),
        }
    }
}

/// Wire width of cell voltages and wire resistances in cell data records.
///
/// Both variants share the record type byte, so the encoding is a property of
/// the device firmware and has to be configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CellEncoding {
    /// Little endian `i16` millivolts / milliohms.
    #[default]
    TwoByte,
    /// The proprietary 4 byte encoding, see [`crate::decode::decode_jk_float`].
    FourByte,
}

/// Decoding strategy resolved once from the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Info,
    Extended,
    CellData2Byte,
    CellData4Byte,
    Unrecognized(u8),
}

impl RecordLayout {
    pub fn resolve(type_byte: u8, encoding: CellEncoding) -> Self {
        match (RecordType::try_from(type_byte), encoding) {
            (Ok(RecordType::Info), _) => RecordLayout::Info,
            (Ok(RecordType::Extended), _) => RecordLayout::Extended,
            (Ok(RecordType::CellData), CellEncoding::TwoByte) => RecordLayout::CellData2Byte,
            (Ok(RecordType::CellData), CellEncoding::FourByte) => RecordLayout::CellData4Byte,
            (Err(other), _) => RecordLayout::Unrecognized(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Record {
    pub sequence_number: u8,
    pub payload: Payload,
}

impl Record {
    pub fn record_type(&self) -> Option<RecordType> {
        match self.payload {
            Payload::Info(_) => Some(RecordType::Info),
            Payload::Extended => Some(RecordType::Extended),
            Payload::CellData(_) => Some(RecordType::CellData),
            Payload::Unrecognized(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Payload {
    Info(Info),
    /// Nothing beyond the header is known about extended records.
    Extended,
    CellData(CellData),
    /// A record type this decoder does not know, with its type byte.
    Unrecognized(u8),
}

/// Device information, answer to [`crate::protocol::Command::GetInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Info {
    pub vendor_id: String,
    pub hardware_version: String,
    pub software_version: String,
    pub uptime: Uptime,
    pub power_up_count: u8,
    pub device_name: String,
    #[cfg_attr(feature = "serde", serde(skip_serializing, default))]
    pub pass_code: String,
}

impl Info {
    /// Publishable fields. The pass code is left out.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("VendorID", self.vendor_id.clone()),
            ("HardwareVersion", self.hardware_version.clone()),
            ("SoftwareVersion", self.software_version.clone()),
            ("DeviceName", self.device_name.clone()),
            ("Uptime", self.uptime.to_string()),
            ("PowerUpTimes", self.power_up_count.to_string()),
        ]
    }
}

/// Cell and pack measurements, answer to [`crate::protocol::Command::GetCellInfo`].
///
/// Voltages are in V, resistances in Ω, currents in A, power in W,
/// temperatures in °C and capacities in Ah.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellData {
    pub encoding: CellEncoding,
    pub cell_voltages: Vec<f64>,
    pub wire_resistances: Vec<f64>,
    pub total_voltage: f64,
    pub cell_high: f64,
    pub cell_low: f64,
    pub cell_diff: f64,
    /// Only sent by the 2 byte layout, like the three fields below.
    pub average_cell_voltage: Option<f64>,
    pub delta_cell_voltage: Option<f64>,
    pub balancer_current: Option<f64>,
    pub pack_voltage: f64,
    pub pack_power: f64,
    pub balance_current: f64,
    pub temperature_1: f64,
    pub temperature_2: f64,
    pub mos_temperature: f64,
    pub state_of_charge: u8,
    pub remaining_capacity: f64,
    pub nominal_capacity: f64,
    pub cycle_count: u32,
    pub cycle_capacity: f64,
    pub uptime: Uptime,
    /// Meaning unconfirmed.
    pub charge: f64,
    /// Meaning unconfirmed.
    pub discharge: f64,
    /// `unknown_1` to `unknown_29` in wire order. The 4 byte layout has no
    /// `unknown_1` and `unknown_2`.
    pub unknown: Vec<Option<f64>>,
}

impl CellData {
    /// Field name to value mapping, every value rounded to 4 decimals.
    ///
    /// Fields the layout does not carry are left out. So is the uptime, see
    /// [`CellData::text_fields`].
    pub fn fields(&self) -> Vec<(String, f64)> {
        let mut fields = Vec::with_capacity(CELL_COUNT + RESISTANCE_COUNT + UNKNOWN_COUNT + 24);
        for (n, volt) in self.cell_voltages.iter().enumerate() {
            fields.push((format!("B{}", n + 1), *volt));
        }
        for (n, resistance) in self.wire_resistances.iter().enumerate() {
            fields.push((format!("R{}", n + 1), *resistance));
        }
        let scalars = [
            ("Total", Some(self.total_voltage)),
            ("Cell_High", Some(self.cell_high)),
            ("Cell_Low", Some(self.cell_low)),
            ("Cell_Diff", Some(self.cell_diff)),
            ("Cell_Avg", self.average_cell_voltage),
            ("Cell_Delta", self.delta_cell_voltage),
            ("Balancer_Current", self.balancer_current),
            ("Pack_Voltage", Some(self.pack_voltage)),
            ("Pack_Power", Some(self.pack_power)),
            ("Balance_Current", Some(self.balance_current)),
            ("T1", Some(self.temperature_1)),
            ("T2", Some(self.temperature_2)),
            ("T_MOS", Some(self.mos_temperature)),
            ("SOC", Some(f64::from(self.state_of_charge))),
            ("Capacity_Remaining", Some(self.remaining_capacity)),
            ("Capacity_Nominal", Some(self.nominal_capacity)),
            ("Cycle_Count", Some(f64::from(self.cycle_count))),
            ("Cycle_Capacity", Some(self.cycle_capacity)),
            ("Charge", Some(self.charge)),
            ("Discharge", Some(self.discharge)),
        ];
        fields.extend(
            scalars
                .iter()
                .filter_map(|(name, value)| value.map(|value| (name.to_string(), value))),
        );
        for (n, value) in self.unknown.iter().enumerate() {
            if let Some(value) = value {
                fields.push((format!("unknown_{}", n + 1), *value));
            }
        }
        for (_, value) in fields.iter_mut() {
            *value = round4(*value);
        }
        fields
    }

    /// [`CellData::fields`] formatted for text outputs, with the uptime
    /// following `Cycle_Capacity` as `1D2H3M4S`.
    pub fn text_fields(&self) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = self
            .fields()
            .into_iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
        let at = fields
            .iter()
            .position(|(name, _)| name == "Cycle_Capacity")
            .map_or(fields.len(), |n| n + 1);
        fields.insert(at, ("Uptime".to_string(), self.uptime.to_string()));
        fields
    }
}

/// Turns frames into records.
///
/// The parser itself is stateless; all connection state lives in the
/// [`Framer`](crate::framer::Framer).
#[derive(Debug, Clone, Copy, Default)]
pub struct Parser {
    encoding: CellEncoding,
}

impl Parser {
    pub fn new(encoding: CellEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> CellEncoding {
        self.encoding
    }

    pub fn parse(&self, frame: &Frame) -> Result<Record, Error> {
        self.parse_bytes(frame.body())
    }

    /// Decodes a record without its checksum byte. The start of record marker is not checked.
    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<Record, Error> {
        let mut cursor = Cursor::at(bytes, TYPE_OFFSET);
        let type_byte = cursor.read_u8()?;
        let sequence_number = cursor.read_u8()?;
        debug_assert_eq!(cursor.position(), PAYLOAD_OFFSET);

        let layout = RecordLayout::resolve(type_byte, self.encoding);
        log::debug!(
            "Record #{sequence_number}: {layout:?}, {} byte(s)",
            bytes.len()
        );

        let payload = match layout {
            RecordLayout::Info => Payload::Info(decode_info(&mut cursor)?),
            RecordLayout::Extended => Payload::Extended,
            RecordLayout::CellData2Byte => {
                Payload::CellData(decode_cell_data(&mut cursor, CellEncoding::TwoByte)?)
            }
            RecordLayout::CellData4Byte => {
                Payload::CellData(decode_cell_data(&mut cursor, CellEncoding::FourByte)?)
            }
            RecordLayout::Unrecognized(type_byte) => {
                log::debug!("Unknown record type {type_byte}");
                Payload::Unrecognized(type_byte)
            }
        };
        Ok(Record {
            sequence_number,
            payload,
        })
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Skips padding in front of `field` and fails if nothing is left.
fn field_start(cursor: &mut Cursor<'_>, field: &'static str) -> Result<(), Error> {
    cursor.skip_nul_padding();
    if cursor.is_empty() {
        return Err(Error::InvalidInfoRecord { field });
    }
    Ok(())
}

fn decode_info(cursor: &mut Cursor<'_>) -> Result<Info, Error> {
    let vendor_id = text(cursor.take_until_nul());

    field_start(cursor, "hardware version")?;
    let hardware_version = text(cursor.take_until_nul());

    field_start(cursor, "software version")?;
    let software_version = text(cursor.take_until_nul());

    // variable length, ends at the first zero byte
    field_start(cursor, "uptime")?;
    let uptime = Uptime::from_le_bytes(cursor.take_until_nul());

    field_start(cursor, "power up count")?;
    let power_up_count = cursor.read_u8()?;

    field_start(cursor, "device name")?;
    let device_name = text(cursor.take_until_nul());

    field_start(cursor, "pass code")?;
    let pass_code = text(cursor.take_until_nul());

    log::debug!(
        "Info: vendor={vendor_id} hardware={hardware_version} software={software_version} \
         name={device_name} uptime={uptime} power_up_count={power_up_count}"
    );
    Ok(Info {
        vendor_id,
        hardware_version,
        software_version,
        uptime,
        power_up_count,
        device_name,
        pass_code,
    })
}

fn read_cell_value(cursor: &mut Cursor<'_>, encoding: CellEncoding) -> Result<f64, Error> {
    match encoding {
        CellEncoding::TwoByte => milli_i16(cursor),
        CellEncoding::FourByte => cursor.read_jk_float(),
    }
}

fn milli_i16(cursor: &mut Cursor<'_>) -> Result<f64, Error> {
    Ok(f64::from(cursor.read_i16()?) / 1000.0)
}

fn deci_i16(cursor: &mut Cursor<'_>) -> Result<f64, Error> {
    Ok(f64::from(cursor.read_i16()?) / 10.0)
}

fn milli_u32(cursor: &mut Cursor<'_>) -> Result<f64, Error> {
    Ok(f64::from(cursor.read_u32()?) / 1000.0)
}

fn milli_i32(cursor: &mut Cursor<'_>) -> Result<f64, Error> {
    Ok(f64::from(cursor.read_i32()?) / 1000.0)
}

fn read_unknown(
    cursor: &mut Cursor<'_>,
    unknown: &mut Vec<Option<f64>>,
    count: usize,
) -> Result<(), Error> {
    for _ in 0..count {
        unknown.push(Some(milli_i16(cursor)?));
    }
    Ok(())
}

/// Sum over all cells, highest and lowest of the cells reporting a non-zero value.
fn aggregate(voltages: &[f64]) -> (f64, f64, f64) {
    let total: f64 = voltages.iter().sum();
    let mut present = voltages.iter().copied().filter(|v| *v != 0.0);
    match present.next() {
        Some(first) => {
            let (high, low) = present.fold((first, first), |(high, low), v| {
                (high.max(v), low.min(v))
            });
            (total, high, low)
        }
        None => (total, 0.0, 0.0),
    }
}

fn decode_cell_data(cursor: &mut Cursor<'_>, encoding: CellEncoding) -> Result<CellData, Error> {
    let mut cell_voltages = Vec::with_capacity(CELL_COUNT);
    for n_cell in 1..=CELL_COUNT {
        let volt = read_cell_value(cursor, encoding)?;
        log::trace!("Cell #{} volt={:.4}", n_cell, volt);
        cell_voltages.push(volt);
    }

    let mut unknown = Vec::with_capacity(UNKNOWN_COUNT);
    let (average_cell_voltage, delta_cell_voltage, balancer_current) = match encoding {
        CellEncoding::TwoByte => {
            read_unknown(cursor, &mut unknown, 2)?;
            (
                Some(milli_i16(cursor)?),
                Some(milli_i16(cursor)?),
                Some(milli_i16(cursor)?),
            )
        }
        // resistances follow the cells directly
        CellEncoding::FourByte => {
            unknown.extend([None, None]);
            (None, None, None)
        }
    };

    let mut wire_resistances = Vec::with_capacity(RESISTANCE_COUNT);
    for n_cell in 1..=RESISTANCE_COUNT {
        let resistance = read_cell_value(cursor, encoding)?;
        log::trace!("Cell #{} resistance={:.4}", n_cell, resistance);
        wire_resistances.push(resistance);
    }

    read_unknown(cursor, &mut unknown, 3)?;
    let pack_voltage = milli_u32(cursor)?;
    let pack_power = milli_u32(cursor)?;
    let balance_current = milli_i32(cursor)?;
    let temperature_1 = deci_i16(cursor)?;
    let temperature_2 = deci_i16(cursor)?;
    let mos_temperature = deci_i16(cursor)?;
    read_unknown(cursor, &mut unknown, 2)?;
    unknown.push(Some(f64::from(cursor.read_u8()?) / 1000.0));
    let state_of_charge = cursor.read_u8()?;
    let remaining_capacity = milli_u32(cursor)?;
    let nominal_capacity = milli_u32(cursor)?;
    let cycle_count = cursor.read_u32()?;
    let cycle_capacity = milli_u32(cursor)?;
    read_unknown(cursor, &mut unknown, 2)?;
    let uptime = cursor.read_uptime()?;
    read_unknown(cursor, &mut unknown, 12)?;
    let charge = milli_i16(cursor)?;
    let discharge = milli_i16(cursor)?;
    read_unknown(cursor, &mut unknown, 7)?;
    debug_assert_eq!(unknown.len(), UNKNOWN_COUNT);

    let (total_voltage, cell_high, cell_low) = aggregate(&cell_voltages);
    log::debug!(
        "Cell data: total={total_voltage:.4} high={cell_high:.4} low={cell_low:.4} \
         pack={pack_voltage} soc={state_of_charge} uptime={uptime}, {} byte(s) ignored",
        cursor.remaining()
    );

    Ok(CellData {
        encoding,
        cell_voltages,
        wire_resistances,
        total_voltage,
        cell_high,
        cell_low,
        cell_diff: cell_high - cell_low,
        average_cell_voltage,
        delta_cell_voltage,
        balancer_current,
        pack_voltage,
        pack_power,
        balance_current,
        temperature_1,
        temperature_2,
        mos_temperature,
        state_of_charge,
        remaining_capacity,
        nominal_capacity,
        cycle_count,
        cycle_capacity,
        uptime,
        charge,
        discharge,
        unknown,
    })
}
