use crate::Error;
use chrono::{DateTime, Utc};
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

const START_OF_FRAME: char = '~';
pub const END_OF_FRAME: u8 = b'\r';
const VERSION: &str = "20";
const CID1: &str = "46";
const REQUEST_LENGTH: &str = "E002";
const CHECKSUM_LENGTH: usize = 4;
// VER + ADR + CID1 + CID2 + LENGTH
const INFO_OFFSET: usize = 12;
// DATAFLAG and command group in front of every INFO block
const INFO_DATA_OFFSET: usize = 4;

/// Address of one battery pack on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize), serde(transparent))]
pub struct Address(u8);

impl Address {
    pub const MAX: u8 = 15;

    pub fn new(address: u8) -> Result<Self, Error> {
        if address > Self::MAX {
            return Err(Error::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    /// Every address a pack can be configured to, in ascending order.
    pub fn all() -> impl Iterator<Item = Address> {
        (0..=Self::MAX).map(Address)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(address: u8) -> Result<Self, Self::Error> {
        Self::new(address)
    }
}

// The wire protocol puts the decimal digits into the hex coded ADR field.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Command {
    Telemetry,
    Alarm,
}

impl Command {
    /// The CID2 code of the request.
    pub fn code(self) -> &'static str {
        match self {
            Command::Telemetry => "42",
            Command::Alarm => "44",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Telemetry => write!(f, "telemetry"),
            Command::Alarm => write!(f, "alarm"),
        }
    }
}

/// Calculates the frame checksum over everything between `~` and the checksum field.
///
/// The 16 bit complement of the sum is incremented without wrapping, so a sum of zero
/// modulo 0x10000 yields the five digit `10000`.
pub fn checksum(payload: &str) -> String {
    let sum = payload
        .bytes()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(b)));
    format!("{:X}", u32::from(!sum) + 1)
}

pub fn verify_checksum(payload: &str, received: &str) -> bool {
    checksum(payload) == received
}

/// Builds the request frame for `command`, including the `~` and `\r` delimiters.
pub fn encode_request(address: Address, command: Command) -> String {
    let payload = format!(
        "{VERSION}{address}{CID1}{}{REQUEST_LENGTH}{address}",
        command.code()
    );
    let checksum = checksum(&payload);
    format!("{START_OF_FRAME}{payload}{checksum}{}", END_OF_FRAME as char)
}

/// Header fields and INFO block of a response whose checksum was verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    /// Address reported by the responding pack, hex decoded.
    pub address: u8,
    pub cid2: &'a str,
    pub info: &'a str,
}

/// Validates a response line and splits it into header fields and INFO.
pub fn decode_response(line: &str) -> Result<ParsedFrame<'_>, Error> {
    if !line.is_ascii() {
        log::warn!("Non ASCII response - line={line:?}");
        return Err(Error::InvalidFrame(line.to_string()));
    }
    let frame = match line.find(START_OF_FRAME) {
        Some(start) => {
            if start > 0 {
                log::trace!("Skip {start} bytes in front of the frame");
            }
            &line[start + 1..]
        }
        None => line,
    };
    let frame = frame.trim_end_matches(END_OF_FRAME as char);
    if frame.len() < CHECKSUM_LENGTH {
        log::warn!("Response too short - line={line:?}");
        return Err(Error::InvalidFrame(line.to_string()));
    }

    let (payload, received) = frame.split_at(frame.len() - CHECKSUM_LENGTH);
    let calculated = checksum(payload);
    if calculated != received {
        log::warn!("Invalid checksum - calculated={calculated} received={received} frame={frame:?}");
        return Err(Error::ChecksumMismatch {
            calculated,
            received: received.to_string(),
        });
    }
    if payload.len() < INFO_OFFSET {
        log::warn!("Response header incomplete - frame={frame:?}");
        return Err(Error::InvalidFrame(line.to_string()));
    }

    let address = u8::from_str_radix(&payload[2..4], 16)
        .map_err(|_| Error::InvalidFrame(line.to_string()))?;
    Ok(ParsedFrame {
        address,
        cid2: &payload[6..8],
        info: &payload[INFO_OFFSET..],
    })
}

/// Reads fixed width hex fields from an INFO block.
struct InfoReader<'a> {
    info: &'a str,
    position: usize,
}

impl<'a> InfoReader<'a> {
    fn new(info: &'a str) -> Self {
        Self {
            info,
            position: INFO_DATA_OFFSET,
        }
    }

    fn read(&mut self, width: usize, field: &'static str) -> Result<u16, Error> {
        let raw = self
            .info
            .get(self.position..self.position + width)
            .filter(|raw| raw.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or(Error::MalformedPayload(field))?;
        let value = u16::from_str_radix(raw, 16).map_err(|_| Error::MalformedPayload(field))?;
        self.position += width;
        Ok(value)
    }

    fn byte(&mut self, field: &'static str) -> Result<u8, Error> {
        self.read(2, field).map(|value| value as u8)
    }

    fn word(&mut self, field: &'static str) -> Result<u16, Error> {
        self.read(4, field)
    }

    fn bytes<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], Error> {
        let mut result = [0; N];
        for value in result.iter_mut() {
            *value = self.byte(field)?;
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub cells: u8,
    pub cell_voltages: Vec<u16>, // mV
    pub temperature_sensors: u8,
    pub temperatures: Vec<f32>,
    pub current: f32, // negative=discharging, positive=charging
    pub voltage: f32,
    pub residual_capacity: f32,
    pub custom: u8,
    pub capacity: f32,
    pub soc_percent: f32,
    pub rated_capacity: f32,
    pub cycles: u16,
    pub soh_percent: f32,
    pub port_voltage: f32,
}

impl TelemetrySample {
    pub fn request(address: Address) -> String {
        encode_request(address, Command::Telemetry)
    }

    pub fn decode(info: &str) -> Result<Self, Error> {
        let mut reader = InfoReader::new(info);
        let cells = reader.byte("cells")?;
        let cell_voltages = (0..cells)
            .map(|_| reader.word("cell_voltages"))
            .collect::<Result<Vec<_>, _>>()?;
        let temperature_sensors = reader.byte("temperature_sensors")?;
        // Temperatures are transmitted in 0.1 K
        let temperatures = (0..temperature_sensors)
            .map(|_| {
                reader
                    .word("temperatures")
                    .map(|raw| (i32::from(raw) - 2731) as f32 / 10.0)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            timestamp: Utc::now(),
            cells,
            cell_voltages,
            temperature_sensors,
            temperatures,
            current: reader.word("current")? as i16 as f32 / 100.0,
            voltage: reader.word("voltage")? as f32 / 100.0,
            residual_capacity: reader.word("residual_capacity")? as f32 / 100.0,
            custom: reader.byte("custom")?,
            capacity: reader.word("capacity")? as f32 / 100.0,
            soc_percent: reader.word("soc")? as f32 / 10.0,
            rated_capacity: reader.word("rated_capacity")? as f32 / 100.0,
            cycles: reader.word("cycles")?,
            soh_percent: reader.word("soh")? as f32 / 10.0,
            port_voltage: reader.word("port_voltage")? as f32 / 100.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct AlarmSample {
    pub timestamp: DateTime<Utc>,
    pub cells: u8,
    pub cell_alarms: Vec<u8>,
    pub temperature_sensors: u8,
    pub temperature_alarms: Vec<u8>,
    pub current_alarm: u8,
    pub voltage_alarm: u8,
    pub custom_alarm: u8,
    pub alarm_events: [u8; 8],
    pub on_off_state: u8,
    pub equilibrium_states: [u8; 2],
    pub system_state: u8,
    pub disconnection_states: [u8; 2],
}

impl AlarmSample {
    pub fn request(address: Address) -> String {
        encode_request(address, Command::Alarm)
    }

    pub fn decode(info: &str) -> Result<Self, Error> {
        let mut reader = InfoReader::new(info);
        let cells = reader.byte("cells")?;
        let cell_alarms = (0..cells)
            .map(|_| reader.byte("cell_alarms"))
            .collect::<Result<Vec<_>, _>>()?;
        let temperature_sensors = reader.byte("temperature_sensors")?;
        let temperature_alarms = (0..temperature_sensors)
            .map(|_| reader.byte("temperature_alarms"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            timestamp: Utc::now(),
            cells,
            cell_alarms,
            temperature_sensors,
            temperature_alarms,
            current_alarm: reader.byte("current_alarm")?,
            voltage_alarm: reader.byte("voltage_alarm")?,
            custom_alarm: reader.byte("custom_alarm")?,
            alarm_events: reader.bytes("alarm_events")?,
            on_off_state: reader.byte("on_off_state")?,
            equilibrium_states: reader.bytes("equilibrium_states")?,
            system_state: reader.byte("system_state")?,
            disconnection_states: reader.bytes("disconnection_states")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TELEMETRY_INFO: &str = concat!(
        "0001", "02", "0CE4", "0CE5", "02", "0AAB", "0E93", "FF9C", "1482", "2710", "0A", "2710",
        "03E8", "2710", "0010", "03E8", "1482"
    );

    const ALARM_INFO: &str = concat!(
        "0001", "02", "00", "01", "01", "02", "00", "03", "14", "0102030405060708", "0A", "0B0C",
        "0D", "0E0F"
    );

    fn response(address: u8, cid2: &str, info: &str) -> String {
        let payload = format!("20{address:02X}46{cid2}{:04X}{info}", info.len());
        format!("~{payload}{}", checksum(&payload))
    }

    #[test]
    fn checksum_of_known_payloads() {
        assert_eq!(checksum("2000464200E0020"), "FD07");
        assert!(verify_checksum("2000464200E0020", "FD07"));
        assert!(!verify_checksum("2000464200E0020", "fd07"));
        assert_ne!(checksum("2000464200E0021"), "FD07");
    }

    #[test]
    fn checksum_is_not_padded() {
        assert_eq!(checksum("\u{01}"), "FFFF");
        let payload = "z".repeat(537) + "\u{07}";
        assert_eq!(checksum(&payload), "F");
    }

    #[test]
    fn checksum_of_zero_sum() {
        assert_eq!(checksum(""), "10000");
        assert_eq!(checksum(&"@".repeat(1024)), "10000");
    }

    #[test]
    fn encode_known_requests() {
        let address = Address::new(0).unwrap();
        assert_eq!(TelemetrySample::request(address), "~20004642E00200FD37\r");
        assert_eq!(AlarmSample::request(address), "~20004644E00200FD35\r");
    }

    #[test]
    fn address_rendered_as_decimal_digits() {
        let request = encode_request(Address::new(12).unwrap(), Command::Telemetry);
        assert!(request.starts_with("~20124642E00212"));
        let payload = &request[1..request.len() - 5];
        assert!(verify_checksum(payload, &request[request.len() - 5..request.len() - 1]));
    }

    #[test]
    fn address_range() {
        assert_eq!(Address::all().count(), 16);
        assert_eq!(Address::new(7).unwrap().to_string(), "07");
        assert!(matches!(Address::new(16), Err(Error::InvalidAddress(16))));
        assert!(Address::try_from(15).is_ok());
    }

    #[test]
    fn decode_response_recovers_address() {
        for address in Address::all() {
            for command in [Command::Telemetry, Command::Alarm] {
                let line = response(address.value(), command.code(), TELEMETRY_INFO);
                let frame = decode_response(&line).unwrap();
                assert_eq!(frame.address, address.value());
                assert_eq!(frame.cid2, command.code());
                assert_eq!(frame.info, TELEMETRY_INFO);
            }
        }
    }

    #[test]
    fn decode_response_accepts_trailing_delimiter() {
        let line = response(3, "00", ALARM_INFO) + "\r";
        assert_eq!(decode_response(&line).unwrap().address, 3);
    }

    #[test]
    fn decode_response_rejects_bad_checksum() {
        let mut line = response(1, "00", TELEMETRY_INFO);
        line.replace_range(20..21, "F");
        assert!(matches!(
            decode_response(&line),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn decode_response_rejects_short_frames() {
        assert!(matches!(decode_response("~12"), Err(Error::InvalidFrame(_))));
        let payload = "2001";
        let line = format!("~{payload}{}", checksum(payload));
        assert!(matches!(decode_response(&line), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn decode_telemetry() {
        let sample = TelemetrySample::decode(TELEMETRY_INFO).unwrap();
        assert_eq!(sample.cells, 2);
        assert_eq!(sample.cell_voltages, vec![3300, 3301]);
        assert_eq!(sample.temperature_sensors, 2);
        assert_eq!(sample.temperatures, vec![0.0, 100.0]);
        assert_eq!(sample.current, -1.0);
        assert_eq!(sample.voltage, 52.5);
        assert_eq!(sample.residual_capacity, 100.0);
        assert_eq!(sample.custom, 10);
        assert_eq!(sample.capacity, 100.0);
        assert_eq!(sample.soc_percent, 100.0);
        assert_eq!(sample.rated_capacity, 100.0);
        assert_eq!(sample.cycles, 16);
        assert_eq!(sample.soh_percent, 100.0);
        assert_eq!(sample.port_voltage, 52.5);
    }

    #[test]
    fn decode_telemetry_cell_order() {
        let mut info = String::from("000110");
        for cell in 0..16u16 {
            info.push_str(&format!("{:04X}", 3200 + cell));
        }
        info.push_str("00");
        info.push_str(&"0000".repeat(3));
        info.push_str("00");
        info.push_str(&"0000".repeat(6));
        let sample = TelemetrySample::decode(&info).unwrap();
        assert_eq!(sample.cells, 16);
        assert_eq!(sample.cell_voltages, (3200..3216).collect::<Vec<u16>>());
        assert!(sample.temperatures.is_empty());
    }

    #[test]
    fn decode_telemetry_truncated() {
        let info = &TELEMETRY_INFO[..TELEMETRY_INFO.len() - 2];
        assert!(matches!(
            TelemetrySample::decode(info),
            Err(Error::MalformedPayload("port_voltage"))
        ));
    }

    #[test]
    fn decode_telemetry_not_hex() {
        let info = TELEMETRY_INFO.replacen("0CE5", "0CXZ", 1);
        assert!(matches!(
            TelemetrySample::decode(&info),
            Err(Error::MalformedPayload("cell_voltages"))
        ));
    }

    #[test]
    fn decode_alarm() {
        let sample = AlarmSample::decode(ALARM_INFO).unwrap();
        assert_eq!(sample.cell_alarms, vec![0, 1]);
        assert_eq!(sample.temperature_sensors, 1);
        assert_eq!(sample.temperature_alarms, vec![2]);
        assert_eq!(sample.current_alarm, 0);
        assert_eq!(sample.voltage_alarm, 3);
        assert_eq!(sample.custom_alarm, 0x14);
        assert_eq!(sample.alarm_events, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(sample.on_off_state, 0x0A);
        assert_eq!(sample.equilibrium_states, [0x0B, 0x0C]);
        assert_eq!(sample.system_state, 0x0D);
        assert_eq!(sample.disconnection_states, [0x0E, 0x0F]);
    }

    #[test]
    fn decode_alarm_missing_events() {
        let info = &ALARM_INFO[..20];
        assert!(matches!(
            AlarmSample::decode(info),
            Err(Error::MalformedPayload("alarm_events"))
        ));
    }
}
