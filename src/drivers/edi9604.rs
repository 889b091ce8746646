//! Decoder for the EDI9604 chipset.
//!
//! The instrument streams fixed 14-byte frames at 2400 8N1. Alignment is
//! only established once, right after the port opens, by scanning for a
//! CR-LF pair; every subsequent reading consumes exactly one frame.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Framed};
use tracing::debug;

use super::SessionClock;
use crate::error::{MeterError, Result};
use crate::reading::{OperationMode, RangeMode, Reading, Scale, Scope, Unit};
use crate::registry::Chipset;

const SERIAL_BAUD: u32 = 2400;
const PACKET_LEN: usize = 14;
/// Single-byte reads spent looking for CR-LF before giving up on alignment.
const SYNC_SCAN_LIMIT: usize = 14;

type Packet = [u8; PACKET_LEN];

/// Frames the byte stream into raw 14-byte packets. The stream carries no
/// per-frame marker, so this relies on the open-time CR-LF alignment.
#[derive(Default)]
pub(crate) struct Edi9604Codec;

impl Decoder for Edi9604Codec {
    type Item = Packet;
    type Error = MeterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < PACKET_LEN {
            return Ok(None);
        }
        let raw = src.split_to(PACKET_LEN);
        let mut packet = [0u8; PACKET_LEN];
        packet.copy_from_slice(&raw);
        Ok(Some(packet))
    }
}

pub struct Edi9604 {
    stream: Framed<SerialStream, Edi9604Codec>,
    clock: SessionClock,
}

impl Edi9604 {
    /// Open the serial port and align to the frame boundary.
    ///
    /// The CR-LF scan is best-effort: if no terminator shows up within the
    /// scan limit the stream is assumed to be aligned already. The original
    /// firmware protocol description leaves open whether a failed scan
    /// should be fatal; the historical behavior is to proceed.
    pub async fn open(connect: &str) -> Result<Self> {
        let mut port = tokio_serial::new(connect, SERIAL_BAUD)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| {
                MeterError::connect_caused_by(format!("serial port {}", connect), e)
            })?;

        #[cfg(unix)]
        port.set_exclusive(false)?;

        let mut last = 0u8;
        let mut aligned = false;
        for _ in 0..SYNC_SCAN_LIMIT {
            let mut current = [0u8; 1];
            port.read_exact(&mut current).await?;
            if last == b'\r' && current[0] == b'\n' {
                aligned = true;
                break;
            }
            last = current[0];
        }
        if !aligned {
            debug!("no CR-LF seen within {} bytes, assuming aligned stream", SYNC_SCAN_LIMIT);
        }
        debug!("serial connection okay: {}", connect);

        Ok(Self {
            stream: Edi9604Codec.framed(port),
            clock: SessionClock::start(),
        })
    }

    pub async fn get_reading(&mut self) -> Result<Reading> {
        let packet = match self.stream.next().await {
            Some(packet) => packet?,
            None => {
                return Err(MeterError::Framing("serial stream closed".into()));
            }
        };
        parse_packet(&mut self.clock, &packet)
    }

    pub fn close(self) -> Result<()> {
        debug!("closing serial connection");
        Ok(())
    }
}

/// Mode rules in priority order; the first matching row wins. The order is
/// load-bearing because the bit assignments are only mutually exclusive on
/// well-behaved hardware.
#[rustfmt::skip]
const MODE_RULES: &[(fn(&Packet) -> bool, OperationMode)] = &[
    (|p| p[10] & 0b1000_0000 != 0 && p[7] & 0b1_0000 != 0, OperationMode::VoltageDc),
    (|p| p[10] & 0b1000_0000 != 0 && p[7] & 0b1000 != 0,   OperationMode::VoltageAc),
    (|p| p[10] & 0b1000_0000 != 0 && p[9] & 0b100 != 0,    OperationMode::Diode),
    (|p| p[10] & 0b100_0000 != 0 && p[7] & 0b1_0000 != 0,  OperationMode::CurrentDc),
    (|p| p[10] & 0b100_0000 != 0 && p[7] & 0b1000 != 0,    OperationMode::CurrentAc),
    (|p| p[10] & 0b10_0000 != 0 && p[9] & 0b1000 == 0,     OperationMode::Resistance),
    (|p| p[10] & 0b10_0000 != 0 && p[9] & 0b1000 != 0,     OperationMode::Continuity),
    (|p| p[10] & 0b1000 != 0,                              OperationMode::Frequency),
    (|p| p[10] & 0b100 != 0,                               OperationMode::Capacitance),
    (|p| p[10] & 0b10 != 0 || p[10] & 0b1 != 0,            OperationMode::Temperature),
];

fn parse_packet(clock: &mut SessionClock, packet: &Packet) -> Result<Reading> {
    let unit = parse_units(packet)?;
    let mode = parse_operation_mode(packet)?;
    let value = parse_value(packet);
    let scale = parse_scale(packet);

    let mut reading = Reading::new(Chipset::Edi9604, mode, value, unit, scale, clock.stamp());
    reading.scope = Some(parse_scope(packet));
    reading.range = Some(parse_range(packet));
    reading.relative = Some(packet[7] & 0b100 != 0);
    // Not exposed by this chipset's byte layout.
    reading.low_battery = Some(false);
    reading.hold = Some(false);
    Ok(reading)
}

/// Sign from byte 0, four ASCII digits from bytes 1..5 and the decimal
/// point position from byte 6. Malformed digits mean the display showed a
/// dashed field; that is a soft condition, not an error.
fn parse_value(packet: &Packet) -> Option<f64> {
    let sign = if packet[0] == b'-' { -1.0 } else { 1.0 };
    // Blank-padded digit fields are legitimate on low ranges.
    let digits = std::str::from_utf8(&packet[1..5]).ok()?.trim();
    let number = digits.parse::<u32>().ok()?;
    let position = (packet[6] as char).to_digit(10)?;
    let divider = 10f64.powi(4 - position as i32);
    Some(sign * f64::from(number) / divider)
}

fn parse_scale(packet: &Packet) -> Scale {
    if packet[9] & 0b1000_0000 != 0 {
        Scale::Micro
    } else if packet[9] & 0b100_0000 != 0 {
        Scale::Milli
    } else if packet[9] & 0b10_0000 != 0 {
        Scale::Kilo
    } else if packet[9] & 0b1_0000 != 0 {
        Scale::Mega
    } else if packet[8] & 0b10 != 0 {
        Scale::Nano
    } else {
        Scale::None
    }
}

fn parse_units(packet: &Packet) -> Result<Unit> {
    if packet[10] & 0b1000_0000 != 0 {
        Ok(Unit::Volt)
    } else if packet[10] & 0b100_0000 != 0 {
        Ok(Unit::Ampere)
    } else if packet[10] & 0b10_0000 != 0 {
        Ok(Unit::Ohm)
    } else if packet[10] & 0b1000 != 0 {
        Ok(Unit::Hertz)
    } else if packet[10] & 0b100 != 0 {
        Ok(Unit::Farad)
    } else if packet[9] & 0b10 != 0 {
        Ok(Unit::DutyCycle)
    } else if packet[10] & 0b10 != 0 {
        Ok(Unit::Celsius)
    } else if packet[10] & 0b1 != 0 {
        Ok(Unit::Fahrenheit)
    } else {
        Err(MeterError::Decode("Unknown measurement units".into()))
    }
}

fn parse_operation_mode(packet: &Packet) -> Result<OperationMode> {
    for (matches, mode) in MODE_RULES {
        if matches(packet) {
            return Ok(*mode);
        }
    }
    Err(MeterError::Decode(
        "Unsupported digital multimeter mode from packet".into(),
    ))
}

fn parse_scope(packet: &Packet) -> Scope {
    if packet[8] & 0b10_0000 != 0 {
        Scope::Max
    } else if packet[8] & 0b1_0000 != 0 {
        Scope::Min
    } else {
        Scope::Value
    }
}

fn parse_range(packet: &Packet) -> RangeMode {
    if packet[7] & 0b10_0000 != 0 {
        RangeMode::Auto
    } else {
        RangeMode::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frame showing +1234 V DC, autorange, no scale.
    fn volts_frame() -> Packet {
        let mut packet = [0u8; PACKET_LEN];
        packet[0] = b'+';
        packet[1..5].copy_from_slice(b"1234");
        packet[6] = b'4'; // decimal point after the last digit
        packet[7] = 0b0011_0000; // DC + autorange
        packet[10] = 0b1000_0000; // volts
        packet
    }

    #[test]
    fn decodes_dc_volts_frame() {
        let mut clock = SessionClock::start();
        let reading = parse_packet(&mut clock, &volts_frame()).unwrap();
        assert_eq!(reading.value, Some(1234.0));
        assert_eq!(reading.unit, Unit::Volt);
        assert_eq!(reading.scale, Scale::None);
        assert_eq!(reading.scaled_value, Some(1234.0));
        assert_eq!(reading.mode, OperationMode::VoltageDc);
        assert_eq!(reading.scope, Some(Scope::Value));
        assert_eq!(reading.range, Some(RangeMode::Auto));
        assert_eq!(reading.relative, Some(false));
        assert_eq!(reading.low_battery, Some(false));
        assert_eq!(reading.hold, Some(false));
    }

    #[test]
    fn sign_and_decimal_position() {
        let mut packet = volts_frame();
        packet[0] = b'-';
        packet[6] = b'1'; // 10^(4-1) divider
        assert_eq!(parse_value(&packet), Some(-1234.0 / 1000.0));
    }

    #[test]
    fn blank_padded_digits_still_parse() {
        let mut packet = volts_frame();
        packet[1..5].copy_from_slice(b" 234");
        assert_eq!(parse_value(&packet), Some(234.0));
        packet[1..5].copy_from_slice(b"    ");
        assert_eq!(parse_value(&packet), None);
    }

    #[test]
    fn unparsable_digits_yield_undefined_value_not_an_error() {
        let mut clock = SessionClock::start();
        let mut packet = volts_frame();
        packet[2] = b'x';
        let reading = parse_packet(&mut clock, &packet).unwrap();
        assert_eq!(reading.value, None);
        assert_eq!(reading.scaled_value, None);
    }

    #[test]
    fn missing_unit_bits_fail_decoding() {
        let mut clock = SessionClock::start();
        let mut packet = volts_frame();
        packet[9] = 0;
        packet[10] = 0;
        let err = parse_packet(&mut clock, &packet).unwrap_err();
        assert!(matches!(err, MeterError::Decode(_)));
    }

    #[test]
    fn scale_bits() {
        let mut packet = volts_frame();
        packet[9] |= 0b1000_0000;
        assert_eq!(parse_scale(&packet), Scale::Micro);
        packet[9] = 0b100_0000;
        assert_eq!(parse_scale(&packet), Scale::Milli);
        packet[9] = 0b10_0000;
        assert_eq!(parse_scale(&packet), Scale::Kilo);
        packet[9] = 0b1_0000;
        assert_eq!(parse_scale(&packet), Scale::Mega);
        packet[9] = 0;
        packet[8] = 0b10;
        assert_eq!(parse_scale(&packet), Scale::Nano);
    }

    #[test]
    fn resistance_vs_continuity_is_decided_by_the_buzzer_bit() {
        let mut packet = [0u8; PACKET_LEN];
        packet[10] = 0b10_0000; // ohms
        assert_eq!(parse_operation_mode(&packet).unwrap(), OperationMode::Resistance);
        packet[9] |= 0b1000;
        assert_eq!(parse_operation_mode(&packet).unwrap(), OperationMode::Continuity);
    }

    #[test]
    fn min_max_scope_bits() {
        let mut packet = volts_frame();
        packet[8] = 0b10_0000;
        assert_eq!(parse_scope(&packet), Scope::Max);
        packet[8] = 0b1_0000;
        assert_eq!(parse_scope(&packet), Scope::Min);
    }

    #[test]
    fn codec_emits_fixed_frames() {
        let mut codec = Edi9604Codec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&volts_frame());
        buf.extend_from_slice(&volts_frame()[..6]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, volts_frame());
        // Second frame is incomplete.
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }
}
