//! Decoder for the Fortune FS9721 chipset.
//!
//! The transport delivers one byte per logical nibble: the high nibble is
//! a positional index (1..=14), the low nibble the payload. A packet is
//! the ordered run of all 14 payload nibbles; anything out of sequence
//! forces a resynchronization attempt.

use bytes::BytesMut;
use futures::StreamExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Framed};
use tracing::debug;

use super::{SessionClock, PACKET_RETRY_LIMIT};
use crate::error::{MeterError, Result};
use crate::reading::{OperationMode, Reading, Scale, Unit};
use crate::registry::Chipset;

const SERIAL_BAUD: u32 = 2400;
const PACKET_NIBBLES: usize = 14;

/// The 14 payload nibbles of one validated packet, in positional order.
/// Each entry keeps its raw 4-bit pattern.
type Packet = [u8; PACKET_NIBBLES];

/// Test a nibble bit by its position counted from the most significant
/// bit, matching the chipset datasheet's segment naming.
fn bit(nibble: u8, pos: u8) -> bool {
    nibble & (1 << (3 - pos)) != 0
}

/// Reassembles packets from the indexed nibble stream.
///
/// Bytes are discarded until an index-1 byte is seen, then indices 2..=14
/// must follow in strict sequence. A sequence break aborts the attempt and
/// rescans; the attempt budget belongs to a single reading request and is
/// reset by the driver before each acquisition.
#[derive(Default)]
pub(crate) struct Fs9721Codec {
    attempts: u32,
}

impl Fs9721Codec {
    pub(crate) fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}

impl Decoder for Fs9721Codec {
    type Item = Packet;
    type Error = MeterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(start) = src.iter().position(|b| b >> 4 == 1) else {
                // No frame start anywhere in the buffer.
                src.clear();
                return Ok(None);
            };
            let _ = src.split_to(start);
            if src.len() < PACKET_NIBBLES {
                return Ok(None);
            }

            match src
                .iter()
                .take(PACKET_NIBBLES)
                .enumerate()
                .position(|(i, b)| (b >> 4) as usize != i + 1)
            {
                None => {
                    let raw = src.split_to(PACKET_NIBBLES);
                    let mut packet = [0u8; PACKET_NIBBLES];
                    for (nibble, byte) in packet.iter_mut().zip(raw.iter()) {
                        *nibble = byte & 0x0F;
                    }
                    self.attempts = 0;
                    debug!("received complete packet with {}x nibbles", PACKET_NIBBLES);
                    return Ok(Some(packet));
                }
                Some(mismatch) => {
                    self.attempts += 1;
                    if self.attempts > PACKET_RETRY_LIMIT {
                        return Err(MeterError::Framing(format!(
                            "Received out of order bytes after {} retries",
                            PACKET_RETRY_LIMIT
                        )));
                    }
                    debug!("received out of order packet data, retrying");
                    // Drop everything up to and including the offender.
                    let _ = src.split_to(mismatch + 1);
                }
            }
        }
    }
}

pub struct Fs9721 {
    stream: Framed<SerialStream, Fs9721Codec>,
    clock: SessionClock,
}

impl Fs9721 {
    pub fn open(connect: &str) -> Result<Self> {
        #[cfg_attr(not(unix), allow(unused_mut))]
        let mut port = tokio_serial::new(connect, SERIAL_BAUD)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|e| {
                MeterError::connect_caused_by(format!("serial port {}", connect), e)
            })?;

        #[cfg(unix)]
        port.set_exclusive(false)?;

        debug!("serial connection okay: {}", connect);
        Ok(Self {
            stream: Fs9721Codec::default().framed(port),
            clock: SessionClock::start(),
        })
    }

    pub async fn get_reading(&mut self) -> Result<Reading> {
        self.stream.codec_mut().reset_attempts();
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

/// Mode rules in priority order, first match wins.
#[rustfmt::skip]
const MODE_RULES: &[(fn(&Packet) -> bool, OperationMode)] = &[
    (|p| bit(p[12], 0) && bit(p[0], 0),  OperationMode::CurrentAc),
    (|p| bit(p[12], 0) && bit(p[0], 1),  OperationMode::CurrentDc),
    (|p| bit(p[12], 1) && bit(p[0], 0),  OperationMode::VoltageAc),
    (|p| bit(p[12], 1) && bit(p[0], 1),  OperationMode::VoltageDc),
    (|p| bit(p[11], 1) && !bit(p[10], 3), OperationMode::Resistance),
    (|p| bit(p[9], 3) && bit(p[12], 1),  OperationMode::Diode),
    (|p| bit(p[11], 1) && bit(p[10], 3), OperationMode::Continuity),
    (|p| bit(p[11], 0),                  OperationMode::Capacitance),
    (|p| bit(p[12], 2) || bit(p[10], 1), OperationMode::Frequency),
    (|p| bit(p[13], 1),                  OperationMode::Temperature),
];

fn parse_packet(clock: &mut SessionClock, packet: &Packet) -> Result<Reading> {
    let value = parse_display_value(packet)?;
    let scale = parse_scale(packet);
    let unit = parse_units(packet)?;
    let mode = parse_operation_mode(packet)?;

    let mut reading = Reading::new(Chipset::Fs9721, mode, value, unit, scale, clock.stamp());
    reading.relative = Some(bit(packet[11], 2));
    reading.low_battery = Some(bit(packet[12], 3));
    reading.hold = Some(bit(packet[11], 3));
    Ok(reading)
}

/// Map a 7-segment pattern spanning two adjacent nibbles to its display
/// character. `L` marks an open/error display, a dark digit maps to None.
fn parse_digit(high: u8, low: u8) -> Result<Option<char>> {
    let segments = ((high & 0b0111) << 4) | (low & 0b1111);
    match segments {
        0b0000101 => Ok(Some('1')),
        0b1011011 => Ok(Some('2')),
        0b0011111 => Ok(Some('3')),
        0b0100111 => Ok(Some('4')),
        0b0111110 => Ok(Some('5')),
        0b1111110 => Ok(Some('6')),
        0b0010101 => Ok(Some('7')),
        0b1111111 => Ok(Some('8')),
        0b0111111 => Ok(Some('9')),
        0b1111101 => Ok(Some('0')),
        0b1101000 => Ok(Some('L')),
        0b0000000 => Ok(None),
        _ => Err(MeterError::Decode("Unknown digit".into())),
    }
}

/// Sign bit, four 7-segment digits and the decimal point position. Dark
/// digits drop out of the digit string before parsing; an `L` digit (or an
/// all-dark display) fails integer parsing and yields an undefined value.
fn parse_display_value(packet: &Packet) -> Result<Option<f64>> {
    let sign = if bit(packet[1], 0) { -1.0 } else { 1.0 };

    let multiplier = if bit(packet[7], 0) {
        0.1
    } else if bit(packet[5], 0) {
        0.01
    } else if bit(packet[3], 0) {
        0.001
    } else {
        1.0
    };

    let mut digits = String::with_capacity(4);
    for idx in [1usize, 3, 5, 7] {
        if let Some(ch) = parse_digit(packet[idx], packet[idx + 1])? {
            digits.push(ch);
        }
    }

    let number = match digits.parse::<i64>() {
        Ok(number) => number,
        Err(_) => return Ok(None),
    };
    Ok(Some(sign * number as f64 * multiplier))
}

fn parse_scale(packet: &Packet) -> Scale {
    if bit(packet[10], 2) {
        Scale::Mega
    } else if bit(packet[9], 2) {
        Scale::Kilo
    } else if bit(packet[10], 0) {
        Scale::Milli
    } else if bit(packet[9], 0) {
        Scale::Micro
    } else if bit(packet[9], 1) {
        Scale::Nano
    } else {
        Scale::None
    }
}

fn parse_units(packet: &Packet) -> Result<Unit> {
    if bit(packet[12], 0) {
        Ok(Unit::Ampere)
    } else if bit(packet[12], 1) {
        Ok(Unit::Volt)
    } else if bit(packet[11], 1) {
        Ok(Unit::Ohm)
    } else if bit(packet[11], 0) {
        Ok(Unit::Farad)
    } else if bit(packet[12], 2) {
        Ok(Unit::Hertz)
    } else if bit(packet[10], 1) {
        Ok(Unit::DutyCycle)
    } else if bit(packet[13], 1) {
        Ok(Unit::Celsius)
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
