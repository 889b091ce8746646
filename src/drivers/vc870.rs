//! Decoder for the Voltcraft VC870 over its USB-HID cable.
//!
//! The instrument side speaks a plain ASCII protocol; a HID-UART bridge
//! chip (Hoitek HE2325U or WCH CH9325) wraps it into HID reports and is
//! configured through a vendor SET_REPORT control transfer carrying the
//! UART speed. Readings are fixed 23-byte CR-LF terminated packets.

use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use nusb::transfer::{ControlOut, ControlType, Direction, Recipient, RequestBuffer};
use regex::Regex;
use tracing::debug;

use super::{SessionClock, PACKET_RETRY_LIMIT};
use crate::error::{MeterError, Result};
use crate::reading::{ActiveFlags, Flag, OperationMode, Reading, Scale, Unit};
use crate::registry::Chipset;

const UART_SPEED: u32 = 9600;
const HID_SET_REPORT: u8 = 0x09;
const HID_FEATURE_REPORT_0: u16 = 0x0300;

const PACKET_SIZE: usize = 23;
const PACKET_TERMINATOR: &[u8] = b"\r\n";
const DATA_SIZE: usize = PACKET_SIZE - PACKET_TERMINATOR.len();
const READ_TIMEOUT: Duration = Duration::from_millis(3000);

/// Payload bytes are printable ASCII in 0x30..0x40.
fn allowed(byte: u8) -> bool {
    (0x30..0x40).contains(&byte)
}

type Packet = [u8; DATA_SIZE];

/// Parse a `vendor:product` connect string: four hex digits each, with an
/// optional `usb:` prefix and `:` or `.` as separator.
fn parse_connect(connect: &str) -> Result<(u16, u16)> {
    let re = Regex::new(r"^(?:usb:)?([a-fA-F0-9]{4})[:.]([a-fA-F0-9]{4})$")
        .expect("valid connect pattern");
    let caps = re.captures(connect).ok_or_else(|| {
        MeterError::connect(format!("Could not read VID/PID from connect string: {}", connect))
    })?;
    // The pattern guarantees both groups are 4 hex digits.
    let vid = u16::from_str_radix(&caps[1], 16).expect("hex group");
    let pid = u16::from_str_radix(&caps[2], 16).expect("hex group");
    Ok((vid, pid))
}

/// Reassembled UART bytes carried inside HID reports.
///
/// A report whose first byte has the top nibble set to 0b1111 carries a
/// payload; the low 3 bits give the payload length and every payload byte
/// has its high bit stripped before it lands in the buffer.
#[derive(Default)]
struct ReportBuffer {
    data: Vec<u8>,
}

impl ReportBuffer {
    fn push_report(&mut self, report: &[u8]) -> Result<()> {
        if report.len() > 1 && report[0] & 0xF0 == 0xF0 {
            let nbytes = (report[0] & 0x07) as usize;
            if nbytes > 0 {
                if report.len() < nbytes + 1 {
                    return Err(MeterError::Decode("More bytes announced than sent".into()));
                }
                self.data
                    .extend(report[1..=nbytes].iter().map(|b| b & 0x7F));
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, size: usize) -> Vec<u8> {
        let rest = self.data.split_off(size);
        std::mem::replace(&mut self.data, rest)
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

/// Byte transport over the HID-UART bridge: sized reads with a deadline,
/// and a flush that drops everything buffered so far.
struct HidBridge {
    device: nusb::Device,
    interface: nusb::Interface,
    endpoint: u8,
    max_packet_size: usize,
    buffer: ReportBuffer,
}

impl HidBridge {
    async fn open(vid: u16, pid: u16) -> Result<Self> {
        let device_info = nusb::list_devices()?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or_else(|| MeterError::connect("Could not find USB device"))?;
        let device = device_info
            .open()
            .map_err(|e| MeterError::connect_caused_by("Could not open USB device", e))?;
        debug!("connected to VID={:04x}, PID={:04x} successfully", vid, pid);

        // The CH9325 often refuses to talk until it has been reset once.
        device.reset()?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Detaches any kernel-owned driver before claiming (no-op where the
        // platform has no concept of one).
        let interface = device.detach_and_claim_interface(0)?;

        let config = device
            .active_configuration()
            .map_err(|e| MeterError::connect_caused_by("No active USB configuration", e))?;
        let mut found = None;
        'discovery: for group in config.interfaces() {
            if group.interface_number() != 0 {
                continue;
            }
            for alt in group.alt_settings() {
                for ep in alt.endpoints() {
                    if ep.direction() == Direction::In {
                        found = Some((ep.address(), ep.max_packet_size()));
                        break 'discovery;
                    }
                }
            }
        }
        let (endpoint, max_packet_size) =
            found.ok_or_else(|| MeterError::connect("No endpoint found on device"))?;

        let bridge = Self {
            device,
            interface,
            endpoint,
            max_packet_size,
            buffer: ReportBuffer::default(),
        };
        bridge.configure_uart().await?;
        Ok(bridge)
    }

    /// Program the bridge chip's UART: little-endian speed plus a fixed
    /// trailer byte, sent as a HID feature SET_REPORT.
    async fn configure_uart(&self) -> Result<()> {
        let mut conf = Vec::with_capacity(5);
        conf.write_u32::<LittleEndian>(UART_SPEED)?;
        conf.write_u8(0x03)?;

        self.interface
            .control_out(ControlOut {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: HID_SET_REPORT,
                value: HID_FEATURE_REPORT_0,
                index: 0,
                data: &conf,
            })
            .await
            .into_result()?;
        Ok(())
    }

    fn flush(&mut self) {
        self.buffer.clear();
    }

    /// Block until `size` bytes are buffered, polling the endpoint so no
    /// report is missed, or fail with a timeout once the deadline passes.
    async fn read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let transfer = self
                .interface
                .interrupt_in(self.endpoint, RequestBuffer::new(self.max_packet_size));
            let report = tokio::time::timeout_at(deadline, transfer)
                .await
                .map_err(|_| MeterError::Timeout)?
                .into_result()?;
            self.buffer.push_report(&report)?;

            if self.buffer.len() >= size {
                return Ok(self.buffer.take(size));
            }
            if tokio::time::Instant::now() > deadline {
                return Err(MeterError::Timeout);
            }
        }
    }

    fn close(self) -> Result<()> {
        debug!("closing USB connection");
        self.device.reset()?;
        Ok(())
    }
}

/// Outcome of examining the assembly buffer after a read.
enum Assembly {
    /// Terminator at the expected offset, payload all in range.
    Complete,
    /// Buffer unusable, restart from an empty buffer.
    Restart,
    /// Clean partial packet carried over, read this many more bytes.
    NeedMore(usize),
}

/// Apply the terminator/byte-range policy to the assembly buffer. On
/// `Complete` the buffer holds exactly the packet payload.
fn evaluate(packet: &mut Vec<u8>) -> Assembly {
    let terminator = packet
        .windows(PACKET_TERMINATOR.len())
        .position(|w| w == PACKET_TERMINATOR);
    match terminator {
        Some(pos) if pos == DATA_SIZE => {
            packet.truncate(DATA_SIZE);
            if packet.iter().copied().all(allowed) {
                Assembly::Complete
            } else {
                packet.clear();
                Assembly::Restart
            }
        }
        None => {
            packet.clear();
            Assembly::Restart
        }
        Some(pos) => {
            // The terminator came early: whatever follows it may be the
            // head of the next packet.
            let rest = packet.split_off(pos + PACKET_TERMINATOR.len());
            *packet = rest;
            if packet.iter().copied().all(allowed) {
                Assembly::NeedMore(PACKET_SIZE - packet.len())
            } else {
                packet.clear();
                Assembly::Restart
            }
        }
    }
}

pub struct Vc870 {
    bridge: HidBridge,
    clock: SessionClock,
}

impl Vc870 {
    pub async fn open(connect: &str) -> Result<Self> {
        let (vid, pid) = parse_connect(connect)?;
        let bridge = HidBridge::open(vid, pid).await?;
        Ok(Self {
            bridge,
            clock: SessionClock::start(),
        })
    }

    pub async fn get_reading(&mut self) -> Result<Reading> {
        let packet = self.receive_packet().await?;
        parse_packet(&mut self.clock, &packet)
    }

    pub fn close(self) -> Result<()> {
        self.bridge.close()
    }

    async fn receive_packet(&mut self) -> Result<Packet> {
        let mut packet: Vec<u8> = Vec::with_capacity(PACKET_SIZE);
        let mut bytes_to_read = PACKET_SIZE;
        let mut retries = 0u32;

        self.bridge.flush();
        loop {
            let received = self.bridge.read(bytes_to_read, READ_TIMEOUT).await?;
            debug!("interface read {} bytes", received.len());
            packet.extend_from_slice(&received);

            match evaluate(&mut packet) {
                Assembly::Complete => {
                    let mut data = [0u8; DATA_SIZE];
                    data.copy_from_slice(&packet);
                    return Ok(data);
                }
                Assembly::Restart => {
                    bytes_to_read = PACKET_SIZE;
                    self.bridge.flush();
                }
                Assembly::NeedMore(n) => bytes_to_read = n,
            }

            retries += 1;
            if retries > PACKET_RETRY_LIMIT {
                return Err(MeterError::Framing(format!(
                    "Too many invalid responses after {} retries",
                    PACKET_RETRY_LIMIT
                )));
            }
        }
    }
}

/// What a 2-character function code implies: the operation mode, the
/// primary unit and base factor, and for the dual-value modes the
/// auxiliary unit and factor as well.
struct ModeEntry {
    mode: OperationMode,
    unit: Unit,
    factor: f64,
    aux: Option<(Unit, f64)>,
}

impl ModeEntry {
    const fn single(mode: OperationMode, unit: Unit, factor: f64) -> Self {
        Self {
            mode,
            unit,
            factor,
            aux: None,
        }
    }

    const fn dual(mode: OperationMode, unit: Unit, factor: f64, aux: Unit, aux_factor: f64) -> Self {
        Self {
            mode,
            unit,
            factor,
            aux: Some((aux, aux_factor)),
        }
    }
}

#[rustfmt::skip]
fn mode_entry(code: &[u8]) -> Option<ModeEntry> {
    Some(match code {
        b"00" => ModeEntry::single(OperationMode::VoltageDc,   Unit::Volt,    1e-4),
        b"01" => ModeEntry::single(OperationMode::VoltageAc,   Unit::Volt,    1e-4),
        b"10" => ModeEntry::single(OperationMode::VoltageDc,   Unit::Volt,    1e-5),
        b"11" => ModeEntry::single(OperationMode::Temperature, Unit::Celsius, 1e-1),
        b"20" => ModeEntry::single(OperationMode::Resistance,  Unit::Ohm,     1e-2),
        b"21" => ModeEntry::single(OperationMode::Continuity,  Unit::Ohm,     1e-2),
        b"30" => ModeEntry::single(OperationMode::Capacitance, Unit::Farad,   1e-12),
        b"40" => ModeEntry::single(OperationMode::Diode,       Unit::Volt,    1e-4),
        b"50" => ModeEntry::single(OperationMode::Frequency,   Unit::Hertz,   1.0),
        b"51" => ModeEntry::single(OperationMode::LoopCurrentPercent, Unit::Percent, 1.0),
        b"60" => ModeEntry::single(OperationMode::CurrentDc,   Unit::Ampere,  1e-8),
        b"61" => ModeEntry::single(OperationMode::CurrentAc,   Unit::Ampere,  1e-8),
        b"70" => ModeEntry::single(OperationMode::CurrentDc,   Unit::Ampere,  1e-6),
        b"71" => ModeEntry::single(OperationMode::CurrentAc,   Unit::Ampere,  1e-6),
        b"80" => ModeEntry::single(OperationMode::CurrentDc,   Unit::Ampere,  1e-3),
        b"81" => ModeEntry::single(OperationMode::CurrentAc,   Unit::Ampere,  1e-3),
        b"90" => ModeEntry::dual(OperationMode::Power, Unit::Watt, 0.1, Unit::VoltAmpere, 0.1),
        b"91" => ModeEntry::dual(OperationMode::PowerFactorFrequency, Unit::PowerFactor, 1e-3, Unit::Hertz, 0.1),
        b"92" => ModeEntry::dual(OperationMode::EffectiveVoltageCurrent, Unit::Volt, 0.1, Unit::Ampere, 0.1),
        _ => return None,
    })
}

fn ascii_int(digits: &[u8]) -> Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| MeterError::Decode("Non-numeric display digits".into()))
}

/// Primary and auxiliary display values before the mode's base factor is
/// applied: fixed-width digit substrings, sign bits from the status byte
/// and a shared power-of-ten exponent digit.
fn parse_display_value(packet: &Packet) -> Result<(f64, f64)> {
    let value = ascii_int(&packet[3..8])?;
    let aux_value = ascii_int(&packet[8..13])?;

    let status = packet[15] & 0b1111;
    let sign = if status & 0b100 != 0 { -1.0 } else { 1.0 };
    let aux_sign = if status & 0b1000 != 0 { -1.0 } else { 1.0 };

    let exponent = (packet[2] as char)
        .to_digit(10)
        .ok_or_else(|| MeterError::Decode("Non-numeric exponent digit".into()))?;
    let multiplier = 10f64.powi(exponent as i32);

    Ok((
        sign * value as f64 * multiplier,
        aux_sign * aux_value as f64 * multiplier,
    ))
}

/// Active-flag bits across the status byte and the four option bytes.
/// Overflow and open-circuit each have two independent bit positions that
/// are OR'd together.
fn parse_flags(packet: &Packet) -> ActiveFlags {
    let status = packet[15] & 0b1111;
    let option1 = packet[16] & 0b1111;
    let option2 = packet[17] & 0b1111;
    let option3 = packet[18] & 0b1111;
    let option4 = packet[19] & 0b1111;

    let mut flags = ActiveFlags::default();
    if status & 0b10 != 0 {
        flags.add(Flag::Battery);
    }
    if status & 0b1 != 0 || option2 & 0b1000 != 0 {
        flags.add(Flag::Overflow);
    }
    if option1 & 0b1000 != 0 {
        flags.add(Flag::Max);
    }
    if option1 & 0b100 != 0 {
        flags.add(Flag::Min);
    }
    if option1 & 0b10 != 0 {
        flags.add(Flag::MaxMin);
    }
    if option1 & 0b1 != 0 {
        flags.add(Flag::Rel);
    }
    if option2 & 0b100 != 0 || option4 & 0b1 != 0 {
        flags.add(Flag::Open);
    }
    if option2 & 0b10 != 0 {
        flags.add(Flag::Manual);
    }
    if option2 & 0b1 != 0 {
        flags.add(Flag::Hold);
    }
    if option3 & 0b1000 != 0 {
        flags.add(Flag::Light);
    }
    if option3 & 0b10 != 0 {
        flags.add(Flag::Warning);
    }
    if option4 & 0b1000 != 0 {
        flags.add(Flag::MisplugWarn);
    }
    if option4 & 0b100 != 0 {
        flags.add(Flag::Lo);
    }
    if option4 & 0b10 != 0 {
        flags.add(Flag::Hi);
    }
    // The usb and auto_power bits are always on and carry no information.
    flags
}

fn parse_packet(clock: &mut SessionClock, packet: &Packet) -> Result<Reading> {
    let entry = mode_entry(&packet[0..2]).ok_or_else(|| {
        MeterError::Decode("Unsupported digital multimeter mode from packet".into())
    })?;
    let (raw_value, raw_aux) = parse_display_value(packet)?;
    let flags = parse_flags(packet);

    // Overflow and open-circuit both pin the display to infinity no matter
    // what the digit fields say.
    let pinned = flags.is(Flag::Overflow) || flags.is(Flag::Open);
    let value = if pinned {
        f64::INFINITY
    } else {
        raw_value * entry.factor
    };

    let mut reading = Reading::new(
        Chipset::Vc870,
        entry.mode,
        Some(value),
        entry.unit,
        // The base factor already lands the value in SI units.
        Scale::None,
        clock.stamp(),
    );
    if let Some((aux_unit, aux_factor)) = entry.aux {
        reading.aux_value = Some(if pinned {
            f64::INFINITY
        } else {
            raw_aux * aux_factor
        });
        reading.aux_unit = Some(aux_unit);
    }
    reading.flags = Some(flags);
    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Packet payload for mode `code` with the given digit fields; status
    /// and option bytes default to '0' (no bits set).
    fn packet(code: &[u8; 2], value: &[u8; 5], aux: &[u8; 5]) -> Packet {
        let mut data = [b'0'; DATA_SIZE];
        data[0..2].copy_from_slice(code);
        data[2] = b'0';
        data[3..8].copy_from_slice(value);
        data[8..13].copy_from_slice(aux);
        data
    }

    #[test]
    fn parses_connect_string_variants() {
        assert_eq!(parse_connect("usb:1a86.e008").unwrap(), (0x1a86, 0xe008));
        assert_eq!(parse_connect("1a86:e008").unwrap(), (0x1a86, 0xe008));
        assert_eq!(parse_connect("1A86.E008").unwrap(), (0x1a86, 0xe008));
        assert!(matches!(
            parse_connect("/dev/ttyUSB0"),
            Err(MeterError::Connect { .. })
        ));
        assert!(parse_connect("usb:1a86").is_err());
    }

    #[test]
    fn report_buffer_strips_header_and_high_bits() {
        let mut buffer = ReportBuffer::default();
        // 3 payload bytes, second one with the high bit set.
        buffer.push_report(&[0xF3, b'1', b'2' | 0x80, b'3', 0xAA]).unwrap();
        // Not a payload report.
        buffer.push_report(&[0x03, b'x', b'y']).unwrap();
        assert_eq!(buffer.take(3), b"123");
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn report_announcing_more_than_sent_is_rejected() {
        let mut buffer = ReportBuffer::default();
        let err = buffer.push_report(&[0xF7, b'1', b'2']).unwrap_err();
        assert!(matches!(err, MeterError::Decode(_)));
    }

    #[test]
    fn evaluate_accepts_a_clean_packet() {
        let mut buf = packet(b"00", b"12345", b"00000").to_vec();
        buf.extend_from_slice(PACKET_TERMINATOR);
        assert!(matches!(evaluate(&mut buf), Assembly::Complete));
        assert_eq!(buf.len(), DATA_SIZE);
    }

    #[test]
    fn evaluate_restarts_without_terminator() {
        let mut buf = vec![b'1'; PACKET_SIZE];
        assert!(matches!(evaluate(&mut buf), Assembly::Restart));
        assert!(buf.is_empty());
    }

    #[test]
    fn evaluate_carries_partial_packet_forward() {
        // Tail of a previous packet, terminator, then 5 clean bytes.
        let mut buf = b"999\r\n01234".to_vec();
        match evaluate(&mut buf) {
            Assembly::NeedMore(n) => assert_eq!(n, PACKET_SIZE - 5),
            _ => panic!("expected a partial packet"),
        }
        assert_eq!(buf, b"01234");
    }

    #[test]
    fn evaluate_discards_partial_with_illegal_bytes() {
        let mut buf = b"999\r\n01z34".to_vec();
        assert!(matches!(evaluate(&mut buf), Assembly::Restart));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_dc_volts() {
        let mut clock = SessionClock::start();
        let reading = parse_packet(&mut clock, &packet(b"00", b"12345", b"00000")).unwrap();
        assert_eq!(reading.mode, OperationMode::VoltageDc);
        assert_eq!(reading.value, Some(12345.0 * 1e-4));
        assert_eq!(reading.unit, Unit::Volt);
        assert_eq!(reading.scale, Scale::None);
        assert_eq!(reading.scaled_value, reading.value);
        assert_eq!(reading.aux_value, None);
        assert!(reading.flags.as_ref().is_some_and(|f| f.iter().count() == 0));
    }

    #[test]
    fn negative_sign_and_exponent() {
        let mut clock = SessionClock::start();
        let mut data = packet(b"00", b"00100", b"00000");
        data[2] = b'2'; // exponent 10^2
        data[15] = 0x34; // status bit 0b100: negative primary
        let reading = parse_packet(&mut clock, &data).unwrap();
        assert_eq!(reading.value, Some(-100.0 * 100.0 * 1e-4));
    }

    #[test]
    fn dual_mode_carries_aux_value() {
        let mut clock = SessionClock::start();
        let reading = parse_packet(&mut clock, &packet(b"90", b"00100", b"00050")).unwrap();
        assert_eq!(reading.mode, OperationMode::Power);
        assert_eq!(reading.unit, Unit::Watt);
        assert_eq!(reading.value, Some(10.0));
        assert_eq!(reading.aux_value, Some(5.0));
        assert_eq!(reading.aux_unit, Some(Unit::VoltAmpere));
    }

    #[test]
    fn overflow_pins_both_values_to_infinity() {
        let mut clock = SessionClock::start();
        let mut data = packet(b"90", b"00100", b"00050");
        data[17] = 0x38; // option2 bit 0b1000: overflow
        let reading = parse_packet(&mut clock, &data).unwrap();
        assert_eq!(reading.value, Some(f64::INFINITY));
        assert_eq!(reading.aux_value, Some(f64::INFINITY));
        assert!(reading.flags.as_ref().is_some_and(|f| f.is(Flag::Overflow)));
    }

    #[test]
    fn open_circuit_pins_value_from_either_bit_position() {
        let mut clock = SessionClock::start();
        let mut data = packet(b"20", b"00100", b"00000");
        data[17] = 0x34; // option2 bit 0b100
        let reading = parse_packet(&mut clock, &data).unwrap();
        assert_eq!(reading.value, Some(f64::INFINITY));

        let mut data = packet(b"20", b"00100", b"00000");
        data[19] = 0x31; // option4 bit 0b1
        let reading = parse_packet(&mut clock, &data).unwrap();
        assert_eq!(reading.value, Some(f64::INFINITY));
    }

    #[test]
    fn flag_table_covers_the_option_bytes() {
        let mut data = packet(b"00", b"00000", b"00000");
        data[15] = 0x32; // battery
        data[16] = 0x3F; // max, min, maxmin, rel
        data[17] = 0x33; // manual, hold
        data[18] = 0x3A; // light, warning
        data[19] = 0x3E; // misplug_warn, lo, hi
        let flags = parse_flags(&data);
        for flag in [
            Flag::Battery,
            Flag::Max,
            Flag::Min,
            Flag::MaxMin,
            Flag::Rel,
            Flag::Manual,
            Flag::Hold,
            Flag::Light,
            Flag::Warning,
            Flag::MisplugWarn,
            Flag::Lo,
            Flag::Hi,
        ] {
            assert!(flags.is(flag), "missing {flag}");
        }
        assert!(!flags.is(Flag::Overflow));
    }

    #[test]
    fn unknown_mode_code_is_a_decode_error() {
        let mut clock = SessionClock::start();
        let err = parse_packet(&mut clock, &packet(b"99", b"00000", b"00000")).unwrap_err();
        assert!(matches!(err, MeterError::Decode(_)));
    }

    #[test]
    fn millivolt_function_uses_finer_base_factor() {
        let mut clock = SessionClock::start();
        let reading = parse_packet(&mut clock, &packet(b"10", b"12345", b"00000")).unwrap();
        assert_eq!(reading.mode, OperationMode::VoltageDc);
        assert_eq!(reading.value, Some(12345.0 * 1e-5));
    }
}
