use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::fmt::{self, Display};

use crate::registry::Chipset;

/// Physical measurement unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "A")]
    Ampere,
    #[serde(rename = "Ω")]
    Ohm,
    #[serde(rename = "Hz")]
    Hertz,
    #[serde(rename = "F")]
    Farad,
    #[serde(rename = "%")]
    DutyCycle,
    #[serde(rename = "°C")]
    Celsius,
    #[serde(rename = "°F")]
    Fahrenheit,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "VA")]
    VoltAmpere,
    #[serde(rename = "cos_fi")]
    PowerFactor,
    #[serde(rename = "percent")]
    Percent,
}

impl Unit {
    pub fn name(&self) -> &'static str {
        match self {
            Unit::Volt => "volts",
            Unit::Ampere => "amps",
            Unit::Ohm => "ohms",
            Unit::Hertz => "hertz",
            Unit::Farad => "farads",
            Unit::DutyCycle => "duty-cycle",
            Unit::Celsius => "celsius",
            Unit::Fahrenheit => "fahrenheit",
            Unit::Watt => "watts",
            Unit::VoltAmpere => "volt-amps",
            Unit::PowerFactor => "power-factor",
            Unit::Percent => "percent",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Ohm => "\u{03A9}",
            Unit::Hertz => "Hz",
            Unit::Farad => "F",
            Unit::DutyCycle => "%",
            Unit::Celsius => "C",
            Unit::Fahrenheit => "F",
            Unit::Watt => "W",
            Unit::VoltAmpere => "VA",
            Unit::PowerFactor => "cos\u{03C6}",
            Unit::Percent => "%",
        }
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Power-of-ten multiplier reported next to the displayed digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    #[default]
    None,
    Nano,
    Micro,
    Milli,
    Kilo,
    Mega,
}

impl Scale {
    pub fn multiplier(&self) -> f64 {
        match self {
            Scale::None => 1.0,
            Scale::Nano => 1e-9,
            Scale::Micro => 1e-6,
            Scale::Milli => 1e-3,
            Scale::Kilo => 1e3,
            Scale::Mega => 1e6,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Scale::None => None,
            Scale::Nano => Some("nano"),
            Scale::Micro => Some("micro"),
            Scale::Milli => Some("milli"),
            Scale::Kilo => Some("kilo"),
            Scale::Mega => Some("mega"),
        }
    }

    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            Scale::None => None,
            Scale::Nano => Some("n"),
            Scale::Micro => Some("\u{03BC}"),
            Scale::Milli => Some("m"),
            Scale::Kilo => Some("k"),
            Scale::Mega => Some("M"),
        }
    }
}

impl Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol().unwrap_or(""))
    }
}

/// Active measurement function of the instrument.
///
/// The serial chipsets report a common subset; the VC870 adds dual-value
/// power and loop-current functions on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    VoltageDc,
    VoltageAc,
    CurrentDc,
    CurrentAc,
    Resistance,
    Continuity,
    Diode,
    Capacitance,
    Frequency,
    Temperature,
    DutyCycle,
    LoopCurrentPercent,
    Power,
    PowerFactorFrequency,
    EffectiveVoltageCurrent,
}

impl Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::VoltageDc => f.write_str("voltage_dc"),
            OperationMode::VoltageAc => f.write_str("voltage_ac"),
            OperationMode::CurrentDc => f.write_str("current_dc"),
            OperationMode::CurrentAc => f.write_str("current_ac"),
            OperationMode::Resistance => f.write_str("resistance"),
            OperationMode::Continuity => f.write_str("continuity"),
            OperationMode::Diode => f.write_str("diode"),
            OperationMode::Capacitance => f.write_str("capacitance"),
            OperationMode::Frequency => f.write_str("frequency"),
            OperationMode::Temperature => f.write_str("temperature"),
            OperationMode::DutyCycle => f.write_str("duty_cycle"),
            OperationMode::LoopCurrentPercent => f.write_str("loop_current_percent"),
            OperationMode::Power => f.write_str("power"),
            OperationMode::PowerFactorFrequency => f.write_str("power_factor_frequency"),
            OperationMode::EffectiveVoltageCurrent => f.write_str("effective_voltage_current"),
        }
    }
}

/// Whether the displayed value is the live reading or a recorded extreme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Value,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RangeMode {
    Auto,
    Manual,
}

/// Status indicator asserted by the VC870.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Battery,
    Overflow,
    Max,
    Min,
    MaxMin,
    Rel,
    Open,
    Manual,
    Hold,
    Light,
    Warning,
    MisplugWarn,
    Lo,
    Hi,
}

impl Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Battery => f.write_str("battery"),
            Flag::Overflow => f.write_str("overflow"),
            Flag::Max => f.write_str("max"),
            Flag::Min => f.write_str("min"),
            Flag::MaxMin => f.write_str("maxmin"),
            Flag::Rel => f.write_str("rel"),
            Flag::Open => f.write_str("open"),
            Flag::Manual => f.write_str("manual"),
            Flag::Hold => f.write_str("hold"),
            Flag::Light => f.write_str("light"),
            Flag::Warning => f.write_str("warning"),
            Flag::MisplugWarn => f.write_str("misplug_warn"),
            Flag::Lo => f.write_str("lo"),
            Flag::Hi => f.write_str("hi"),
        }
    }
}

/// Set of asserted status indicators.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveFlags(Vec<Flag>);

impl ActiveFlags {
    pub fn is(&self, flag: Flag) -> bool {
        self.0.contains(&flag)
    }

    pub(crate) fn add(&mut self, flag: Flag) {
        if !self.0.contains(&flag) {
            self.0.push(flag);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter()
    }
}

impl Display for ActiveFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = self
            .0
            .iter()
            .map(Flag::to_string)
            .collect::<Vec<_>>()
            .join("|");
        f.write_str(&str)
    }
}

/// Timing attached to a reading: seconds since the driver opened, seconds
/// since the previous reading, and the absolute wall-clock timestamp.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeInfo {
    pub elapsed: f64,
    pub interval: f64,
    #[serde_as(as = "serde_with::TimestampSecondsWithFrac<f64>")]
    pub timestamp: DateTime<Utc>,
}

/// Normalized output of one decode cycle.
///
/// `value` is the raw displayed number; `scaled_value` is derived from
/// `value * scale` at construction and never set independently. A `None`
/// value means the display showed a blank or dashed field, which is not an
/// error condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub chipset: Chipset,
    pub mode: OperationMode,
    pub value: Option<f64>,
    pub unit: Unit,
    pub scale: Scale,
    pub scaled_value: Option<f64>,
    /// Recorded-extreme scope (EDI9604 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_battery: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<bool>,
    /// Asserted status indicators (VC870 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<ActiveFlags>,
    /// Secondary display value (VC870 dual-value modes only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux_unit: Option<Unit>,
    pub time: TimeInfo,
}

impl Reading {
    /// Build a reading with `scaled_value` computed from `value * scale`.
    /// All chipset-specific fields start out unset.
    pub(crate) fn new(
        chipset: Chipset,
        mode: OperationMode,
        value: Option<f64>,
        unit: Unit,
        scale: Scale,
        time: TimeInfo,
    ) -> Self {
        Self {
            chipset,
            mode,
            value,
            unit,
            scale,
            scaled_value: value.map(|v| v * scale.multiplier()),
            scope: None,
            range: None,
            relative: None,
            low_battery: None,
            hold: None,
            flags: None,
            aux_value: None,
            aux_unit: None,
            time,
        }
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prec = f.precision().unwrap_or(4);
        match self.value {
            Some(value) => f.write_fmt(format_args!(
                "{:.prec$} {}{}",
                value,
                self.scale,
                self.unit.symbol()
            )),
            None => f.write_str("---"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> TimeInfo {
        TimeInfo {
            elapsed: 0.0,
            interval: 0.0,
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    #[test]
    fn scaled_value_is_value_times_scale() {
        let reading = Reading::new(
            Chipset::Fs9721,
            OperationMode::VoltageDc,
            Some(123.4),
            Unit::Volt,
            Scale::Milli,
            epoch(),
        );
        assert_eq!(reading.scaled_value, Some(123.4 * 1e-3));
    }

    #[test]
    fn undefined_value_has_no_scaled_value() {
        let reading = Reading::new(
            Chipset::Fs9721,
            OperationMode::Resistance,
            None,
            Unit::Ohm,
            Scale::Kilo,
            epoch(),
        );
        assert_eq!(reading.scaled_value, None);
        assert_eq!(reading.to_string(), "---");
    }

    #[test]
    fn reading_serializes_as_key_value_tree() {
        let mut reading = Reading::new(
            Chipset::Edi9604,
            OperationMode::VoltageDc,
            Some(1.234),
            Unit::Volt,
            Scale::None,
            epoch(),
        );
        reading.scope = Some(Scope::Value);
        reading.range = Some(RangeMode::Auto);

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["mode"], "voltage_dc");
        assert_eq!(json["unit"], "V");
        assert_eq!(json["scaled_value"], 1.234);
        assert_eq!(json["scope"], "VALUE");
        // Fields foreign to this chipset stay out of the tree.
        assert!(json.get("flags").is_none());
        assert!(json.get("aux_value").is_none());
    }

    #[test]
    fn scale_accessors() {
        assert_eq!(Scale::Micro.multiplier(), 1e-6);
        assert_eq!(Scale::Micro.name(), Some("micro"));
        assert_eq!(Scale::Micro.symbol(), Some("\u{03BC}"));
        assert_eq!(Scale::None.name(), None);
    }

    #[test]
    fn active_flags_dedup_and_display() {
        let mut flags = ActiveFlags::default();
        flags.add(Flag::Battery);
        flags.add(Flag::Overflow);
        flags.add(Flag::Battery);
        assert!(flags.is(Flag::Overflow));
        assert_eq!(flags.to_string(), "battery|overflow");
    }
}
