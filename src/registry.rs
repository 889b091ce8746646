use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Decoder kind backing a registry model.
///
/// The decoder set is closed, so model dispatch is a plain lookup table
/// instead of anything dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Chipset {
    /// Fixed 14-byte serial frame (EDI9604).
    #[serde(rename = "EDI9604")]
    Edi9604,
    /// Self-framing nibble stream (Fortune FS9721).
    #[serde(rename = "FS9721")]
    Fs9721,
    /// USB-HID ASCII-framed protocol (Voltcraft VC870).
    #[serde(rename = "VC870")]
    Vc870,
}

impl Display for Chipset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chipset::Edi9604 => f.write_str("EDI9604"),
            Chipset::Fs9721 => f.write_str("FS9721"),
            Chipset::Vc870 => f.write_str("VC870"),
        }
    }
}

/// Model name to chipset table. Names are case-sensitive; many models are
/// rebadged variants of the same chipset.
#[rustfmt::skip]
pub const MODELS: &[(&str, Chipset)] = &[
    ("Default",           Chipset::Fs9721),
    ("Digitech_QM1538",   Chipset::Fs9721),
    ("Digitek_DT4000ZC",  Chipset::Fs9721),
    ("Eidechse_EDI9604",  Chipset::Edi9604),
    ("PCE_PCEDM32",       Chipset::Fs9721),
    ("Tecpel_DMM8062",    Chipset::Fs9721),
    ("TekPower_TP4000ZC", Chipset::Fs9721),
    ("UniTrend_UT30A",    Chipset::Fs9721),
    ("UniTrend_UT30E",    Chipset::Fs9721),
    ("UniTrend_UT60E",    Chipset::Fs9721),
    ("Voltcraft_VC820",   Chipset::Fs9721),
    ("Voltcraft_VC840",   Chipset::Fs9721),
    ("Voltcraft_VC870",   Chipset::Vc870),
];

/// Look up the chipset for a model name. Exact, case-sensitive match.
pub fn lookup(model: &str) -> Option<Chipset> {
    MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, chipset)| *chipset)
}

/// Supported model names in table order, as a serializable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedModels {
    pub models: Vec<String>,
}

pub fn models_supported() -> SupportedModels {
    SupportedModels {
        models: MODELS.iter().map(|(name, _)| name.to_string()).collect(),
    }
}
