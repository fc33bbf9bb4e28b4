//! Units of EMS field values
//!
//! A unit decides how a decoded value is presented: a sign appended to
//! numbers, an optional plausible range and, for enumerations, the label of
//! every raw value.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::field::Value;

/// Display unit of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Minute,
    Hour,
    Celsius,
    Percent,
    Bar,
    MicroAmpere,
    LiterPerMin,
    YesNo,
    OpenClosed,
    OnOff,
    WeekDay,
    OffOnAuto,
    /// Drink water mode, `0xDB` is ECO
    DwMode,
    /// Drink water loading system, `0xFF` is a three way valve
    DwLoading,
    DwType,
    /// Online bitmap entry
    Device,
    HcInstallation,
    HcWorkMode,
    HcRemote,
    HcOperation,
    UbaMsTimestamp,
    UbaMmNeed,
    UbaFtValve,
    HwDcProgram,
}

impl Unit {
    /// Sign appended to rendered values, empty for enumerations
    pub fn sign(&self) -> &'static str {
        match self {
            Unit::Minute => "min",
            Unit::Hour => "h",
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::Bar => "bar",
            Unit::MicroAmpere => "µA",
            Unit::LiterPerMin => "l/min",
            _ => "",
        }
    }

    /// Plausible value range (inclusive)
    pub fn range(&self) -> Option<(i64, i64)> {
        match self {
            Unit::Minute => Some((0, 60)),
            Unit::Hour => Some((0, 24)),
            Unit::Celsius => Some((0, 80)),
            Unit::Percent => Some((0, 100)),
            _ => None,
        }
    }

    /// Labels indexed by the raw value
    pub fn labels(&self) -> Option<&'static [&'static str]> {
        let labels: &'static [&'static str] = match self {
            Unit::YesNo => &["No", "Yes"],
            Unit::OpenClosed => &["Closed", "Open"],
            Unit::OnOff => &["Off", "On"],
            Unit::WeekDay => &[
                "Monday",
                "Tuesday",
                "Wednesday",
                "Thursday",
                "Friday",
                "Saturday",
                "Sunday",
                "Daily",
            ],
            Unit::OffOnAuto => &["Always off", "Always on", "Auto"],
            Unit::DwType => &[
                "No drink water",
                "Flow heating",
                "Flow heating with small hot water tank",
                "Hot water tank",
            ],
            Unit::Device => &["Absent", "Present"],
            Unit::HcInstallation => &[
                "(unknown)",
                "Radiator",
                "Convector",
                "Floor heating",
                "Room forward flow",
            ],
            Unit::HcWorkMode => &["Off", "Reduced", "Room guided", "Outside guided"],
            Unit::HcRemote => &["(none)", "RC20", "RC3x"],
            Unit::HcOperation => &["Night", "Day", "Auto"],
            Unit::UbaMsTimestamp => &["None", "Working hours", "Date"],
            Unit::UbaMmNeed => &[
                "No",
                "1",
                "2",
                "Yes, by working hours",
                "4",
                "5",
                "6",
                "7",
                "Yes, by date",
            ],
            Unit::UbaFtValve => &["Heat circuit", "Drinkwater circuit"],
            Unit::HwDcProgram => &["By heat circuit", "Separate program"],
            _ => return None,
        };
        Some(labels)
    }

    /// Check a numeric value against the unit range
    ///
    /// Units without a range accept everything.
    pub fn contains(&self, value: &Value) -> bool {
        match (self.range(), value.as_f64()) {
            (Some((min, max)), Some(v)) => v >= min as f64 && v <= max as f64,
            _ => true,
        }
    }

    /// Render a value with this unit
    pub fn render(&self, value: &Value) -> String {
        let text = match self {
            Unit::DwMode => match value.as_i64() {
                Some(0xDB) => "ECO".to_string(),
                _ => "Comfort".to_string(),
            },
            Unit::DwLoading => match value.as_i64() {
                Some(0xFF) => "Three way valve".to_string(),
                _ => "Pump".to_string(),
            },
            _ => self
                .labels()
                .and_then(|labels| value.as_index().and_then(|i| labels.get(i)))
                .map(|label| label.to_string())
                .unwrap_or_else(|| value.to_string()),
        };

        let sign = self.sign();
        if sign.is_empty() {
            text
        } else {
            format!("{} {}", text, sign)
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = self.sign();
        if sign.is_empty() {
            write!(f, "{:?}", self)
        } else {
            f.write_str(sign)
        }
    }
}
