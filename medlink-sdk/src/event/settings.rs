use super::{BgUnits, CarbUnits, EventMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSegment {
    /// Milliseconds after midnight
    pub start: i64,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetSegment {
    pub start: i64,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmountSegment {
    pub start: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsUnits {
    pub bg: Option<BgUnits>,
    pub carb: Option<CarbUnits>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueWithUnits {
    pub value: f64,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsulinAction {
    pub duration: u8,
    pub units: String,
}

impl InsulinAction {
    pub fn hours(duration: u8) -> Self {
        Self {
            duration,
            units: "hours".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BolusCalculator {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin: Option<InsulinAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BolusSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_maximum: Option<ValueWithUnits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculator: Option<BolusCalculator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<Toggle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryBasal {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasalSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_maximum: Option<ValueWithUnits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary: Option<TemporaryBasal>,
}

impl BasalSettings {
    pub fn is_empty(&self) -> bool {
        self.rate_maximum.is_none() && self.temporary.is_none()
    }
}

/// Therapy settings in force at one point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    pub active_schedule: String,
    pub basal_schedules: BTreeMap<String, Vec<ScheduleSegment>>,
    pub bg_target: Vec<TargetSegment>,
    pub carb_ratio: Vec<AmountSegment>,
    pub insulin_sensitivity: Vec<AmountSegment>,
    pub units: SettingsUnits,
    pub bolus: BolusSettings,
    pub basal: BasalSettings,
}

impl SettingsSnapshot {
    /// Segments of the active schedule, empty when it is unknown.
    pub fn active_segments(&self) -> &[ScheduleSegment] {
        self.basal_schedules
            .get(&self.active_schedule)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BloodGlucoseDisplay {
    pub units: Option<BgUnits>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Display {
    pub blood_glucose: BloodGlucoseDisplay,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpSettings {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub settings: SettingsSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub manufacturers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<Display>,
}

impl PumpSettings {
    pub fn new(meta: EventMeta, settings: SettingsSnapshot) -> Self {
        Self {
            meta,
            settings,
            manufacturers: Vec::new(),
            model: None,
            serial_number: None,
            display: None,
        }
    }
}
