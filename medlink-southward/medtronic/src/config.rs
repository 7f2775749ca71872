//! Pump configuration replies and the settings snapshot built from them.

use crate::protocol::packet::STROKES_PER_UNIT;
use chrono::{NaiveDate, NaiveDateTime};
use medlink_sdk::{
    AmountSegment, BasalSettings, BgUnits, BolusCalculator, BolusSettings, CarbUnits,
    DeltaMarkers, InsulinAction, ScheduleSegment, SettingsSnapshot, SettingsUnits,
    TargetSegment, TemporaryBasal, Toggle, ValueWithUnits,
};
use std::collections::BTreeMap;

pub const MAX_HISTORY_PAGES: u32 = 36;
pub const MAX_CBG_PAGES: u32 = 32;

const HALF_HOUR_MS: i64 = 30 * 60 * 1000;
const PROFILE_SLOTS: usize = 47;
const PROFILE_CLEARED: u8 = 0x3F;
const SCHEDULE_SLOTS: usize = 8;

/// Basal profile names indexed by the pump's profile number.
pub const PROFILES: [&str; 3] = ["standard", "pattern a", "pattern b"];

pub fn profile_name(index: u8) -> Option<&'static str> {
    PROFILES.get(index as usize).copied()
}

#[inline]
pub(crate) fn byte_at(bytes: &[u8], i: usize) -> u8 {
    bytes.get(i).copied().unwrap_or(0)
}

#[inline]
pub(crate) fn be_u16_at(bytes: &[u8], i: usize) -> u16 {
    u16::from_be_bytes([byte_at(bytes, i), byte_at(bytes, i + 1)])
}

#[inline]
pub(crate) fn be_u32_at(bytes: &[u8], i: usize) -> u32 {
    u32::from_be_bytes([
        byte_at(bytes, i),
        byte_at(bytes, i + 1),
        byte_at(bytes, i + 2),
        byte_at(bytes, i + 3),
    ])
}

/// Round to five decimals.
pub(crate) fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

pub fn bg_units(code: u8) -> Option<BgUnits> {
    match code {
        1 => Some(BgUnits::MgDl),
        2 => Some(BgUnits::MmolL),
        _ => None,
    }
}

pub fn carb_units(code: u8) -> Option<CarbUnits> {
    match code {
        1 => Some(CarbUnits::Grams),
        2 => Some(CarbUnits::Exchanges),
        _ => None,
    }
}

/// READ_MODEL reply: a length-prefixed ASCII string.
pub fn parse_model(payload: &[u8]) -> String {
    let len = byte_at(payload, 0) as usize;
    let end = (1 + len).min(payload.len());
    payload
        .get(1..end)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

/// Basal profile reply. Slots are `(rate, q, offset)`; a `0x3F` offset marks
/// cleared settings, and only the first slot may be all zero.
pub fn parse_profile(payload: &[u8]) -> Vec<ScheduleSegment> {
    let mut schedule = Vec::new();
    for j in 0..PROFILE_SLOTS {
        let (rate, q, offset) = (
            byte_at(payload, j * 3),
            byte_at(payload, j * 3 + 1),
            byte_at(payload, j * 3 + 2),
        );
        if offset == PROFILE_CLEARED || (j > 0 && offset == 0 && rate == 0 && q == 0) {
            break;
        }
        schedule.push(ScheduleSegment {
            start: offset as i64 * HALF_HOUR_MS,
            rate: rate as f64 / STROKES_PER_UNIT,
        });
    }
    schedule
}

pub fn carb_ratios(encoded: &[u8], units: Option<CarbUnits>) -> Vec<AmountSegment> {
    let mut ratios: Vec<AmountSegment> = Vec::new();
    for j in 0..SCHEDULE_SLOTS {
        let offset = byte_at(encoded, j * 3 + 2);
        let raw = be_u16_at(encoded, j * 3 + 3);
        if offset == 0 && raw == 0 {
            break;
        }
        let start = offset as i64 * HALF_HOUR_MS;
        if ratios.last().is_some_and(|last| start < last.start) {
            tracing::debug!(offset, raw, "dropping carb ratio with invalid start time");
            break;
        }
        let mut ratio = raw as f64;
        if units == Some(CarbUnits::Exchanges) {
            ratio /= 100.0;
        }
        ratios.push(AmountSegment {
            start,
            amount: round5(ratio / 10.0),
        });
    }
    ratios
}

pub fn bg_targets(encoded: &[u8], units: Option<BgUnits>) -> Vec<TargetSegment> {
    let mut targets = Vec::new();
    for j in 0..SCHEDULE_SLOTS {
        let (offset, low, high) = (
            byte_at(encoded, j * 3 + 1),
            byte_at(encoded, j * 3 + 2),
            byte_at(encoded, j * 3 + 3),
        );
        if offset == 0 && low == 0 && high == 0 {
            break;
        }
        let scale = if units == Some(BgUnits::MmolL) { 10.0 } else { 1.0 };
        targets.push(TargetSegment {
            start: offset as i64 * HALF_HOUR_MS,
            low: low as f64 / scale,
            high: high as f64 / scale,
        });
    }
    targets
}

pub fn insulin_sensitivities(encoded: &[u8], units: Option<BgUnits>) -> Vec<AmountSegment> {
    let mut sensitivities = Vec::new();
    for j in 0..SCHEDULE_SLOTS {
        let (offset, val) = (byte_at(encoded, j * 2 + 1), byte_at(encoded, j * 2 + 2));
        if offset == 0 && val == 0 {
            break;
        }
        let mut amount = (val as u32 + (((offset & 0xC0) as u32) << 2)) as f64;
        if units == Some(BgUnits::MmolL) {
            amount /= 10.0;
        }
        sensitivities.push(AmountSegment {
            start: (offset & 0x3F) as i64 * HALF_HOUR_MS,
            amount,
        });
    }
    sensitivities
}

/// READ_SETTINGS reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpOptions {
    pub active_schedule: String,
    pub active_insulin_time: u8,
    pub max_basal_rate: f64,
    pub max_bolus: f64,
    pub extended_bolus_enabled: bool,
    pub temp_basal_type: &'static str,
}

impl PumpOptions {
    pub fn parse(payload: &[u8]) -> Self {
        Self {
            active_schedule: profile_name(byte_at(payload, 11))
                .unwrap_or(PROFILES[0])
                .to_string(),
            active_insulin_time: byte_at(payload, 17),
            max_basal_rate: be_u16_at(payload, 7) as f64 / STROKES_PER_UNIT,
            max_bolus: byte_at(payload, 6) as f64 / 10.0,
            extended_bolus_enabled: byte_at(payload, 4) != 0,
            temp_basal_type: temp_basal_type(byte_at(payload, 14)),
        }
    }
}

pub(crate) fn temp_basal_type(flag: u8) -> &'static str {
    if flag != 0 {
        "percent"
    } else {
        "Units/hour"
    }
}

/// READ_CURRENT_CBG_PAGE reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbgPosition {
    pub cbg: u32,
    pub glucose: u8,
    pub isig: u8,
}

impl CbgPosition {
    pub fn parse(payload: &[u8]) -> Self {
        Self {
            cbg: be_u32_at(payload, 0),
            glucose: byte_at(payload, 5),
            isig: byte_at(payload, 7),
        }
    }
}

/// READ_TIME reply: hour, minute, second, BE year, month, day.
pub fn parse_rtc(payload: &[u8]) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(
        be_u16_at(payload, 3) as i32,
        byte_at(payload, 5) as u32,
        byte_at(payload, 6) as u32,
    )?
    .and_hms_opt(
        byte_at(payload, 0) as u32,
        byte_at(payload, 1) as u32,
        byte_at(payload, 2) as u32,
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub low: bool,
    pub voltage: f64,
}

impl BatteryStatus {
    pub fn parse(payload: &[u8]) -> Self {
        Self {
            low: byte_at(payload, 0) != 0,
            voltage: be_u16_at(payload, 1) as f64 / 100.0,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.low {
            "low"
        } else {
            "normal"
        }
    }
}

/// Which pages the fetch stage reads, and the markers the upload records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    pub history_pages: u32,
    pub cbg_current_page: u32,
    pub glucose_pages: u32,
    pub isig_pages: u32,
    pub first_upload: bool,
    pub delta: DeltaMarkers,
}

fn position_to_page(last: Option<u32>, current: u32) -> u32 {
    match last {
        Some(last) => current.saturating_sub(last),
        None => current,
    }
}

impl PagePlan {
    pub fn new(current_page: u32, cbg: CbgPosition, last: Option<&DeltaMarkers>) -> Self {
        let last = last.copied().unwrap_or_default();
        let history = position_to_page(last.last_position, current_page);

        let pages_for = |last_position: Option<u32>, current: u8| {
            let pages = if last_position == Some(MAX_CBG_PAGES) {
                cbg.cbg.saturating_sub(last.last_cbg_position.unwrap_or(0))
            } else {
                position_to_page(last_position, current as u32)
            };
            (pages + 1).min(MAX_CBG_PAGES)
        };

        Self {
            history_pages: history.min(MAX_HISTORY_PAGES) + 1,
            cbg_current_page: cbg.cbg,
            glucose_pages: pages_for(last.last_glucose_position, cbg.glucose),
            isig_pages: pages_for(last.last_isig_position, cbg.isig),
            first_upload: last.last_position.is_none(),
            delta: DeltaMarkers {
                last_position: Some(current_page),
                last_cbg_position: Some(cbg.cbg),
                last_glucose_position: Some(cbg.glucose as u32),
                last_isig_position: Some(cbg.isig as u32),
            },
        }
    }
}

/// Raw configuration replies collected during `getConfigInfo`.
#[derive(Debug, Clone, Default)]
pub struct ConfigReplies {
    pub profiles: BTreeMap<String, Vec<ScheduleSegment>>,
    pub bg_units: Option<BgUnits>,
    pub bg_targets: Vec<TargetSegment>,
    pub carb_units: Option<CarbUnits>,
    pub carb_ratios: Vec<AmountSegment>,
    pub wizard_enabled: bool,
    pub insulin_sensitivities: Vec<u8>,
    pub options: Option<PumpOptions>,
}

/// Pump identity and the settings in force when the pump was read.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSettings {
    pub model_number: String,
    pub serial_number: String,
    pub strokes_per_unit: f64,
    pub snapshot: SettingsSnapshot,
    pub current_device_time: NaiveDateTime,
}

impl CurrentSettings {
    pub fn assemble(
        model_number: &str,
        serial_number: &str,
        replies: ConfigReplies,
        current_device_time: NaiveDateTime,
    ) -> Self {
        let units = SettingsUnits {
            bg: replies.bg_units,
            carb: replies.carb_units,
        };
        let options = replies.options.unwrap_or_else(|| PumpOptions::parse(&[]));
        let mut calculator = BolusCalculator {
            enabled: replies.wizard_enabled,
            insulin: None,
        };
        if calculator.enabled {
            calculator.insulin = Some(InsulinAction::hours(options.active_insulin_time));
        }

        let snapshot = SettingsSnapshot {
            active_schedule: options.active_schedule.clone(),
            basal_schedules: replies.profiles,
            bg_target: replies.bg_targets,
            carb_ratio: replies.carb_ratios,
            insulin_sensitivity: insulin_sensitivities(&replies.insulin_sensitivities, units.bg),
            units,
            bolus: BolusSettings {
                amount_maximum: Some(ValueWithUnits {
                    value: options.max_bolus,
                    units: "Units".into(),
                }),
                calculator: Some(calculator),
                extended: Some(Toggle {
                    enabled: options.extended_bolus_enabled,
                }),
            },
            basal: BasalSettings {
                rate_maximum: Some(ValueWithUnits {
                    value: options.max_basal_rate,
                    units: "Units/hour".into(),
                }),
                temporary: Some(TemporaryBasal {
                    kind: options.temp_basal_type.into(),
                }),
            },
        };

        Self {
            model_number: model_number.to_string(),
            serial_number: serial_number.to_string(),
            strokes_per_unit: STROKES_PER_UNIT,
            snapshot,
            current_device_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_is_length_prefixed() {
        assert_eq!(parse_model(&[3, b'5', b'5', b'4', 0, 0]), "554");
        assert_eq!(parse_model(&[0, 0, 0]), "");
    }

    #[test]
    fn profile_stops_at_cleared_offset() {
        let payload = [0x28, 0, 0x00, 0x30, 0, 0x0C, 0, 0, 0x3F, 0x10, 0, 0x20];
        let schedule = parse_profile(&payload);
        assert_eq!(
            schedule,
            vec![
                ScheduleSegment { start: 0, rate: 1.0 },
                ScheduleSegment { start: 12 * HALF_HOUR_MS, rate: 1.2 },
            ]
        );
    }

    #[test]
    fn profile_keeps_zero_first_slot() {
        let schedule = parse_profile(&[0u8; 141]);
        assert_eq!(schedule, vec![ScheduleSegment { start: 0, rate: 0.0 }]);
    }

    #[test]
    fn profile_cleared_before_first_slot_is_empty() {
        assert!(parse_profile(&[0, 0, 0x3F]).is_empty());
    }

    #[test]
    fn carb_ratios_in_exchanges() {
        // units byte, spare, then (offset, BE ratio)
        let encoded = [2, 0, 0, 0x00, 0x96, 12, 0x01, 0x2C];
        let ratios = carb_ratios(&encoded, Some(CarbUnits::Exchanges));
        assert_eq!(ratios.len(), 2);
        assert_eq!(ratios[0].amount, 0.15);
        assert_eq!(ratios[1].start, 12 * HALF_HOUR_MS);
        assert_eq!(ratios[1].amount, 0.3);
    }

    #[test]
    fn carb_ratios_stop_on_decreasing_start() {
        let encoded = [1, 0, 4, 0, 100, 2, 0, 120];
        let ratios = carb_ratios(&encoded, Some(CarbUnits::Grams));
        assert_eq!(ratios, vec![AmountSegment { start: 4 * HALF_HOUR_MS, amount: 10.0 }]);
    }

    #[test]
    fn sensitivities_borrow_offset_high_bits() {
        let encoded = [1, 0x40, 0x2C, 0x10, 50];
        let isf = insulin_sensitivities(&encoded, Some(BgUnits::MgDl));
        assert_eq!(isf[0], AmountSegment { start: 0, amount: 300.0 });
        assert_eq!(isf[1], AmountSegment { start: 16 * HALF_HOUR_MS, amount: 50.0 });
        let mmol = insulin_sensitivities(&[2, 0, 25], Some(BgUnits::MmolL));
        assert_eq!(mmol[0].amount, 2.5);
    }

    #[test]
    fn settings_reply_fields() {
        let mut payload = [0u8; 20];
        payload[4] = 1;
        payload[6] = 100;
        payload[7] = 0x00;
        payload[8] = 0x78;
        payload[11] = 1;
        payload[14] = 1;
        payload[17] = 4;
        let options = PumpOptions::parse(&payload);
        assert_eq!(options.active_schedule, "pattern a");
        assert_eq!(options.max_bolus, 10.0);
        assert_eq!(options.max_basal_rate, 3.0);
        assert!(options.extended_bolus_enabled);
        assert_eq!(options.temp_basal_type, "percent");
        assert_eq!(options.active_insulin_time, 4);
    }

    #[test]
    fn rtc_reply() {
        let dt = parse_rtc(&[13, 45, 10, 0x07, 0xE0, 11, 14]).unwrap();
        assert_eq!(dt.to_string(), "2016-11-14 13:45:10");
        assert!(parse_rtc(&[0; 7]).is_none());
    }

    #[test]
    fn first_upload_reads_everything_up_to_caps() {
        let plan = PagePlan::new(
            50,
            CbgPosition { cbg: 100, glucose: 40, isig: 3 },
            None,
        );
        assert_eq!(plan.history_pages, 37);
        assert_eq!(plan.glucose_pages, 32);
        assert_eq!(plan.isig_pages, 4);
        assert!(plan.first_upload);
        assert_eq!(plan.delta.last_position, Some(50));
    }

    #[test]
    fn delta_upload_reads_new_pages_only() {
        let last = DeltaMarkers {
            last_position: Some(48),
            last_cbg_position: Some(95),
            last_glucose_position: Some(32),
            last_isig_position: Some(2),
        };
        let plan = PagePlan::new(
            50,
            CbgPosition { cbg: 100, glucose: 32, isig: 3 },
            Some(&last),
        );
        assert_eq!(plan.history_pages, 3);
        assert_eq!(plan.glucose_pages, 6);
        assert_eq!(plan.isig_pages, 2);
        assert!(!plan.first_upload);
    }

    #[test]
    fn assembles_snapshot_with_calculator_insulin() {
        let mut options = [0u8; 20];
        options[17] = 3;
        options[6] = 50;
        let mut profiles = BTreeMap::new();
        profiles.insert("standard".to_string(), vec![ScheduleSegment { start: 0, rate: 0.5 }]);
        let replies = ConfigReplies {
            profiles,
            bg_units: Some(BgUnits::MgDl),
            wizard_enabled: true,
            insulin_sensitivities: vec![1, 0, 40],
            options: Some(PumpOptions::parse(&options)),
            ..Default::default()
        };
        let now = parse_rtc(&[1, 0, 0, 0x07, 0xE0, 1, 1]).unwrap();
        let current = CurrentSettings::assemble("554", "123456", replies, now);
        let calc = current.snapshot.bolus.calculator.as_ref().unwrap();
        assert_eq!(calc.insulin, Some(InsulinAction::hours(3)));
        assert_eq!(current.snapshot.insulin_sensitivity[0].amount, 40.0);
        assert_eq!(current.snapshot.active_segments()[0].rate, 0.5);
        assert_eq!(current.snapshot.bolus.amount_maximum.as_ref().unwrap().value, 5.0);
    }
}
