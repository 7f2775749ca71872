//! Settings history.
//!
//! The pump only reports the settings in force now. Walking the change
//! records from newest to oldest and undoing each one reconstructs what was
//! in force before it; the simulator fills in the point-in-time values
//! (maximums, temp basal type) that are logged without their old value.

use super::BuildContext;
use crate::{
    config::{bg_targets, carb_ratios, insulin_sensitivities, profile_name, temp_basal_type},
    decoder::{filter_records, Record, RecordType},
};
use medlink_sdk::{
    AmountSegment, BasalSettings, BgUnits, BolusCalculator, BolusSettings, CarbUnits, DriverError,
    DriverResult, EventMeta, InsulinAction, PumpSettings, ScheduleSegment, SettingsSnapshot,
    SettingsUnits, TargetSegment, TemporaryBasal, Toggle, ValueWithUnits,
};
use tracing::debug;

const HALF_HOUR_MS: i64 = 30 * 60 * 1000;
const SCHEDULE_SLOTS: usize = 47;

const CARB_RATIO_SIZE: usize = 27;
const INSULIN_SENSITIVITY_SIZE: usize = 17;
const BG_TARGET_SIZE: usize = 25;
const NO_DURATION: u8 = 0x0F;

const CHANGE_TYPES: [RecordType; 8] = [
    RecordType::ChangeBasalProfileOld,
    RecordType::ChangeBasalProfileNew,
    RecordType::SelectBasalProfile,
    RecordType::BolusWizardChange,
    RecordType::ChangeTempBasalType,
    RecordType::ChangeMaxBasal,
    RecordType::VarBolusEnable,
    RecordType::MaxBolus,
];

/// Reconstructed settings events plus the settings in force before the
/// oldest change.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsHistory {
    pub events: Vec<PumpSettings>,
    /// Not dated yet; the caller stamps it with the first event's clock.
    pub initial: SettingsSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
struct WizardSettings {
    units: SettingsUnits,
    carb_ratio: Vec<AmountSegment>,
    insulin_sensitivity: Vec<AmountSegment>,
    bg_target: Vec<TargetSegment>,
    calculator: BolusCalculator,
}

impl WizardSettings {
    fn matches(&self, snapshot: &SettingsSnapshot) -> bool {
        snapshot.units == self.units
            && snapshot.carb_ratio == self.carb_ratio
            && snapshot.insulin_sensitivity == self.insulin_sensitivity
            && snapshot.bg_target == self.bg_target
            && snapshot.bolus.calculator.as_ref() == Some(&self.calculator)
    }

    fn apply(self, snapshot: &mut SettingsSnapshot) {
        snapshot.units = self.units;
        snapshot.carb_ratio = self.carb_ratio;
        snapshot.insulin_sensitivity = self.insulin_sensitivity;
        snapshot.bg_target = self.bg_target;
        snapshot.bolus = BolusSettings {
            calculator: Some(self.calculator),
            ..Default::default()
        };
    }
}

fn wizard_units(encoded: u8) -> SettingsUnits {
    SettingsUnits {
        bg: match (encoded >> 2) & 0x03 {
            0 => None,
            1 => Some(BgUnits::MgDl),
            _ => Some(BgUnits::MmolL),
        },
        carb: match encoded & 0x03 {
            0 => None,
            1 => Some(CarbUnits::Grams),
            _ => Some(CarbUnits::Exchanges),
        },
    }
}

fn window(bytes: &[u8], start: usize, len: usize) -> &[u8] {
    let end = (start + len).min(bytes.len());
    bytes.get(start..end).unwrap_or(&[])
}

/// Old and new calculator settings of a `BOLUS_WIZARD_CHANGE`.
fn wizard_settings(record: &Record) -> (WizardSettings, WizardSettings) {
    let body = &record.body[..];
    let flags = record.head_byte(1);

    let read = |start: usize, enabled: bool, duration: u8| {
        let units = wizard_units(body.get(start).copied().unwrap_or(0));
        let isf_at = start + CARB_RATIO_SIZE;
        let bg_at = isf_at + INSULIN_SENSITIVITY_SIZE - 1;
        WizardSettings {
            units,
            carb_ratio: carb_ratios(window(body, start, CARB_RATIO_SIZE), units.carb),
            insulin_sensitivity: insulin_sensitivities(
                window(body, isf_at, INSULIN_SENSITIVITY_SIZE),
                units.bg,
            ),
            bg_target: bg_targets(window(body, bg_at, BG_TARGET_SIZE), units.bg),
            calculator: BolusCalculator {
                enabled,
                insulin: (duration < NO_DURATION).then(|| InsulinAction::hours(duration)),
            },
        }
    };

    let new_at = CARB_RATIO_SIZE + INSULIN_SENSITIVITY_SIZE + BG_TARGET_SIZE - 1;
    let durations = body
        .get(new_at + CARB_RATIO_SIZE + INSULIN_SENSITIVITY_SIZE + BG_TARGET_SIZE - 1)
        .copied()
        .unwrap_or(0xFF);

    let old = read(0, (flags >> 2) & 0x01 != 0, durations & 0x0F);
    let new = read(new_at, (flags >> 3) & 0x01 != 0, durations >> 4);
    (old, new)
}

/// Basal schedule logged with a profile change. Slots are `(offset, rate, q)`.
fn logged_schedule(ctx: &BuildContext, record: &Record) -> Vec<ScheduleSegment> {
    if record.head_byte(1) == 0 {
        return Vec::new();
    }
    let mut schedule = Vec::new();
    for j in 0..SCHEDULE_SLOTS {
        let (offset, rate, q) = (
            record.body_byte(j * 3),
            record.body_byte(j * 3 + 1),
            record.body_byte(j * 3 + 2),
        );
        if j > 0 && offset == 0 && rate == 0 && q == 0 {
            break;
        }
        schedule.push(ScheduleSegment {
            start: offset as i64 * HALF_HOUR_MS,
            rate: ctx.units(rate as u32),
        });
    }
    if schedule.is_empty() {
        // cleared after a pump error
        schedule.push(ScheduleSegment { start: 0, rate: 0.0 });
    }
    schedule
}

/// Values logged without their previous setting.
#[derive(Debug, Clone, Default)]
struct PointInTime {
    bolus: BolusSettings,
    basal: BasalSettings,
}

pub fn build_settings(ctx: &BuildContext, records: &[Record]) -> DriverResult<SettingsHistory> {
    let mut changes = filter_records(records, &CHANGE_TYPES);
    changes.reverse();

    let current = &ctx.settings.snapshot;
    let mut working = current.clone();
    let mut stack = vec![working.clone()];
    let mut pit = PointInTime {
        bolus: current.bolus.clone(),
        basal: current.basal.clone(),
    };
    let mut events = Vec::new();

    // current settings, dated by the newest change when there is one
    let current_meta = match changes.first() {
        Some(newest) => ctx.meta(newest),
        None => {
            let device_time = ctx.settings.current_device_time;
            let mut meta = EventMeta::new(device_time, ctx.device_id.as_str());
            meta.time = ctx.tzo.apply_timezone(device_time);
            meta.timezone_offset = ctx.tzo.timezone_offset();
            meta
        }
    };
    events.push(PumpSettings::new(current_meta, current.clone()));

    let mut prev_date = None;
    let mut i = 0;
    while i < changes.len() {
        let mut record = changes[i];

        match record.record_type {
            RecordType::SelectBasalProfile => match profile_name(record.head_byte(1)) {
                Some(name) => working.active_schedule = name.to_string(),
                None => debug!(profile = record.head_byte(1), "unknown basal profile selected"),
            },
            RecordType::VarBolusEnable => {
                pit.bolus.extended = Some(Toggle {
                    enabled: record.head_byte(1) != 0,
                });
            }
            RecordType::MaxBolus => {
                let strokes = (((record.head_byte(1) & 0x1F) as u32) << 5)
                    | (((record.date_byte(2) & 0xE0) >> 3) as u32)
                    | (((record.date_byte(4) & 0xC0) >> 6) as u32);
                pit.bolus.amount_maximum = Some(ValueWithUnits {
                    value: ctx.units(strokes),
                    units: "Units".into(),
                });
            }
            RecordType::ChangeMaxBasal => {
                let strokes =
                    record.head_byte(1) as u32 | (((record.date_byte(2) & 0xE0) as u32) << 3);
                pit.basal.rate_maximum = Some(ValueWithUnits {
                    value: ctx.units(strokes),
                    units: "Units/hour".into(),
                });
            }
            RecordType::ChangeTempBasalType => {
                pit.basal.temporary = Some(TemporaryBasal {
                    kind: temp_basal_type(record.head_byte(1)).into(),
                });
            }
            RecordType::BolusWizardChange => {
                if (record.head_byte(1) >> 1) & 0x01 == 0 {
                    // setup not complete, left behind by a pump reset
                    i += 1;
                    continue;
                }
                let (old, new) = wizard_settings(record);
                if !new.matches(&working) {
                    debug!(?new, "could not find bolus wizard settings");
                    return Err(DriverError::DecodeError(
                        "Could not find bolus wizard settings".into(),
                    ));
                }
                old.apply(&mut working);
            }
            RecordType::ChangeBasalProfileNew => {
                if let Some(name) = profile_name(record.date_byte(2) >> 5) {
                    working.active_schedule = name.to_string();
                }
                let new_schedule = logged_schedule(ctx, record);

                i += 1;
                let Some(old_record) = changes.get(i).copied() else {
                    debug!("old basal schedule has dropped off the end");
                    break;
                };
                if !old_record.is(RecordType::ChangeBasalProfileOld) {
                    return Err(DriverError::DecodeError("Old basal schedule is missing".into()));
                }
                record = old_record;
                let old_schedule = logged_schedule(ctx, record);

                let active = working
                    .basal_schedules
                    .entry(working.active_schedule.clone())
                    .or_default();
                if *active == new_schedule {
                    *active = old_schedule;
                } else if active.is_empty() {
                    debug!("pump settings were cleared, using last available settings");
                    *active = old_schedule;
                } else {
                    return Err(DriverError::DecodeError("Could not find basal schedule".into()));
                }
            }
            _ => {}
        }

        stack.push(working.clone());

        if prev_date.is_some_and(|prev| prev != record.timestamp) {
            // the change logged at this instant produced the settings one
            // step newer on the stack
            let mut snapshot = stack[stack.len() - 2].clone();
            snapshot.bolus = BolusSettings {
                calculator: snapshot.bolus.calculator.take(),
                extended: pit.bolus.extended.clone(),
                amount_maximum: pit.bolus.amount_maximum.clone(),
            };
            snapshot.basal = pit.basal.clone();
            events.push(PumpSettings::new(ctx.meta(record), snapshot));
        }

        prev_date = Some(record.timestamp);
        pit = PointInTime::default();
        i += 1;
    }

    let mut initial = stack.pop().unwrap_or_else(|| current.clone());
    initial.bolus = BolusSettings {
        calculator: initial.bolus.calculator.take(),
        ..Default::default()
    };
    initial.basal = BasalSettings::default();

    Ok(SettingsHistory { events, initial })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::fixtures::{at, context, record};

    fn profile_change(kind: RecordType, rate: u8, index: u64) -> Record {
        record(kind, &[kind.opcode(), 1], &[0, 0, 0, 14, 16], &[0, rate, 0], at(6, 0, 0), index)
    }

    fn with_schedule(rate: f64) -> BuildContext {
        let mut ctx = context();
        ctx.settings
            .snapshot
            .basal_schedules
            .insert("standard".into(), vec![ScheduleSegment { start: 0, rate }]);
        ctx
    }

    #[test]
    fn no_changes_dates_current_settings_by_pump_clock() {
        let ctx = context();
        let history = build_settings(&ctx, &[]).unwrap();
        assert_eq!(history.events.len(), 1);
        let current = &history.events[0];
        assert_eq!(current.meta.index, None);
        assert_eq!(current.meta.device_time, at(23, 0, 0));
        assert_eq!(current.settings, ctx.settings.snapshot);
        assert!(history.initial.bolus.amount_maximum.is_none());
        assert!(history.initial.basal.is_empty());
    }

    #[test]
    fn profile_change_is_undone() {
        let ctx = with_schedule(1.0);
        let max_bolus = record(
            RecordType::MaxBolus,
            &[0x24, 0x01],
            &[0, 0, 0x40, 14, 16],
            &[],
            at(9, 0, 0),
            8,
        );
        let records = [
            profile_change(RecordType::ChangeBasalProfileOld, 20, 5),
            profile_change(RecordType::ChangeBasalProfileNew, 40, 6),
            max_bolus,
        ];
        let history = build_settings(&ctx, &records).unwrap();

        assert_eq!(history.events.len(), 2);
        assert_eq!(history.events[0].meta.index, Some(8));
        assert_eq!(history.events[0].meta.device_time, at(9, 0, 0));

        let at_change = &history.events[1];
        assert_eq!(at_change.meta.index, Some(5));
        assert_eq!(at_change.settings.active_segments()[0].rate, 1.0);
        assert!(at_change.settings.bolus.amount_maximum.is_none());

        assert_eq!(history.initial.active_segments(), &[ScheduleSegment { start: 0, rate: 0.5 }]);
    }

    #[test]
    fn mismatched_profile_fails() {
        let ctx = with_schedule(2.0);
        let records = [
            profile_change(RecordType::ChangeBasalProfileOld, 20, 5),
            profile_change(RecordType::ChangeBasalProfileNew, 40, 6),
        ];
        let err = build_settings(&ctx, &records).unwrap_err();
        assert!(err.to_string().contains("Could not find basal schedule"));
    }

    #[test]
    fn new_profile_without_old_fails() {
        let ctx = with_schedule(1.0);
        let records = [
            profile_change(RecordType::SelectBasalProfile, 0, 5),
            profile_change(RecordType::ChangeBasalProfileNew, 40, 6),
        ];
        let err = build_settings(&ctx, &records).unwrap_err();
        assert!(err.to_string().contains("Old basal schedule is missing"));
    }

    fn wizard_change(flags: u8, old_units: u8, durations: u8) -> Record {
        let mut body = [0u8; 137];
        body[0] = old_units;
        body[3] = 0x00;
        body[4] = 150;
        body[136] = durations;
        record(RecordType::BolusWizardChange, &[0x5A, flags], &[0, 0, 0, 14, 16], &body, at(6, 0, 0), 4)
    }

    #[test]
    fn wizard_change_restores_old_settings() {
        let ctx = context();
        // new setup complete, old calculator enabled with 4 h action
        let records = [wizard_change(0b0110, 0x05, 0xF4)];
        let history = build_settings(&ctx, &records).unwrap();
        let initial = &history.initial;
        assert_eq!(initial.units.bg, Some(BgUnits::MgDl));
        assert_eq!(initial.units.carb, Some(CarbUnits::Grams));
        assert_eq!(initial.carb_ratio, vec![AmountSegment { start: 0, amount: 15.0 }]);
        assert_eq!(
            initial.bolus.calculator,
            Some(BolusCalculator {
                enabled: true,
                insulin: Some(InsulinAction::hours(4)),
            })
        );
    }

    #[test]
    fn wizard_change_mismatch_fails() {
        let records = [wizard_change(0b0010, 0x05, 0x44)];
        let err = build_settings(&context(), &records).unwrap_err();
        assert!(err.to_string().contains("Could not find bolus wizard settings"));
    }

    #[test]
    fn incomplete_wizard_setup_is_ignored() {
        let records = [wizard_change(0, 0x05, 0x44)];
        let history = build_settings(&context(), &records).unwrap();
        assert!(history.initial.carb_ratio.is_empty());
    }
}
