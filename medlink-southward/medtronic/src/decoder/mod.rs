//! History page decoder.
//!
//! Every record starts with an opcode byte. The opcode selects a static
//! `(head, date, body)` layout; a few record types resolve part of their
//! layout from the head bytes or from the pump model. Pages are walked oldest
//! first and every record gets a running index, which later ties builder
//! output back to its position in the stream.

mod cbg;
mod date;

pub use cbg::{decode_cbg_pages, CbgRecord, CbgRecordType};
pub use date::decode_date;

use crate::protocol::session::HistoryPage;
use bytes::Bytes;
use chrono::NaiveDateTime;
use medlink_sdk::{checksum::to_hex, WireDecode};
use thiserror::Error;
use tracing::debug;

/// Usable bytes of a history page; the rest is the CRC trailer.
pub const PAGE_DATA_SIZE: usize = 1022;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub head: usize,
    pub date: usize,
    pub body: usize,
}

impl Layout {
    pub const fn len(&self) -> usize {
        self.head + self.date + self.body
    }
}

const fn layout(head: usize, date: usize, body: usize) -> Layout {
    Layout { head, date, body }
}

/// Default layout of record types the table does not override.
const DEFAULT: Layout = layout(2, 5, 0);

macro_rules! record_types {
    (@layout) => { DEFAULT };
    (@layout $layout:expr) => { $layout };
    ($( $variant:ident = $code:literal, $name:literal $(=> $layout:expr)? ; )*) => {
        /// History record types known to the Paradigm pumps.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RecordType {
            $( $variant, )*
        }

        impl RecordType {
            pub fn from_opcode(opcode: u8) -> Option<Self> {
                match opcode {
                    $( $code => Some(Self::$variant), )*
                    _ => None,
                }
            }

            pub fn opcode(self) -> u8 {
                match self {
                    $( Self::$variant => $code, )*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }

            /// Layout before any per-record adjustment.
            pub fn base_layout(self) -> Layout {
                match self {
                    $( Self::$variant => record_types!(@layout $($layout)?), )*
                }
            }
        }
    };
}

record_types! {
    Bolus = 0x01, "BOLUS" => layout(8, 5, 0);
    Prime = 0x03, "PRIME" => layout(5, 5, 0);
    AlarmPump = 0x06, "ALARM_PUMP" => layout(4, 5, 0);
    ResultDailyTotal = 0x07, "RESULT_DAILY_TOTAL" => layout(5, 2, 3);
    ChangeBasalProfileOld = 0x08, "CHANGE_BASAL_PROFILE_OLD" => layout(2, 5, 145);
    ChangeBasalProfileNew = 0x09, "CHANGE_BASAL_PROFILE_NEW" => layout(2, 5, 145);
    CalBgForPh = 0x0A, "CAL_BG_FOR_PH";
    AlarmSensor = 0x0B, "ALARM_SENSOR" => layout(3, 5, 0);
    ClearAlarm = 0x0C, "CLEAR_ALARM";
    SelectBasalProfile = 0x14, "SELECT_BASAL_PROFILE";
    TempBasalDuration = 0x16, "TEMP_BASAL_DURATION";
    ChangeTime = 0x17, "CHANGE_TIME";
    NewTimeSet = 0x18, "NEW_TIME_SET";
    LowBattery = 0x19, "LOW_BATTERY";
    Battery = 0x1A, "BATTERY";
    SetAutoOff = 0x1B, "SET_AUTO_OFF";
    Concentration = 0x1C, "CONCENTRATION";
    PumpSuspend = 0x1E, "PUMP_SUSPEND";
    PumpResume = 0x1F, "PUMP_RESUME";
    SelfTest = 0x20, "SELF_TEST";
    Rewind = 0x21, "REWIND";
    Clear = 0x22, "CLEAR";
    Block = 0x23, "BLOCK";
    MaxBolus = 0x24, "MAX_BOLUS";
    MaxBasal = 0x25, "MAX_BASAL";
    EnableDisableRemote = 0x26, "ENABLE_DISABLE_REMOTE" => layout(2, 5, 14);
    ChangeRemoteId = 0x27, "CHANGE_REMOTE_ID";
    CodeUpdate = 0x29, "CODE_UPDATE" => layout(2, 5, 14);
    ChangeMaxBasal = 0x2C, "CHANGE_MAX_BASAL";
    SetBolusWizardEnabled = 0x2D, "SET_BOLUS_WIZARD_ENABLED";
    BgReminderOffsetSet = 0x31, "BG_REMINDER_OFFSET_SET";
    BgReminderAlarmSet = 0x32, "BG_REMINDER_ALARM_SET";
    TempBasal = 0x33, "TEMP_BASAL" => layout(2, 5, 1);
    LowReservoir = 0x34, "LOW_RESERVOIR";
    BgReminder = 0x35, "BG_REMINDER";
    ParadigmLinkSetup = 0x36, "PARADIGM_LINK_SETUP" => layout(2, 5, 14);
    InsulinActionTypeChange = 0x3A, "INSULIN_ACTION_TYPE_CHANGE";
    WeakBattery = 0x3B, "WEAK_BATTERY";
    ChangeParadigmLinkId = 0x3C, "CHANGE_PARADIGM_LINK_ID" => layout(2, 5, 14);
    BgReceived = 0x3F, "BG_RECEIVED" => layout(2, 5, 3);
    JournalEntryMealMarker = 0x40, "JOURNAL_ENTRY_MEAL_MARKER" => layout(2, 5, 2);
    JournalEntryExerciseMarker = 0x41, "JOURNAL_ENTRY_EXERCISE_MARKER" => layout(2, 5, 1);
    JournalEntryInsulinMarker = 0x42, "JOURNAL_ENTRY_INSULIN_MARKER" => layout(2, 5, 1);
    JournalEntryOtherMarker = 0x43, "JOURNAL_ENTRY_OTHER_MARKER";
    AutoCalEnable = 0x44, "AUTO_CAL_ENABLE";
    ChangeBolusWizardSetup = 0x4F, "CHANGE_BOLUS_WIZARD_SETUP" => layout(2, 5, 32);
    SensorSettings = 0x50, "SENSOR_SETTINGS" => layout(2, 5, 34);
    SensorGraphTimeout = 0x51, "SENSOR_GRAPH_TIMEOUT";
    SensorGraphDemoMode = 0x52, "SENSOR_GRAPH_DEMO_MODE";
    SensorAlarmSilence = 0x53, "SENSOR_ALARM_SILENCE" => layout(2, 5, 1);
    SensorGlucoseLimits = 0x54, "SENSOR_GLUCOSE_LIMITS" => layout(2, 5, 57);
    SensorPredictiveAlerts = 0x55, "SENSOR_PREDICTIVE_ALERTS";
    SensorRateOfChangeAlerts = 0x56, "SENSOR_RATE_OF_CHANGE_ALERTS" => layout(2, 5, 5);
    BolusScrollSet = 0x57, "BOLUS_SCROLL_SET";
    BolusWizardChange = 0x5A, "BOLUS_WIZARD_CHANGE" => layout(2, 5, 137);
    BolusWizard = 0x5B, "BOLUS_WIZARD" => layout(2, 5, 15);
    UnabsorbedInsulin = 0x5C, "UNABSORBED_INSULIN" => layout(2, 0, 0);
    SaveSettings = 0x5D, "SAVE_SETTINGS";
    VarBolusEnable = 0x5E, "VAR_BOLUS_ENABLE";
    EasyBolusEnable = 0x5F, "EASY_BOLUS_ENABLE";
    BgReminderEnable = 0x60, "BG_REMINDER_ENABLE";
    AlarmClockEnable = 0x61, "ALARM_CLOCK_ENABLE";
    ChangeTempBasalType = 0x62, "CHANGE_TEMP_BASAL_TYPE";
    ChangeAlarmNotifyMode = 0x63, "CHANGE_ALARM_NOTIFY_MODE";
    ChangeTimeDisplay = 0x64, "CHANGE_TIME_DISPLAY";
    LowReservoirWarning = 0x65, "LOW_RESERVOIR_WARNING";
    BolusReminderEnable = 0x66, "BOLUS_REMINDER_ENABLE";
    BolusReminderSet = 0x67, "BOLUS_REMINDER_SET" => layout(2, 5, 2);
    BolusReminderDelete = 0x68, "BOLUS_REMINDER_DELETE" => layout(2, 5, 2);
    BolusReminder = 0x69, "BOLUS_REMINDER" => layout(2, 5, 2);
    AlarmClockDelete = 0x6A, "ALARM_CLOCK_DELETE";
    TotalDetails = 0x6C, "TOTAL_DETAILS" => layout(1, 2, 35);
    SensorTotalDetails = 0x6E, "SENSOR_TOTAL_DETAILS" => layout(1, 2, 49);
    CarbUnitsSet = 0x6F, "CARB_UNITS_SET";
    BasalProfileStart = 0x7B, "BASAL_PROFILE_START" => layout(2, 5, 3);
    ConnectDevicesOtherDevicesEnabled = 0x7C, "CONNECT_DEVICES_OTHER_DEVICES_ENABLED";
    ChangeOtherDeviceId = 0x7D, "CHANGE_OTHER_DEVICE_ID" => layout(2, 5, 30);
    LowSuspendLimitSet = 0x7E, "LOW_SUSPEND_LIMIT_SET";
    LowSuspendParamSet = 0x7F, "LOW_SUSPEND_PARAM_SET" => layout(2, 5, 1);
    ChangeWatchdogMarriageProfile = 0x81, "CHANGE_WATCHDOG_MARRIAGE_PROFILE" => layout(2, 5, 5);
    DeleteOtherDeviceId = 0x82, "DELETE_OTHER_DEVICE_ID" => layout(2, 5, 5);
    ChangeCaptureEventEnable = 0x83, "CHANGE_CAPTURE_EVENT_ENABLE";
}

impl RecordType {
    /// Layout of one record, given its first head bytes and the pump model.
    pub fn resolve_layout(self, head: &[u8], model: &str) -> Layout {
        let lead = head.get(1).copied().unwrap_or(0) as usize;
        let base = self.base_layout();
        match self {
            RecordType::SensorPredictiveAlerts => Layout {
                body: lead.saturating_sub(1) * 3,
                ..base
            },
            // the IOB record carries its own head length
            RecordType::UnabsorbedInsulin => Layout {
                head: lead.max(2),
                ..base
            },
            RecordType::SensorSettings if matches!(model, "523" | "723") => Layout {
                body: 30,
                ..base
            },
            _ => base,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Unknown type or corrupt record starting with: {0:02X}")]
    UnknownType(u8),
    #[error("{record} needs {needed} bytes, {available} left in page")]
    Truncated {
        record: &'static str,
        needed: usize,
        available: usize,
    },
}

/// Pump model the layouts are resolved against.
#[derive(Debug, Clone, Default)]
pub struct LayoutContext {
    pub model: String,
}

/// One record cut out of a page, before its date is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub record_type: RecordType,
    pub head: Bytes,
    pub date: Bytes,
    pub body: Bytes,
}

impl WireDecode for RawRecord {
    type Error = RecordError;
    type Context = LayoutContext;

    fn parse<'a>(
        input: &'a [u8],
        parent: &Bytes,
        ctx: &Self::Context,
    ) -> Result<(&'a [u8], Self), Self::Error> {
        let opcode = input.first().copied().unwrap_or(0);
        let record_type = RecordType::from_opcode(opcode).ok_or(RecordError::UnknownType(opcode))?;
        let layout = record_type.resolve_layout(&input[..input.len().min(2)], &ctx.model);
        if layout.len() > input.len() {
            return Err(RecordError::Truncated {
                record: record_type.name(),
                needed: layout.len(),
                available: input.len(),
            });
        }

        let (head, rest) = input.split_at(layout.head);
        let (date, rest) = rest.split_at(layout.date);
        let (body, rest) = rest.split_at(layout.body);
        Ok((
            rest,
            RawRecord {
                record_type,
                head: parent.slice_ref(head),
                date: parent.slice_ref(date),
                body: parent.slice_ref(body),
            },
        ))
    }
}

/// A dated history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub head: Bytes,
    pub date: Bytes,
    pub body: Bytes,
    pub timestamp: NaiveDateTime,
    pub index: u64,
}

impl Record {
    pub fn is(&self, record_type: RecordType) -> bool {
        self.record_type == record_type
    }

    pub fn head_byte(&self, i: usize) -> u8 {
        crate::config::byte_at(&self.head, i)
    }

    pub fn date_byte(&self, i: usize) -> u8 {
        crate::config::byte_at(&self.date, i)
    }

    pub fn body_byte(&self, i: usize) -> u8 {
        crate::config::byte_at(&self.body, i)
    }
}

/// Decode history pages, as read from the pump (newest first), into dated
/// records in chronological order.
///
/// Invalid pages are skipped. An unknown opcode or a record running past the
/// page end discards the rest of that page. Records without a date, or
/// stamped with the pump reset date, are dropped but still use up an index.
pub fn decode_pages(pages: &[HistoryPage], model: &str) -> Vec<Record> {
    let ctx = LayoutContext {
        model: model.to_string(),
    };
    let reset = date::reset_date();
    let mut records = Vec::new();
    let mut index = 0u64;

    for page in pages.iter().rev().filter(|p| p.valid) {
        let parent = Bytes::copy_from_slice(&page.bytes[..page.bytes.len().min(PAGE_DATA_SIZE)]);
        let mut input: &[u8] = &parent;

        while let Some(&first) = input.first() {
            if first == 0 {
                input = &input[1..];
                continue;
            }
            let (rest, raw) = match RawRecord::parse(input, &parent, &ctx) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(page = page.number, error = %e, "discarding rest of page");
                    break;
                }
            };
            input = rest;

            let timestamp = decode_date(&raw.date);
            debug!(
                record = raw.record_type.name(),
                head = %to_hex(&raw.head),
                date = %to_hex(&raw.date),
                body = %to_hex(&raw.body),
                timestamp = ?timestamp,
                "decoded record"
            );

            match timestamp {
                Some(ts) if Some(ts) != reset => records.push(Record {
                    record_type: raw.record_type,
                    head: raw.head,
                    date: raw.date,
                    body: raw.body,
                    timestamp: ts,
                    index,
                }),
                _ => debug!(record = raw.record_type.name(), "dropping record with incorrect date"),
            }
            index += 1;
        }
    }

    records
}

/// Records of the given types, in stream order.
pub fn filter_records<'a>(records: &'a [Record], types: &[RecordType]) -> Vec<&'a Record> {
    records
        .iter()
        .filter(|r| types.contains(&r.record_type))
        .collect()
}
