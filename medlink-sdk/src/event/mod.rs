//! Canonical event model.
//!
//! Builders produce [`DraftEvent`]s whose open fields (basal duration, the
//! bolus attached to a wizard) are still settable; the simulator closes them
//! into immutable [`Event`]s, which are what gets uploaded.

mod basal;
mod bolus;
mod device;
mod settings;

pub use basal::*;
pub use bolus::*;
pub use device::*;
pub use settings::*;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MS_PER_MINUTE: i64 = 60_000;
pub const MS_PER_DAY: i64 = 86_400_000;

/// Annotation codes attached to uncertain or fabricated events.
pub mod codes {
    pub const UNKNOWN_DURATION: &str = "basal/unknown-duration";
    pub const INCOMPLETE_TUPLE: &str = "status/incomplete-tuple";
    pub const UNCERTAIN_TIMESTAMP: &str = "uncertain-timestamp";
    pub const OUT_OF_RANGE: &str = "bg/out-of-range";
    pub const FINAL_BASAL_FABRICATED: &str = "final-basal/fabricated-from-schedule";
    pub const FABRICATED_FROM_SCHEDULE: &str = "medtronic/basal/fabricated-from-schedule";
    pub const ONE_SECOND_GAP: &str = "medtronic/basal/one-second-gap";
    pub const TIME_CHANGE_SPLIT: &str = "medtronic/basal/time-change";
    pub const STATUS_FABRICATED: &str = "medtronic/status/fabricated-from-device-event";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
}

impl Annotation {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: None,
            threshold: None,
        }
    }

    /// `bg/out-of-range` marker for sensor values clamped to the display range.
    pub fn out_of_range(value: &str, threshold: u32) -> Self {
        Self {
            code: codes::OUT_OF_RANGE.to_string(),
            value: Some(value.to_string()),
            threshold: Some(threshold),
        }
    }
}

/// Annotation list, unique by code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(Vec<Annotation>);

impl Annotations {
    pub fn add(&mut self, annotation: Annotation) {
        if !self.contains(&annotation.code) {
            self.0.push(annotation);
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|a| a.code == code)
    }

    pub fn first(&self) -> Option<&Annotation> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.0.iter()
    }
}

/// Fields shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub time: DateTime<Utc>,
    pub device_time: NaiveDateTime,
    /// Minutes east of UTC
    pub timezone_offset: i32,
    /// Milliseconds
    pub conversion_offset: i64,
    /// Milliseconds
    pub clock_drift_offset: i64,
    pub device_id: String,
    /// Position in the decoded record stream; never uploaded.
    #[serde(skip)]
    pub index: Option<u64>,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

impl EventMeta {
    /// Meta for a record read at `device_time`. `time` treats the device
    /// clock as UTC until a timezone is applied.
    pub fn new(device_time: NaiveDateTime, device_id: impl Into<String>) -> Self {
        Self {
            time: device_time.and_utc(),
            device_time,
            timezone_offset: 0,
            conversion_offset: 0,
            clock_drift_offset: 0,
            device_id: device_id.into(),
            index: None,
            annotations: Annotations::default(),
            payload: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn annotate(&mut self, code: &str) {
        self.annotations.add(Annotation::new(code));
    }

    pub fn is_annotated(&self, code: &str) -> bool {
        self.annotations.contains(code)
    }

    pub fn set_payload(&mut self, key: &str, value: impl Into<Value>) {
        self.payload
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
    }

    pub fn payload_value(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref().and_then(|p| p.get(key))
    }

    /// Milliseconds since local midnight. With a conversion offset in play the
    /// value is rounded to the nearest 15 minutes so clock drift does not
    /// defeat schedule matching.
    pub fn ms_in_current_day(&self) -> i64 {
        let local = self.time + ChronoDuration::minutes(self.timezone_offset as i64);
        let ms = local.num_seconds_from_midnight() as i64 * 1000
            + (local.nanosecond() / 1_000_000) as i64;
        if self.conversion_offset != 0 {
            let fifteen = 15 * MS_PER_MINUTE;
            let rounded = ((ms as f64 / fifteen as f64) + 0.5).floor() as i64 * fifteen;
            return if rounded == MS_PER_DAY { 0 } else { rounded };
        }
        ms
    }

    /// Device clock reading `ms` after this event.
    pub fn device_time_plus(&self, ms: i64) -> NaiveDateTime {
        self.device_time + ChronoDuration::milliseconds(ms)
    }

    /// Milliseconds from `self.time` to `other.time`.
    pub fn ms_until(&self, other: &EventMeta) -> i64 {
        (other.time - self.time).num_milliseconds()
    }

    /// Copy of the UTC bookkeeping of `other`, keeping identity fields.
    pub fn take_clock_from(&mut self, other: &EventMeta) {
        self.time = other.time;
        self.device_time = other.device_time;
        self.timezone_offset = other.timezone_offset;
        self.conversion_offset = other.conversion_offset;
        self.clock_drift_offset = other.clock_drift_offset;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BgUnits {
    #[serde(rename = "mg/dL")]
    MgDl,
    #[serde(rename = "mmol/L")]
    MmolL,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarbUnits {
    Grams,
    Exchanges,
}

/// Events still open for the simulator to complete.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftEvent {
    Basal(DraftBasal),
    Bolus(Bolus),
    Wizard(DraftWizard),
    Smbg(Smbg),
    Cbg(Cbg),
    PumpSettings(PumpSettings),
    DeviceEvent(DeviceEvent),
}

impl DraftEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            DraftEvent::Basal(e) => &e.meta,
            DraftEvent::Bolus(e) => &e.meta,
            DraftEvent::Wizard(e) => &e.meta,
            DraftEvent::Smbg(e) => &e.meta,
            DraftEvent::Cbg(e) => &e.meta,
            DraftEvent::PumpSettings(e) => &e.meta,
            DraftEvent::DeviceEvent(e) => &e.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut EventMeta {
        match self {
            DraftEvent::Basal(e) => &mut e.meta,
            DraftEvent::Bolus(e) => &mut e.meta,
            DraftEvent::Wizard(e) => &mut e.meta,
            DraftEvent::Smbg(e) => &mut e.meta,
            DraftEvent::Cbg(e) => &mut e.meta,
            DraftEvent::PumpSettings(e) => &mut e.meta,
            DraftEvent::DeviceEvent(e) => &mut e.meta,
        }
    }

    pub fn index(&self) -> Option<u64> {
        self.meta().index
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.meta().time
    }
}

/// Finalized, uploadable events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Basal(Basal),
    Bolus(Bolus),
    Wizard(Wizard),
    Smbg(Smbg),
    Cbg(Cbg),
    PumpSettings(PumpSettings),
    DeviceEvent(DeviceEvent),
}

impl Event {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Event::Basal(e) => &e.meta,
            Event::Bolus(e) => &e.meta,
            Event::Wizard(e) => &e.meta,
            Event::Smbg(e) => &e.meta,
            Event::Cbg(e) => &e.meta,
            Event::PumpSettings(e) => &e.meta,
            Event::DeviceEvent(e) => &e.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut EventMeta {
        match self {
            Event::Basal(e) => &mut e.meta,
            Event::Bolus(e) => &mut e.meta,
            Event::Wizard(e) => &mut e.meta,
            Event::Smbg(e) => &mut e.meta,
            Event::Cbg(e) => &mut e.meta,
            Event::PumpSettings(e) => &mut e.meta,
            Event::DeviceEvent(e) => &mut e.meta,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.meta().time
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Basal(_) => "basal",
            Event::Bolus(_) => "bolus",
            Event::Wizard(_) => "wizard",
            Event::Smbg(_) => "smbg",
            Event::Cbg(_) => "cbg",
            Event::PumpSettings(_) => "pumpSettings",
            Event::DeviceEvent(_) => "deviceEvent",
        }
    }
}

impl From<Event> for DraftEvent {
    /// Reopen a finalized event. Durations already set stay set, so a second
    /// simulation pass leaves them untouched.
    fn from(event: Event) -> Self {
        match event {
            Event::Basal(b) => DraftEvent::Basal(b.into()),
            Event::Bolus(b) => DraftEvent::Bolus(b),
            Event::Wizard(w) => DraftEvent::Wizard(w.into()),
            Event::Smbg(s) => DraftEvent::Smbg(s),
            Event::Cbg(c) => DraftEvent::Cbg(c),
            Event::PumpSettings(p) => DraftEvent::PumpSettings(p),
            Event::DeviceEvent(d) => DraftEvent::DeviceEvent(d),
        }
    }
}
