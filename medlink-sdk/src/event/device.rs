use super::{BgUnits, EventMeta};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmbgSubType {
    Manual,
    Linked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Smbg {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<SmbgSubType>,
    pub value: f64,
    pub units: BgUnits,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cbg {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub value: f64,
    pub units: BgUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReason {
    pub suspended: Agent,
    pub resumed: Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpStatus {
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: PumpStatus,
    pub reason: StatusReason,
    pub duration: i64,
    /// Index of the resume record that ended the suspension.
    #[serde(skip)]
    pub resume_index: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    NoDelivery,
    NoPower,
    AutoOff,
    LowInsulin,
    LowPower,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub alarm_type: AlarmType,
    /// Fabricated suspension this alarm caused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Box<DeviceEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimeTarget {
    Tubing,
    Cannula,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimeEvent {
    pub prime_target: PrimeTarget,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ReservoirChangeEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Box<DeviceEvent>>,
}

/// Which clock a time change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    Pump,
    Cgm,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeChange {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
    pub agent: Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeChangeEvent {
    pub change: TimeChange,
    #[serde(skip)]
    pub source: ClockSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationEvent {
    pub value: f64,
    pub units: BgUnits,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subType", rename_all = "camelCase")]
pub enum DeviceEventKind {
    Status(StatusEvent),
    Alarm(AlarmEvent),
    Prime(PrimeEvent),
    ReservoirChange(ReservoirChangeEvent),
    TimeChange(TimeChangeEvent),
    Calibration(CalibrationEvent),
}

impl DeviceEventKind {
    pub fn sub_type(&self) -> &'static str {
        match self {
            DeviceEventKind::Status(_) => "status",
            DeviceEventKind::Alarm(_) => "alarm",
            DeviceEventKind::Prime(_) => "prime",
            DeviceEventKind::ReservoirChange(_) => "reservoirChange",
            DeviceEventKind::TimeChange(_) => "timeChange",
            DeviceEventKind::Calibration(_) => "calibration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub kind: DeviceEventKind,
}

impl DeviceEvent {
    pub fn new(meta: EventMeta, kind: DeviceEventKind) -> Self {
        Self { meta, kind }
    }

    pub fn time_change(
        meta: EventMeta,
        from: NaiveDateTime,
        to: NaiveDateTime,
        source: ClockSource,
    ) -> Self {
        let mut event = Self::new(
            meta,
            DeviceEventKind::TimeChange(TimeChangeEvent {
                change: TimeChange {
                    from,
                    to,
                    agent: Agent::Manual,
                },
                source,
            }),
        );
        event.meta.set_payload(
            "deviceType",
            match source {
                ClockSource::Pump => "pump",
                ClockSource::Cgm => "cgm",
            },
        );
        event
    }

    pub fn as_time_change(&self) -> Option<&TimeChangeEvent> {
        match &self.kind {
            DeviceEventKind::TimeChange(tc) => Some(tc),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&StatusEvent> {
        match &self.kind {
            DeviceEventKind::Status(s) => Some(s),
            _ => None,
        }
    }

    /// Attach the fabricated suspension status to an alarm or reservoir change.
    pub fn attach_status(&mut self, status: DeviceEvent) {
        match &mut self.kind {
            DeviceEventKind::Alarm(alarm) => alarm.status = Some(Box::new(status)),
            DeviceEventKind::ReservoirChange(rc) => rc.status = Some(Box::new(status)),
            _ => {}
        }
    }
}
