//! Meter record parsing and conversion to upload events.

use chrono::NaiveDateTime;
use medlink_sdk::{
    BgUnits, ClockSource, DeviceEvent, DriverError, DriverResult, Event, EventMeta, Smbg, TzoUtil,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const DATE_FORMAT: &str = "%H:%M:%S %m/%d/%y";

/// Characters `start..end` of `s`, clamped to its length.
pub fn slice_chars(s: &str, start: usize, end: usize) -> &str {
    let byte = |n: usize| s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len());
    let from = byte(start);
    let to = byte(end.max(start));
    &s[from..to]
}

/// Leading decimal digits of `s`, ignoring leading whitespace.
pub fn leading_number(s: &str) -> Option<u32> {
    let s = s.trim_start();
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    s[..digits].parse().ok()
}

fn parse_date(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DATE_FORMAT).ok()
}

/// What a record's data string describes, keyed by its first character.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Clock set; the record date is the new reading.
    TimeChange { from: NaiveDateTime },
    /// Blood glucose in mg/dL. `None` when the value is not numeric.
    Glucose { value: Option<u32> },
    ControlSolution,
    Error { code: String },
    MemoryReset,
    Shutdown,
    Invalid { detail: String },
    Undocumented,
}

/// One `D` response.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterRecord {
    pub index: u32,
    pub device_time: NaiveDateTime,
    pub trusted_time: bool,
    pub data: String,
    pub kind: RecordKind,
}

impl MeterRecord {
    pub fn parse(response: &str) -> DriverResult<Self> {
        let index = leading_number(slice_chars(response, 1, 6)).ok_or_else(|| {
            DriverError::DecodeError(format!("Record index is not a number: {response:?}"))
        })?;
        let device_time = parse_date(slice_chars(response, 7, 24)).ok_or_else(|| {
            DriverError::DecodeError(format!("Record {index} has no valid date"))
        })?;
        let trusted_time = leading_number(slice_chars(response, 37, 38)).unwrap_or(0) != 0;
        let data = slice_chars(response, 49, usize::MAX).to_string();

        let kind = match data.chars().next() {
            Some('C') => {
                let from = parse_date(slice_chars(&data, 2, 19)).ok_or_else(|| {
                    DriverError::DecodeError(format!("Record {index} has no valid previous time"))
                })?;
                RecordKind::TimeChange { from }
            }
            Some('G') => RecordKind::Glucose {
                value: leading_number(slice_chars(&data, 2, 5)),
            },
            Some('S') => RecordKind::ControlSolution,
            Some('E') => RecordKind::Error {
                code: slice_chars(&data, 2, 7).to_string(),
            },
            Some('D') => RecordKind::MemoryReset,
            Some('P') => RecordKind::Shutdown,
            Some('I') => RecordKind::Invalid {
                detail: slice_chars(&data, 2, usize::MAX).to_string(),
            },
            _ => RecordKind::Undocumented,
        };

        Ok(Self {
            index,
            device_time,
            trusted_time,
            data,
            kind,
        })
    }

    fn meta(&self, device_id: &str) -> EventMeta {
        EventMeta::new(self.device_time, device_id).with_index(self.index as u64)
    }
}

/// Turn meter records, oldest first, into upload events.
///
/// Clock changes set up the timezone offsets; a shutdown discards every
/// event gathered before it.
pub fn build_events(
    records: &[MeterRecord],
    device_id: &str,
    timezone_offset: i32,
) -> DriverResult<(TzoUtil, Vec<Event>)> {
    let Some(last) = records.last() else {
        return Err(DriverError::NoRecords("Device has no records to upload".into()));
    };

    let changes = records
        .iter()
        .filter_map(|record| match record.kind {
            RecordKind::TimeChange { from } => {
                let mut event =
                    DeviceEvent::time_change(record.meta(device_id), from, record.device_time, ClockSource::Pump);
                event.meta.payload = None;
                Some(event)
            }
            _ => None,
        })
        .collect();
    let most_recent = TzoUtil::fixed(timezone_offset).apply_timezone(last.device_time);
    let (tzo, changes) = TzoUtil::new(timezone_offset, most_recent, changes)?;
    let mut changes: BTreeMap<Option<u64>, DeviceEvent> =
        changes.into_iter().map(|c| (c.meta.index, c)).collect();

    let mut events = Vec::new();
    for record in records {
        match &record.kind {
            RecordKind::Glucose { value: Some(value) } => {
                let mut meta = record.meta(device_id);
                tzo.fill_in(&mut meta);
                events.push(Event::Smbg(Smbg {
                    meta,
                    sub_type: None,
                    value: *value as f64,
                    units: BgUnits::MgDl,
                }));
            }
            RecordKind::Glucose { value: None } => {
                warn!(index = record.index, data = %record.data, "glucose value out of range");
            }
            RecordKind::TimeChange { .. } => {
                if let Some(change) = changes.remove(&Some(record.index as u64)) {
                    events.push(Event::DeviceEvent(change));
                }
            }
            RecordKind::ControlSolution => debug!(index = record.index, "skipping control solution"),
            RecordKind::Error { code } => {
                debug!(device_time = %record.device_time, code = %code, "meter error")
            }
            RecordKind::MemoryReset => {
                debug!(device_time = %record.device_time, "database was cleared")
            }
            RecordKind::Shutdown => {
                info!(index = record.index, "device shutdown, ignoring all previous records");
                events.clear();
            }
            RecordKind::Invalid { detail } => debug!(index = record.index, %detail, "invalid record"),
            RecordKind::Undocumented => debug!(data = %record.data, "undocumented record"),
        }
    }

    if events.is_empty() {
        return Err(DriverError::NoRecords("Device has no records to upload".into()));
    }
    Ok((tzo, events))
}
