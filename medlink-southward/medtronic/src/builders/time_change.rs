//! Clock change pairs and the UTC offset intervals derived from them.

use crate::decoder::{filter_records, CbgRecord, CbgRecordType, Record, RecordType};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use medlink_sdk::{ClockSource, DeviceEvent, DriverResult, EventMeta, TzoUtil};
use tracing::debug;

/// `DATE_TIME_CHANGE` sub codes.
const CGM_CHANGE_TO: u8 = 0;
const CGM_CHANGE_FROM: u8 = 1;
const CGM_CHANGE_ALARM: u8 = 2;

/// One from/to pair as read from the stream.
struct Pair {
    from: NaiveDateTime,
    to: NaiveDateTime,
    index: u64,
    alarm: bool,
}

/// Drop pairs involving a year well before the pump's current one; those
/// are left behind when the battery is out for too long.
fn is_spurious(pair: &Pair, current_year: i32) -> bool {
    pair.from.year() < current_year - 1 || pair.to.year() < current_year - 1 || pair.alarm
}

fn finish(
    pairs: Vec<Pair>,
    source: ClockSource,
    device_id: &str,
    timezone_offset: i32,
    most_recent: DateTime<Utc>,
    current_year: i32,
) -> DriverResult<(TzoUtil, Vec<DeviceEvent>)> {
    let changes = pairs
        .into_iter()
        .filter(|pair| {
            let spurious = is_spurious(pair, current_year);
            if spurious {
                debug!(from = %pair.from, to = %pair.to, "excluding spurious time change");
            }
            !spurious
        })
        .map(|pair| {
            DeviceEvent::time_change(
                EventMeta::new(pair.to, device_id).with_index(pair.index),
                pair.from,
                pair.to,
                source,
            )
        })
        .collect();
    TzoUtil::new(timezone_offset, most_recent, changes)
}

/// Pump clock changes: `CHANGE_TIME` holds the old reading, the following
/// `NEW_TIME_SET` the new one.
pub fn build_time_changes(
    records: &[Record],
    device_id: &str,
    timezone_offset: i32,
    most_recent: DateTime<Utc>,
    current_year: i32,
) -> DriverResult<(TzoUtil, Vec<DeviceEvent>)> {
    let entries = filter_records(records, &[RecordType::ChangeTime, RecordType::NewTimeSet]);
    let mut pairs = Vec::new();

    let mut i = 0;
    while i < entries.len() {
        let from = entries[i];
        if !from.is(RecordType::ChangeTime) {
            debug!(index = from.index, "skipping time change without a preceding from record");
            i += 1;
            continue;
        }
        match entries.get(i + 1).filter(|e| e.is(RecordType::NewTimeSet)) {
            Some(to) => {
                pairs.push(Pair {
                    from: from.timestamp,
                    to: to.timestamp,
                    index: to.index,
                    alarm: false,
                });
                i += 2;
            }
            None => {
                debug!(index = from.index, "missing \"to\" time change");
                i += 1;
            }
        }
    }

    finish(pairs, ClockSource::Pump, device_id, timezone_offset, most_recent, current_year)
}

/// Sensor clock changes, paired by `DATE_TIME_CHANGE` sub code.
pub fn build_cgm_time_changes(
    records: &[CbgRecord],
    device_id: &str,
    timezone_offset: i32,
    most_recent: DateTime<Utc>,
    current_year: i32,
) -> DriverResult<(TzoUtil, Vec<DeviceEvent>)> {
    let entries: Vec<&CbgRecord> = records
        .iter()
        .filter(|r| r.record_type == CbgRecordType::DateTimeChange)
        .collect();
    let mut pairs = Vec::new();

    let mut i = 0;
    while i < entries.len() {
        let from = entries[i];
        if from.sub_code() != CGM_CHANGE_FROM {
            debug!(index = from.index, "skipping time change without a preceding from record");
            i += 1;
            continue;
        }
        let to = entries
            .get(i + 1)
            .filter(|e| matches!(e.sub_code(), CGM_CHANGE_TO | CGM_CHANGE_ALARM));
        match (to, from.timestamp) {
            (Some(to), Some(from_ts)) => {
                if let Some(to_ts) = to.timestamp {
                    pairs.push(Pair {
                        from: from_ts,
                        to: to_ts,
                        index: to.index,
                        alarm: to.sub_code() == CGM_CHANGE_ALARM,
                    });
                }
                i += 2;
            }
            (Some(_), None) => i += 2,
            (None, _) => {
                debug!(index = from.index, "missing \"to\" time change");
                i += 1;
            }
        }
    }

    finish(pairs, ClockSource::Cgm, device_id, timezone_offset, most_recent, current_year)
}
