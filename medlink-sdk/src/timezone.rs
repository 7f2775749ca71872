//! UTC bootstrapping from device clock changes.
//!
//! Device records carry local clock readings only. Walking the clock changes
//! from newest to oldest reconstructs which timezone, clock drift and
//! conversion offsets applied to each stretch of the record stream.

use crate::{codes, DeviceEvent, DriverError, DriverResult, EventMeta};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::debug;

const ROUND_TO_NEAREST_MIN: i64 = 30;
/// UTC+14 to UTC-12
const MAX_DIFF_MIN: i64 = 1560;
const MAX_TIMEZONE_OFFSET: i32 = 840;
const MIN_TIMEZONE_OFFSET: i32 = -720;
const DAY_MIN: i32 = 1440;
const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeProcessing {
    AcrossTheBoardTimezone,
    UtcBootstrapping,
}

impl TimeProcessing {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeProcessing::AcrossTheBoardTimezone => "across-the-board-timezone",
            TimeProcessing::UtcBootstrapping => "utc-bootstrapping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Offsets {
    timezone: i32,
    clock_drift: i64,
    conversion: i64,
}

impl Offsets {
    fn to_utc(&self, device_time: NaiveDateTime) -> DateTime<Utc> {
        device_time.and_utc()
            - ChronoDuration::minutes(self.timezone as i64)
            - ChronoDuration::milliseconds(self.conversion)
    }

    fn adjust(&mut self, from: NaiveDateTime, to: NaiveDateTime) {
        let diff = from - to;
        let minutes = diff.num_minutes();
        let offset_diff = ((minutes as f64 / ROUND_TO_NEAREST_MIN as f64) + 0.5).floor() as i64
            * ROUND_TO_NEAREST_MIN;
        let raw_ms = diff.num_seconds() * 1000;

        if offset_diff.abs() <= MAX_DIFF_MIN {
            self.timezone += offset_diff as i32;
            self.clock_drift += raw_ms - offset_diff * 60_000;
        } else {
            self.conversion += raw_ms;
        }

        while self.timezone > MAX_TIMEZONE_OFFSET {
            self.timezone -= DAY_MIN;
            self.conversion += DAY_MS;
        }
        while self.timezone < MIN_TIMEZONE_OFFSET {
            self.timezone += DAY_MIN;
            self.conversion -= DAY_MS;
        }
    }
}

#[derive(Debug, Clone)]
struct OffsetInterval {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    start_index: Option<u64>,
    end_index: Option<u64>,
    offsets: Offsets,
}

impl OffsetInterval {
    fn matches_index(&self, index: u64) -> bool {
        match (self.start_index, self.end_index) {
            (Some(start), Some(end)) => index <= end && index > start,
            (Some(start), None) => index > start,
            (None, Some(end)) => index <= end,
            (None, None) => false,
        }
    }

    /// Placement by UTC for events without an index. Timestamps past the
    /// newest interval end (device clock set into the future) still match it.
    fn matches_time(&self, utc: DateTime<Utc>) -> bool {
        match (self.start, self.end) {
            (Some(start), _) => utc >= start,
            (None, Some(end)) => utc <= end,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TzoUtil {
    timezone_offset: i32,
    intervals: Vec<OffsetInterval>,
}

impl TzoUtil {
    /// Build the offset intervals for the configured fixed `timezone_offset`
    /// (minutes east of UTC). `changes` must all be time change events; they
    /// are returned with their UTC fields filled in, newest first.
    pub fn new(
        timezone_offset: i32,
        most_recent: DateTime<Utc>,
        mut changes: Vec<DeviceEvent>,
    ) -> DriverResult<(Self, Vec<DeviceEvent>)> {
        let mut intervals = Vec::new();

        if let Some(bad) = changes.iter().find(|c| c.as_time_change().is_none()) {
            return Err(DriverError::SimulationError(format!(
                "Wrong subType of object passed as `timeChange`: {}",
                bad.kind.sub_type()
            )));
        }

        changes.sort_by(|a, b| b.meta.index.cmp(&a.meta.index));

        let mut offsets = Offsets {
            timezone: timezone_offset,
            clock_drift: 0,
            conversion: 0,
        };
        let mut current_index = None;
        let mut newer_time = Some(most_recent);

        for change in changes.iter_mut() {
            let Some(tc) = change.as_time_change() else {
                continue;
            };
            let (from, to) = (tc.change.from, tc.change.to);

            change.meta.time = offsets.to_utc(change.meta.device_time);
            change.meta.timezone_offset = offsets.timezone;
            change.meta.clock_drift_offset = offsets.clock_drift;
            change.meta.conversion_offset = offsets.conversion;

            intervals.push(OffsetInterval {
                start: Some(change.meta.time),
                end: newer_time,
                start_index: change.meta.index,
                end_index: current_index,
                offsets,
            });
            offsets.adjust(from, to);

            current_index = change.meta.index;
            newer_time = Some(change.meta.time);
        }

        if let Some(earliest) = intervals.last().map(|i| i.start) {
            intervals.push(OffsetInterval {
                start: None,
                end: earliest,
                start_index: None,
                end_index: current_index,
                offsets,
            });
        }

        debug!(intervals = intervals.len(), "computed offset intervals");

        Ok((
            Self {
                timezone_offset,
                intervals,
            },
            changes,
        ))
    }

    /// Across-the-board conversion with no clock changes.
    pub fn fixed(timezone_offset: i32) -> Self {
        Self {
            timezone_offset,
            intervals: Vec::new(),
        }
    }

    pub fn processing(&self) -> TimeProcessing {
        if self.intervals.is_empty() {
            TimeProcessing::AcrossTheBoardTimezone
        } else {
            TimeProcessing::UtcBootstrapping
        }
    }

    pub fn timezone_offset(&self) -> i32 {
        self.timezone_offset
    }

    /// Device clock reading in UTC under the configured offset alone.
    pub fn apply_timezone(&self, device_time: NaiveDateTime) -> DateTime<Utc> {
        device_time.and_utc() - ChronoDuration::minutes(self.timezone_offset as i64)
    }

    fn lookup(&self, device_time: NaiveDateTime, index: Option<u64>) -> Option<(DateTime<Utc>, Offsets)> {
        if self.intervals.is_empty() {
            let offsets = Offsets {
                timezone: self.timezone_offset,
                clock_drift: 0,
                conversion: 0,
            };
            return Some((offsets.to_utc(device_time), offsets));
        }
        self.intervals.iter().find_map(|interval| {
            let utc = interval.offsets.to_utc(device_time);
            let hit = match index {
                Some(idx) => interval.matches_index(idx),
                None => interval.matches_time(utc),
            };
            hit.then_some((utc, interval.offsets))
        })
    }

    /// Assign `time` and the offsets from the event's device time and index.
    /// Events without an index are placed by time and marked uncertain.
    pub fn fill_in(&self, meta: &mut EventMeta) {
        match self.lookup(meta.device_time, meta.index) {
            Some((time, offsets)) => {
                meta.time = time;
                meta.timezone_offset = offsets.timezone;
                meta.clock_drift_offset = offsets.clock_drift;
                meta.conversion_offset = offsets.conversion;
                if meta.index.is_none() {
                    meta.annotate(codes::UNCERTAIN_TIMESTAMP);
                }
            }
            None => debug!(device_time = %meta.device_time, "could not look up UTC info"),
        }
    }
}
